// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use futures::stream::{Stream, StreamExt};
use log::warn;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

/// Turns a broadcast receiver into a stream, skipping over (and logging) items a slow listener
/// lagged behind on.
pub fn stream_from_broadcast_receiver<T>(
    receiver: broadcast::Receiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send>>
where
    T: Clone + Send + 'static,
{
    Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move {
        match x {
            Ok(item) => Some(item),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Event listener lagged, {} events dropped", missed);
                None
            }
        }
    }))
}

/// Sends to a broadcast channel, ignoring the error returned while nobody listens.
pub fn broadcast<T>(sender: &broadcast::Sender<T>, item: T) {
    let _ = sender.send(item);
}
