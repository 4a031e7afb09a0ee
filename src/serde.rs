//! De-/Serialization with alternative formats.
//!
//! The various modules in here are intended to be used with `serde`'s [`with` annotation] to de-/serialize as something other than the default format.
//!
//! [`with` annotation]: https://serde.rs/attributes.html#field-attributes

/// A [`Duration`](std::time::Duration) as a whole number of milliseconds, which is how
/// timeouts are written in configuration files.
pub mod duration_millis {
    use serde_cr::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
