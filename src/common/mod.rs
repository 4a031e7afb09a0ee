pub mod registry;
pub mod util;
