pub mod config;
pub mod group;
pub mod messages;

pub use config::*;
pub use group::*;
pub use messages::*;
