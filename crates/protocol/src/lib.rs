pub mod config;
pub mod control;
pub mod messages;

pub use config::*;
pub use control::*;
pub use messages::*;
