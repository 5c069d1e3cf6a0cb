pub mod config;
pub mod poller;
pub mod turn;

pub use config::*;
pub use poller::*;
pub use turn::*;
