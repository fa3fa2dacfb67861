pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod multiplexer;
pub mod socket;
pub mod socket_map;
pub mod timeouts;
pub mod transport;

pub use config::Config;
pub use driver::{ListenerDriver, ServerDriver};
pub use error::{Result, SessionError};
pub use frame::SocketId;
pub use multiplexer::Multiplexer;
pub use timeouts::{TimeoutConfig, Timeouts};
