// SIP channel signaling core: transports, party bindings and call sessions

pub mod config;
pub mod error;
pub mod media;
pub mod routing;
pub mod rsip_ext;
pub mod session;
pub mod transaction;
pub mod transport;

pub use config::{ListenerConfig, SessionConfig, TransportConfig};
pub use error::Error;
pub type Result<T> = std::result::Result<T, crate::error::Error>;

pub const VERSION: &str = concat!("rsipchan/", env!("CARGO_PKG_VERSION"));
