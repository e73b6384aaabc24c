pub mod codec;
pub mod config;
pub mod dns;
pub mod error;
pub mod reactor;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::Config;
pub use error::{DnsError, ProtocolError, ProxyError};
pub use reactor::Reactor;
