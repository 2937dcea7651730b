//! TFTP (RFC 1350) server library: wire codec, datastore facade,
//! per-session state machine, single-threaded event reactor, and the
//! bootstrap sequence that gets the reactor running with dropped
//! privileges.

pub mod audit;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod datastore;
pub mod error;
pub mod logging;
pub mod net;
pub mod reactor;
pub mod session;

pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use reactor::Reactor;
