//! Duplex envelope transports.
//!
//! A transport owns one byte stream and exchanges whole envelopes over it:
//! - [`TcpTransport`] connects to `net.tcp://host:port` (or `tcp://`) endpoints
//! - [`MemoryTransport`] pairs two in-process endpoints, mainly for tests
//!
//! Sends and receives are serialized independently, so one send and one
//! receive may run concurrently. Encryption and compression changes wait for
//! both directions to be idle before replacing the underlying stream.

pub mod error;
pub mod memory;
pub mod stream;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use stream::{StreamTransport, TransportConfig};
pub use tcp::{TcpTransport, TcpTransportListener, DEFAULT_PORT, TCP_SCHEMES};
pub use traits::{AsyncStream, BoxedStream, StreamUpgrader, Transport};
