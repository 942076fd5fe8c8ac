//! # utp-engine
//!
//! An implementation of the micro Transport Protocol (BEP 29): reliable,
//! ordered byte streams multiplexed over a single UDP socket.
//!
//! ## Features
//!
//! - **Multiplexing**: any number of streams per UDP port, routed by connection id
//! - **Selective acks**: out-of-order delivery with early retransmission
//! - **Flow control**: bounded send window driven by the peer's advertised window
//! - **Passthrough**: datagrams that are not uTP can still be read from the socket
//! - **Async**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use utp_engine::UtpSocket;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = UtpSocket::bind("127.0.0.1:0".parse()?).await?;
//!     let stream = socket.dial("127.0.0.1:6881".parse()?).await?;
//!
//!     stream.write_all(b"hello").await?;
//!     let mut buf = [0u8; 64];
//!     let n = stream.read(&mut buf).await?;
//!     println!("Got {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod conn;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod selective_ack;
pub mod socket;
pub mod transport;

mod pool;
mod send;
mod timer;

// Re-exports for convenience
pub use config::{AcceptFilter, UtpConfig};
pub use conn::{ErrorCallback, UtpStream};
pub use error::{Result, UtpError};
pub use metrics::{snapshot, ConnectionStats, CounterSnapshot};
pub use packet::{Header, HeaderError, PacketType};
pub use selective_ack::SelectiveAckBitmask;
pub use socket::UtpSocket;
pub use transport::{Listener, StreamTransport};
