//! Transport traits
//!
//! Lets code written against a stream-oriented transport run over uTP
//! without naming the concrete types.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::conn::UtpStream;
use crate::socket::UtpSocket;

/// Reliable, ordered byte stream to one peer
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Get the remote peer's address
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Get the local address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Read some bytes (may return less than buf.len(), 0 at end of stream)
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Write all bytes
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Close the sending half
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Source of incoming streams
#[async_trait]
pub trait Listener: Send + Sync {
    type Stream: StreamTransport;

    async fn accept(&self) -> io::Result<Self::Stream>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl StreamTransport for UtpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(UtpStream::peer_addr(self))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(UtpStream::local_addr(self))
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(UtpStream::read(self, buf).await?)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        Ok(UtpStream::read_exact(self, buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Ok(UtpStream::write_all(self, buf).await?)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.close();
        Ok(())
    }
}

#[async_trait]
impl Listener for UtpSocket {
    type Stream = UtpStream;

    async fn accept(&self) -> io::Result<UtpStream> {
        Ok(UtpSocket::accept(self).await?)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(UtpSocket::local_addr(self))
    }
}
