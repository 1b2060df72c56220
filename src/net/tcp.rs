use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::net::connection::{IoResult, TransferStatus, Transport};
use crate::net::details::ConnectionDetails;

/// Stream transport over a non-blocking TCP socket.
///
/// `connect` only initiates the connection attempt; completion (or failure)
///  is observed through `poll` on subsequent scheduler ticks via the
///  socket's error slot and peer address.
pub struct TcpTransport {
    details: ConnectionDetails,
    stream: Option<TcpStream>,
    connect_pending: bool,
}

impl TcpTransport {
    pub fn from_details(details: &ConnectionDetails) -> TcpTransport {
        TcpTransport {
            details: details.clone(),
            stream: None,
            connect_pending: false,
        }
    }

    /// Wrap a socket produced by a listener's accept.
    pub fn from_accepted(stream: TcpStream) -> anyhow::Result<TcpTransport> {
        stream.set_nonblocking(true)?;
        Ok(TcpTransport {
            details: ConnectionDetails::default(),
            stream: Some(stream),
            connect_pending: false,
        })
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    fn resolve(details: &ConnectionDetails) -> anyhow::Result<SocketAddr> {
        let port: u16 = details.get_with_index_fallback("port", 0, 0);
        if port == 0 {
            anyhow::bail!("a port is required: {}", details);
        }
        let address = match details.address() {
            Some("ANY") | None => "0.0.0.0",
            Some(address) => address,
        };
        (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve hostname {}", address))
    }
}

#[cfg(unix)]
fn connect_in_progress(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> anyhow::Result<()> {
        let addr = Self::resolve(&self.details)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => self.connect_pending = false,
            Err(e) if connect_in_progress(&e) || e.kind() == ErrorKind::WouldBlock => {
                self.connect_pending = true;
            }
            Err(e) => return Err(e.into()),
        }
        self.stream = Some(socket.into());
        Ok(())
    }

    fn poll(&mut self) -> TransferStatus {
        let Some(stream) = self.stream.as_ref() else {
            return TransferStatus::Disconnect;
        };
        if !self.connect_pending {
            return TransferStatus::Success;
        }
        match stream.take_error() {
            Ok(Some(e)) => {
                debug!("connect failed: {}", e);
                return TransferStatus::Disconnect;
            }
            Ok(None) => {}
            Err(_) => return TransferStatus::Disconnect,
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.connect_pending = false;
                TransferStatus::Success
            }
            Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock => {
                TransferStatus::Wait
            }
            Err(e) => {
                debug!("connect failed: {}", e);
                TransferStatus::Disconnect
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoResult {
        let Some(stream) = self.stream.as_mut() else {
            return IoResult::disconnect();
        };
        match stream.write(buf) {
            Ok(n) => IoResult::success(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                IoResult::wait()
            }
            Err(e) => {
                debug!("socket write error: {}", e);
                IoResult::disconnect()
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> IoResult {
        let Some(stream) = self.stream.as_mut() else {
            return IoResult::disconnect();
        };
        match stream.read(buf) {
            // a zero length read on a stream socket means the peer closed
            Ok(0) => IoResult::disconnect(),
            Ok(n) => IoResult::success(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                IoResult::wait()
            }
            Err(e) => {
                debug!("socket read error: {}", e);
                IoResult::disconnect()
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.connect_pending = false;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }
}
