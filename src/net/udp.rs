use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::io::ErrorKind;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::net::connection::{IoResult, TransferStatus, Transport};
use crate::net::details::ConnectionDetails;

/// Datagram transport. "Connecting" binds a local socket on the given port
///  and records a default destination; there is no handshake, so the
///  transport is ready as soon as the socket is bound. Each framed packet
///  travels as a single datagram. The destination can be retargeted per
///  send; without an explicit destination, replies go to the last sender.
pub struct UdpTransport {
    details: ConnectionDetails,
    socket: Option<UdpSocket>,
    destination: Option<SocketAddr>,
    last_sender: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn from_details(details: &ConnectionDetails) -> UdpTransport {
        UdpTransport {
            details: details.clone(),
            socket: None,
            destination: None,
            last_sender: None,
        }
    }

    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.last_sender
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> anyhow::Result<()> {
        let port: u16 = self.details.get_with_index_fallback("port", 0, 0);
        if port == 0 {
            anyhow::bail!("a port is required: {}", self.details);
        }
        let broadcast: bool = self.details.get_with_index_fallback("broadcast", 1, false);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
        if broadcast {
            socket.set_broadcast(true)?;
        }

        match self.details.address() {
            Some("ANY") | None => {}
            Some(address) => {
                self.destination = (address, port).to_socket_addrs()?.next();
                if self.destination.is_none() {
                    anyhow::bail!("unable to resolve hostname {}", address);
                }
            }
        }
        self.socket = Some(socket.into());
        Ok(())
    }

    fn poll(&mut self) -> TransferStatus {
        match self.socket {
            Some(_) => TransferStatus::Success,
            None => TransferStatus::Disconnect,
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoResult {
        let Some(socket) = self.socket.as_ref() else {
            return IoResult::disconnect();
        };
        let Some(destination) = self.destination.or(self.last_sender) else {
            warn!("no destination for datagram send - discarding {} bytes", buf.len());
            return IoResult::success(buf.len());
        };
        match socket.send_to(buf, destination) {
            Ok(n) => IoResult::success(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                IoResult::wait()
            }
            // an asynchronous ICMP error from an earlier datagram; the peer
            //  may simply not be up yet
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => IoResult::wait(),
            Err(e) => {
                debug!("datagram send error: {}", e);
                IoResult::disconnect()
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> IoResult {
        let Some(socket) = self.socket.as_ref() else {
            return IoResult::disconnect();
        };
        match socket.recv_from(buf) {
            Ok((n, from)) => {
                self.last_sender = Some(from);
                IoResult::success(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                IoResult::wait()
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => IoResult::wait(),
            Err(e) => {
                debug!("datagram receive error: {}", e);
                IoResult::disconnect()
            }
        }
    }

    fn shutdown(&mut self) {
        self.socket = None;
    }

    fn set_destination(&mut self, addr: SocketAddr) {
        self.destination = Some(addr);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_roundtrip_with_retarget() {
        let mut sender =
            UdpTransport::from_details(&ConnectionDetails::parse("(Socket)passive:ANY:47661"));
        let mut receiver =
            UdpTransport::from_details(&ConnectionDetails::parse("(Socket)passive:ANY:47662"));
        sender.connect().unwrap();
        receiver.connect().unwrap();

        sender.set_destination(SocketAddr::from(([127, 0, 0, 1], 47662)));
        assert_eq!(sender.send(b"ping").status, TransferStatus::Success);

        let mut buf = [0u8; 64];
        let mut received = IoResult::wait();
        for _ in 0..50 {
            received = receiver.receive(&mut buf);
            if received.status == TransferStatus::Success {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(received.status, TransferStatus::Success);
        assert_eq!(&buf[..received.bytes], b"ping");
        // the receiver can now reply without an explicit destination
        assert!(receiver.last_sender().is_some());
        assert_eq!(receiver.send(b"pong").status, TransferStatus::Success);
    }

    #[test]
    fn test_missing_port_is_rejected() {
        let mut transport =
            UdpTransport::from_details(&ConnectionDetails::parse("(Socket)passive:ANY"));
        assert!(transport.connect().is_err());
    }
}
