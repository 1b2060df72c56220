use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::net::connection::{Connection, ConnectionState, TransferStatus, Transport};
use crate::net::details::ConnectionDetails;
use crate::net::manager::{IncomingConnectionListener, NetContext, NetworkSystem};
use crate::net::tcp::TcpTransport;
use crate::net::tls::{load_server_config, TlsTransport};
use crate::net::udp::UdpTransport;

#[derive(Clone)]
struct Tracked {
    connection: Arc<Connection>,
    /// notified once, just before the connection's establish event
    incoming: Option<Arc<dyn IncomingConnectionListener>>,
}

struct ListenEndpoint {
    listener: TcpListener,
    handler: Arc<dyn IncomingConnectionListener>,
    tls: Option<Arc<ServerConfig>>,
    details: ConnectionDetails,
}

#[derive(Default)]
struct Inner {
    connections: Vec<Tracked>,
    listeners: Vec<ListenEndpoint>,
}

/// The socket-based [NetworkSystem]: non-blocking TCP (`direct`), optionally
///  TLS-wrapped (`security=tls`), and UDP datagrams (`passive`).
///
/// Each tick accepts pending connections on every listening endpoint, then
///  pumps every connection: connect/handshake progress while Connecting,
///  receive then send while Connected. A connection that reports Disconnect
///  is released after its disconnect callbacks have fired.
pub struct SocketNetworkSystem {
    context: Arc<NetContext>,
    inner: Mutex<Inner>,
}

impl SocketNetworkSystem {
    pub fn new(context: Arc<NetContext>) -> Arc<SocketNetworkSystem> {
        Arc::new(SocketNetworkSystem {
            context,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn make_listener(details: &ConnectionDetails) -> anyhow::Result<TcpListener> {
        let port: u16 = details.get_with_index_fallback("port", 0, 0);
        if port == 0 {
            anyhow::bail!("a port is required: {}", details);
        }
        let address = match details.address() {
            Some("ANY") | None => "0.0.0.0",
            Some(address) => address,
        };
        let addr: SocketAddr = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve hostname {}", address))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    }

    fn track(&self, connection: Arc<Connection>, incoming: Option<Arc<dyn IncomingConnectionListener>>) {
        self.inner.lock().connections.push(Tracked {
            connection,
            incoming,
        });
    }

    fn accept_incoming(&self) {
        type Accepted = (
            TcpStream,
            SocketAddr,
            Arc<dyn IncomingConnectionListener>,
            Option<Arc<ServerConfig>>,
        );
        let accepted: Vec<Accepted> = {
            let inner = self.inner.lock();
            let mut out = Vec::new();
            for endpoint in &inner.listeners {
                loop {
                    match endpoint.listener.accept() {
                        Ok((stream, peer)) => {
                            out.push((stream, peer, endpoint.handler.clone(), endpoint.tls.clone()))
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("accept failed on {}: {}", endpoint.details, e);
                            break;
                        }
                    }
                }
            }
            out
        };

        for (stream, peer, handler, tls) in accepted {
            let transport: Box<dyn Transport> = match tls {
                Some(config) => match TlsTransport::from_accepted(stream, config) {
                    Ok(transport) => Box::new(transport),
                    Err(e) => {
                        error!("unable to upgrade accepted connection to TLS: {}", e);
                        continue;
                    }
                },
                None => match TcpTransport::from_accepted(stream) {
                    Ok(transport) => Box::new(transport),
                    Err(e) => {
                        error!("unable to set up accepted connection: {}", e);
                        continue;
                    }
                },
            };
            debug!("incoming connection from {}", peer);
            let details =
                ConnectionDetails::parse(&format!("(Socket)direct:{}:{}", peer.ip(), peer.port()));
            let connection = Connection::new(transport, details, self.context.clone());
            connection.mark_connecting();
            self.track(connection, Some(handler));
        }
    }

    fn pump_connections(&self) {
        let snapshot: Vec<Tracked> = self.inner.lock().connections.clone();
        let mut released: Vec<Arc<Connection>> = Vec::new();

        for tracked in snapshot {
            let connection = &tracked.connection;
            match connection.state() {
                ConnectionState::Connecting => match connection.poll_transport() {
                    TransferStatus::Success => {
                        if let Some(handler) = &tracked.incoming {
                            handler.incoming_connection(connection.clone());
                        }
                        connection.establish();
                    }
                    TransferStatus::Wait => {}
                    TransferStatus::Disconnect => {
                        connection.dropped();
                        released.push(connection.clone());
                    }
                },
                ConnectionState::Connected => {
                    connection.update_receive();
                    if connection.is_connected() {
                        connection.update_send(true);
                    }
                    if connection.state() == ConnectionState::Disconnected {
                        released.push(connection.clone());
                    }
                }
                ConnectionState::Disconnected => released.push(connection.clone()),
            }
        }

        if !released.is_empty() {
            let mut inner = self.inner.lock();
            inner.connections.retain(|tracked| {
                !released
                    .iter()
                    .any(|r| Arc::ptr_eq(&tracked.connection, r))
            });
        }
    }
}

impl NetworkSystem for SocketNetworkSystem {
    fn name(&self) -> &str {
        "Socket"
    }

    fn update(&self) {
        self.accept_incoming();
        self.pump_connections();
    }

    fn connect(&self, details: ConnectionDetails) -> Option<Arc<Connection>> {
        let transport: Box<dyn Transport> = match details.conn_type() {
            Some("direct") | None => {
                if details.get("security", String::new()) == "tls" {
                    Box::new(TlsTransport::from_details(&details))
                } else {
                    Box::new(TcpTransport::from_details(&details))
                }
            }
            Some("passive") => Box::new(UdpTransport::from_details(&details)),
            Some(other) => {
                error!("unsupported connection type '{}' in {}", other, details);
                return None;
            }
        };

        let connection = Connection::new(transport, details, self.context.clone());
        if !connection.connect() {
            return None;
        }
        self.track(connection.clone(), None);
        Some(connection)
    }

    fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        details: ConnectionDetails,
    ) -> bool {
        match details.conn_type() {
            Some("direct") | None => {
                let tls = if details.get("security", String::new()) == "tls" {
                    match load_server_config(&details) {
                        Ok(config) => Some(config),
                        Err(e) => {
                            error!("failed to set up TLS listening on {}: {}", details, e);
                            return false;
                        }
                    }
                } else {
                    None
                };
                match Self::make_listener(&details) {
                    Ok(tcp_listener) => {
                        info!("listening on {}", details);
                        self.inner.lock().listeners.push(ListenEndpoint {
                            listener: tcp_listener,
                            handler: listener,
                            tls,
                            details,
                        });
                        true
                    }
                    Err(e) => {
                        error!("failed to listen on {}: {}", details, e);
                        false
                    }
                }
            }
            Some("passive") => {
                // a datagram endpoint is "established" as soon as it is
                //  bound; it is handed to the handler like an accepted
                //  connection on the next tick
                let transport = Box::new(UdpTransport::from_details(&details));
                let connection = Connection::new(transport, details, self.context.clone());
                if !connection.connect() {
                    return false;
                }
                self.track(connection, Some(listener));
                true
            }
            Some(other) => {
                error!("unsupported connection type '{}' in {}", other, details);
                false
            }
        }
    }

    fn disconnect_all(&self) {
        let snapshot: Vec<Tracked> = self.inner.lock().connections.clone();
        for tracked in snapshot {
            tracked.connection.disconnect();
        }
        let mut inner = self.inner.lock();
        inner.connections.clear();
        inner.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_refused_connect_reports_disconnect() {
        let context = Arc::new(NetContext::new());
        let system = SocketNetworkSystem::new(context);

        // nothing listens on this port; the non-blocking connect is expected
        //  to fail on a later tick, not at initiation
        let connection = system
            .connect(ConnectionDetails::parse("(Socket)direct:127.0.0.1:9"))
            .expect("connect initiation should succeed");

        let dropped = Arc::new(Mutex::new(false));
        {
            let dropped = dropped.clone();
            connection.register_disconnect_callback("test", move |_| *dropped.lock() = true);
        }

        for _ in 0..500 {
            system.update();
            if *dropped.lock() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(*dropped.lock());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unsupported_connection_type_rejected() {
        let system = SocketNetworkSystem::new(Arc::new(NetContext::new()));
        assert!(system
            .connect(ConnectionDetails::parse("(Socket)warp:127.0.0.1:1"))
            .is_none());
    }
}
