use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use echonet::kernel::kernel::Kernel;
use echonet::kernel::task::Task;
use echonet::kernel::task_manager::TaskManager;
use echonet::kernel::timer::CountDownTimer;
use echonet::net::connection::{Connection, ConnectionOwner};
use echonet::net::manager::{IncomingConnectionListener, NetworkManager};
use echonet::net::socket_system::SocketNetworkSystem;

mod test_logging {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}

/// Server-side owner of one accepted connection: answers type-100 requests
///  with a message response and acknowledges everything else with a type-1
///  control packet.
struct ServerSide {
    _connection: Arc<Connection>,
}

impl ConnectionOwner for ServerSide {
    fn received_packet(
        &self,
        connection: &Arc<Connection>,
        _packet: &Arc<echonet::net::packet::DataPacket>,
    ) {
        connection.send_control_packet(0x1);
    }
}

#[derive(Default)]
struct ServerListener {
    sides: Mutex<Vec<Arc<ServerSide>>>,
}

impl IncomingConnectionListener for ServerListener {
    fn incoming_connection(&self, connection: Arc<Connection>) {
        connection.register_packet_callback(100, |conn, packet| {
            conn.send_message_response(packet, "I got your message!", false);
        });
        let side = Arc::new(ServerSide {
            _connection: connection.clone(),
        });
        connection.set_owner(&side);
        // the owner is held weakly by the connection, keep it alive here
        self.sides.lock().push(side);
    }
}

#[derive(Default)]
struct ClientState {
    acks: AtomicUsize,
    response: Mutex<Option<String>>,
    dropped_early: AtomicBool,
}

impl ClientState {
    fn done(&self) -> bool {
        // one type-1 ack per packet the server handled via fallback: the
        //  five type-1 controls plus types 2..=5, minus the type-100 request
        self.response.lock().is_some() && self.acks.load(Ordering::Relaxed) >= 8
    }
}

/// Drive the client side of the exchange on an established connection.
fn start_client_exchange(connection: &Arc<Connection>, state: &Arc<ClientState>) {
    {
        let state = state.clone();
        connection.register_packet_callback(1, move |_, _| {
            state.acks.fetch_add(1, Ordering::Relaxed);
        });
    }
    {
        let state = state.clone();
        connection.register_disconnect_callback("client-exchange", move |_| {
            if !state.done() {
                state.dropped_early.store(true, Ordering::Relaxed);
            }
        });
    }
    connection.register_connect_callback("client-exchange", |connection| {
        tracing::info!("client established {}", connection.friendly_identifier());
    });

    connection.send_control_packet(1);
    connection.send_control_packet(2);
    connection.send_control_packet(1);
    connection.send_control_packet(3);
    {
        let state = state.clone();
        connection.send_control_packet_with_response(100, move |_, packet| {
            *state.response.lock() = packet.get_string(0);
        });
    }
    connection.send_control_packet(1);
    connection.send_control_packet(4);
    connection.send_control_packet(1);
    connection.send_control_packet(5);
}

/// Removes every task from the manager once the predicate holds, ending the
///  kernel's execute loop.
struct StopWhen {
    manager: Arc<TaskManager>,
    predicate: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Task for StopWhen {
    fn name(&self) -> &str {
        "stop-when"
    }

    fn update(&self, _frame_time: Duration) {
        if (self.predicate)() {
            self.manager.remove_all_tasks();
        }
    }
}

struct TlsFiles {
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

fn make_tls_files(dir: &Path) -> TlsFiles {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec!["tlstest".to_string()]).unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let files = TlsFiles {
        ca: dir.join("cacert.pem"),
        cert: dir.join("tlstest-cert.pem"),
        key: dir.join("tlstest-key.pem"),
    };
    std::fs::write(&files.ca, ca_cert.pem()).unwrap();
    std::fs::write(&files.cert, server_cert.pem()).unwrap();
    std::fs::write(&files.key, server_key.serialize_pem()).unwrap();
    files
}

fn listen_uri(port: u16, tls: Option<&TlsFiles>) -> String {
    match tls {
        None => format!("(Socket)direct:ANY:{}", port),
        Some(files) => format!(
            "(Socket)direct:ANY:{}:security=tls:privateKey={}:publicCert={}",
            port,
            files.key.display(),
            files.cert.display()
        ),
    }
}

fn connect_uri(port: u16, tls: Option<&TlsFiles>) -> String {
    match tls {
        None => format!("(Socket)direct:127.0.0.1:{}", port),
        Some(files) => format!(
            "(Socket)direct:127.0.0.1:{}:security=tls:ca={}:commonName=tlstest",
            port,
            files.ca.display()
        ),
    }
}

/// The full exchange on a single kernel: a listener and a client connection
///  in the same manager, completing within the 5 second timeout.
fn run_simple_exchange(port: u16, tls: Option<&TlsFiles>) {
    let kernel = Arc::new(Kernel::new());
    let manager = Arc::new(NetworkManager::new());
    let system = SocketNetworkSystem::new(manager.context().clone());
    manager.install_system(system, true).unwrap();

    let server = Arc::new(ServerListener::default());
    assert!(
        manager.listen(server.clone(), &listen_uri(port, tls)),
        "failed to set up listening"
    );

    let connection = manager
        .connect(&connect_uri(port, tls))
        .expect("failed to initiate client connection");
    let state = Arc::new(ClientState::default());
    start_client_exchange(&connection, &state);

    kernel.add_task(manager.clone()).unwrap();
    {
        let state = state.clone();
        kernel
            .add_task(Arc::new(StopWhen {
                manager: kernel.task_manager().clone(),
                predicate: Box::new(move || state.done()),
            }))
            .unwrap();
    }
    {
        let task_manager = kernel.task_manager().clone();
        kernel
            .add_task(Arc::new(CountDownTimer::new(
                Duration::from_secs(5),
                "timeout",
                move || task_manager.remove_all_tasks(),
            )))
            .unwrap();
    }
    kernel.execute().unwrap();

    assert_eq!(
        *state.response.lock(),
        Some("I got your message!".to_string())
    );
    assert_eq!(state.acks.load(Ordering::Relaxed), 8);
    assert!(
        !state.dropped_early.load(Ordering::Relaxed),
        "a connection dropped before the exchange completed"
    );
}

#[test]
fn test_simple_exchange() {
    run_simple_exchange(47311, None);
}

#[test]
fn test_tls_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let files = make_tls_files(dir.path());
    run_simple_exchange(47313, Some(&files));
}

/// A network node with its own kernel pumped from its own thread; the
///  concurrency unit is one cooperative scheduler per thread.
struct NetworkNode {
    manager: Arc<NetworkManager>,
    kernel: Arc<Kernel>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NetworkNode {
    fn new() -> NetworkNode {
        let manager = Arc::new(NetworkManager::new());
        let system = SocketNetworkSystem::new(manager.context().clone());
        manager.install_system(system, true).unwrap();
        // a small receive buffer forces packets to reassemble across many
        //  partial reads
        manager.set_new_connection_buffer_size(128);

        let kernel = Arc::new(Kernel::new());
        kernel.add_task(manager.clone()).unwrap();
        NetworkNode {
            manager,
            kernel,
            thread: None,
        }
    }

    fn run_in_background(&mut self, name: &str) {
        let kernel = self.kernel.clone();
        self.thread = Some(
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || kernel.execute().unwrap())
                .unwrap(),
        );
    }

    fn stop(&mut self) {
        self.kernel.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

#[test]
fn test_two_kernels_on_two_threads() {
    let port = 47315;

    let mut server_node = NetworkNode::new();
    let server = Arc::new(ServerListener::default());
    assert!(server_node.manager.listen(server.clone(), &listen_uri(port, None)));
    server_node.run_in_background("server");

    let mut client_node = NetworkNode::new();
    client_node.run_in_background("client");
    let connection = client_node
        .manager
        .connect(&connect_uri(port, None))
        .expect("failed to initiate client connection");
    let state = Arc::new(ClientState::default());
    start_client_exchange(&connection, &state);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !state.done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }

    server_node.stop();
    client_node.stop();

    assert_eq!(
        *state.response.lock(),
        Some("I got your message!".to_string())
    );
    assert_eq!(state.acks.load(Ordering::Relaxed), 8);
    assert!(server_node.manager.total_bytes_received() > 0);
    assert!(client_node.manager.total_bytes_sent() > 0);
}
