use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::kernel::task::Task;
use crate::net::connection::Connection;
use crate::net::details::ConnectionDetails;

/// Aggregated throughput counters: running totals plus a once-per-second
///  rolling bytes-per-second window.
#[derive(Default)]
pub struct NetCounters {
    total_sent: AtomicU64,
    total_received: AtomicU64,
    window_sent: AtomicU64,
    window_received: AtomicU64,
    sent_per_second: AtomicU64,
    received_per_second: AtomicU64,
}

impl NetCounters {
    pub fn report_sent(&self, bytes: usize) {
        self.total_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn report_received(&self, bytes: usize) {
        self.total_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent_per_second(&self) -> u64 {
        self.sent_per_second.load(Ordering::Relaxed)
    }

    pub fn bytes_received_per_second(&self) -> u64 {
        self.received_per_second.load(Ordering::Relaxed)
    }

    fn roll_window(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let sent = self.window_sent.swap(0, Ordering::Relaxed);
        let received = self.window_received.swap(0, Ordering::Relaxed);
        self.sent_per_second
            .store((sent as f64 / secs) as u64, Ordering::Relaxed);
        self.received_per_second
            .store((received as f64 / secs) as u64, Ordering::Relaxed);
    }
}

/// State shared between a [NetworkManager], its installed systems and every
///  connection they create.
pub struct NetContext {
    counters: NetCounters,
    new_connection_buffer_size: AtomicUsize,
}

impl Default for NetContext {
    fn default() -> Self {
        NetContext::new()
    }
}

impl NetContext {
    pub fn new() -> NetContext {
        NetContext {
            counters: NetCounters::default(),
            // how much data a connection can process per read, not a limit
            //  on packet size
            new_connection_buffer_size: AtomicUsize::new(5 * 1024 * 1024),
        }
    }

    pub fn counters(&self) -> &NetCounters {
        &self.counters
    }

    pub fn new_connection_buffer_size(&self) -> usize {
        self.new_connection_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_new_connection_buffer_size(&self, size_in_bytes: usize) {
        self.new_connection_buffer_size
            .store(size_in_bytes, Ordering::Relaxed);
    }
}

/// Notified with each connection accepted by a listening endpoint. The
///  handler runs before the connection's connect callbacks fire, so
///  callbacks registered here observe the establish event.
pub trait IncomingConnectionListener: Send + Sync {
    fn incoming_connection(&self, connection: Arc<Connection>);
}

/// A pluggable transport provider installed into a [NetworkManager], e.g.
///  the socket-based system. A system owns the connections it creates,
///  pumps them once per manager tick, and must never block.
pub trait NetworkSystem: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> bool {
        true
    }

    /// Pump every connection and listener once. Called once per scheduler
    ///  tick by the owning manager.
    fn update(&self);

    fn connect(&self, details: ConnectionDetails) -> Option<Arc<Connection>>;

    fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        details: ConnectionDetails,
    ) -> bool;

    fn disconnect_all(&self);
}

/// Owns the installed [NetworkSystem]s and routes `connect`/`listen` calls
///  to the system selected by the connection string's `(<System>)` prefix,
///  falling back to the default system. The manager is itself a [Task]:
///  each tick polls every installed system and rolls the throughput window.
pub struct NetworkManager {
    context: Arc<NetContext>,
    systems: Mutex<FxHashMap<String, Arc<dyn NetworkSystem>>>,
    default_system: Mutex<Option<String>>,
    window_started: Mutex<Instant>,
}

impl Default for NetworkManager {
    fn default() -> Self {
        NetworkManager::new()
    }
}

impl NetworkManager {
    pub fn new() -> NetworkManager {
        NetworkManager {
            context: Arc::new(NetContext::new()),
            systems: Mutex::new(FxHashMap::default()),
            default_system: Mutex::new(None),
            window_started: Mutex::new(Instant::now()),
        }
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.context
    }

    /// Install a network system under its name. The first installed system
    ///  (or one installed with `default_system`) becomes the fallback for
    ///  connection strings without a `(<System>)` prefix.
    pub fn install_system(
        &self,
        system: Arc<dyn NetworkSystem>,
        default_system: bool,
    ) -> anyhow::Result<()> {
        let name = system.name().to_string();
        {
            let systems = self.systems.lock();
            if systems.contains_key(&name) {
                bail!("a network system named '{}' is already installed", name);
            }
        }
        if !system.start() {
            bail!("network system '{}' failed to start", name);
        }
        self.systems.lock().insert(name.clone(), system);
        let mut default = self.default_system.lock();
        if default_system || default.is_none() {
            *default = Some(name);
        }
        Ok(())
    }

    pub fn uninstall_system(&self, name: &str) -> anyhow::Result<()> {
        let system = {
            let mut systems = self.systems.lock();
            systems.remove(name)
        };
        let Some(system) = system else {
            bail!("no network system named '{}' is installed", name);
        };
        system.disconnect_all();
        let mut default = self.default_system.lock();
        if default.as_deref() == Some(name) {
            *default = self.systems.lock().keys().next().cloned();
        }
        Ok(())
    }

    pub fn installed_system(&self, name: &str) -> Option<Arc<dyn NetworkSystem>> {
        self.systems.lock().get(name).cloned()
    }

    fn system_for(&self, details: &ConnectionDetails) -> Option<Arc<dyn NetworkSystem>> {
        let systems = self.systems.lock();
        match details.system() {
            Some(name) => systems.get(name).cloned(),
            None => self
                .default_system
                .lock()
                .as_ref()
                .and_then(|name| systems.get(name).cloned()),
        }
    }

    /// Open an outgoing connection described by a connection string, e.g.
    ///  `(Socket)direct:127.0.0.1:1234`. Returns None for an unknown system
    ///  or malformed details; failures of an initiated connection are
    ///  reported later through disconnect callbacks.
    pub fn connect(&self, connection_string: &str) -> Option<Arc<Connection>> {
        let details = ConnectionDetails::parse(connection_string);
        let Some(system) = self.system_for(&details) else {
            error!("no network system available for '{}'", connection_string);
            return None;
        };
        system.connect(details)
    }

    /// Set up a listening endpoint; accepted connections go to `listener`.
    pub fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        connection_string: &str,
    ) -> bool {
        let details = ConnectionDetails::parse(connection_string);
        let Some(system) = self.system_for(&details) else {
            error!("no network system available for '{}'", connection_string);
            return false;
        };
        system.listen(listener, details)
    }

    pub fn bytes_sent_per_second(&self) -> u64 {
        self.context.counters().bytes_sent_per_second()
    }

    pub fn bytes_received_per_second(&self) -> u64 {
        self.context.counters().bytes_received_per_second()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.context.counters().total_bytes_sent()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.context.counters().total_bytes_received()
    }

    pub fn set_new_connection_buffer_size(&self, size_in_bytes: usize) {
        self.context.set_new_connection_buffer_size(size_in_bytes);
    }
}

impl Task for NetworkManager {
    fn name(&self) -> &str {
        "network-manager"
    }

    fn update(&self, _frame_time: Duration) {
        let systems: Vec<Arc<dyn NetworkSystem>> =
            self.systems.lock().values().cloned().collect();
        for system in systems {
            system.update();
        }

        let mut window_started = self.window_started.lock();
        let elapsed = window_started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.context.counters().roll_window(elapsed);
            *window_started = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener;
    impl IncomingConnectionListener for NullListener {
        fn incoming_connection(&self, _connection: Arc<Connection>) {}
    }

    #[test]
    fn test_connect_with_no_system_fails_locally() {
        let manager = NetworkManager::new();
        assert!(manager.connect("(Socket)direct:127.0.0.1:1234").is_none());
        assert!(!manager.listen(Arc::new(NullListener), "(Socket)direct:ANY:1234"));
    }

    #[test]
    fn test_unknown_system_name_fails_locally() {
        struct NoopSystem;
        impl NetworkSystem for NoopSystem {
            fn name(&self) -> &str {
                "Noop"
            }
            fn update(&self) {}
            fn connect(&self, _details: ConnectionDetails) -> Option<Arc<Connection>> {
                None
            }
            fn listen(
                &self,
                _listener: Arc<dyn IncomingConnectionListener>,
                _details: ConnectionDetails,
            ) -> bool {
                false
            }
            fn disconnect_all(&self) {}
        }

        let manager = NetworkManager::new();
        manager.install_system(Arc::new(NoopSystem), true).unwrap();
        assert!(manager.connect("(Missing)direct:127.0.0.1:1").is_none());
        // duplicate install is rejected
        assert!(manager.install_system(Arc::new(NoopSystem), false).is_err());
    }
}
