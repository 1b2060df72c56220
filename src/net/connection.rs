use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, trace, warn};

use crate::net::details::ConnectionDetails;
use crate::net::manager::NetContext;
use crate::net::packet::{DataPacket, PacketHeader};

/// Payload lengths above this are treated as a protocol violation and drop
///  the connection. The header length field comes straight off the wire and
///  must not be trusted to allocate unbounded memory.
const UNREASONABLE_DATA_SIZE: usize = 10 * 1024 * 1024;

/// Result of a single non-blocking transport operation.
///
/// `Wait` is not an error: it means the operation would block and should be
///  retried on the next scheduler tick. `Disconnect` is fatal for the
///  connection; the owning system releases it after disconnect callbacks
///  have fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Wait,
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoResult {
    pub bytes: usize,
    pub status: TransferStatus,
}

impl IoResult {
    pub fn success(bytes: usize) -> IoResult {
        IoResult {
            bytes,
            status: TransferStatus::Success,
        }
    }

    pub fn wait() -> IoResult {
        IoResult {
            bytes: 0,
            status: TransferStatus::Wait,
        }
    }

    pub fn disconnect() -> IoResult {
        IoResult {
            bytes: 0,
            status: TransferStatus::Disconnect,
        }
    }
}

/// The transport seam under a [Connection]: raw TCP, TLS or UDP.
///
/// Implementations must never block. `poll` drives connect / handshake
///  progress and reports `Success` once the transport is ready to carry
///  traffic; `send` and `receive` move as many bytes as the underlying
///  socket allows right now.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// Start a connection attempt. This only initiates: completion is
    ///  observed through `poll`.
    fn connect(&mut self) -> anyhow::Result<()>;

    fn poll(&mut self) -> TransferStatus;

    fn send(&mut self, buf: &[u8]) -> IoResult;

    fn receive(&mut self, buf: &mut [u8]) -> IoResult;

    fn shutdown(&mut self);

    /// Retarget the destination for subsequent sends. Only meaningful for
    ///  datagram transports.
    fn set_destination(&mut self, _addr: SocketAddr) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Implemented by application objects that want lifecycle and fallback
///  packet notifications for a connection, without depending on transport
///  details. The connection holds the owner weakly; it never keeps it alive.
pub trait ConnectionOwner: Send + Sync {
    fn connection_established(&self, _connection: &Arc<Connection>) {}

    fn connection_drop(&self, _connection: &Arc<Connection>) {}

    /// Called for received packets that no registered callback handled.
    fn received_packet(&self, _connection: &Arc<Connection>, _packet: &Arc<DataPacket>) {}
}

pub type PacketCallback = Arc<dyn Fn(&Arc<Connection>, &Arc<DataPacket>) + Send + Sync>;
pub type LabelledPacketCallback = Arc<dyn Fn(&Arc<Connection>, &Arc<DataPacket>, &[u8]) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// One-shot callback invoked with the packet that responds to a sent packet.
pub type ResponseCallback = Box<dyn FnOnce(&Arc<Connection>, &Arc<DataPacket>) + Send>;
/// Flow control hook: `(connection, queued_bytes, threshold, packet)`.
///  Return false to discard the packet instead of queueing it.
pub type BacklogCallback =
    Box<dyn FnMut(&Arc<Connection>, usize, usize, &Arc<DataPacket>) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct QueuedPacket {
    /// header + payload, framed once at enqueue so stream and datagram
    ///  transports share the same cursor-based pump
    frame: BytesMut,
    cursor: usize,
    packet: Arc<DataPacket>,
    disconnect_after_send: bool,
    destination: Option<SocketAddr>,
}

struct SendState {
    queue: VecDeque<QueuedPacket>,
    can_send: bool,
}

struct RecvState {
    header_buf: [u8; PacketHeader::SERIALIZED_LEN],
    header_filled: usize,
    current: Option<DataPacket>,
    buf: Vec<u8>,
}

#[derive(Default)]
struct Callbacks {
    packet: FxHashMap<u32, Vec<PacketCallback>>,
    labelled: FxHashMap<String, Vec<LabelledPacketCallback>>,
    connect: Vec<(String, ConnectCallback)>,
    disconnect: Vec<(String, DisconnectCallback)>,
}

#[derive(Default)]
struct BacklogState {
    callback: Option<BacklogCallback>,
    threshold: usize,
}

/// A per-endpoint network session: a state machine
///  (Disconnected → Connecting → Connected → Disconnected) over a pluggable
///  [Transport], with an asynchronous send queue, streaming packet
///  reassembly and callback dispatch by packet type, label, or response id.
///
/// All I/O is non-blocking; the owning network system pumps
///  [Connection::update_receive] and [Connection::update_send] once per
///  scheduler tick. Completed packets dispatch synchronously inside the pump
///  that finished reassembling them, preserving per-connection FIFO order.
pub struct Connection {
    details: Mutex<ConnectionDetails>,
    local_details: Mutex<ConnectionDetails>,
    state: Mutex<ConnectionState>,
    transport: Mutex<Box<dyn Transport>>,
    owner: Mutex<Option<Weak<dyn ConnectionOwner>>>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    callbacks: Mutex<Callbacks>,
    response_callbacks: Mutex<FxHashMap<u32, ResponseCallback>>,
    backlog: Mutex<BacklogState>,
    /// framed bytes queued but not yet handed to the transport
    bytes_queued: Mutex<usize>,
    allowed_packet_types: Mutex<FxHashSet<u32>>,
    allowed_labels: Mutex<FxHashSet<String>>,
    next_packet_id: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    queue_if_not_connected: AtomicBool,
    discard_queue_on_disconnect: AtomicBool,
    context: Arc<NetContext>,
}

impl Connection {
    pub fn new(
        transport: Box<dyn Transport>,
        details: ConnectionDetails,
        context: Arc<NetContext>,
    ) -> Arc<Connection> {
        let buffer_size = context.new_connection_buffer_size();
        Arc::new(Connection {
            details: Mutex::new(details),
            local_details: Mutex::new(ConnectionDetails::default()),
            state: Mutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(transport),
            owner: Mutex::new(None),
            send: Mutex::new(SendState {
                queue: VecDeque::new(),
                can_send: false,
            }),
            recv: Mutex::new(RecvState {
                header_buf: [0; PacketHeader::SERIALIZED_LEN],
                header_filled: 0,
                current: None,
                buf: vec![0; buffer_size],
            }),
            callbacks: Mutex::new(Callbacks::default()),
            response_callbacks: Mutex::new(FxHashMap::default()),
            backlog: Mutex::new(BacklogState::default()),
            bytes_queued: Mutex::new(0),
            allowed_packet_types: Mutex::new(FxHashSet::default()),
            allowed_labels: Mutex::new(FxHashSet::default()),
            next_packet_id: AtomicU32::new(1),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            queue_if_not_connected: AtomicBool::new(true),
            discard_queue_on_disconnect: AtomicBool::new(false),
            context,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn connection_details(&self) -> ConnectionDetails {
        self.details.lock().clone()
    }

    pub fn local_connection_details(&self) -> ConnectionDetails {
        self.local_details.lock().clone()
    }

    pub fn friendly_identifier(&self) -> String {
        self.details.lock().to_string()
    }

    pub fn local_friendly_identifier(&self) -> String {
        self.local_details.lock().to_string()
    }

    pub fn set_owner<O: ConnectionOwner + 'static>(&self, owner: &Arc<O>) {
        let owner: Arc<dyn ConnectionOwner> = owner.clone();
        let weak: Weak<dyn ConnectionOwner> = Arc::downgrade(&owner);
        *self.owner.lock() = Some(weak);
    }

    pub fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    /// Request a transition from Disconnected to Connecting. The transition
    ///  to Connected is observed by the owning system polling the transport.
    pub fn connect(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Connecting;
        }
        info!("connecting {}...", self.friendly_identifier());
        match self.transport.lock().connect() {
            Ok(()) => true,
            Err(e) => {
                error!("error initiating connection attempt: {}", e);
                *self.state.lock() = ConnectionState::Disconnected;
                false
            }
        }
    }

    pub fn disconnect(self: &Arc<Self>) -> bool {
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        self.transport.lock().shutdown();
        self.dropped();
        true
    }

    /// Drive connect / handshake progress. Used by the owning system while
    ///  the connection is in the Connecting state.
    pub(crate) fn poll_transport(&self) -> TransferStatus {
        self.transport.lock().poll()
    }

    /// Used by listening endpoints for accepted sockets: the transport is
    ///  already live, so the connection starts in Connecting and is
    ///  established once the transport (e.g. a TLS handshake) reports ready.
    pub(crate) fn mark_connecting(&self) {
        *self.state.lock() = ConnectionState::Connecting;
    }

    // ---- sending --------------------------------------------------------

    pub fn send_data_packet(self: &Arc<Self>, packet: Arc<DataPacket>) {
        self.enqueue(packet, None, None, false);
    }

    pub fn send_data_packet_with_response(
        self: &Arc<Self>,
        packet: Arc<DataPacket>,
        response_callback: impl FnOnce(&Arc<Connection>, &Arc<DataPacket>) + Send + 'static,
    ) {
        self.enqueue(packet, Some(Box::new(response_callback)), None, false);
    }

    /// Send to an explicit destination address. Only meaningful on datagram
    ///  transports, which retarget the destination for this packet.
    pub fn send_data_packet_to(self: &Arc<Self>, packet: Arc<DataPacket>, destination: SocketAddr) {
        self.enqueue(packet, None, Some(destination), false);
    }

    pub fn send_data(self: &Arc<Self>, data: &[u8], packet_type: u32) {
        let mut packet = DataPacket::with_type_and_size(packet_type, data.len());
        packet.append_data(data);
        self.send_data_packet(Arc::new(packet));
    }

    pub fn send_message(self: &Arc<Self>, message: &str, packet_type: u32) {
        let mut packet = DataPacket::from_string(message);
        packet.set_packet_type(packet_type);
        self.send_data_packet(Arc::new(packet));
    }

    /// A control packet has a type id and no payload, for notification use.
    pub fn send_control_packet(self: &Arc<Self>, packet_type: u32) {
        self.send_data_packet(Arc::new(DataPacket::with_type_and_size(packet_type, 0)));
    }

    pub fn send_control_packet_with_response(
        self: &Arc<Self>,
        packet_type: u32,
        response_callback: impl FnOnce(&Arc<Connection>, &Arc<DataPacket>) + Send + 'static,
    ) {
        let packet = Arc::new(DataPacket::with_type_and_size(packet_type, 0));
        self.send_data_packet_with_response(packet, response_callback);
    }

    pub fn send_labelled_packet(self: &Arc<Self>, label: &str, data: &[u8]) {
        let mut packet = DataPacket::labelled(label, data.len());
        packet.append_data(data);
        self.send_data_packet(Arc::new(packet));
    }

    pub fn send_labelled_string(self: &Arc<Self>, label: &str, content: &str) {
        self.send_data_packet(Arc::new(DataPacket::labelled_string(label, content)));
    }

    /// Send a prepared packet as the response to a received packet.
    pub fn send_packet_response(
        self: &Arc<Self>,
        responding_to: &Arc<DataPacket>,
        mut packet: DataPacket,
        disconnect_after_send: bool,
    ) {
        packet.set_response_to(responding_to.packet_id());
        self.enqueue(Arc::new(packet), None, None, disconnect_after_send);
    }

    pub fn send_data_response(
        self: &Arc<Self>,
        responding_to: &Arc<DataPacket>,
        data: &[u8],
        disconnect_after_send: bool,
    ) {
        let mut packet = DataPacket::with_type_and_size(responding_to.packet_type(), data.len());
        packet.append_data(data);
        self.send_packet_response(responding_to, packet, disconnect_after_send);
    }

    pub fn send_message_response(
        self: &Arc<Self>,
        responding_to: &Arc<DataPacket>,
        message: &str,
        disconnect_after_send: bool,
    ) {
        let mut packet = DataPacket::from_string(message);
        packet.set_packet_type(responding_to.packet_type());
        self.send_packet_response(responding_to, packet, disconnect_after_send);
    }

    fn enqueue(
        self: &Arc<Self>,
        packet: Arc<DataPacket>,
        response_callback: Option<ResponseCallback>,
        destination: Option<SocketAddr>,
        disconnect_after_send: bool,
    ) {
        if self.state() == ConnectionState::Disconnected
            && !self.queue_if_not_connected.load(Ordering::Relaxed)
        {
            debug!("not connected and queueing while disconnected is disabled - discarding packet");
            return;
        }

        let framed_len = PacketHeader::SERIALIZED_LEN + packet.received_data_size();

        let threshold = self.backlog.lock().threshold;
        if threshold > 0 {
            let new_total = *self.bytes_queued.lock() + framed_len;
            if new_total >= threshold {
                // The callback is taken out of its slot for the duration of
                //  the call so it may itself use the connection. Registering
                //  a different callback from inside the callback wins over
                //  the one being restored.
                let callback = self.backlog.lock().callback.take();
                if let Some(mut callback) = callback {
                    let keep = callback(self, new_total, threshold, &packet);
                    let mut backlog = self.backlog.lock();
                    if backlog.callback.is_none() {
                        backlog.callback = Some(callback);
                    }
                    if !keep {
                        trace!(
                            "backlog callback discarded packet, {} bytes queued of threshold {}",
                            new_total,
                            threshold
                        );
                        return;
                    }
                }
            }
        }

        packet.set_packet_id(self.next_packet_id.fetch_add(1, Ordering::Relaxed));

        let header = PacketHeader::for_packet(&packet);
        let mut frame = BytesMut::with_capacity(framed_len);
        header.ser(&mut frame);
        frame.extend_from_slice(packet.payload());

        if let Some(callback) = response_callback {
            self.response_callbacks
                .lock()
                .insert(header.packet_id, callback);
        }
        self.send.lock().queue.push_back(QueuedPacket {
            frame,
            cursor: 0,
            packet,
            disconnect_after_send,
            destination,
        });
        *self.bytes_queued.lock() += framed_len;

        self.update_send(false);
    }

    // ---- transport pumps ------------------------------------------------

    pub fn update_receive(self: &Arc<Self>) {
        if self.receive_packets() == TransferStatus::Disconnect {
            self.transport.lock().shutdown();
            self.dropped();
        }
    }

    pub fn update_send(self: &Arc<Self>, reenable: bool) {
        if self.send_packets(reenable) == TransferStatus::Disconnect {
            self.transport.lock().shutdown();
            self.dropped();
        }
    }

    /// Drain as much as the transport allows, reassembling packets from the
    ///  header+payload stream and dispatching each completed packet.
    pub fn receive_packets(self: &Arc<Self>) -> TransferStatus {
        loop {
            let mut completed = Vec::new();
            let status = {
                let mut recv = self.recv.lock();
                let recv = &mut *recv;
                let result = self.transport.lock().receive(&mut recv.buf);
                match result.status {
                    TransferStatus::Success => {
                        self.bytes_received
                            .fetch_add(result.bytes as u64, Ordering::Relaxed);
                        self.context.counters().report_received(result.bytes);
                        if Self::parse_incoming(recv, result.bytes, &mut completed).is_err() {
                            TransferStatus::Disconnect
                        } else {
                            TransferStatus::Success
                        }
                    }
                    other => other,
                }
            };

            // dispatch with no locks held: callbacks commonly send replies
            for packet in completed {
                self.process_received_packet(Arc::new(packet));
            }

            // a callback may have disconnected the connection; stop pumping
            if self.state() == ConnectionState::Disconnected {
                return TransferStatus::Disconnect;
            }
            if status != TransferStatus::Success {
                return status;
            }
        }
    }

    fn parse_incoming(
        recv: &mut RecvState,
        bytes_read: usize,
        completed: &mut Vec<DataPacket>,
    ) -> Result<(), ()> {
        let mut at = 0;
        while at < bytes_read {
            if recv.current.is_none() {
                let need = PacketHeader::SERIALIZED_LEN - recv.header_filled;
                let take = need.min(bytes_read - at);
                recv.header_buf[recv.header_filled..recv.header_filled + take]
                    .copy_from_slice(&recv.buf[at..at + take]);
                recv.header_filled += take;
                at += take;

                if recv.header_filled == PacketHeader::SERIALIZED_LEN {
                    recv.header_filled = 0;
                    let Ok(header) = PacketHeader::deser(&mut &recv.header_buf[..]) else {
                        return Err(());
                    };
                    if header.length as usize > UNREASONABLE_DATA_SIZE {
                        error!(
                            "packet length {} exceeds the maximum of {} - dropping connection",
                            header.length, UNREASONABLE_DATA_SIZE
                        );
                        return Err(());
                    }
                    recv.current = Some(DataPacket::from_header(&header));
                }
            }
            if let Some(current) = recv.current.as_mut() {
                at += current.append_data(&recv.buf[at..bytes_read]);
                if current.has_received_all_data() {
                    if let Some(packet) = recv.current.take() {
                        completed.push(packet);
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand queued frames to the transport. `reenable` forces an attempt even
    ///  if the previous pump left the connection in a wait state.
    pub fn send_packets(self: &Arc<Self>, reenable: bool) -> TransferStatus {
        if self.state() != ConnectionState::Connected {
            return TransferStatus::Wait;
        }
        let mut disconnect_requested = false;
        let status = {
            let mut send = self.send.lock();
            if !reenable && !send.can_send {
                return TransferStatus::Wait;
            }
            send.can_send = false;
            loop {
                let Some(entry) = send.queue.front_mut() else {
                    send.can_send = true;
                    break TransferStatus::Success;
                };
                if let Some(destination) = entry.destination {
                    self.transport.lock().set_destination(destination);
                }
                let result = self.transport.lock().send(&entry.frame[entry.cursor..]);
                if result.bytes > 0 {
                    entry.cursor += result.bytes;
                    *self.bytes_queued.lock() -= result.bytes;
                    self.bytes_sent
                        .fetch_add(result.bytes as u64, Ordering::Relaxed);
                    self.context.counters().report_sent(result.bytes);
                }
                match result.status {
                    TransferStatus::Success => {
                        if entry.cursor == entry.frame.len() {
                            let finished = send.queue.pop_front();
                            if finished.map(|f| f.disconnect_after_send).unwrap_or(false) {
                                disconnect_requested = true;
                                break TransferStatus::Success;
                            }
                        } else if result.bytes == 0 {
                            break TransferStatus::Wait;
                        }
                    }
                    other => break other,
                }
            }
        };
        if disconnect_requested {
            self.disconnect();
        }
        status
    }

    // ---- lifecycle ------------------------------------------------------

    /// Transition to Connected and notify owner and connect callbacks. Called
    ///  by the owning system once the transport reports ready (for TLS that
    ///  is after handshake completion).
    pub(crate) fn establish(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Connected;
        }
        if let Some(addr) = self.transport.lock().local_addr() {
            *self.local_details.lock() =
                ConnectionDetails::parse(&format!("(Socket)direct:{}:{}", addr.ip(), addr.port()));
        }
        info!("connected: {}", self.friendly_identifier());

        if let Some(owner) = self.current_owner() {
            owner.connection_established(self);
        }
        let callbacks: Vec<ConnectCallback> = self
            .callbacks
            .lock()
            .connect
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(self);
        }

        self.update_send(true);
    }

    /// Transition to Disconnected and fire disconnect notifications, then
    ///  reset or discard in-flight transfer state. The owning system releases
    ///  the connection afterwards.
    pub(crate) fn dropped(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        info!("disconnected: {}", self.friendly_identifier());

        {
            let mut recv = self.recv.lock();
            recv.header_filled = 0;
            recv.current = None;
        }

        if let Some(owner) = self.current_owner() {
            owner.connection_drop(self);
        }
        let callbacks: Vec<DisconnectCallback> = self
            .callbacks
            .lock()
            .disconnect
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(self);
        }

        let mut send = self.send.lock();
        send.can_send = false;
        if self.discard_queue_on_disconnect.load(Ordering::Relaxed) {
            let discarded: usize = send
                .queue
                .iter()
                .map(|entry| entry.frame.len() - entry.cursor)
                .sum();
            send.queue.clear();
            *self.bytes_queued.lock() -= discarded;
        } else if let Some(front) = send.queue.front_mut() {
            // a partially sent frame goes out again from the start if the
            //  connection is re-established
            *self.bytes_queued.lock() += front.cursor;
            front.cursor = 0;
        }
    }

    fn current_owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.lock().clone().and_then(|weak| weak.upgrade())
    }

    // ---- dispatch -------------------------------------------------------

    fn process_received_packet(self: &Arc<Self>, packet: Arc<DataPacket>) {
        trace!(
            "received packet type 0x{:08X} id {} ({} bytes)",
            packet.packet_type(),
            packet.packet_id(),
            packet.data_size()
        );
        {
            let allowed = self.allowed_packet_types.lock();
            if !allowed.is_empty() && !allowed.contains(&packet.packet_type()) {
                drop(allowed);
                warn!(
                    "received packet type 0x{:08X} not in allowed list - disconnecting",
                    packet.packet_type()
                );
                self.disconnect();
                return;
            }
        }

        if packet.is_response() {
            let callback = self.response_callbacks.lock().remove(&packet.response_to());
            match callback {
                Some(callback) => callback(self, &packet),
                None => self.notify_owner(&packet),
            }
            return;
        }

        if packet.is_labelled() {
            self.process_labelled_packet(packet);
            return;
        }

        let callbacks: Vec<PacketCallback> = self
            .callbacks
            .lock()
            .packet
            .get(&packet.packet_type())
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            self.notify_owner(&packet);
            return;
        }
        for callback in callbacks {
            callback(self, &packet);
        }
    }

    fn process_labelled_packet(self: &Arc<Self>, packet: Arc<DataPacket>) {
        let Some(label) = packet.label() else {
            warn!("labelled packet is invalid or does not contain a label - ignoring");
            return;
        };
        {
            let allowed = self.allowed_labels.lock();
            if !allowed.is_empty() && !allowed.contains(&label) {
                drop(allowed);
                warn!(
                    "received labelled packet ({}) not in allowed list - disconnecting",
                    label
                );
                self.disconnect();
                return;
            }
        }
        let callbacks: Vec<LabelledPacketCallback> = self
            .callbacks
            .lock()
            .labelled
            .get(&label)
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            self.notify_owner(&packet);
            return;
        }
        for callback in callbacks {
            callback(self, &packet, packet.payload_after_label());
        }
    }

    fn notify_owner(self: &Arc<Self>, packet: &Arc<DataPacket>) {
        if let Some(owner) = self.current_owner() {
            owner.received_packet(self, packet);
        }
    }

    // ---- callback registration ------------------------------------------

    /// Register a callback for incoming packets with the given type id.
    ///  Multiple callbacks per type are invoked in registration order.
    pub fn register_packet_callback(
        &self,
        packet_type: u32,
        callback: impl Fn(&Arc<Connection>, &Arc<DataPacket>) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .packet
            .entry(packet_type)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn register_labelled_packet_callback(
        &self,
        label: &str,
        callback: impl Fn(&Arc<Connection>, &Arc<DataPacket>, &[u8]) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .labelled
            .entry(label.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Register a connect callback under an identifier so it can later be
    ///  removed by name.
    pub fn register_connect_callback(
        &self,
        identifier: &str,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .connect
            .push((identifier.to_string(), Arc::new(callback)));
    }

    pub fn register_disconnect_callback(
        &self,
        identifier: &str,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks
            .lock()
            .disconnect
            .push((identifier.to_string(), Arc::new(callback)));
    }

    pub fn clear_packet_callbacks(&self, packet_type: u32) {
        self.callbacks.lock().packet.remove(&packet_type);
    }

    pub fn clear_labelled_packet_callbacks(&self, label: &str) {
        self.callbacks.lock().labelled.remove(label);
    }

    pub fn clear_all_packet_callbacks(&self) {
        let mut callbacks = self.callbacks.lock();
        callbacks.packet.clear();
        callbacks.labelled.clear();
    }

    pub fn clear_connect_callbacks(&self, identifier: &str) {
        self.callbacks
            .lock()
            .connect
            .retain(|(name, _)| name != identifier);
    }

    pub fn clear_disconnect_callbacks(&self, identifier: &str) {
        self.callbacks
            .lock()
            .disconnect
            .retain(|(name, _)| name != identifier);
    }

    pub fn clear_all_callbacks(&self) {
        let mut callbacks = self.callbacks.lock();
        callbacks.packet.clear();
        callbacks.labelled.clear();
        callbacks.connect.clear();
        callbacks.disconnect.clear();
    }

    // ---- backlog / flow control -----------------------------------------

    /// The backlog callback fires for every enqueue while the queued total
    ///  (including the packet being queued and per-packet header overhead)
    ///  is at or above the trigger threshold. It decides whether to keep or
    ///  discard the triggering packet.
    pub fn set_backlog_callback(
        &self,
        callback: impl FnMut(&Arc<Connection>, usize, usize, &Arc<DataPacket>) -> bool + Send + 'static,
    ) {
        self.backlog.lock().callback = Some(Box::new(callback));
    }

    pub fn clear_backlog_callback(&self) {
        self.backlog.lock().callback = None;
    }

    /// A threshold of 0 disables the backlog callback.
    pub fn set_backlog_callback_trigger_threshold(&self, threshold: usize) {
        self.backlog.lock().threshold = threshold;
    }

    pub fn backlog_callback_trigger_threshold(&self) -> usize {
        self.backlog.lock().threshold
    }

    /// Exact number of framed bytes queued but not yet handed to the
    ///  transport. A packet discarded by the backlog callback contributes
    ///  nothing.
    pub fn bytes_queued_to_send(&self) -> usize {
        *self.bytes_queued.lock()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    // ---- options --------------------------------------------------------

    /// By default packets sent while disconnected are queued and flushed once
    ///  the connection establishes. Disabling this silently discards them.
    pub fn set_queue_data_packets_if_not_connected(&self, queue: bool) {
        self.queue_if_not_connected.store(queue, Ordering::Relaxed);
    }

    /// If enabled, the send queue is discarded when the connection drops
    ///  (after the disconnect callbacks have run).
    pub fn set_discard_data_packet_queue_on_disconnect(&self, discard: bool) {
        self.discard_queue_on_disconnect
            .store(discard, Ordering::Relaxed);
    }

    /// Restrict incoming traffic to an explicit set of packet types. With an
    ///  empty set all types are allowed. A packet outside the set drops the
    ///  connection.
    pub fn add_allowed_packet_type(&self, packet_type: u32) {
        self.allowed_packet_types.lock().insert(packet_type);
    }

    pub fn remove_allowed_packet_type(&self, packet_type: u32) {
        self.allowed_packet_types.lock().remove(&packet_type);
    }

    pub fn add_allowed_label(&self, label: &str) {
        self.allowed_labels.lock().insert(label.to_string());
    }

    pub fn remove_allowed_label(&self, label: &str) {
        self.allowed_labels.lock().remove(label);
    }

    /// Build a packet ready for [Connection::send_data_packet].
    pub fn new_data_packet(&self, packet_type: u32, size: usize) -> DataPacket {
        DataPacket::with_type_and_size(packet_type, size)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection{{{}, {:?}}}",
            self.friendly_identifier(),
            self.state()
        )
    }
}
