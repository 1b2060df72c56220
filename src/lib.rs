//! Engine core: a cooperative task scheduler and the asynchronous
//!  connection layer that runs on top of it.
//!
//! ## Design goals
//!
//! * One cooperative scheduler per thread. A [kernel::kernel::Kernel] ticks a
//!   [kernel::task_manager::TaskManager]; every subsystem - including the
//!   network layer - is a [kernel::task::Task] updated once per tick in
//!   priority order. No task's update may block.
//! * All I/O is non-blocking. Transport operations report a three-way
//!   status: success, "would block - retry next tick" (never an error), or
//!   a fatal per-connection disconnect. One scheduler thread can service
//!   hundreds of connections this way.
//! * Transports are pluggable under a single connection abstraction: raw
//!   TCP, TLS-wrapped TCP and UDP datagrams share the framing, queueing and
//!   dispatch machinery in [net::connection::Connection].
//! * Messages, not streams: applications exchange framed
//!   [net::packet::DataPacket]s routed to callbacks by packet type id,
//!   label, or response id.
//! * Backpressure is explicit: connections account every queued byte and a
//!   configurable backlog callback may veto queueing when a threshold is
//!   crossed.
//!
//! ## Wire format
//!
//! Every packet is a fixed header followed by its payload; packets are
//!  concatenated back to back with no delimiter, so reconstruction relies
//!  entirely on the length field. All header fields are little-endian
//!  regardless of platform:
//!
//! ```ascii
//!  0: packet type id (u32)
//!  4: payload length (u32)
//!  8: packet id (u32) - assigned sequentially per connection
//! 12: response-to id (u32) - id of the packet this responds to, 0 = none
//! 16: payload (length bytes)
//! ```
//!
//! Strings inside payloads use `[bytes_per_char: u32][len: u32][bytes]`.
//!  Labelled packets (type `0xFFFFFFFF`) start their payload with a label
//!  string and are dispatched by label. Type ids from `0xF0000000` upwards
//!  are reserved.
//!
//! ## Connection strings
//!
//! Endpoints are described as `(<System>)<type>:<address>[:<extra>...]`,
//!  e.g. `(Socket)direct:127.0.0.1:1234:security=tls:ca=cacert.pem`. The
//!  `(<System>)` prefix selects an installed
//!  [net::manager::NetworkSystem]; `direct` is a stream connection,
//!  `passive` a datagram endpoint.

pub mod kernel;
pub mod net;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
