use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, BytesMut};

/// Reserved packet type ids. Application packet types must stay below
///  [packet_types::MIN_RESERVED].
pub mod packet_types {
    /// Payload starts with a length-prefixed label string, dispatched by label
    ///  rather than by type id.
    pub const LABELLED: u32 = 0xFFFF_FFFF;

    /// Type ids at or above this value are reserved for internal use.
    pub const MIN_RESERVED: u32 = 0xF000_0000;
}

pub const NUM_BYTES_FOR_STRING_HEADER: usize = 2 * size_of::<u32>();

/// The fixed-size prefix in front of every packet on the wire: packet type,
///  payload length, packet id and the id of the packet being responded to
///  (0 = not a response).
///
/// All fields are little-endian regardless of platform. The header size is
///  constant and known before any payload byte is read, which is what allows
///  packets to be reconstructed from a byte stream that arrives fragmented
///  across any number of reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u32,
    pub length: u32,
    pub packet_id: u32,
    pub response_to: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 4 * size_of::<u32>();

    pub fn for_packet(packet: &DataPacket) -> PacketHeader {
        PacketHeader {
            packet_type: packet.packet_type(),
            length: packet.received_data_size() as u32,
            packet_id: packet.packet_id(),
            response_to: packet.response_to(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.packet_type);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.packet_id);
        buf.put_u32_le(self.response_to);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("not enough data for a packet header");
        }
        Ok(PacketHeader {
            packet_type: buf.get_u32_le(),
            length: buf.get_u32_le(),
            packet_id: buf.get_u32_le(),
            response_to: buf.get_u32_le(),
        })
    }
}

/// A framed application message: an opaque payload plus enough metadata to
///  route it and reply to it.
///
/// A packet is configured to a target size up front; [DataPacket::append_data]
///  fills it up to that size and never past it. A short append is the signal
///  that a packet spans more than one read (or that a writer ran out of
///  space). Both the send queue and user callbacks may hold a packet at the
///  same time, so completed packets are shared via `Arc`.
#[derive(Debug)]
pub struct DataPacket {
    packet_type: u32,
    // assigned by the connection at enqueue time, after the packet is shared
    packet_id: AtomicU32,
    response_to: u32,
    size: usize,
    received: usize,
    data: Vec<u8>,
}

impl Default for DataPacket {
    fn default() -> Self {
        DataPacket::new()
    }
}

impl DataPacket {
    pub fn new() -> DataPacket {
        DataPacket {
            packet_type: 0,
            packet_id: AtomicU32::new(0),
            response_to: 0,
            size: 0,
            received: 0,
            data: Vec::new(),
        }
    }

    pub fn with_type_and_size(packet_type: u32, size: usize) -> DataPacket {
        let mut packet = DataPacket::new();
        packet.configure(packet_type, size);
        packet
    }

    /// A packet holding a single string. The packet type is left at 0 for the
    ///  caller to set.
    pub fn from_string(content: &str) -> DataPacket {
        let mut packet = DataPacket::new();
        packet.configure(0, content.len() + NUM_BYTES_FOR_STRING_HEADER);
        packet.append_string(content);
        packet
    }

    pub fn from_strings(content: &[String]) -> DataPacket {
        let required: usize = content
            .iter()
            .map(|s| s.len() + NUM_BYTES_FOR_STRING_HEADER)
            .sum();
        let mut packet = DataPacket::new();
        packet.configure(0, required);
        for s in content {
            packet.append_string(s);
        }
        packet
    }

    /// A labelled packet with `size` bytes of space after the label.
    pub fn labelled(label: &str, size: usize) -> DataPacket {
        let mut packet = DataPacket::new();
        packet.configure(
            packet_types::LABELLED,
            label.len() + NUM_BYTES_FOR_STRING_HEADER + size,
        );
        packet.append_string(label);
        packet
    }

    pub fn labelled_string(label: &str, content: &str) -> DataPacket {
        let mut packet = DataPacket::labelled(label, content.len() + NUM_BYTES_FOR_STRING_HEADER);
        packet.append_string(content);
        packet
    }

    pub fn labelled_strings(label: &str, content: &[String]) -> DataPacket {
        let required: usize = content
            .iter()
            .map(|s| s.len() + NUM_BYTES_FOR_STRING_HEADER)
            .sum();
        let mut packet = DataPacket::labelled(label, required);
        for s in content {
            packet.append_string(s);
        }
        packet
    }

    /// Set up an empty packet to receive the payload described by a parsed
    ///  header.
    pub fn from_header(header: &PacketHeader) -> DataPacket {
        let mut packet = DataPacket::new();
        packet.configure(header.packet_type, header.length as usize);
        packet.packet_id = AtomicU32::new(header.packet_id);
        packet.response_to = header.response_to;
        packet
    }

    /// Allocate (or reuse) the buffer for a payload of `size` bytes and reset
    ///  the write cursor.
    pub fn configure(&mut self, packet_type: u32, size: usize) {
        if self.data.len() < size {
            self.data.resize(size, 0);
        }
        self.packet_type = packet_type;
        self.size = size;
        self.received = 0;
    }

    pub fn packet_type(&self) -> u32 {
        self.packet_type
    }

    pub fn set_packet_type(&mut self, packet_type: u32) {
        self.packet_type = packet_type;
    }

    /// The id the owning connection assigned when the packet was queued, or
    ///  the id parsed from the wire for received packets.
    pub fn packet_id(&self) -> u32 {
        self.packet_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_packet_id(&self, packet_id: u32) {
        self.packet_id.store(packet_id, Ordering::Relaxed);
    }

    /// The id of the packet this one responds to; 0 means not a response.
    pub fn response_to(&self) -> u32 {
        self.response_to
    }

    pub fn set_response_to(&mut self, response_to: u32) {
        self.response_to = response_to;
    }

    pub fn is_response(&self) -> bool {
        self.response_to != 0
    }

    pub fn is_labelled(&self) -> bool {
        self.packet_type == packet_types::LABELLED
    }

    pub fn data_size(&self) -> usize {
        self.size
    }

    pub fn received_data_size(&self) -> usize {
        self.received
    }

    pub fn remaining_data_size(&self) -> usize {
        self.size - self.received
    }

    pub fn has_received_all_data(&self) -> bool {
        self.received == self.size
    }

    /// The filled part of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.received]
    }

    /// Copy up to `data.len()` bytes into the packet, bounded by the remaining
    ///  space. Returns the number of bytes actually appended, which may be
    ///  less than requested.
    pub fn append_data(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_data_size());
        if n == 0 {
            return 0;
        }
        self.data[self.received..self.received + n].copy_from_slice(&data[..n]);
        self.received += n;
        n
    }

    /// Append a length-prefixed string: `[bytes_per_char: u32][len: u32][bytes]`.
    ///  If there is not enough space the string is not appended at all and
    ///  false is returned.
    pub fn append_string(&mut self, s: &str) -> bool {
        if s.len() + NUM_BYTES_FOR_STRING_HEADER > self.remaining_data_size() {
            return false;
        }
        self.append_data(&1u32.to_le_bytes());
        self.append_data(&(s.len() as u32).to_le_bytes());
        self.append_data(s.as_bytes());
        true
    }

    /// Read a length-prefixed string at `data_offset`, past the label if the
    ///  packet is labelled.
    pub fn get_string(&self, data_offset: usize) -> Option<String> {
        let base = self.label_end().unwrap_or(0);
        self.read_string_at(base + data_offset).map(|(s, _)| s)
    }

    /// Read consecutive length-prefixed strings starting at `data_offset`
    ///  until the payload is exhausted. Empty result means the payload did not
    ///  contain a valid string at the offset.
    pub fn get_strings(&self, data_offset: usize) -> Vec<String> {
        let mut result = Vec::new();
        let mut at = self.label_end().unwrap_or(0) + data_offset;
        while let Some((s, next)) = self.read_string_at(at) {
            result.push(s);
            at = next;
        }
        result
    }

    /// The packet label, or None if the packet is not a labelled packet or
    ///  does not contain a valid label.
    pub fn label(&self) -> Option<String> {
        if !self.is_labelled() {
            return None;
        }
        self.read_string_at(0).map(|(s, _)| s)
    }

    /// Payload bytes after the label for labelled packets, the whole payload
    ///  otherwise.
    pub fn payload_after_label(&self) -> &[u8] {
        let base = self.label_end().unwrap_or(0);
        &self.data[base..self.received]
    }

    pub fn get_u32_at(&self, byte_offset: usize) -> Option<u32> {
        let at = self.label_end().unwrap_or(0) + byte_offset;
        let raw = self.data.get(at..at + 4)?;
        if at + 4 > self.received {
            return None;
        }
        Some(u32::from_le_bytes(raw.try_into().ok()?))
    }

    pub fn get_u64_at(&self, byte_offset: usize) -> Option<u64> {
        let at = self.label_end().unwrap_or(0) + byte_offset;
        let raw = self.data.get(at..at + 8)?;
        if at + 8 > self.received {
            return None;
        }
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }

    fn label_end(&self) -> Option<usize> {
        if !self.is_labelled() {
            return None;
        }
        self.read_string_at(0).map(|(_, end)| end)
    }

    fn read_string_at(&self, at: usize) -> Option<(String, usize)> {
        if at + NUM_BYTES_FOR_STRING_HEADER > self.received {
            return None;
        }
        let bytes_per_char = u32::from_le_bytes(self.data[at..at + 4].try_into().ok()?);
        if bytes_per_char != 1 {
            return None;
        }
        let len = u32::from_le_bytes(self.data[at + 4..at + 8].try_into().ok()?) as usize;
        let start = at + NUM_BYTES_FOR_STRING_HEADER;
        if start + len > self.received {
            return None;
        }
        let s = String::from_utf8(self.data[start..start + len].to_vec()).ok()?;
        Some((s, start + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(100, 9999)]
    #[case(packet_types::LABELLED, 99999)]
    fn test_header_ser_roundtrip(#[case] packet_type: u32, #[case] length: u32) {
        let original = PacketHeader {
            packet_type,
            length,
            packet_id: 7,
            response_to: 3,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);
        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_header_deser_short_buffer() {
        let mut b: &[u8] = &[0u8; PacketHeader::SERIALIZED_LEN - 1];
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let packet = DataPacket::from_string("Hello world");
        assert_eq!(packet.get_string(0), Some("Hello world".to_string()));
    }

    #[test]
    fn test_string_at_offset() {
        let mut packet = DataPacket::with_type_and_size(0, "Hello world".len() * 3);
        let some_value = 1234567890u64;
        assert_eq!(packet.append_data(&some_value.to_le_bytes()), 8);
        assert!(packet.append_string("Hello world"));

        assert_eq!(packet.get_u64_at(0), Some(some_value));
        assert_eq!(packet.get_string(8), Some("Hello world".to_string()));
    }

    #[test]
    fn test_labelled_gets_skip_label() {
        let mut packet = DataPacket::labelled("ExcellentLabel", "Hello world".len() * 3);
        let some_value = 1234567890u64;
        assert_eq!(packet.append_data(&some_value.to_le_bytes()), 8);
        assert!(packet.append_string("Hello world"));

        assert_eq!(packet.get_u64_at(0), Some(some_value));
        assert_eq!(packet.get_string(8), Some("Hello world".to_string()));
        assert_eq!(packet.label(), Some("ExcellentLabel".to_string()));
    }

    #[test]
    fn test_multiple_strings() {
        let content = vec!["Hello world".to_string(), "Goodbye Pluto".to_string()];
        let packet = DataPacket::from_strings(&content);
        assert_eq!(packet.get_strings(0), content);
    }

    #[test]
    fn test_labelled_string_packet() {
        let packet = DataPacket::labelled_string("magicLabel", "RUN!");
        assert_eq!(packet.label(), Some("magicLabel".to_string()));
        assert_eq!(packet.get_string(0), Some("RUN!".to_string()));
    }

    #[test]
    fn test_append_bounded_by_capacity() {
        let mut packet = DataPacket::with_type_and_size(1, 4);
        assert_eq!(packet.append_data(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(packet.append_data(&[7]), 0);
        assert!(packet.has_received_all_data());
        assert_eq!(packet.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_append_string_insufficient_space() {
        let mut packet = DataPacket::with_type_and_size(1, 4);
        assert!(!packet.append_string("too long to fit"));
        assert_eq!(packet.received_data_size(), 0);
    }

    #[test]
    fn test_header_describes_filled_payload() {
        let mut packet = DataPacket::with_type_and_size(42, 16);
        packet.append_data(&[0xAB; 10]);
        let header = PacketHeader::for_packet(&packet);
        assert_eq!(header.packet_type, 42);
        assert_eq!(header.length, 10);
    }
}
