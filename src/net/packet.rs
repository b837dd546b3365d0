use std::sync::Arc;

use thiserror::Error;

/// Largest string body a server frame can carry behind its u16 length prefix.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;
/// Largest list a u8 count prefix can describe.
pub const MAX_LIST_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated packet: needed {needed} bytes, {remaining} remaining")]
    TruncatedPacket { needed: usize, remaining: usize },
    #[error("string of {len} bytes exceeds max {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("list of {len} entries exceeds max {max}")]
    ListTooLong { len: usize, max: usize },
}

/// One complete outbound message: opcode byte followed by its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Arc<[u8]>,
}

impl Frame {
    pub fn opcode(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }
}

/// Forward-only reader shared by both string conventions.
#[derive(Debug, Clone)]
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if remaining < len {
            return Err(CodecError::TruncatedPacket {
                needed: len,
                remaining,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_text(&mut self, len: usize) -> Result<String, CodecError> {
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Reads server-format data: u16 length-prefixed strings.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor { data, pos: 0 },
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8()
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        self.cursor.read_u16_le()
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        self.cursor.read_u32_le()
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.cursor.read_u8()? != 0)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.cursor.read_u16_le()? as usize;
        self.cursor.read_text(len)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.cursor.take(len)
    }
}

/// Reads client-format data. The legacy client prefixes strings with a
/// single length byte, unlike everything the server writes.
#[derive(Debug, Clone)]
pub struct ClientPacketReader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> ClientPacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor { data, pos: 0 },
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8()
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        self.cursor.read_u16_le()
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        self.cursor.read_u32_le()
    }

    pub fn read_string_u8(&mut self) -> Result<String, CodecError> {
        let len = self.cursor.read_u8()? as usize;
        self.cursor.read_text(len)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    data: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn finish(self) -> Frame {
        Frame {
            bytes: Arc::from(self.data),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        let bytes = value.as_bytes();
        let len = u16::try_from(bytes.len()).map_err(|_| CodecError::StringTooLong {
            len: bytes.len(),
            max: MAX_STRING_LEN,
        })?;
        self.write_u16_le(len);
        self.write_bytes(bytes);
        Ok(())
    }

    /// Writes the u8 count that precedes every list on the wire.
    pub fn write_count(&mut self, len: usize) -> Result<(), CodecError> {
        let count = u8::try_from(len).map_err(|_| CodecError::ListTooLong {
            len,
            max: MAX_LIST_LEN,
        })?;
        self.write_u8(count);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

/// Client-side writer, used to script inbound packets in tests and tools.
#[derive(Debug, Default, Clone)]
pub struct ClientPacketWriter {
    inner: PacketWriter,
}

impl ClientPacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.inner.write_u8(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.inner.write_u16_le(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.inner.write_u32_le(value);
    }

    pub fn write_string_u8(&mut self, value: &str) -> Result<(), CodecError> {
        let bytes = value.as_bytes();
        let len = u8::try_from(bytes.len()).map_err(|_| CodecError::StringTooLong {
            len: bytes.len(),
            max: u8::MAX as usize,
        })?;
        self.inner.write_u8(len);
        self.inner.write_bytes(bytes);
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.inner.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (*state >> 32) as u32
    }

    fn random_text(state: &mut u64, max_len: u32) -> String {
        let len = lcg_next(state) % max_len;
        (0..len)
            .map(|_| match lcg_next(state) % 4 {
                0 => 'é',
                1 => '木',
                _ => char::from(b'a' + (lcg_next(state) % 26) as u8),
            })
            .collect()
    }

    #[test]
    fn integers_are_little_endian() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0xab);
        writer.write_u16_le(0x1234);
        writer.write_u32_le(0xdead_beef);
        assert_eq!(
            writer.as_slice(),
            &[0xab, 0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]
        );
        let mut reader = PacketReader::new(writer.as_slice());
        assert_eq!(reader.read_u8(), Ok(0xab));
        assert_eq!(reader.read_u16_le(), Ok(0x1234));
        assert_eq!(reader.read_u32_le(), Ok(0xdead_beef));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn server_strings_use_u16_byte_length() {
        let mut writer = PacketWriter::new();
        writer.write_string("é").expect("string");
        assert_eq!(writer.as_slice(), &[0x02, 0x00, 0xc3, 0xa9]);

        let mut empty = PacketWriter::new();
        empty.write_string("").expect("string");
        assert_eq!(empty.as_slice(), &[0x00, 0x00]);
    }

    #[test]
    fn server_string_roundtrip_varied_text() {
        let mut state = 0x1234_5678_9abc_def0;
        for _ in 0..128 {
            let text = random_text(&mut state, 300);
            let mut writer = PacketWriter::new();
            writer.write_string(&text).expect("string");
            writer.write_u8(0x42);
            let mut reader = PacketReader::new(writer.as_slice());
            assert_eq!(reader.read_string().expect("string"), text);
            assert_eq!(reader.read_u8(), Ok(0x42));
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn client_string_roundtrip_varied_text() {
        let mut state = 0x0bad_cafe_0000_0001;
        for _ in 0..128 {
            let text = random_text(&mut state, 60);
            let mut writer = ClientPacketWriter::new();
            writer.write_string_u8(&text).expect("string");
            let bytes = writer.into_vec();
            assert_eq!(bytes[0] as usize, text.len());
            let mut reader = ClientPacketReader::new(&bytes);
            assert_eq!(reader.read_string_u8().expect("string"), text);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn string_directions_are_not_interchangeable() {
        let mut writer = PacketWriter::new();
        writer.write_string("abc").expect("string");
        let mut reader = ClientPacketReader::new(writer.as_slice());
        // The u8 reader sees a length of 3 followed by [0x00, 'a', 'b'].
        assert_eq!(reader.read_string_u8().expect("string"), "\0ab");
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let text = "x".repeat(MAX_STRING_LEN + 1);
        let mut writer = PacketWriter::new();
        assert_eq!(
            writer.write_string(&text),
            Err(CodecError::StringTooLong {
                len: MAX_STRING_LEN + 1,
                max: MAX_STRING_LEN
            })
        );
        assert!(writer.is_empty());

        let exact = "y".repeat(MAX_STRING_LEN);
        writer.write_string(&exact).expect("max length fits");
        assert_eq!(writer.len(), MAX_STRING_LEN + 2);
    }

    #[test]
    fn every_short_prefix_is_truncated() {
        let mut writer = PacketWriter::new();
        writer.write_u32_le(7);
        writer.write_string("hello").expect("string");
        writer.write_u16_le(9);
        let full = writer.as_slice().to_vec();

        for cut in 0..full.len() {
            let prefix = &full[..cut];
            let mut reader = PacketReader::new(prefix);
            let result = reader
                .read_u32_le()
                .and_then(|_| reader.read_string())
                .and_then(|_| reader.read_u16_le());
            assert!(
                matches!(result, Err(CodecError::TruncatedPacket { .. })),
                "prefix of {cut} bytes decoded"
            );
            assert!(reader.remaining() <= prefix.len());
        }
    }

    #[test]
    fn truncated_client_string_reports_needed_bytes() {
        let bytes = [5u8, b'a', b'b'];
        let mut reader = ClientPacketReader::new(&bytes);
        assert_eq!(
            reader.read_string_u8(),
            Err(CodecError::TruncatedPacket {
                needed: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn count_prefix_rejects_long_lists() {
        let mut writer = PacketWriter::new();
        writer.write_count(255).expect("fits");
        assert_eq!(
            writer.write_count(256),
            Err(CodecError::ListTooLong { len: 256, max: 255 })
        );
        assert_eq!(writer.as_slice(), &[255]);
    }

    #[test]
    fn finished_frame_exposes_opcode_and_payload() {
        let mut writer = PacketWriter::with_capacity(8);
        writer.write_u8(0x0a);
        writer.write_u16_le(1);
        let frame = writer.finish();
        assert_eq!(frame.opcode(), Some(0x0a));
        assert_eq!(frame.payload(), &[1, 0]);
        assert_eq!(frame.len(), 3);
    }
}
