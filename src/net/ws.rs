use std::collections::HashMap;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::net::auth::{HandshakeAuthenticator, HandshakeError};
use crate::session::Identity;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const GAME_PATHS: [&str; 2] = ["/", "/ws"];

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, Clone)]
pub struct WsHandshakeConfig {
    pub allowed_origins: Option<Vec<String>>,
    pub max_request_bytes: usize,
}

impl Default for WsHandshakeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            max_request_bytes: 8192,
        }
    }
}

#[derive(Debug)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum WsFrameError {
    #[error("websocket read timed out")]
    Timeout,
    #[error("websocket closed")]
    Closed,
    #[error("websocket i/o failed: {0}")]
    Io(std::io::Error),
    #[error("websocket protocol error: {0}")]
    Protocol(String),
}

/// Upgrades an HTTP request on `/` or `/ws` to a WebSocket. The `token`
/// query parameter is authenticated before the 101 goes out, so a rejected
/// client never sees an open socket.
pub fn accept_handshake<S: Read + Write>(
    stream: &mut S,
    config: &WsHandshakeConfig,
    authenticator: &dyn HandshakeAuthenticator,
) -> Result<Identity, HandshakeError> {
    let request = read_http_request(stream, config.max_request_bytes)?;
    let (target, headers) = parse_headers(&request)?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target.as_str(), ""),
    };

    if !GAME_PATHS.contains(&path) {
        reject_handshake(stream, 404, "Not Found")?;
        return Err(HandshakeError::Malformed(format!("unknown path '{path}'")));
    }
    if !matches!(
        headers.get("upgrade").map(|value| value.to_ascii_lowercase()),
        Some(value) if value == "websocket"
    ) {
        reject_handshake(stream, 426, "Upgrade Required")?;
        return Err(HandshakeError::Malformed("websocket upgrade missing".to_string()));
    }
    let connection = headers
        .get("connection")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    if !connection.contains("upgrade") {
        reject_handshake(stream, 400, "Missing Connection: Upgrade")?;
        return Err(HandshakeError::Malformed(
            "websocket connection upgrade missing".to_string(),
        ));
    }
    let version = headers
        .get("sec-websocket-version")
        .map(|value| value.trim())
        .unwrap_or("");
    if version != "13" {
        reject_handshake(stream, 400, "Unsupported WebSocket version")?;
        return Err(HandshakeError::Malformed(format!(
            "unsupported websocket version '{version}'"
        )));
    }
    let Some(key) = headers.get("sec-websocket-key") else {
        reject_handshake(stream, 400, "Missing Sec-WebSocket-Key")?;
        return Err(HandshakeError::Malformed("missing sec-websocket-key".to_string()));
    };

    if let Some(allowed) = config.allowed_origins.as_ref() {
        let origin_value = headers
            .get("origin")
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let allow_all = allowed.iter().any(|value| value == "*");
        let allowed_origin = allow_all || allowed.iter().any(|value| value == &origin_value);
        if !allowed_origin {
            reject_handshake(stream, 403, "Origin not allowed")?;
            return Err(HandshakeError::Rejected(format!(
                "origin '{origin_value}' not allowed"
            )));
        }
    }

    let token = query_param(query, "token").unwrap_or_default();
    let identity = match authenticator.authenticate(token) {
        Ok(identity) => identity,
        Err(err) => {
            reject_handshake(stream, 401, "Unauthorized")?;
            return Err(err);
        }
    };

    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    let accept = BASE64_ENGINE.encode(sha1.finalize());

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {accept}\r\n\
\r\n"
    );
    stream.write_all(response.as_bytes())?;

    Ok(identity)
}

/// Incremental frame decoder. Bytes that arrived before a read timeout stay
/// buffered, so a frame split across polls resumes on the next call. Reads
/// never go past the end of the current frame.
#[derive(Debug)]
pub struct FrameReader {
    max_payload: usize,
    buf: Vec<u8>,
}

struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

enum HeaderProgress {
    /// At least this many buffered bytes are needed to continue.
    Need(usize),
    Ready(FrameHeader),
}

impl FrameReader {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            buf: Vec::new(),
        }
    }

    /// Returns the next complete frame. `Timeout` means the stream went quiet;
    /// any partial frame is kept for the next call.
    pub fn read<S: Read>(&mut self, stream: &mut S) -> Result<WsFrame, WsFrameError> {
        loop {
            let needed = match self.parse_header()? {
                HeaderProgress::Need(total) => total,
                HeaderProgress::Ready(header) => {
                    let total = header.header_len + header.payload_len;
                    if self.buf.len() >= total {
                        return Ok(self.take_frame(header));
                    }
                    total
                }
            };
            self.fill(stream, needed - self.buf.len())?;
        }
    }

    fn parse_header(&self) -> Result<HeaderProgress, WsFrameError> {
        let buf = &self.buf;
        if buf.len() < 2 {
            return Ok(HeaderProgress::Need(2));
        }
        let fin = (buf[0] & 0x80) != 0;
        let opcode = buf[0] & 0x0f;
        if opcode >= OP_CLOSE && !fin {
            return Err(WsFrameError::Protocol(
                "fragmented control frame".to_string(),
            ));
        }
        let masked = (buf[1] & 0x80) != 0;
        let ext_len = match buf[1] & 0x7f {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        if buf.len() < 2 + ext_len {
            return Ok(HeaderProgress::Need(2 + ext_len));
        }
        let len = match ext_len {
            2 => u16::from_be_bytes([buf[2], buf[3]]) as u64,
            8 => {
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(ext)
            }
            _ => (buf[1] & 0x7f) as u64,
        };

        if opcode >= OP_CLOSE && len > 125 {
            return Err(WsFrameError::Protocol(
                "control frame payload too large".to_string(),
            ));
        }
        if len > self.max_payload as u64 {
            return Err(WsFrameError::Protocol(format!(
                "websocket payload {} exceeds max {}",
                len, self.max_payload
            )));
        }

        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(HeaderProgress::Need(header_len));
        }
        let mask = masked.then(|| {
            let mut mask = [0u8; 4];
            mask.copy_from_slice(&buf[2 + ext_len..header_len]);
            mask
        });
        Ok(HeaderProgress::Ready(FrameHeader {
            fin,
            opcode,
            mask,
            header_len,
            payload_len: len as usize,
        }))
    }

    fn take_frame(&mut self, header: FrameHeader) -> WsFrame {
        let total = header.header_len + header.payload_len;
        let mut payload = self.buf[header.header_len..total].to_vec();
        self.buf.clear();
        if let Some(mask) = header.mask {
            for (idx, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[idx % 4];
            }
        }
        WsFrame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        }
    }

    fn fill<S: Read>(&mut self, stream: &mut S, wanted: usize) -> Result<(), WsFrameError> {
        let start = self.buf.len();
        self.buf.resize(start + wanted, 0);
        let read = match stream.read(&mut self.buf[start..]) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                self.buf.truncate(start);
                return Ok(());
            }
            Err(err) => {
                self.buf.truncate(start);
                return Err(map_ws_read_error(err));
            }
        };
        self.buf.truncate(start + read);
        if read == 0 {
            return Err(WsFrameError::Closed);
        }
        Ok(())
    }
}

pub fn write_frame<S: Write>(stream: &mut S, opcode: u8, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len();
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | (opcode & 0x0f));
    if len < 126 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    stream.write_all(&header)?;
    if !payload.is_empty() {
        stream.write_all(payload)?;
    }
    stream.flush()
}

pub fn write_close<S: Write>(stream: &mut S, code: u16) -> std::io::Result<()> {
    write_frame(stream, OP_CLOSE, &code.to_be_bytes())
}

fn read_http_request<S: Read>(stream: &mut S, max_bytes: usize) -> Result<String, HandshakeError> {
    let mut data = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            return Err(HandshakeError::Malformed("handshake closed".to_string()));
        }
        data.extend_from_slice(&buf[..read]);
        if data.len() > max_bytes {
            return Err(HandshakeError::Malformed(
                "handshake exceeded max bytes".to_string(),
            ));
        }
        if data.windows(4).any(|chunk| chunk == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&data).to_string())
}

fn parse_headers(request: &str) -> Result<(String, HashMap<String, String>), HandshakeError> {
    let mut lines = request.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| HandshakeError::Malformed("empty handshake request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("/");
    if !method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::Malformed(format!(
            "unexpected method '{method}'"
        )));
    }
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((target.to_string(), headers))
}

/// Raw (still escaped) value of a query parameter.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn reject_handshake<S: Write>(stream: &mut S, code: u16, message: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {code} {message}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn map_ws_read_error(err: std::io::Error) -> WsFrameError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => WsFrameError::Timeout,
        std::io::ErrorKind::UnexpectedEof => WsFrameError::Closed,
        _ => WsFrameError::Io(err),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex: reads come from `input`, writes land in `output`.
    pub(crate) struct Duplex {
        pub input: Cursor<Vec<u8>>,
        pub output: Vec<u8>,
    }

    impl Duplex {
        pub fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FixedAuth;

    impl HandshakeAuthenticator for FixedAuth {
        fn authenticate(&self, token: &str) -> Result<Identity, HandshakeError> {
            match token {
                "good" => Ok(Identity::new("Alice")),
                _ => Err(HandshakeError::Rejected("bad token".to_string())),
            }
        }
    }

    pub(crate) fn masked_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![if fin { 0x80 } else { 0x00 } | opcode];
        if payload.len() < 126 {
            out.push(0x80 | payload.len() as u8);
        } else {
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(idx, byte)| byte ^ mask[idx % 4]));
        out
    }

    fn upgrade_request(target: &str) -> Vec<u8> {
        format!(
            "GET {target} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nOrigin: http://game.test\r\n\r\n"
        )
        .into_bytes()
    }

    fn response_line(stream: &Duplex) -> String {
        String::from_utf8_lossy(&stream.output)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn valid_token_upgrades_and_returns_identity() {
        let mut stream = Duplex::new(upgrade_request("/ws?foo=1&token=good"));
        let identity =
            accept_handshake(&mut stream, &WsHandshakeConfig::default(), &FixedAuth)
                .expect("handshake");
        assert_eq!(identity.as_str(), "Alice");
        assert_eq!(response_line(&stream), "HTTP/1.1 101 Switching Protocols");
        let response = String::from_utf8_lossy(&stream.output).to_string();
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn bad_or_missing_token_gets_401() {
        for target in ["/?token=bad", "/"] {
            let mut stream = Duplex::new(upgrade_request(target));
            let err = accept_handshake(&mut stream, &WsHandshakeConfig::default(), &FixedAuth)
                .expect_err("rejected");
            assert!(matches!(err, HandshakeError::Rejected(_)));
            assert_eq!(response_line(&stream), "HTTP/1.1 401 Unauthorized");
        }
    }

    #[test]
    fn plain_http_request_gets_426() {
        let request = b"GET /ws?token=good HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec();
        let mut stream = Duplex::new(request);
        let err = accept_handshake(&mut stream, &WsHandshakeConfig::default(), &FixedAuth)
            .expect_err("not upgraded");
        assert!(matches!(err, HandshakeError::Malformed(_)));
        assert_eq!(response_line(&stream), "HTTP/1.1 426 Upgrade Required");
    }

    #[test]
    fn unknown_path_is_not_upgraded() {
        let mut stream = Duplex::new(upgrade_request("/admin?token=good"));
        assert!(accept_handshake(&mut stream, &WsHandshakeConfig::default(), &FixedAuth).is_err());
        assert_eq!(response_line(&stream), "HTTP/1.1 404 Not Found");
    }

    #[test]
    fn origin_allow_list_is_enforced() {
        let config = WsHandshakeConfig {
            allowed_origins: Some(vec!["http://other.test".to_string()]),
            ..WsHandshakeConfig::default()
        };
        let mut stream = Duplex::new(upgrade_request("/?token=good"));
        assert!(accept_handshake(&mut stream, &config, &FixedAuth).is_err());
        assert_eq!(response_line(&stream), "HTTP/1.1 403 Origin not allowed");

        let config = WsHandshakeConfig {
            allowed_origins: Some(vec!["http://game.test".to_string()]),
            ..WsHandshakeConfig::default()
        };
        let mut stream = Duplex::new(upgrade_request("/?token=good"));
        assert!(accept_handshake(&mut stream, &config, &FixedAuth).is_ok());
    }

    /// Reads one whole frame from a client socket in tests.
    pub(crate) fn read_frame<S: Read>(
        stream: &mut S,
        max_payload: usize,
    ) -> Result<WsFrame, WsFrameError> {
        FrameReader::new(max_payload).read(stream)
    }

    /// Hands out queued chunks; `None` reads as a poll timeout.
    struct Trickle {
        chunks: std::collections::VecDeque<Option<Vec<u8>>>,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
                Some(None) => Err(std::io::ErrorKind::WouldBlock.into()),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn frame_reader_unmasks_and_reports_fin() {
        let mut bytes = masked_frame(false, OP_BINARY, &[1, 2, 3]);
        bytes.extend(masked_frame(true, OP_CONTINUATION, &[4]));
        let mut stream = Cursor::new(bytes);
        let mut reader = FrameReader::new(1024);

        let first = reader.read(&mut stream).expect("first");
        assert!(!first.fin);
        assert_eq!(first.opcode, OP_BINARY);
        assert_eq!(first.payload, vec![1, 2, 3]);

        let second = reader.read(&mut stream).expect("second");
        assert!(second.fin);
        assert_eq!(second.opcode, OP_CONTINUATION);
        assert_eq!(second.payload, vec![4]);

        assert!(matches!(reader.read(&mut stream), Err(WsFrameError::Closed)));
    }

    #[test]
    fn frame_split_by_timeouts_is_resumed() {
        let frame = masked_frame(true, OP_BINARY, &[9u8; 130]);
        let mut chunks = std::collections::VecDeque::new();
        for cut in [&frame[..1], &frame[1..3], &frame[3..7], &frame[7..50], &frame[50..]] {
            chunks.push_back(None);
            chunks.push_back(Some(cut.to_vec()));
        }
        let mut stream = Trickle { chunks };
        let mut reader = FrameReader::new(1024);

        let mut timeouts = 0;
        let frame = loop {
            match reader.read(&mut stream) {
                Ok(frame) => break frame,
                Err(WsFrameError::Timeout) => timeouts += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert_eq!(timeouts, 5);
        assert_eq!(frame.opcode, OP_BINARY);
        assert_eq!(frame.payload, vec![9u8; 130]);
    }

    #[test]
    fn frame_reader_enforces_limits() {
        let mut stream = Cursor::new(masked_frame(true, OP_BINARY, &[0u8; 200]));
        assert!(matches!(
            read_frame(&mut stream, 100),
            Err(WsFrameError::Protocol(_))
        ));

        let mut stream = Cursor::new(masked_frame(false, OP_PING, &[]));
        assert!(matches!(
            read_frame(&mut stream, 100),
            Err(WsFrameError::Protocol(_))
        ));
    }

    #[test]
    fn write_frame_uses_extended_lengths() {
        let mut out = Vec::new();
        write_frame(&mut out, OP_BINARY, &[7u8; 300]).expect("write");
        assert_eq!(&out[..4], &[0x82, 126, 0x01, 0x2c]);
        assert_eq!(out.len(), 4 + 300);

        let mut out = Vec::new();
        write_close(&mut out, CLOSE_NORMAL).expect("close");
        assert_eq!(out, vec![0x88, 2, 0x03, 0xe8]);
    }
}
