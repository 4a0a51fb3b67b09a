//! Wire codec for the key-value / pub/sub backend.
//!
//! ## Wire Format
//!
//! Every frame starts with a one-byte type prefix and a `\r\n` terminated
//! header line:
//!
//! ```text
//! +<text>\r\n              simple string
//! -<text>\r\n              error reply
//! :<int>\r\n               integer
//! $<len>\r\n<bytes>\r\n    bulk string ($-1 is null)
//! *<count>\r\n<frame>...   array (*-1 is null)
//! ><count>\r\n<frame>...   out-of-band push
//! ```
//!
//! Requests are always arrays of bulk strings, see [`encode_command`].
//!
//! ## Pub/Sub notifications
//!
//! | Frame                                   | Meaning                     |
//! |-----------------------------------------|-----------------------------|
//! | `["subscribe", channel, count]`         | subscribe acknowledgement   |
//! | `["unsubscribe", channel, count]`       | unsubscribe acknowledgement |
//! | `["message", channel, payload]`         | published message           |
//! | `["pong", ""]`                          | `PING` reply in subscribed mode |

/// Maximum bulk string length (512 MB, the backend's own limit).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in one array or push frame.
pub const MAX_AGGREGATE_LEN: usize = 1024 * 1024;

/// Maximum nesting of aggregate frames.
pub const MAX_DEPTH: usize = 32;

/// Maximum length of a header line (type prefix excluded).
pub const MAX_LINE_SIZE: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    InvalidPrefix(u8),
    InvalidInteger(String),
    InvalidLength(i64),
    BulkTooLarge(usize),
    AggregateTooLarge(usize),
    TooDeep(usize),
    LineTooLong(usize),
    MissingTerminator,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPrefix(b) => write!(f, "invalid frame prefix: 0x{b:02X}"),
            Self::InvalidInteger(s) => write!(f, "invalid integer: {s:?}"),
            Self::InvalidLength(n) => write!(f, "invalid length: {n}"),
            Self::BulkTooLarge(size) => write!(f, "bulk string too large: {size}"),
            Self::AggregateTooLarge(count) => write!(f, "aggregate too large: {count} elements"),
            Self::TooDeep(depth) => write!(f, "frame nesting too deep: {depth}"),
            Self::LineTooLong(size) => write!(f, "header line too long: {size}"),
            Self::MissingTerminator => write!(f, "bulk string not terminated by CRLF"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<Frame>),
    Push(Vec<Frame>),
}

impl Frame {
    /// Bulk string frame from anything byte-like.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Self::Bulk(data.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Raw bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Simple(s) => Some(s.as_bytes()),
            Self::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Text of a simple or bulk string. `None` for other frames or invalid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of an array or push frame.
    pub fn into_elements(self) -> Option<Vec<Frame>> {
        match self {
            Self::Array(items) | Self::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Append the wire form of this frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Simple(s) => put_line(out, b'+', s.as_bytes()),
            Self::Error(s) => put_line(out, b'-', s.as_bytes()),
            Self::Integer(n) => put_line(out, b':', n.to_string().as_bytes()),
            Self::Bulk(data) => put_bulk(out, data),
            Self::Null => out.extend_from_slice(b"$-1\r\n"),
            Self::Array(items) => put_aggregate(out, b'*', items),
            Self::Push(items) => put_aggregate(out, b'>', items),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn put_line(out: &mut Vec<u8>, prefix: u8, line: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(line);
    out.extend_from_slice(CRLF);
}

fn put_bulk(out: &mut Vec<u8>, data: &[u8]) {
    put_line(out, b'$', data.len().to_string().as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF);
}

fn put_aggregate(out: &mut Vec<u8>, prefix: u8, items: &[Frame]) {
    put_line(out, prefix, items.len().to_string().as_bytes());
    for item in items {
        item.encode(out);
    }
}

/// Encode a command: an array of bulk strings, e.g. `PUBLISH <channel> <message>`.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let len: usize = args.iter().map(|a| a.as_ref().len() + 16).sum();
    let mut out = Vec::with_capacity(16 + len);
    put_line(&mut out, b'*', args.len().to_string().as_bytes());
    for arg in args {
        put_bulk(&mut out, arg.as_ref());
    }
    out
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Index of the `\r\n` that ends the line starting at `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(CRLF.len())
        .position(|w| w == CRLF)
        .map(|i| from + i)
}

/// Read the header line starting at `start`. Returns the line and the
/// offset just past its terminator, or `None` if the line is incomplete.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    match find_crlf(buf, start) {
        Some(end) => {
            let line = buf.get(start..end).unwrap_or_default();
            if line.len() > MAX_LINE_SIZE {
                return Err(ProtocolError::LineTooLong(line.len()));
            }
            Ok(Some((line, end + CRLF.len())))
        }
        None => {
            let buffered = buf.len().saturating_sub(start);
            if buffered > MAX_LINE_SIZE {
                return Err(ProtocolError::LineTooLong(buffered));
            }
            Ok(None)
        }
    }
}

fn parse_integer(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

/// Parse a length header. `-1` encodes null and yields `None`.
fn parse_length(line: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match parse_integer(line)? {
        -1 => Ok(None),
        n => usize::try_from(n)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidLength(n)),
    }
}

/// Parse one frame at `pos`. Returns the frame and the offset just past it,
/// or `None` if `buf` does not yet hold the complete frame.
fn parse_frame(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    if !matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*' | b'>') {
        return Err(ProtocolError::InvalidPrefix(prefix));
    }
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match prefix {
        b'+' => Ok(Some((
            Frame::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_integer(line)?), next))),
        b'$' => {
            let Some(len) = parse_length(line)? else {
                return Ok(Some((Frame::Null, next)));
            };
            if len > MAX_BULK_SIZE {
                return Err(ProtocolError::BulkTooLarge(len));
            }
            let end = next + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if buf.get(end..end + CRLF.len()) != Some(CRLF) {
                return Err(ProtocolError::MissingTerminator);
            }
            let data = buf.get(next..end).unwrap_or_default().to_vec();
            Ok(Some((Frame::Bulk(data), end + CRLF.len())))
        }
        _ => {
            let Some(count) = parse_length(line)? else {
                return Ok(Some((Frame::Null, next)));
            };
            if count > MAX_AGGREGATE_LEN {
                return Err(ProtocolError::AggregateTooLarge(count));
            }
            if depth >= MAX_DEPTH {
                return Err(ProtocolError::TooDeep(depth + 1));
            }
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = next;
            for _ in 0..count {
                let Some((item, after)) = parse_frame(buf, cursor, depth + 1)? else {
                    return Ok(None);
                };
                items.push(item);
                cursor = after;
            }
            let frame = if prefix == b'>' {
                Frame::Push(items)
            } else {
                Frame::Array(items)
            };
            Ok(Some((frame, cursor)))
        }
    }
}

/// Buffered frame decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(16 * 1024),
        }
    }

    /// Feed data and extract complete frames.
    ///
    /// Incomplete trailing data is kept for the next call. On error the
    /// buffer is reset, since the stream can no longer be resynchronised.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < self.buf.len() {
            match parse_frame(&self.buf, offset, 0) {
                Ok(Some((frame, next))) => {
                    frames.push(frame);
                    offset = next;
                }
                Ok(None) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(frames)
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<Frame> {
        Decoder::new().decode(data).unwrap()
    }

    #[test]
    fn encode_command_publish() {
        let data = encode_command(&["PUBLISH", "sensors", "sensors:kitchen:temp:21"]);
        assert_eq!(
            data,
            b"*3\r\n$7\r\nPUBLISH\r\n$7\r\nsensors\r\n$23\r\nsensors:kitchen:temp:21\r\n"
        );
    }

    #[test]
    fn encode_command_empty_argument() {
        let data = encode_command(&["SET", "k", ""]);
        assert_eq!(data, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$0\r\n\r\n");
    }

    #[test]
    fn decode_scalar_frames() {
        let frames = decode_all(b"+PONG\r\n-ERR unknown command\r\n:42\r\n:-7\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::Simple("PONG".into()),
                Frame::Error("ERR unknown command".into()),
                Frame::Integer(42),
                Frame::Integer(-7),
            ]
        );
    }

    #[test]
    fn decode_bulk_and_null() {
        let frames = decode_all(b"$5\r\nhello\r\n$0\r\n\r\n$-1\r\n*-1\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::bulk("hello"),
                Frame::bulk(""),
                Frame::Null,
                Frame::Null
            ]
        );
    }

    #[test]
    fn decode_bulk_with_embedded_crlf() {
        let frames = decode_all(b"$4\r\na\r\nb\r\n");
        assert_eq!(frames, vec![Frame::bulk("a\r\nb")]);
    }

    #[test]
    fn decode_message_notification() {
        let frames =
            decode_all(b"*3\r\n$7\r\nmessage\r\n$5\r\nTiger\r\n$16\r\nTiger:Eats:Fruit\r\n");
        assert_eq!(frames.len(), 1);
        let items = frames[0].clone().into_elements().unwrap();
        assert_eq!(items[0].as_str(), Some("message"));
        assert_eq!(items[1].as_str(), Some("Tiger"));
        assert_eq!(items[2].as_str(), Some("Tiger:Eats:Fruit"));
    }

    #[test]
    fn decode_subscribe_ack() {
        let frames =
            decode_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nFish\r\n:1\r\n");
        let items = frames[0].clone().into_elements().unwrap();
        assert_eq!(items[0].as_str(), Some("subscribe"));
        assert_eq!(items[2].as_integer(), Some(1));
    }

    #[test]
    fn decode_push_frame() {
        let frames = decode_all(b">3\r\n$7\r\nmessage\r\n$1\r\nc\r\n$1\r\np\r\n");
        assert!(matches!(frames[0], Frame::Push(_)));
        assert_eq!(frames[0].clone().into_elements().map(|v| v.len()), Some(3));
    }

    #[test]
    fn decode_nested_array() {
        let frames = decode_all(b"*2\r\n*1\r\n:1\r\n$1\r\nx\r\n");
        assert_eq!(
            frames,
            vec![Frame::Array(vec![
                Frame::Array(vec![Frame::Integer(1)]),
                Frame::bulk("x"),
            ])]
        );
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let data = Frame::Array(vec![Frame::bulk("message"), Frame::bulk("ch"), Frame::bulk("a:b")])
            .to_bytes();
        let mut dec = Decoder::new();

        let split = data.len() / 2;
        assert!(dec.decode(&data[..split]).unwrap().is_empty());
        assert_eq!(dec.buffered(), split);

        let frames = dec.decode(&data[split..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = b"*2\r\n$3\r\nfoo\r\n:9\r\n";
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let frames = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(frames.is_empty());
            } else {
                assert_eq!(
                    frames,
                    vec![Frame::Array(vec![Frame::bulk("foo"), Frame::Integer(9)])]
                );
            }
        }
    }

    #[test]
    fn decoder_handles_multiple_frames_and_keeps_remainder() {
        let mut dec = Decoder::new();
        let frames = dec.decode(b"+OK\r\n:1\r\n$3\r\nab").unwrap();
        assert_eq!(frames, vec![Frame::Simple("OK".into()), Frame::Integer(1)]);
        let frames = dec.decode(b"c\r\n").unwrap();
        assert_eq!(frames, vec![Frame::bulk("abc")]);
    }

    #[test]
    fn decoder_rejects_invalid_prefix() {
        let mut dec = Decoder::new();
        let err = dec.decode(b"?what\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPrefix(b'?')));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn decoder_rejects_invalid_integer() {
        let err = Decoder::new().decode(b":12x\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidInteger(_)));
    }

    #[test]
    fn decoder_rejects_negative_length() {
        let err = Decoder::new().decode(b"$-2\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength(-2)));
    }

    #[test]
    fn decoder_rejects_too_large_bulk() {
        let header = format!("${}\r\n", MAX_BULK_SIZE + 1);
        let err = Decoder::new().decode(header.as_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::BulkTooLarge(_)));
    }

    #[test]
    fn decoder_rejects_missing_terminator() {
        let err = Decoder::new().decode(b"$3\r\nabcXY").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTerminator));
    }

    #[test]
    fn decoder_rejects_deep_nesting() {
        let data = "*1\r\n".repeat(MAX_DEPTH + 1);
        let err = Decoder::new().decode(data.as_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooDeep(_)));
    }

    #[test]
    fn decoder_rejects_unterminated_long_line() {
        let mut data = b"+".to_vec();
        data.extend(std::iter::repeat_n(b'a', MAX_LINE_SIZE + 1));
        let err = Decoder::new().decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong(_)));
    }

    #[test]
    fn frame_accessors() {
        assert_eq!(Frame::Simple("OK".into()).as_str(), Some("OK"));
        assert_eq!(Frame::bulk(vec![0xff, 0xfe]).as_str(), None);
        assert_eq!(Frame::bulk(vec![0xff]).as_bytes(), Some(&[0xff][..]));
        assert_eq!(Frame::Integer(3).as_str(), None);
        assert!(Frame::Error("ERR".into()).is_error());
        assert!(Frame::Null.into_elements().is_none());
    }
}
