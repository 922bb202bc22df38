#![forbid(unsafe_code)]

//! RESP v2 wire codec: a resumable streaming decoder plus the encoding
//! helpers used by both the server reply path and client-side request
//! packing.

use std::fmt;

/// One decoded RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`).
    BulkString(Option<Vec<u8>>),
    /// `None` is the null array (`*-1`).
    Array(Option<Vec<RespFrame>>),
}

impl RespFrame {
    #[must_use]
    pub fn ok() -> Self {
        RespFrame::SimpleString("OK".to_owned())
    }

    #[must_use]
    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        RespFrame::BulkString(Some(bytes.into()))
    }

    #[must_use]
    pub fn null() -> Self {
        RespFrame::BulkString(None)
    }

    #[must_use]
    pub fn null_array() -> Self {
        RespFrame::Array(None)
    }

    #[must_use]
    pub fn array(items: Vec<RespFrame>) -> Self {
        RespFrame::Array(Some(items))
    }

    /// Serialize this frame, appending to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            RespFrame::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
            RespFrame::BulkString(Some(bytes)) => {
                out.push(b'$');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(bytes);
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(Some(items)) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// Classification of the leading code word of a `-` error reply.
/// Unrecognized codes normalize to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    WrongType,
    NoAuth,
    Other,
}

impl ErrorKind {
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let code = message.split(' ').next().unwrap_or("");
        match code {
            "ERR" => ErrorKind::Generic,
            "WRONGTYPE" => ErrorKind::WrongType,
            "NOAUTH" => ErrorKind::NoAuth,
            _ => ErrorKind::Other,
        }
    }
}

/// Wire-level decode failures. Everything here is fatal to the
/// connection: the decoder clears its buffer before reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespError {
    BadTypeTag(u8),
    InvalidInteger,
    InvalidBulkLength,
    InvalidMultibulkLength,
}

impl fmt::Display for RespError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespError::BadTypeTag(tag) => {
                write!(f, "Protocol error: unexpected type byte {:#04x}", tag)
            }
            RespError::InvalidInteger => write!(f, "Protocol error: invalid integer"),
            RespError::InvalidBulkLength => write!(f, "Protocol error: invalid bulk length"),
            RespError::InvalidMultibulkLength => {
                write!(f, "Protocol error: invalid multibulk length")
            }
        }
    }
}

impl std::error::Error for RespError {}

/// An array whose header arrived but whose elements are still streaming
/// in. The stack of these is the decoder's resume point across `feed`
/// calls.
#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<RespFrame>,
}

enum Step {
    NeedMore,
    Value(RespFrame),
    ArrayStart(usize),
}

/// Resumable RESP decoder over a streamed byte buffer.
///
/// `feed` appends raw bytes; `try_next` yields at most one complete
/// top-level frame per call and `Ok(None)` when more bytes are needed.
/// Scalars are only consumed once whole; arrays accumulate element by
/// element in `stack`, so a frame split across any number of reads
/// decodes identically to one fed in a single chunk.
#[derive(Debug, Default)]
pub struct RespDecoder {
    buf: Vec<u8>,
    pos: usize,
    stack: Vec<PartialArray>,
}

impl RespDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed by a completed frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode one complete top-level frame if the buffer holds one.
    pub fn try_next(&mut self) -> Result<Option<RespFrame>, RespError> {
        loop {
            let step = match self.parse_step() {
                Ok(step) => step,
                Err(err) => {
                    self.buf.clear();
                    self.pos = 0;
                    self.stack.clear();
                    return Err(err);
                }
            };
            match step {
                Step::NeedMore => {
                    self.compact();
                    return Ok(None);
                }
                Step::ArrayStart(len) => {
                    self.stack.push(PartialArray {
                        remaining: len,
                        items: Vec::with_capacity(len.min(64)),
                    });
                }
                Step::Value(frame) => {
                    if let Some(complete) = self.fold(frame) {
                        self.compact();
                        return Ok(Some(complete));
                    }
                }
            }
        }
    }

    /// Push a completed value into the innermost pending array,
    /// collapsing finished arrays outward. Returns the finished
    /// top-level frame, if any.
    fn fold(&mut self, frame: RespFrame) -> Option<RespFrame> {
        let mut value = frame;
        loop {
            match self.stack.last_mut() {
                None => return Some(value),
                Some(top) => {
                    top.items.push(value);
                    top.remaining -= 1;
                    if top.remaining > 0 {
                        return None;
                    }
                    let done = self.stack.pop().unwrap_or_else(|| unreachable!());
                    value = RespFrame::Array(Some(done.items));
                }
            }
        }
    }

    /// Parse one value or array header starting at `pos`. Does not
    /// consume anything when the buffer is short.
    fn parse_step(&mut self) -> Result<Step, RespError> {
        let Some(line_end) = find_crlf(&self.buf[self.pos..]) else {
            return Ok(Step::NeedMore);
        };
        let line_start = self.pos;
        let line = &self.buf[line_start..line_start + line_end];
        let Some((&tag, rest)) = line.split_first() else {
            return Err(RespError::BadTypeTag(b'\r'));
        };
        let after_line = line_start + line_end + 2;
        match tag {
            b'+' => {
                let text = String::from_utf8_lossy(rest).into_owned();
                self.pos = after_line;
                Ok(Step::Value(RespFrame::SimpleString(text)))
            }
            b'-' => {
                let text = String::from_utf8_lossy(rest).into_owned();
                self.pos = after_line;
                Ok(Step::Value(RespFrame::Error(text)))
            }
            b':' => {
                let n = parse_i64(rest).ok_or(RespError::InvalidInteger)?;
                self.pos = after_line;
                Ok(Step::Value(RespFrame::Integer(n)))
            }
            b'$' => {
                let len = parse_i64(rest).ok_or(RespError::InvalidBulkLength)?;
                if len == -1 {
                    self.pos = after_line;
                    return Ok(Step::Value(RespFrame::BulkString(None)));
                }
                if len < 0 {
                    return Err(RespError::InvalidBulkLength);
                }
                let len = len as usize;
                // Payload plus trailing CRLF must be fully buffered
                // before the header is consumed.
                if self.buf.len() < after_line + len + 2 {
                    return Ok(Step::NeedMore);
                }
                let payload = self.buf[after_line..after_line + len].to_vec();
                self.pos = after_line + len + 2;
                Ok(Step::Value(RespFrame::BulkString(Some(payload))))
            }
            b'*' => {
                let len = parse_i64(rest).ok_or(RespError::InvalidMultibulkLength)?;
                if len == -1 {
                    self.pos = after_line;
                    return Ok(Step::Value(RespFrame::Array(None)));
                }
                if len < 0 {
                    return Err(RespError::InvalidMultibulkLength);
                }
                self.pos = after_line;
                if len == 0 {
                    return Ok(Step::Value(RespFrame::Array(Some(Vec::new()))));
                }
                Ok(Step::ArrayStart(len as usize))
            }
            other => Err(RespError::BadTypeTag(other)),
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == b"\r\n")
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Frame a client-side request: an array of bulk strings.
#[must_use]
pub fn pack_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    pack_command_into(args, &mut out);
    out
}

/// Frame a pipeline of requests back to back in one buffer.
#[must_use]
pub fn pack_pipeline(commands: &[Vec<Vec<u8>>]) -> Vec<u8> {
    let mut out = Vec::new();
    for command in commands {
        let args: Vec<&[u8]> = command.iter().map(Vec::as_slice).collect();
        pack_command_into(&args, &mut out);
    }
    out
}

fn pack_command_into(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{ErrorKind, RespDecoder, RespError, RespFrame, pack_command, pack_pipeline};

    fn decode_one(bytes: &[u8]) -> RespFrame {
        let mut decoder = RespDecoder::new();
        decoder.feed(bytes);
        decoder.try_next().expect("decode").expect("complete frame")
    }

    #[test]
    fn decodes_scalars() {
        assert_eq!(
            decode_one(b"+OK\r\n"),
            RespFrame::SimpleString("OK".to_owned())
        );
        assert_eq!(decode_one(b":42\r\n"), RespFrame::Integer(42));
        assert_eq!(decode_one(b":-7\r\n"), RespFrame::Integer(-7));
        assert_eq!(decode_one(b"$3\r\nfoo\r\n"), RespFrame::bulk(*b"foo"));
        assert_eq!(decode_one(b"$0\r\n\r\n"), RespFrame::bulk(*b""));
        assert_eq!(decode_one(b"$-1\r\n"), RespFrame::BulkString(None));
        assert_eq!(decode_one(b"*-1\r\n"), RespFrame::Array(None));
        assert_eq!(decode_one(b"*0\r\n"), RespFrame::Array(Some(Vec::new())));
    }

    #[test]
    fn decodes_error_frames_with_kind() {
        let frame = decode_one(b"-WRONGTYPE Operation against a key\r\n");
        let RespFrame::Error(message) = frame else {
            panic!("expected error frame");
        };
        assert_eq!(ErrorKind::classify(&message), ErrorKind::WrongType);
        assert_eq!(ErrorKind::classify("NOAUTH Authentication required"), ErrorKind::NoAuth);
        assert_eq!(ErrorKind::classify("BOOM something"), ErrorKind::Other);
    }

    #[test]
    fn decodes_nested_array() {
        let frame = decode_one(b"*2\r\n*2\r\n$1\r\na\r\n:1\r\n$3\r\nbar\r\n");
        assert_eq!(
            frame,
            RespFrame::array(vec![
                RespFrame::array(vec![RespFrame::bulk(*b"a"), RespFrame::Integer(1)]),
                RespFrame::bulk(*b"bar"),
            ])
        );
    }

    #[test]
    fn partial_bulk_is_not_an_error() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"$5\r\nhel");
        assert_eq!(decoder.try_next(), Ok(None));
        decoder.feed(b"lo\r\n");
        assert_eq!(decoder.try_next(), Ok(Some(RespFrame::bulk(*b"hello"))));
    }

    #[test]
    fn one_byte_at_a_time_resumes() {
        let wire = b"*2\r\n$4\r\nLLEN\r\n$6\r\nmylist\r\n";
        let mut decoder = RespDecoder::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            decoder.feed(std::slice::from_ref(byte));
            match decoder.try_next().expect("no protocol error") {
                Some(frame) => {
                    assert_eq!(i, wire.len() - 1);
                    decoded = Some(frame);
                }
                None => assert!(i < wire.len() - 1),
            }
        }
        assert_eq!(
            decoded,
            Some(RespFrame::array(vec![
                RespFrame::bulk(*b"LLEN"),
                RespFrame::bulk(*b"mylist"),
            ]))
        );
    }

    #[test]
    fn drains_multiple_pipelined_frames() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"+one\r\n:2\r\n$5\r\nthree\r\n");
        assert_eq!(
            decoder.try_next(),
            Ok(Some(RespFrame::SimpleString("one".to_owned())))
        );
        assert_eq!(decoder.try_next(), Ok(Some(RespFrame::Integer(2))));
        assert_eq!(decoder.try_next(), Ok(Some(RespFrame::bulk(*b"three"))));
        assert_eq!(decoder.try_next(), Ok(None));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn bad_type_tag_clears_buffer() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"!bogus\r\n+OK\r\n");
        assert_eq!(decoder.try_next(), Err(RespError::BadTypeTag(b'!')));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.try_next(), Ok(None));
    }

    #[test]
    fn negative_bulk_length_is_rejected() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"$-2\r\n");
        assert_eq!(decoder.try_next(), Err(RespError::InvalidBulkLength));
        let mut decoder = RespDecoder::new();
        decoder.feed(b"*-3\r\n");
        assert_eq!(decoder.try_next(), Err(RespError::InvalidMultibulkLength));
    }

    #[test]
    fn bulk_payload_may_contain_crlf() {
        assert_eq!(
            decode_one(b"$6\r\na\r\nb\r\n\r\n"),
            RespFrame::bulk(*b"a\r\nb\r\n")
        );
    }

    #[test]
    fn pack_command_frames_arguments() {
        assert_eq!(
            pack_command(&[b"SET", b"key", b"value"]),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n".to_vec()
        );
    }

    #[test]
    fn pack_pipeline_concatenates_commands() {
        let packed = pack_pipeline(&[
            vec![b"PING".to_vec()],
            vec![b"GET".to_vec(), b"k".to_vec()],
        ]);
        assert_eq!(packed, b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec());
    }

    fn arb_frame() -> impl Strategy<Value = RespFrame> {
        let leaf = prop_oneof![
            "[a-zA-Z0-9 ]{0,12}".prop_map(RespFrame::SimpleString),
            any::<i64>().prop_map(RespFrame::Integer),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..48))
                .prop_map(RespFrame::BulkString),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            proptest::option::of(proptest::collection::vec(inner, 0..4))
                .prop_map(RespFrame::Array)
        })
    }

    proptest! {
        #[test]
        fn round_trip(frame in arb_frame()) {
            let wire = frame.to_bytes();
            let mut decoder = RespDecoder::new();
            decoder.feed(&wire);
            prop_assert_eq!(decoder.try_next().unwrap(), Some(frame));
            prop_assert_eq!(decoder.buffered(), 0);
        }

        #[test]
        fn split_feed_equals_whole_feed(frame in arb_frame(), split in 0usize..64) {
            let wire = frame.to_bytes();
            let cut = split.min(wire.len());
            let mut decoder = RespDecoder::new();
            decoder.feed(&wire[..cut]);
            let early = decoder.try_next().unwrap();
            if let Some(ref got) = early {
                prop_assert_eq!(got, &frame);
            }
            decoder.feed(&wire[cut..]);
            match early {
                Some(_) => prop_assert_eq!(decoder.try_next().unwrap(), None),
                None => prop_assert_eq!(decoder.try_next().unwrap(), Some(frame)),
            }
        }
    }
}
