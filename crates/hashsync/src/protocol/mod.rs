//! Wire protocol: command vocabulary, framing, and message IO.
//!
//! Each message is one length-prefixed frame containing a verb tag, an
//! argument count, and the arguments as self-describing values. Keys and
//! rows travel as arrays of values. Row payloads ride in the same frame as
//! their header arguments, after the fixed arguments for the verb.

pub mod encoding;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{Key, Row, Value};
use crate::error::{Result, SyncError};

use encoding::{decode_value, encode_value};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default target block size: big enough to amortize a moderate amount of
/// link latency.
pub const DEFAULT_TARGET_BLOCK_SIZE: u64 = 256 * 1024;

/// Smallest accepted target block size: one OS page. Combined replies must
/// fit the next command in the kernel send buffer to stay deadlock-free, so
/// this is the floor, not a tunable.
pub const MIN_TARGET_BLOCK_SIZE: u64 = 4096;

/// Frames larger than this are rejected outright.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Command and reply verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    /// Version exchange; replied with the accepted version.
    Protocol = 1,
    /// Block-size hint; replied with the accepted value.
    TargetBlockSize = 2,
    /// Ask the source to begin a transaction and export its snapshot token.
    ExportSnapshot = 3,
    /// Ask the source to adopt a previously exported snapshot.
    ImportSnapshot = 4,
    /// Release any source-side snapshot hold.
    UnholdSnapshot = 5,
    /// Begin a plain transaction with no snapshot choreography.
    WithoutSnapshot = 6,
    /// Request the source's table descriptors.
    Schema = 7,
    /// Begin a per-table dialogue; replied with the first range hash.
    Open = 8,
    /// Request a hash over a key range, bounded by a row limit.
    Hash = 9,
    /// Request (destination) or deliver (source) rows for a key range.
    Rows = 10,
    /// Source's hash over a range it scanned in full.
    HashNext = 11,
    /// Source's hash over a clamped prefix of the requested range.
    HashFail = 12,
    /// Combined rows delivery plus hash of the following range.
    RowsAndHashNext = 13,
    /// Combined rows delivery plus hash, with part of the requested extent
    /// still outstanding.
    RowsAndHashFail = 14,
    /// Peer closes its output and exits.
    Quit = 15,
}

impl Verb {
    fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Verb::Protocol,
            2 => Verb::TargetBlockSize,
            3 => Verb::ExportSnapshot,
            4 => Verb::ImportSnapshot,
            5 => Verb::UnholdSnapshot,
            6 => Verb::WithoutSnapshot,
            7 => Verb::Schema,
            8 => Verb::Open,
            9 => Verb::Hash,
            10 => Verb::Rows,
            11 => Verb::HashNext,
            12 => Verb::HashFail,
            13 => Verb::RowsAndHashNext,
            14 => Verb::RowsAndHashFail,
            15 => Verb::Quit,
            other => return Err(SyncError::protocol(format!("unknown verb {}", other))),
        })
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The verb tag.
    pub verb: Verb,
    /// Positional arguments; row payloads follow the fixed arguments.
    pub args: Vec<Value>,
}

impl Message {
    /// Build a message from a verb and its arguments.
    pub fn new(verb: Verb, args: Vec<Value>) -> Self {
        Self { verb, args }
    }

    /// Positional argument, or a protocol error if absent.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| SyncError::protocol(format!("{:?}: missing argument {}", self.verb, index)))
    }

    /// Positional key argument (an array of values).
    pub fn key_arg(&self, index: usize) -> Result<Key> {
        match self.arg(index)? {
            Value::Array(items) => Ok(items.clone()),
            other => Err(SyncError::protocol(format!(
                "{:?}: argument {} must be a key, got {:?}",
                self.verb, index, other
            ))),
        }
    }

    /// Positional unsigned-integer argument.
    pub fn uint_arg(&self, index: usize) -> Result<u64> {
        self.arg(index)?
            .as_uint()
            .ok_or_else(|| SyncError::protocol(format!("{:?}: argument {} must be an integer", self.verb, index)))
    }

    /// Positional text argument.
    pub fn text_arg(&self, index: usize) -> Result<String> {
        self.arg(index)?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| SyncError::protocol(format!("{:?}: argument {} must be text", self.verb, index)))
    }

    /// Positional binary argument (hashes travel as raw bytes).
    pub fn bytes_arg(&self, index: usize) -> Result<Vec<u8>> {
        match self.arg(index)? {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(SyncError::protocol(format!(
                "{:?}: argument {} must be bytes, got {:?}",
                self.verb, index, other
            ))),
        }
    }

    /// Row payload: every argument from `first` on, each an array of values.
    pub fn rows_from(&self, first: usize) -> Result<Vec<Row>> {
        self.args[first.min(self.args.len())..]
            .iter()
            .map(|v| match v {
                Value::Array(row) => Ok(row.clone()),
                other => Err(SyncError::protocol(format!(
                    "{:?}: row payload must be arrays, got {:?}",
                    self.verb, other
                ))),
            })
            .collect()
    }
}

/// Wrap a key for transmission.
pub fn key_value(key: &Key) -> Value {
    Value::Array(key.clone())
}

/// Wrap a row for transmission.
pub fn row_value(row: &Row) -> Value {
    Value::Array(row.clone())
}

/// Encode and send one message, flushing the stream.
///
/// The flush matters: the peer will not act until it sees the whole frame,
/// and each side blocks on the other's next message.
pub async fn send_message<W>(stream: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = BytesMut::new();
    payload.put_u8(message.verb as u8);
    payload.put_u32(message.args.len() as u32);
    for arg in &message.args {
        encode_value(&mut payload, arg);
    }
    if payload.len() as u64 > u64::from(MAX_FRAME_BYTES) {
        return Err(SyncError::protocol("outgoing frame exceeds maximum size"));
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and decode one message.
///
/// Fails with [`SyncError::Io`] on EOF and [`SyncError::Protocol`] on
/// malformed frames.
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(SyncError::protocol(format!("incoming frame of {} bytes exceeds maximum", len)));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;

    let mut slice: &[u8] = &payload;
    if slice.len() < 5 {
        return Err(SyncError::protocol("frame too short for header"));
    }
    let verb = Verb::from_u8(slice.get_u8())?;
    let argc = slice.get_u32();
    let mut args = Vec::with_capacity(argc.min(4096) as usize);
    for _ in 0..argc {
        args.push(decode_value(&mut slice)?);
    }
    if !slice.is_empty() {
        return Err(SyncError::protocol("trailing bytes after message arguments"));
    }
    Ok(Message::new(verb, args))
}
