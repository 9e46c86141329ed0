//! Write-Ahead Log (WAL) implementation.
//!
//! The WAL is an append-only file of log records stored next to the
//! environment file. A record's position (its LSN) is its byte offset in the
//! log, so positions are strictly increasing and every record can be reached
//! directly from a position saved elsewhere (a checkpoint marker, the
//! superblock).
//!
//! # Log Record Format
//!
//! Each record has the following layout:
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, whole record)            |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | transaction_id (8 bytes, 0 = no transaction)     |
//! | 13-20    | lsn (8 bytes) - byte offset of this record       |
//! | 21-N     | payload (variable, depends on type)              |
//! | N-N+3    | CRC32 checksum (4 bytes) over bytes 0..N         |
//! | N+4-N+7  | record_length again (4 bytes)                    |
//! +----------+--------------------------------------------------+
//! ```
//!
//! The trailing length lets the log be read backward from any record end.
//!
//! # Reading
//!
//! [`Wal::forward`] and [`Wal::backward`] return lazy iterators that read
//! one record per step. Both can be restarted from any position a record was
//! read at. The first invalid record ends iteration with an error. The reader
//! never skips or repairs, and a partially written tail is an error like any
//! other damage.

// record_length fits in u32, records are bounded by MAX_RECORD_SIZE
#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Seek, SeekFrom, Write};

use crate::storage::btree::{Level, NodeId};

/// Log Sequence Number: byte offset of a record in the log.
pub type Lsn = u64;

/// Transaction identifier. 0 is reserved for "no transaction".
pub type TxnId = u64;

/// Log record header size (before payload).
/// `record_length` (4) + `record_type` (1) + `txn_id` (8) + lsn (8) = 21 bytes
const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 checksum size.
const CHECKSUM_SIZE: usize = 4;

/// Trailing copy of `record_length`.
const TRAILER_SIZE: usize = 4;

/// Smallest possible record (empty payload).
pub const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + CHECKSUM_SIZE + TRAILER_SIZE;

/// Largest record accepted by the writer and the reader.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Encodes "no first active position" in a checkpoint marker.
const NO_LSN: u64 = u64::MAX;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A node was created or rewritten.
    NodeWrite = 0x01,
    /// A node was removed.
    NodeDelete = 0x02,
    /// Transaction commit marker.
    Commit = 0x03,
    /// Transaction abort marker.
    Abort = 0x04,
    /// Checkpoint marker.
    Checkpoint = 0x05,
    /// Free-form diagnostic text. Never changes the tree.
    Trace = 0x06,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::NodeWrite),
            0x02 => Ok(Self::NodeDelete),
            0x03 => Ok(Self::Commit),
            0x04 => Ok(Self::Abort),
            0x05 => Ok(Self::Checkpoint),
            0x06 => Ok(Self::Trace),
            _ => Err(value),
        }
    }
}

/// Contents of a checkpoint marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMarker {
    /// Root node at checkpoint time (`None` for an empty tree).
    pub root: Option<NodeId>,
    /// Every change before this position was flushed to the environment file.
    pub redo_start: Lsn,
    /// Position of the oldest record written by a transaction that was still
    /// running when the checkpoint was taken.
    pub first_active: Option<Lsn>,
}

impl CheckpointMarker {
    /// Lowest position the undo pass must reach.
    #[must_use]
    pub fn undo_floor(&self) -> Lsn {
        self.first_active
            .map_or(self.redo_start, |first| first.min(self.redo_start))
    }
}

/// Payload for different log record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordPayload {
    /// Node `node_id` now has `image`. `prior` is the image it replaced,
    /// absent when the node did not exist.
    NodeWrite {
        node_id: NodeId,
        level: Level,
        image: Vec<u8>,
        prior: Option<Vec<u8>>,
    },
    /// Node `node_id` no longer exists. `prior` is its last image.
    NodeDelete {
        node_id: NodeId,
        level: Level,
        prior: Option<Vec<u8>>,
    },
    /// Commit transaction - no additional data.
    Commit,
    /// Abort transaction - no additional data.
    Abort,
    /// Checkpoint marker with metadata.
    Checkpoint(CheckpointMarker),
    /// Diagnostic message.
    Trace(String),
}

impl LogRecordPayload {
    /// Get the record type for this payload.
    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        match self {
            Self::NodeWrite { .. } => LogRecordType::NodeWrite,
            Self::NodeDelete { .. } => LogRecordType::NodeDelete,
            Self::Commit => LogRecordType::Commit,
            Self::Abort => LogRecordType::Abort,
            Self::Checkpoint(_) => LogRecordType::Checkpoint,
            Self::Trace(_) => LogRecordType::Trace,
        }
    }

    /// Serialize the payload to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            Self::NodeWrite {
                node_id,
                level,
                image,
                prior,
            } => {
                bytes.extend_from_slice(&node_id.to_le_bytes());
                bytes.extend_from_slice(&level.to_le_bytes());
                bytes.extend_from_slice(&(image.len() as u32).to_le_bytes());
                bytes.extend_from_slice(image);
                put_optional_image(&mut bytes, prior.as_deref());
            }
            Self::NodeDelete {
                node_id,
                level,
                prior,
            } => {
                bytes.extend_from_slice(&node_id.to_le_bytes());
                bytes.extend_from_slice(&level.to_le_bytes());
                put_optional_image(&mut bytes, prior.as_deref());
            }
            Self::Commit | Self::Abort => {}
            Self::Checkpoint(marker) => {
                bytes.extend_from_slice(&marker.root.unwrap_or(0).to_le_bytes());
                bytes.extend_from_slice(&marker.redo_start.to_le_bytes());
                bytes.extend_from_slice(&marker.first_active.unwrap_or(NO_LSN).to_le_bytes());
            }
            Self::Trace(message) => bytes.extend_from_slice(message.as_bytes()),
        }
        bytes
    }

    /// Deserialize a payload from bytes.
    ///
    /// `offset` is the position of the enclosing record, used for errors.
    pub fn from_bytes(
        record_type: LogRecordType,
        bytes: &[u8],
        offset: Lsn,
    ) -> Result<Self, WalError> {
        let mut reader = PayloadReader {
            bytes,
            pos: 0,
            offset,
        };

        let payload = match record_type {
            LogRecordType::NodeWrite => {
                let node_id = reader.u64()?;
                let level = reader.u32()?;
                let image_len = reader.u32()? as usize;
                let image = reader.take(image_len)?.to_vec();
                let prior = reader.optional_image()?;
                Self::NodeWrite {
                    node_id,
                    level,
                    image,
                    prior,
                }
            }
            LogRecordType::NodeDelete => {
                let node_id = reader.u64()?;
                let level = reader.u32()?;
                let prior = reader.optional_image()?;
                Self::NodeDelete {
                    node_id,
                    level,
                    prior,
                }
            }
            LogRecordType::Commit => Self::Commit,
            LogRecordType::Abort => Self::Abort,
            LogRecordType::Checkpoint => {
                let root = reader.u64()?;
                let redo_start = reader.u64()?;
                let first_active = reader.u64()?;
                Self::Checkpoint(CheckpointMarker {
                    root: (root != 0).then_some(root),
                    redo_start,
                    first_active: (first_active != NO_LSN).then_some(first_active),
                })
            }
            LogRecordType::Trace => {
                let text = reader.take(bytes.len())?;
                let message = String::from_utf8(text.to_vec()).map_err(|_| {
                    WalError::CorruptRecord {
                        offset,
                        reason: "trace message is not UTF-8",
                    }
                })?;
                Self::Trace(message)
            }
        };

        if reader.pos != bytes.len() {
            return Err(WalError::CorruptRecord {
                offset,
                reason: "trailing payload bytes",
            });
        }
        Ok(payload)
    }
}

fn put_optional_image(bytes: &mut Vec<u8>, image: Option<&[u8]>) {
    match image {
        Some(image) => {
            bytes.push(1);
            bytes.extend_from_slice(&(image.len() as u32).to_le_bytes());
            bytes.extend_from_slice(image);
        }
        None => bytes.push(0),
    }
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    offset: Lsn,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], WalError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(WalError::CorruptRecord {
                offset: self.offset,
                reason: "payload shorter than its fields",
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WalError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn optional_image(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let len = self.u32()? as usize;
                Ok(Some(self.take(len)?.to_vec()))
            }
            _ => Err(WalError::CorruptRecord {
                offset: self.offset,
                reason: "invalid prior image flag",
            }),
        }
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log Sequence Number (position in the log).
    pub lsn: Lsn,
    /// Owning transaction, `None` for non-transactional records.
    pub txn_id: Option<TxnId>,
    /// The record payload.
    pub payload: LogRecordPayload,
}

impl LogRecord {
    /// Create a new log record.
    #[must_use]
    pub const fn new(lsn: Lsn, txn_id: Option<TxnId>, payload: LogRecordPayload) -> Self {
        Self {
            lsn,
            txn_id,
            payload,
        }
    }

    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        self.payload.record_type()
    }

    /// True for node writes and node deletes.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self.payload,
            LogRecordPayload::NodeWrite { .. } | LogRecordPayload::NodeDelete { .. }
        )
    }

    /// The node a structural record changes.
    #[must_use]
    pub const fn node_id(&self) -> Option<NodeId> {
        match &self.payload {
            LogRecordPayload::NodeWrite { node_id, .. }
            | LogRecordPayload::NodeDelete { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    /// Serialize this record to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_bytes = self.payload.to_bytes();
        let total_len = RECORD_HEADER_SIZE + payload_bytes.len() + CHECKSUM_SIZE + TRAILER_SIZE;
        let len_bytes = (total_len as u32).to_le_bytes();

        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&len_bytes);
        bytes.push(self.payload.record_type() as u8);
        bytes.extend_from_slice(&self.txn_id.unwrap_or(0).to_le_bytes());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&payload_bytes);

        // CRC32 checksum - computed over everything before it
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&len_bytes);

        bytes
    }

    /// Deserialize the record read from position `offset`.
    ///
    /// `bytes` must be exactly the record, as delimited by its leading length.
    pub fn from_bytes(bytes: &[u8], offset: Lsn) -> Result<Self, WalError> {
        let record_len = bytes.len();
        if record_len < MIN_RECORD_SIZE {
            return Err(WalError::CorruptRecord {
                offset,
                reason: "record shorter than its header",
            });
        }

        let header_len = read_u32(bytes, 0) as usize;
        let trailer_len = read_u32(bytes, record_len - TRAILER_SIZE) as usize;
        if header_len != record_len || trailer_len != record_len {
            return Err(WalError::CorruptRecord {
                offset,
                reason: "record length does not match its trailer",
            });
        }

        let checksum_at = record_len - TRAILER_SIZE - CHECKSUM_SIZE;
        let expected = read_u32(bytes, checksum_at);
        let actual = crc32fast::hash(&bytes[..checksum_at]);
        if expected != actual {
            return Err(WalError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }

        let record_type = LogRecordType::try_from(bytes[4])
            .map_err(|value| WalError::InvalidRecordType { offset, value })?;
        let txn_id = read_u64(bytes, 5);
        let lsn = read_u64(bytes, 13);
        if lsn != offset {
            return Err(WalError::LsnMismatch {
                offset,
                stored: lsn,
            });
        }

        let payload =
            LogRecordPayload::from_bytes(record_type, &bytes[RECORD_HEADER_SIZE..checksum_at], lsn)?;

        Ok(Self {
            lsn,
            txn_id: (txn_id != 0).then_some(txn_id),
            payload,
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Write-Ahead Log manager over any seekable byte stream.
pub struct Wal<'a, F: Read + Write + Seek> {
    /// The underlying file handle.
    file: &'a mut F,
    /// Current end of the log; the position of the next record.
    end: Lsn,
}

impl<'a, F: Read + Write + Seek> Wal<'a, F> {
    /// Open the log, positioning the writer at the current end.
    pub fn open(file: &'a mut F) -> Result<Self, WalError> {
        let end = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, end })
    }

    /// Position the next record will be written at.
    #[must_use]
    pub const fn end(&self) -> Lsn {
        self.end
    }

    /// Check if the log is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Append a log record.
    ///
    /// Returns the LSN assigned to this record.
    pub fn append(
        &mut self,
        txn_id: Option<TxnId>,
        payload: LogRecordPayload,
    ) -> Result<Lsn, WalError> {
        if txn_id == Some(0) {
            return Err(WalError::ReservedTxnId);
        }

        let lsn = self.end;
        let bytes = LogRecord::new(lsn, txn_id, payload).to_bytes();
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }

        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(&bytes)?;
        self.end += bytes.len() as u64;
        Ok(lsn)
    }

    /// Flush buffered log bytes.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        Ok(())
    }

    /// Read the record at position `lsn`.
    pub fn read_at(&mut self, lsn: Lsn) -> Result<LogRecord, WalError> {
        read_record(self.file, lsn, self.end).map(|(record, _)| record)
    }

    /// Records at positions `>= from`, oldest first.
    pub fn forward(&mut self, from: Lsn) -> ForwardRecords<'_, F> {
        ForwardRecords {
            file: &mut *self.file,
            next: from,
            end: self.end,
            done: false,
        }
    }

    /// Records ending at or before `from`, most recent first.
    ///
    /// `from` must be the end of the log or the position of a record.
    pub fn backward(&mut self, from: Lsn) -> BackwardRecords<'_, F> {
        BackwardRecords {
            file: &mut *self.file,
            next_end: from.min(self.end),
            end: self.end,
            done: false,
        }
    }
}

/// Read and validate one record starting at `offset` in a log of `end` bytes.
///
/// Returns the record and its length in bytes.
fn read_record<F: Read + Seek>(
    file: &mut F,
    offset: Lsn,
    end: Lsn,
) -> Result<(LogRecord, u64), WalError> {
    let remaining = end.saturating_sub(offset);
    if remaining < RECORD_HEADER_SIZE as u64 {
        return Err(WalError::CorruptRecord {
            offset,
            reason: "truncated record header",
        });
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let record_len = u32::from_le_bytes(len_buf) as usize;

    if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&record_len) {
        return Err(WalError::CorruptRecord {
            offset,
            reason: "record length out of bounds",
        });
    }
    if record_len as u64 > remaining {
        return Err(WalError::CorruptRecord {
            offset,
            reason: "truncated record",
        });
    }

    let mut record_buf = vec![0u8; record_len];
    record_buf[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut record_buf[4..])?;

    let record = LogRecord::from_bytes(&record_buf, offset)?;
    Ok((record, record_len as u64))
}

/// Lazy forward scan. See [`Wal::forward`].
pub struct ForwardRecords<'w, F> {
    file: &'w mut F,
    next: Lsn,
    end: Lsn,
    done: bool,
}

impl<F: Read + Seek> Iterator for ForwardRecords<'_, F> {
    type Item = Result<LogRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.end {
            return None;
        }

        match read_record(self.file, self.next, self.end) {
            Ok((record, len)) => {
                self.next += len;
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy backward scan. See [`Wal::backward`].
pub struct BackwardRecords<'w, F> {
    file: &'w mut F,
    next_end: Lsn,
    end: Lsn,
    done: bool,
}

impl<F: Read + Seek> BackwardRecords<'_, F> {
    fn read_previous(&mut self) -> Result<LogRecord, WalError> {
        let record_end = self.next_end;
        if record_end < MIN_RECORD_SIZE as u64 {
            return Err(WalError::CorruptRecord {
                offset: record_end,
                reason: "truncated record before this position",
            });
        }

        self.file
            .seek(SeekFrom::Start(record_end - TRAILER_SIZE as u64))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let record_len = u64::from(u32::from_le_bytes(len_buf));

        if record_len < MIN_RECORD_SIZE as u64
            || record_len > MAX_RECORD_SIZE as u64
            || record_len > record_end
        {
            return Err(WalError::CorruptRecord {
                offset: record_end,
                reason: "record trailer out of bounds",
            });
        }

        let start = record_end - record_len;
        let (record, _) = read_record(self.file, start, self.end)?;
        self.next_end = start;
        Ok(record)
    }
}

impl<F: Read + Seek> Iterator for BackwardRecords<'_, F> {
    type Item = Result<LogRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next_end == 0 {
            return None;
        }

        let result = self.read_previous();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug)]
pub enum WalError {
    /// I/O error.
    Io(std::io::Error),
    /// Structurally invalid or truncated record.
    CorruptRecord { offset: Lsn, reason: &'static str },
    /// Invalid record type byte.
    InvalidRecordType { offset: Lsn, value: u8 },
    /// Checksum mismatch.
    ChecksumMismatch {
        offset: Lsn,
        expected: u32,
        actual: u32,
    },
    /// Stored LSN disagrees with the position the record was read from.
    LsnMismatch { offset: Lsn, stored: Lsn },
    /// Record larger than `MAX_RECORD_SIZE`.
    RecordTooLarge(usize),
    /// Transaction id 0 means "no transaction" and cannot be written.
    ReservedTxnId,
}

impl WalError {
    /// Log position of the offending record, if the error concerns one.
    #[must_use]
    pub const fn offset(&self) -> Option<Lsn> {
        match self {
            Self::CorruptRecord { offset, .. }
            | Self::InvalidRecordType { offset, .. }
            | Self::ChecksumMismatch { offset, .. }
            | Self::LsnMismatch { offset, .. } => Some(*offset),
            Self::Io(_) | Self::RecordTooLarge(_) | Self::ReservedTxnId => None,
        }
    }
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "WAL I/O error: {e}"),
            Self::CorruptRecord { offset, reason } => {
                write!(f, "corrupt WAL record at {offset}: {reason}")
            }
            Self::InvalidRecordType { offset, value } => {
                write!(f, "invalid WAL record type at {offset}: 0x{value:02x}")
            }
            Self::ChecksumMismatch {
                offset,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "WAL checksum mismatch at {offset}: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
            Self::LsnMismatch { offset, stored } => {
                write!(f, "WAL record at {offset} claims LSN {stored}")
            }
            Self::RecordTooLarge(size) => {
                write!(
                    f,
                    "WAL record too large: {size} bytes (max {MAX_RECORD_SIZE})"
                )
            }
            Self::ReservedTxnId => write!(f, "transaction id 0 is reserved"),
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
