//! The durability log.
//!
//! The journal is an append-only sequence of frames:
//!
//! ```text
//! | magic "CJNL" (4) | version u16 LE | type u8 | len u32 LE | payload | crc32 u32 LE |
//! ```
//!
//! The payload is canonical CBOR and the CRC covers header and payload. One
//! frame is the unit of atomicity: a commit writes exactly one frame, and a
//! frame torn by a crash is dropped on recovery.

use crate::change::Change;
use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{DeviceId, SequenceNumber};
use bytes::BufMut;
use cachedb_codec::{from_cbor, to_canonical_cbor, CodecError, CodecResult, Decode, Encode, Value};
use cachedb_storage::StorageBackend;

/// Frame magic.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CJNL";
/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Written once when the store is created.
    Identity {
        /// This installation's device id.
        device: DeviceId,
        /// Creation instant, UTC milliseconds.
        created_ms: i64,
    },
    /// Local changes committed together; they hold consecutive sequence
    /// numbers starting at `first_seq`.
    Local {
        /// Sequence number of the first change.
        first_seq: SequenceNumber,
        /// The committed changes.
        changes: Vec<Change>,
    },
    /// Remote changes merged in, with the remote cursor reached.
    RemoteApplied {
        /// The merged changes.
        changes: Vec<Change>,
        /// Remote cursor after these changes.
        remote_cursor: u64,
    },
    /// Sync progress.
    Cursor {
        /// Last local sequence number acknowledged by the remote.
        sent_seq: SequenceNumber,
        /// Last remote cursor applied.
        remote_cursor: u64,
    },
    /// The persisted sync flag.
    Settings {
        /// Whether sync is enabled.
        sync_enabled: bool,
    },
}

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// [`Frame::Identity`].
    Identity = 1,
    /// [`Frame::Local`].
    Local = 2,
    /// [`Frame::RemoteApplied`].
    RemoteApplied = 3,
    /// [`Frame::Cursor`].
    Cursor = 4,
    /// [`Frame::Settings`].
    Settings = 5,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Identity),
            2 => Some(Self::Local),
            3 => Some(Self::RemoteApplied),
            4 => Some(Self::Cursor),
            5 => Some(Self::Settings),
            _ => None,
        }
    }

    /// Lower-case name for logs and the CLI.
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Local => "local",
            Self::RemoteApplied => "remote_applied",
            Self::Cursor => "cursor",
            Self::Settings => "settings",
        }
    }
}

fn uint(n: u64) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn changes_value(changes: &[Change]) -> Value {
    Value::Array(changes.iter().map(Encode::to_value).collect())
}

impl Frame {
    /// Type code of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Identity { .. } => FrameType::Identity,
            Self::Local { .. } => FrameType::Local,
            Self::RemoteApplied { .. } => FrameType::RemoteApplied,
            Self::Cursor { .. } => FrameType::Cursor,
            Self::Settings { .. } => FrameType::Settings,
        }
    }

    fn payload(&self) -> Value {
        match self {
            Self::Identity { device, created_ms } => Value::record([
                ("device", device.to_value()),
                ("created_ms", Value::Integer(*created_ms)),
            ]),
            Self::Local { first_seq, changes } => Value::record([
                ("first_seq", uint(first_seq.get())),
                ("changes", changes_value(changes)),
            ]),
            Self::RemoteApplied {
                changes,
                remote_cursor,
            } => Value::record([
                ("changes", changes_value(changes)),
                ("remote_cursor", uint(*remote_cursor)),
            ]),
            Self::Cursor {
                sent_seq,
                remote_cursor,
            } => Value::record([
                ("sent_seq", uint(sent_seq.get())),
                ("remote_cursor", uint(*remote_cursor)),
            ]),
            Self::Settings { sync_enabled } => {
                Value::record([("sync_enabled", Value::Bool(*sync_enabled))])
            }
        }
    }

    fn from_payload(kind: FrameType, payload: &Value) -> CodecResult<Self> {
        let get = |name: &str| {
            payload
                .get(name)
                .ok_or_else(|| CodecError::shape(format!("{} frame missing {name}", kind.name())))
        };
        let get_u64 = |name: &str| {
            get(name)?
                .as_u64()
                .ok_or_else(|| CodecError::shape(format!("{name} must be an unsigned integer")))
        };
        let get_changes = || -> CodecResult<Vec<Change>> {
            get("changes")?
                .as_array()
                .ok_or_else(|| CodecError::shape("changes must be an array"))?
                .iter()
                .map(Change::from_value)
                .collect()
        };
        Ok(match kind {
            FrameType::Identity => Self::Identity {
                device: DeviceId::from_value(get("device")?)?,
                created_ms: get("created_ms")?
                    .as_integer()
                    .ok_or_else(|| CodecError::shape("created_ms must be an integer"))?,
            },
            FrameType::Local => Self::Local {
                first_seq: SequenceNumber::new(get_u64("first_seq")?),
                changes: get_changes()?,
            },
            FrameType::RemoteApplied => Self::RemoteApplied {
                changes: get_changes()?,
                remote_cursor: get_u64("remote_cursor")?,
            },
            FrameType::Cursor => Self::Cursor {
                sent_seq: SequenceNumber::new(get_u64("sent_seq")?),
                remote_cursor: get_u64("remote_cursor")?,
            },
            FrameType::Settings => Self::Settings {
                sync_enabled: get("sync_enabled")?
                    .as_bool()
                    .ok_or_else(|| CodecError::shape("sync_enabled must be a bool"))?,
            },
        })
    }

    /// The full framed bytes.
    ///
    /// # Errors
    ///
    /// Fails if the payload exceeds 4 GiB.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let payload = to_canonical_cbor(&self.payload());
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::validation("journal frame payload too large"))?;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.put_slice(&JOURNAL_MAGIC);
        data.put_u16_le(JOURNAL_VERSION);
        data.put_u8(self.frame_type() as u8);
        data.put_u32_le(len);
        data.put_slice(&payload);
        let crc = crc32(&data);
        data.put_u32_le(crc);
        Ok(data)
    }
}

/// A frame read back with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Total framed length.
    pub len: u64,
    /// The decoded frame.
    pub frame: Frame,
}

/// Result of scanning the journal.
#[derive(Debug, Default)]
pub struct Scan {
    /// Intact frames, in order.
    pub entries: Vec<JournalEntry>,
    /// Offset where a torn trailing frame starts, if there is one.
    pub torn_at: Option<u64>,
}

/// Append-only frame log over a [`StorageBackend`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Wraps `backend`. With `sync_on_commit`, every append is fsynced
    /// rather than flushed.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            sync_on_commit,
        }
    }

    /// Appends and makes durable one frame. Returns its offset.
    ///
    /// A failed append may leave a partial frame behind; the caller
    /// truncates back to [`Journal::size`] as read before the append.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub fn append(&mut self, frame: &Frame) -> CoreResult<u64> {
        let data = frame.to_bytes()?;
        let offset = self.backend.append(&data)?;
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Current length in bytes.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Drops everything from `size` on.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub fn truncate(&mut self, size: u64) -> CoreResult<()> {
        self.backend.truncate(size)?;
        Ok(())
    }

    /// Reads every frame.
    ///
    /// A trailing frame that is incomplete, or complete but failing its
    /// CRC, is reported through [`Scan::torn_at`]. Damage anywhere else
    /// means the log cannot be trusted.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` for bad magic, an unknown version or frame type, a
    /// CRC mismatch before the tail, or an undecodable payload.
    pub fn scan(&self) -> CoreResult<Scan> {
        let size = self.backend.size()?;
        let mut scan = Scan::default();
        let mut offset = 0u64;
        while offset < size {
            let remaining = size - offset;
            if remaining < HEADER_SIZE as u64 {
                scan.torn_at = Some(offset);
                break;
            }
            let header = self.backend.read_at(offset, HEADER_SIZE)?;
            if header[..4] != JOURNAL_MAGIC {
                return Err(CoreError::unavailable(format!("bad frame magic at offset {offset}")));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != JOURNAL_VERSION {
                return Err(CoreError::unavailable(format!(
                    "unsupported journal version {version} at offset {offset}"
                )));
            }
            let kind = FrameType::from_byte(header[6]).ok_or_else(|| {
                CoreError::unavailable(format!("unknown frame type {} at offset {offset}", header[6]))
            })?;
            let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
            let frame_len = (HEADER_SIZE + CRC_SIZE) as u64 + u64::from(payload_len);
            if remaining < frame_len {
                scan.torn_at = Some(offset);
                break;
            }
            let body = self.backend.read_at(offset, frame_len as usize)?;
            let (covered, stored) = body.split_at(body.len() - CRC_SIZE);
            let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
            if crc32(covered) != stored {
                if offset + frame_len == size {
                    scan.torn_at = Some(offset);
                    break;
                }
                return Err(CoreError::unavailable(format!(
                    "checksum mismatch in frame at offset {offset}"
                )));
            }
            let frame = from_cbor(&covered[HEADER_SIZE..])
                .and_then(|payload| Frame::from_payload(kind, &payload))
                .map_err(|e| {
                    CoreError::unavailable(format!("undecodable frame at offset {offset}: {e}"))
                })?;
            scan.entries.push(JournalEntry {
                offset,
                len: frame_len,
                frame,
            });
            offset += frame_len;
        }
        Ok(scan)
    }
}
