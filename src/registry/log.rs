//! Append-only participant identity log.
//!
//! Framing: a fixed header (magic + format version), then length-prefixed
//! records, each `len u32 | crc32c u32 | payload`. Payloads are serde_json.
//! Every append is flushed and fsynced before the caller proceeds. A
//! truncated tail is treated as an uncommitted append and trimmed; any other
//! decode failure means the log is corrupt.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::RegistryError;
use crate::core::{ItineraryVersion, ParticipantDescription, ParticipantId, RouteId};

const LOG_MAGIC: &[u8; 6] = b"WAYREG";
const LOG_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = LOG_MAGIC.len() + 4;
const RECORD_PREFIX_LEN: usize = 8;

/// Maximum plausible record size; anything larger is treated as corruption
/// rather than an attempted allocation.
const MAX_RECORD_LEN: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LogRecord {
    /// A fresh (owner, name) registration.
    Add {
        id: ParticipantId,
        description: ParticipantDescription,
    },
    /// Re-registration of an existing identity with a new description.
    Update {
        id: ParticipantId,
        description: ParticipantDescription,
    },
    /// High-water marks advanced by an accepted edit.
    Advance {
        id: ParticipantId,
        itinerary_version: ItineraryVersion,
        last_route_id: RouteId,
    },
}

#[derive(Debug)]
pub struct RegistryLog {
    file: File,
    path: PathBuf,
}

impl RegistryLog {
    /// Open (or create) the log at `path` and replay every committed record.
    pub fn open(path: &Path) -> Result<(Self, Vec<LogRecord>), RegistryError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(RegistryError::Unavailable)?;

        let len = file
            .metadata()
            .map_err(RegistryError::Unavailable)?
            .len();

        if len == 0 {
            file.write_all(LOG_MAGIC).map_err(RegistryError::Unavailable)?;
            file.write_all(&LOG_FORMAT_VERSION.to_le_bytes())
                .map_err(RegistryError::Unavailable)?;
            file.sync_data().map_err(RegistryError::Unavailable)?;
            return Ok((
                Self {
                    file,
                    path: path.to_path_buf(),
                },
                Vec::new(),
            ));
        }

        let mut bytes = Vec::with_capacity(len as usize);
        file.rewind().map_err(RegistryError::Unavailable)?;
        file.read_to_end(&mut bytes)
            .map_err(RegistryError::Unavailable)?;

        let (records, committed) = Self::replay(path, &bytes)?;

        if committed < bytes.len() as u64 {
            // Uncommitted tail from an interrupted append; drop it so the
            // next append starts on a record boundary.
            warn!(
                path = %path.display(),
                dropped = bytes.len() as u64 - committed,
                "trimming truncated registry log tail"
            );
            file.set_len(committed).map_err(RegistryError::Unavailable)?;
            file.sync_data().map_err(RegistryError::Unavailable)?;
        }
        file.seek(SeekFrom::End(0)).map_err(RegistryError::Unavailable)?;

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
            },
            records,
        ))
    }

    /// Append one record, fsyncing before returning.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), RegistryError> {
        let payload = serde_json::to_vec(record).map_err(|e| RegistryError::Corrupt {
            path: self.path.clone(),
            reason: format!("failed to encode record: {e}"),
        })?;
        let mut frame = Vec::with_capacity(RECORD_PREFIX_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file
            .write_all(&frame)
            .map_err(RegistryError::Unavailable)?;
        self.file.flush().map_err(RegistryError::Unavailable)?;
        self.file.sync_data().map_err(RegistryError::Unavailable)
    }

    fn replay(path: &Path, bytes: &[u8]) -> Result<(Vec<LogRecord>, u64), RegistryError> {
        let corrupt = |reason: String| RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("log shorter than header".to_string()));
        }
        if &bytes[..LOG_MAGIC.len()] != LOG_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let format = u32::from_le_bytes(
            bytes[LOG_MAGIC.len()..HEADER_LEN]
                .try_into()
                .expect("header slice is 4 bytes"),
        );
        if format != LOG_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {format}")));
        }

        let mut records = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            if offset == bytes.len() {
                break;
            }
            if bytes.len() - offset < RECORD_PREFIX_LEN {
                // Truncated prefix: uncommitted tail.
                break;
            }
            let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
            if len > MAX_RECORD_LEN {
                return Err(corrupt(format!("record length {len} exceeds limit")));
            }
            let start = offset + RECORD_PREFIX_LEN;
            if bytes.len() - start < len {
                // Truncated payload: uncommitted tail.
                break;
            }
            let payload = &bytes[start..start + len];
            if crc32c(payload) != crc {
                return Err(corrupt(format!("crc mismatch at offset {offset}")));
            }
            let record: LogRecord = serde_json::from_slice(payload)
                .map_err(|e| corrupt(format!("undecodable record at offset {offset}: {e}")))?;
            records.push(record);
            offset = start + len;
        }

        Ok((records, offset as u64))
    }
}
