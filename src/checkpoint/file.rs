//! File-backed cursor store.
//!
//! One file per checkpoint key, named by the SHA-256 of the key. Layout:
//!
//! ```text
//! magic "CUR\0" | version u8 | len u32 LE | msgpack(CheckpointFile) | crc32 u32 LE
//! ```
//!
//! Writes go to a temp file that is fsynced and renamed over the old one,
//! so a crash leaves either the previous cursor or the new one.

use super::CursorStore;
use crate::error::{FeedError, Result};
use crate::types::{CheckpointKey, ResumeCursor, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Magic bytes for cursor files.
const CURSOR_MAGIC: &[u8; 4] = b"CUR\0";

/// Current cursor file format version.
const CURSOR_VERSION: u8 = 1;

/// Magic, version and body length.
const HEADER_LEN: usize = 4 + 1 + 4;

/// Cursor tokens are small; anything bigger is corruption.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    key: CheckpointKey,
    cursor: ResumeCursor,
    saved_at: Timestamp,
}

/// Cursor store in a directory on disk.
///
/// Holds an exclusive lock on the directory for its lifetime so two
/// consumer processes never race on the same cursors.
pub struct FileCursorStore {
    dir: PathBuf,
    /// Lock file for exclusive access.
    _lock_file: File,
}

impl FileCursorStore {
    /// Open (creating if needed) a cursor directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;
        Ok(Self {
            dir,
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }

    fn file_for(&self, key: &CheckpointKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.consumer.as_bytes());
        let name = hex::encode(hasher.finalize());
        self.dir.join(format!("{}.cursor", name))
    }

    fn encode(key: &CheckpointKey, cursor: &ResumeCursor) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec(&CheckpointFile {
            key: key.clone(),
            cursor: cursor.clone(),
            saved_at: Timestamp::now(),
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 4);
        out.extend_from_slice(CURSOR_MAGIC);
        out.push(CURSOR_VERSION);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<CheckpointFile> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(FeedError::Corruption(format!(
                "cursor file truncated: {} bytes",
                bytes.len()
            )));
        }
        let (header, reader) = bytes.split_at(HEADER_LEN);

        if &header[..4] != CURSOR_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid cursor file magic".into()));
        }

        let version = header[4];
        if version != CURSOR_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported cursor file version: {}",
                version
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[5..9]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BODY_BYTES || reader.len() != len + 4 {
            return Err(FeedError::Corruption("cursor file length mismatch".into()));
        }

        let (body, checksum_bytes) = reader.split_at(len);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(checksum_bytes);
        let expected = u32::from_le_bytes(stored);
        let got = crc32fast::hash(body);
        if expected != got {
            return Err(FeedError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(body)?)
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<ResumeCursor>> {
        let path = self.file_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file = Self::decode(&bytes)?;
        if &file.key != key {
            return Err(FeedError::Corruption(format!(
                "cursor file for {} holds key {}",
                key, file.key
            )));
        }
        Ok(Some(file.cursor))
    }

    fn save(&self, key: &CheckpointKey, cursor: &ResumeCursor) -> Result<()> {
        let path = self.file_for(key);
        let tmp = path.with_extension("cursor.tmp");
        let bytes = Self::encode(key, cursor)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        // Make the rename itself durable.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        trace!(key = %key, cursor = %cursor, "cursor saved");
        Ok(())
    }

    fn clear(&self, key: &CheckpointKey) -> Result<()> {
        match fs::remove_file(self.file_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
