//! Append-only block body files.
//!
//! Each record is `magic + length + raw block` inside `blkNNNNN.dat`. The
//! append is the single durability boundary of block acceptance: everything
//! else in the database is derived from the bodies and rebuildable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::available_space;

/// Minimum free disk space required before another block is appended.
const FREE_SPACE_FLOOR: u64 = 50 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    OutOfDiskSpace,
    InvalidLocation,
    BadRecordMagic,
    LengthMismatch,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::OutOfDiskSpace => write!(f, "free disk space below floor"),
            FlatFileError::InvalidLocation => write!(f, "invalid block file location"),
            FlatFileError::BadRecordMagic => write!(f, "block record magic mismatch"),
            FlatFileError::LengthMismatch => write!(f, "block record length mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct BlockFileStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<CursorState>,
}

#[derive(Debug)]
struct CursorState {
    current_file: u32,
    current_len: u64,
}

impl BlockFileStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, max_file_size)?;
        Ok(Self {
            dir,
            magic,
            max_file_size,
            state: Mutex::new(CursorState {
                current_file,
                current_len,
            }),
        })
    }

    /// Where the next append would land, for the durable cursor in `Meta`.
    pub fn cursor(&self) -> (u32, u64) {
        let state = self.state.lock().expect("block file lock");
        (state.current_file, state.current_len)
    }

    /// Fails before touching the file when the disk is close to full, so a
    /// rejected append never leaves a torn record behind.
    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut state = self.state.lock().expect("block file lock");
        let needed = 8u64 + bytes.len() as u64;
        if available_space(&self.dir)? < FREE_SPACE_FLOOR + needed {
            return Err(FlatFileError::OutOfDiskSpace);
        }
        if state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = bytes.len() as u32;
        file.write_all(&self.magic)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let path = self.file_path(location.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix)?;
        if prefix[0..4] != self.magic {
            return Err(FlatFileError::BadRecordMagic);
        }
        let stored_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("blk{file_id:05}.dat"))
    }

    fn locate_active_file(dir: &Path, max_file_size: u64) -> Result<(u32, u64), FlatFileError> {
        let mut file_id = 0u32;
        let mut last_existing: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("blk{file_id:05}.dat"));
            if !path.exists() {
                break;
            }
            let len = std::fs::metadata(&path)?.len();
            last_existing = Some((file_id, len));
            file_id += 1;
        }
        match last_existing {
            Some((last_id, len)) if len >= max_file_size => Ok((last_id + 1, 0)),
            Some((last_id, len)) => Ok((last_id, len)),
            None => Ok((0, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xd4, 0xa1, 0x7e, 0x62];

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlockFileStore::open(dir.path(), MAGIC, 1024 * 1024).expect("open");
        let first = store.append(b"first block body").expect("append");
        let second = store.append(b"second").expect("append");
        assert_eq!(first.file_id, second.file_id);
        assert!(second.offset > first.offset);
        assert_eq!(store.read(first).expect("read"), b"first block body");
        assert_eq!(store.read(second).expect("read"), b"second");
    }

    #[test]
    fn rolls_to_next_file_at_size_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlockFileStore::open(dir.path(), MAGIC, 64).expect("open");
        let mut last_file = 0;
        for _ in 0..4 {
            let location = store.append(&[0xab; 40]).expect("append");
            last_file = location.file_id;
        }
        assert!(last_file > 0);
    }

    #[test]
    fn reopen_resumes_at_the_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = {
            let store = BlockFileStore::open(dir.path(), MAGIC, 1024).expect("open");
            store.append(b"persisted").expect("append")
        };
        let store = BlockFileStore::open(dir.path(), MAGIC, 1024).expect("reopen");
        assert_eq!(store.read(location).expect("read"), b"persisted");
        let next = store.append(b"more").expect("append");
        assert!(next.offset > location.offset);
    }

    #[test]
    fn corrupt_magic_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlockFileStore::open(dir.path(), MAGIC, 1024).expect("open");
        let location = store.append(b"body").expect("append");
        let wrong = BlockFileStore::open(dir.path(), [0; 4], 1024).expect("open");
        assert!(matches!(
            wrong.read(location),
            Err(FlatFileError::BadRecordMagic)
        ));
    }
}
