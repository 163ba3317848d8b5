//! Chunked blob storage backing the PUT/GET verbs.
//!
//! Blobs live as flat files named `<identity>-<seq-id>.blob` under the
//! spool directory. Chunks are written at a caller-supplied offset and read
//! back the same way, which makes large transfers resumable: the client
//! re-sends only the ranges it has not had acknowledged.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAX_CHUNK: usize = 1024 * 1024;
pub const MAX_BLOB: u64 = 1024 * 1024 * 1024;
pub const MAX_KEY_LEN: usize = 64;

/// Accepts identity / seq-id values usable as a file-name fragment: present,
/// shorter than 64 bytes, no path separators.
pub fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() < MAX_KEY_LEN && !key.contains(['/', '\\'])
}

pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl AsRef<Path>) -> BlobStore {
        BlobStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn file_name(identity: &str, seq_id: &str) -> String {
        format!("{identity}-{seq_id}.blob")
    }

    /// Writes `data` at `offset`, creating the file if needed, and returns
    /// the file's total length afterwards.
    pub fn put(
        &self,
        identity: &str,
        seq_id: &str,
        offset: u64,
        data: &[u8],
    ) -> std::io::Result<u64> {
        let path = self.dir.join(Self::file_name(identity, seq_id));
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.seek(SeekFrom::End(0))
    }

    /// Reads up to `length` bytes at `offset` and reports the file's total
    /// length. A short or empty read past the end is not an error.
    pub fn get(
        &self,
        identity: &str,
        seq_id: &str,
        offset: u64,
        length: usize,
    ) -> std::io::Result<(Vec<u8>, u64)> {
        let path = self.dir.join(Self::file_name(identity, seq_id));
        let mut file = OpenOptions::new().read(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut data = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);

        let total = file.seek(SeekFrom::End(0))?;
        Ok((data, total))
    }
}
