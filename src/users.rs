//! Credential table: a text source file mirrored into a throwaway
//! key-value cache for random lookup.
//!
//! Source format, one user per line, `#` starts a comment:
//!
//! ```text
//! name:<alg>:<hash_hex>:<salt>:<role>
//! ```
//!
//! `alg` is `md5` or `sha256` (case-insensitive); the stored hash is
//! `alg(passcode ∥ salt)` in hex. The cache file is recreated on every
//! open and deleted on close, so a SIGHUP reload is just close + open.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;
use md5::Md5;
use redb::{Database, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};

use crate::Result;

const TABLE: TableDefinition<&str, &str> = TableDefinition::new("users");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlg {
    Md5,
    Sha256,
}

/// One parsed credential record.
#[derive(Debug, Clone)]
pub struct User {
    alg: HashAlg,
    passcode_hash: String,
    salt: String,
    role: String,
}

impl User {
    /// Checks `alg(passcode ∥ salt)` against the stored hex digest,
    /// case-insensitively.
    pub fn validate(&self, passcode: &str) -> bool {
        let digest = match self.alg {
            HashAlg::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(passcode.as_bytes());
                hasher.update(self.salt.as_bytes());
                hex::encode(hasher.finalize())
            }
            HashAlg::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(passcode.as_bytes());
                hasher.update(self.salt.as_bytes());
                hex::encode(hasher.finalize())
            }
        };
        self.passcode_hash.len() == digest.len()
            && self.passcode_hash.eq_ignore_ascii_case(&digest)
    }

    /// Role tag, interpreted by the dispatcher.
    pub fn role(&self) -> &str {
        &self.role
    }
}

/// The user directory. Lookups hit the cache database only; the source file
/// is read once per (re)open.
pub struct UserDirectory {
    source: PathBuf,
    cache: PathBuf,
    db: Option<Database>,
}

impl UserDirectory {
    /// Builds a fresh cache from the source file. A missing source file
    /// yields an empty directory, not an error.
    pub fn open(source: impl AsRef<Path>, cache: impl AsRef<Path>) -> Result<UserDirectory> {
        let mut dir = UserDirectory {
            source: source.as_ref().to_path_buf(),
            cache: cache.as_ref().to_path_buf(),
            db: None,
        };
        dir.reload()?;
        Ok(dir)
    }

    /// Discards the cache and re-parses the source file.
    pub fn reload(&mut self) -> Result<()> {
        self.db = None;
        let _ = std::fs::remove_file(&self.cache);

        let db = Database::create(&self.cache)?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            if let Ok(file) = File::open(&self.source) {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    let line = match line.find('#') {
                        Some(pos) => &line[..pos],
                        None => line.as_str(),
                    };
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(colon) = line.find(':') {
                        table.insert(&line[..colon], &line[colon + 1..])?;
                    }
                }
            } else {
                debug!("user source '{}' absent, empty directory", self.source.display());
            }
        }
        txn.commit()?;

        self.db = Some(db);
        Ok(())
    }

    /// Looks a login name up. Records with an unknown algorithm or missing
    /// fields are treated as not found.
    pub fn get(&self, name: &str) -> Result<Option<User>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        let txn = db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let value = match table.get(name)? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };

        let mut parts = value.splitn(4, ':');
        let (Some(alg), Some(hash), Some(salt), Some(role)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Ok(None);
        };

        let alg = match alg.to_ascii_lowercase().as_str() {
            "md5" => HashAlg::Md5,
            "sha256" => HashAlg::Sha256,
            _ => return Ok(None),
        };

        Ok(Some(User {
            alg,
            passcode_hash: hash.to_string(),
            salt: salt.to_string(),
            role: role.to_string(),
        }))
    }

    /// Drops the cache database and removes its file.
    pub fn close(mut self) {
        self.db = None;
        let _ = std::fs::remove_file(&self.cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_source(dir: &tempfile::TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("users");
        let mut file = File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    fn md5_line(name: &str, passcode: &str, salt: &str, role: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(passcode.as_bytes());
        hasher.update(salt.as_bytes());
        format!("{name}:md5:{}:{salt}:{role}", hex::encode(hasher.finalize()))
    }

    #[test]
    fn validates_md5_and_sha256() {
        let dir = tempdir().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(b"pw2");
        hasher.update(b"pepper");
        let sha_hex = hex::encode(hasher.finalize()).to_uppercase();

        let source = write_source(
            &dir,
            &format!(
                "{}\nbob:SHA256:{sha_hex}:pepper:admin\n",
                md5_line("alice", "secret", "salt", "all")
            ),
        );
        let users = UserDirectory::open(&source, dir.path().join("users.db")).unwrap();

        let alice = users.get("alice").unwrap().unwrap();
        assert!(alice.validate("secret"));
        assert!(!alice.validate("wrong"));
        assert_eq!(alice.role(), "all");

        // Algorithm tag and stored hex are both case-insensitive.
        let bob = users.get("bob").unwrap().unwrap();
        assert!(bob.validate("pw2"));
        assert_eq!(bob.role(), "admin");
    }

    #[test]
    fn comments_blanks_and_bad_records() {
        let dir = tempdir().unwrap();
        let source = write_source(
            &dir,
            "# full comment line\n\n\
             trailing:md5:aa:bb:all # note\n\
             eve:scrypt:aa:bb:all\n\
             truncated:md5:onlyhash\n\
             nocolonatall\n",
        );
        let users = UserDirectory::open(&source, dir.path().join("users.db")).unwrap();

        assert!(users.get("trailing").unwrap().is_some());
        assert!(users.get("eve").unwrap().is_none(), "unknown alg is not found");
        assert!(users.get("truncated").unwrap().is_none());
        assert!(users.get("nocolonatall").unwrap().is_none());
        assert!(users.get("# full comment line").unwrap().is_none());
    }

    #[test]
    fn missing_source_is_empty_directory() {
        let dir = tempdir().unwrap();
        let users =
            UserDirectory::open(dir.path().join("nope"), dir.path().join("users.db")).unwrap();
        assert!(users.get("anyone").unwrap().is_none());
    }

    #[test]
    fn reload_reflects_additions_and_removals() {
        let dir = tempdir().unwrap();
        let source = write_source(&dir, &md5_line("alice", "secret", "s", "all"));
        let cache = dir.path().join("users.db");
        let mut users = UserDirectory::open(&source, &cache).unwrap();
        assert!(users.get("alice").unwrap().is_some());

        std::fs::write(&source, md5_line("carol", "pw", "s", "pull")).unwrap();
        users.reload().unwrap();
        assert!(users.get("alice").unwrap().is_none());
        assert_eq!(users.get("carol").unwrap().unwrap().role(), "pull");
    }

    #[test]
    fn close_removes_cache_file() {
        let dir = tempdir().unwrap();
        let source = write_source(&dir, "");
        let cache = dir.path().join("users.db");
        let users = UserDirectory::open(&source, &cache).unwrap();
        assert!(cache.exists());
        users.close();
        assert!(!cache.exists());
    }
}
