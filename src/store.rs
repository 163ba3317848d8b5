//! Durable ring-queue storage over a single ordered key-value file.
//!
//! One redb table hosts every record, keyed exactly as the wire-compatible
//! schema prescribes:
//!
//! - `b"@"`: global metadata `{max_queue_size, count}`;
//! - 4-byte little-endian `u32`: per-queue metadata;
//! - `b"@<name>@"`: name record mapping a queue name to its index;
//! - 8-byte little-endian `u64`: one message slot.
//!
//! Each queue owns the slot range `[idx * max_queue_size, (idx + 1) *
//! max_queue_size)` and advances `write_idx`/`read_idx` modulo that range.
//! One slot stays reserved so a full ring is distinguishable from an empty
//! one. `max_queue_size` is frozen when the file is first created.
//!
//! Every mutation happens inside a single write transaction; dropping the
//! transaction without committing rolls everything back, so a crash between
//! the slot write and the metadata write leaves the queue unchanged.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use redb::{Database, Durability, ReadableTable, TableDefinition};

use crate::{Error, Result};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("broker");
const GLOBAL_KEY: &[u8] = b"@";

/// Backing-tree flavor. Kept for configuration compatibility; both map to
/// the same ordered backend and carry identical semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Hash,
    Tree,
}

impl FromStr for DbKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<DbKind> {
        match s {
            "HashDB" => Ok(DbKind::Hash),
            "TreeDB" => Ok(DbKind::Tree),
            other => Err(Error::Config(format!("unknown db_type '{other}'"))),
        }
    }
}

/// Handle to one ring queue inside the store. Plain index, no borrow: the
/// subscription bookkeeping keeps these across reactor ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId(u32);

impl QueueId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Result of a push attempt. `Bounded` and `Full` are flow-control signals,
/// not errors: nothing was written and no transaction was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored { depth: u32 },
    Bounded,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GlobalMeta {
    max_queue_size: u32,
    count: u32,
}

impl GlobalMeta {
    fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.max_queue_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<GlobalMeta> {
        if bytes.len() != 8 {
            return Err(Error::Corrupt("global metadata size mismatch"));
        }
        Ok(GlobalMeta {
            max_queue_size: u32::from_le_bytes(bytes[0..4].try_into().expect("slice length")),
            count: u32::from_le_bytes(bytes[4..8].try_into().expect("slice length")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueMeta {
    pub(crate) write_idx: u64,
    pub(crate) read_idx: u64,
    pub(crate) count: u32,
    pub(crate) start_pos: u64,
    pub(crate) end_pos: u64,
}

impl QueueMeta {
    fn fresh(idx: u32, max_queue_size: u32) -> QueueMeta {
        let start = u64::from(idx) * u64::from(max_queue_size);
        QueueMeta {
            write_idx: start,
            read_idx: start,
            count: 0,
            start_pos: start,
            end_pos: start + u64::from(max_queue_size),
        }
    }

    fn to_bytes(self) -> [u8; 36] {
        let mut buf = [0u8; 36];
        buf[0..8].copy_from_slice(&self.write_idx.to_le_bytes());
        buf[8..16].copy_from_slice(&self.read_idx.to_le_bytes());
        buf[16..20].copy_from_slice(&self.count.to_le_bytes());
        buf[20..28].copy_from_slice(&self.start_pos.to_le_bytes());
        buf[28..36].copy_from_slice(&self.end_pos.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<QueueMeta> {
        if bytes.len() != 36 {
            return Err(Error::Corrupt("queue metadata size mismatch"));
        }
        Ok(QueueMeta {
            write_idx: u64::from_le_bytes(bytes[0..8].try_into().expect("slice length")),
            read_idx: u64::from_le_bytes(bytes[8..16].try_into().expect("slice length")),
            count: u32::from_le_bytes(bytes[16..20].try_into().expect("slice length")),
            start_pos: u64::from_le_bytes(bytes[20..28].try_into().expect("slice length")),
            end_pos: u64::from_le_bytes(bytes[28..36].try_into().expect("slice length")),
        })
    }
}

fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 2);
    key.push(b'@');
    key.extend_from_slice(name.as_bytes());
    key.push(b'@');
    key
}

/// The durable store: one file, many named ring queues.
pub struct Store {
    db: Database,
    path: PathBuf,
    kind: DbKind,
    sync: bool,
}

impl Store {
    /// Opens or creates the store file. On creation the global metadata is
    /// written with the given capacity; on reopen the stored capacity wins
    /// and `max_queue_size` is ignored. `sync` requests fsync-grade commits.
    pub fn open(
        path: impl AsRef<Path>,
        kind: DbKind,
        max_queue_size: u32,
        sync: bool,
    ) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;
        let store = Store {
            db,
            path,
            kind,
            sync,
        };

        let txn = store.begin()?;
        {
            let mut table = txn.open_table(TABLE)?;
            let missing = table.get(GLOBAL_KEY)?.is_none();
            if missing {
                let gmeta = GlobalMeta {
                    max_queue_size,
                    count: 0,
                };
                table.insert(GLOBAL_KEY, gmeta.to_bytes().as_slice())?;
            }
        }
        txn.commit()?;

        Ok(store)
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The frozen per-queue capacity (one slot of which stays reserved).
    pub fn max_queue_size(&self) -> Result<u32> {
        Ok(self.global()?.max_queue_size)
    }

    /// Number of named queues ever created in this file.
    pub fn count(&self) -> Result<u32> {
        Ok(self.global()?.count)
    }

    /// Finds the queue registered under `name`, creating it if absent. The
    /// index allocation, queue metadata and name record are committed in one
    /// transaction.
    pub fn queue_by_name(&self, name: &str) -> Result<QueueId> {
        let key = name_key(name);
        if let Some(idx) = self.read_name(&key)? {
            return Ok(QueueId(idx));
        }

        let txn = self.begin()?;
        let idx;
        {
            let mut table = txn.open_table(TABLE)?;
            // Re-check under the write transaction before allocating.
            let existing = match table.get(key.as_slice())? {
                Some(guard) => Some(decode_index(guard.value())?),
                None => None,
            };
            if let Some(found) = existing {
                return Ok(QueueId(found));
            }

            let mut gmeta = read_global_from(&table)?;
            idx = gmeta.count;
            gmeta.count += 1;
            let meta = QueueMeta::fresh(idx, gmeta.max_queue_size);
            table.insert(idx.to_le_bytes().as_slice(), meta.to_bytes().as_slice())?;
            table.insert(GLOBAL_KEY, gmeta.to_bytes().as_slice())?;
            table.insert(key.as_slice(), idx.to_le_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(QueueId(idx))
    }

    /// Addresses a queue directly by index, creating its metadata if absent.
    /// Used for per-session private queues whose index is the session id; no
    /// name record is written and the global count is untouched.
    pub fn queue_by_index(&self, idx: u32) -> Result<QueueId> {
        if self.read_meta(idx)?.is_some() {
            return Ok(QueueId(idx));
        }

        let txn = self.begin()?;
        {
            let mut table = txn.open_table(TABLE)?;
            if table.get(idx.to_le_bytes().as_slice())?.is_none() {
                let gmeta = read_global_from(&table)?;
                let meta = QueueMeta::fresh(idx, gmeta.max_queue_size);
                table.insert(idx.to_le_bytes().as_slice(), meta.to_bytes().as_slice())?;
            }
        }
        txn.commit()?;
        Ok(QueueId(idx))
    }

    /// Looks a name up without creating anything.
    pub fn lookup(&self, name: &str) -> Result<Option<QueueId>> {
        Ok(self.read_name(&name_key(name))?.map(QueueId))
    }

    /// Appends `value` at the queue's write position. `max_num` is a
    /// client-supplied ceiling checked before the ring's own capacity.
    pub fn push_front(
        &self,
        queue: QueueId,
        value: &[u8],
        max_num: Option<u32>,
    ) -> Result<PushOutcome> {
        let txn = self.begin()?;
        let outcome;
        {
            let mut table = txn.open_table(TABLE)?;
            let mut meta = read_meta_from(&table, queue.0)?;

            if let Some(limit) = max_num {
                if meta.count >= limit {
                    return Ok(PushOutcome::Bounded);
                }
            }

            let slot = meta.write_idx;
            meta.write_idx += 1;
            if meta.write_idx == meta.read_idx
                || (meta.read_idx == meta.start_pos && meta.write_idx == meta.end_pos)
            {
                return Ok(PushOutcome::Full);
            }
            if meta.write_idx == meta.end_pos {
                meta.write_idx = meta.start_pos;
            }
            meta.count += 1;

            table.insert(slot.to_le_bytes().as_slice(), value)?;
            table.insert(queue.0.to_le_bytes().as_slice(), meta.to_bytes().as_slice())?;
            outcome = PushOutcome::Stored { depth: meta.count };
        }
        txn.commit()?;
        Ok(outcome)
    }

    /// Removes and returns the oldest message, or `None` when the queue is
    /// empty. The slot removal and metadata update commit together.
    pub fn pop_back(&self, queue: QueueId) -> Result<Option<Vec<u8>>> {
        let txn = self.begin()?;
        let value;
        {
            let mut table = txn.open_table(TABLE)?;
            let mut meta = read_meta_from(&table, queue.0)?;

            if meta.read_idx == meta.end_pos {
                meta.read_idx = meta.start_pos;
            }
            if meta.read_idx == meta.write_idx {
                return Ok(None);
            }

            let slot = meta.read_idx;
            meta.read_idx += 1;
            meta.count = meta.count.saturating_sub(1);

            value = table
                .remove(slot.to_le_bytes().as_slice())?
                .map(|guard| guard.value().to_vec())
                .unwrap_or_default();
            table.insert(queue.0.to_le_bytes().as_slice(), meta.to_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(Some(value))
    }

    /// Current number of messages in the queue (0 for unknown indices).
    pub fn size(&self, queue: QueueId) -> Result<u32> {
        Ok(self.read_meta(queue.0)?.map(|meta| meta.count).unwrap_or(0))
    }

    /// Resets the queue to empty without touching stored slots.
    pub fn clear(&self, queue: QueueId) -> Result<()> {
        let txn = self.begin()?;
        {
            let mut table = txn.open_table(TABLE)?;
            let mut meta = read_meta_from(&table, queue.0)?;
            meta.write_idx = meta.start_pos;
            meta.read_idx = meta.start_pos;
            meta.count = 0;
            table.insert(queue.0.to_le_bytes().as_slice(), meta.to_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Emits every registered queue name, newline-terminated, in key order.
    pub fn list<W: Write>(&self, writer: &mut W) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        for entry in table.iter()? {
            let (key, _) = entry?;
            let key = key.value();
            if key.len() > 2 && key[0] == b'@' && key[key.len() - 1] == b'@' {
                writer.write_all(&key[1..key.len() - 1])?;
                writer.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    /// Flushes and closes the store, optionally deleting the backing file.
    pub fn close(self, remove: bool) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if remove {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub(crate) fn meta(&self, queue: QueueId) -> Result<QueueMeta> {
        self.read_meta(queue.0)?
            .ok_or(Error::Corrupt("queue metadata missing"))
    }

    fn begin(&self) -> Result<redb::WriteTransaction> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(if self.sync {
            Durability::Immediate
        } else {
            Durability::Eventual
        });
        Ok(txn)
    }

    fn global(&self) -> Result<GlobalMeta> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let gmeta = match table.get(GLOBAL_KEY)? {
            Some(guard) => GlobalMeta::from_bytes(guard.value())?,
            None => return Err(Error::Corrupt("missing global metadata")),
        };
        Ok(gmeta)
    }

    fn read_name(&self, key: &[u8]) -> Result<Option<u32>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let idx = match table.get(key)? {
            Some(guard) => Some(decode_index(guard.value())?),
            None => None,
        };
        Ok(idx)
    }

    fn read_meta(&self, idx: u32) -> Result<Option<QueueMeta>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let meta = match table.get(idx.to_le_bytes().as_slice())? {
            Some(guard) => Some(QueueMeta::from_bytes(guard.value())?),
            None => None,
        };
        Ok(meta)
    }
}

fn decode_index(bytes: &[u8]) -> Result<u32> {
    if bytes.len() != 4 {
        return Err(Error::Corrupt("queue index size mismatch"));
    }
    Ok(u32::from_le_bytes(bytes.try_into().expect("slice length")))
}

fn read_global_from(table: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<GlobalMeta> {
    match table.get(GLOBAL_KEY)? {
        Some(guard) => GlobalMeta::from_bytes(guard.value()),
        None => Err(Error::Corrupt("missing global metadata")),
    }
}

fn read_meta_from(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    idx: u32,
) -> Result<QueueMeta> {
    match table.get(idx.to_le_bytes().as_slice())? {
        Some(guard) => QueueMeta::from_bytes(guard.value()),
        None => Err(Error::Corrupt("queue metadata missing")),
    }
}
