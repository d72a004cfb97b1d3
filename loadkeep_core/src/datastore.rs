//! Transactional metadata store.
//!
//! Metadata (content index, loadouts, disk states) lives in a small
//! versioned key/value table. Every commit appends one transaction of
//! assert/retract facts; reads can be pinned to any earlier transaction.
//!
//! [`FileDatastore`] persists transactions as JSON lines:
//!
//! ```text
//! {"tx":1,"facts":[{"op":"assert","key":"content/<hash>/<container>","value":{..}}]}
//! {"tx":2,"facts":[{"op":"retract","key":"content/<hash>/<container>"}]}
//! ```

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Monotonic transaction id. 0 means "nothing committed yet".
pub type TxId = u64;

/// One change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Fact {
    Assert { key: String, value: Value },
    Retract { key: String },
}

impl Fact {
    pub fn key(&self) -> &str {
        match self {
            Fact::Assert { key, .. } | Fact::Retract { key } => key,
        }
    }
}

/// Facts committed atomically.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    facts: Vec<Fact>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to a raw JSON value.
    pub fn assert(&mut self, key: impl Into<String>, value: Value) {
        self.facts.push(Fact::Assert {
            key: key.into(),
            value,
        });
    }

    /// Set `key` to the JSON encoding of `value`.
    pub fn assert_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.assert(key, value);
        Ok(())
    }

    /// Delete `key`.
    pub fn retract(&mut self, key: impl Into<String>) {
        self.facts.push(Fact::Retract { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }
}

/// Capability interface over the metadata store.
pub trait Datastore: Send + Sync {
    /// Apply all facts of `tx` atomically and return the new transaction id.
    ///
    /// An empty transaction commits nothing and returns the current id.
    fn commit(&self, tx: Transaction) -> Result<TxId>;

    /// Value of `key`, as of transaction `as_of` (latest when `None`).
    fn get(&self, key: &str, as_of: Option<TxId>) -> Result<Option<Value>>;

    /// All live keys starting with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str, as_of: Option<TxId>) -> Result<Vec<(String, Value)>>;

    /// Id of the most recent committed transaction.
    fn latest_tx(&self) -> Result<TxId>;
}

/// Typed helpers over any [`Datastore`].
pub trait DatastoreExt: Datastore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_json_as_of(key, None)
    }

    fn get_json_as_of<T: DeserializeOwned>(
        &self,
        key: &str,
        as_of: Option<TxId>,
    ) -> Result<Option<T>> {
        match self.get(key, as_of)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        self.scan_prefix(prefix, None)?
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::from_value(value)?)))
            .collect()
    }
}

impl<D: Datastore + ?Sized> DatastoreExt for D {}

#[derive(Debug, Clone)]
struct Version {
    tx: TxId,
    value: Option<Value>,
}

/// In-memory versioned table shared by both implementations.
#[derive(Debug, Default)]
struct FactTable {
    latest: TxId,
    keys: BTreeMap<String, Vec<Version>>,
}

impl FactTable {
    fn apply(&mut self, tx: TxId, facts: &[Fact]) {
        for fact in facts {
            let value = match fact {
                Fact::Assert { value, .. } => Some(value.clone()),
                Fact::Retract { .. } => None,
            };
            let versions = self.keys.entry(fact.key().to_string()).or_default();
            // Later facts in one transaction override earlier ones
            if let Some(last) = versions.last_mut()
                && last.tx == tx
            {
                last.value = value;
            } else {
                versions.push(Version { tx, value });
            }
        }
        self.latest = self.latest.max(tx);
    }

    fn resolve(versions: &[Version], as_of: TxId) -> Option<&Value> {
        versions
            .iter()
            .rev()
            .find(|v| v.tx <= as_of)
            .and_then(|v| v.value.as_ref())
    }

    fn get(&self, key: &str, as_of: Option<TxId>) -> Option<Value> {
        let as_of = as_of.unwrap_or(self.latest);
        self.keys
            .get(key)
            .and_then(|versions| Self::resolve(versions, as_of))
            .cloned()
    }

    fn scan(&self, prefix: &str, as_of: Option<TxId>) -> Vec<(String, Value)> {
        let as_of = as_of.unwrap_or(self.latest);
        self.keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, versions)| {
                Self::resolve(versions, as_of).map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }
}

/// Volatile datastore for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    table: RwLock<FactTable>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for MemoryDatastore {
    fn commit(&self, tx: Transaction) -> Result<TxId> {
        let mut table = self.table.write()?;
        if tx.is_empty() {
            return Ok(table.latest);
        }
        let id = table.latest + 1;
        table.apply(id, tx.facts());
        Ok(id)
    }

    fn get(&self, key: &str, as_of: Option<TxId>) -> Result<Option<Value>> {
        Ok(self.table.read()?.get(key, as_of))
    }

    fn scan_prefix(&self, prefix: &str, as_of: Option<TxId>) -> Result<Vec<(String, Value)>> {
        Ok(self.table.read()?.scan(prefix, as_of))
    }

    fn latest_tx(&self) -> Result<TxId> {
        Ok(self.table.read()?.latest)
    }
}

#[derive(Serialize, Deserialize)]
struct LogLine {
    tx: TxId,
    facts: Vec<Fact>,
}

/// Durable datastore backed by an append-only JSON-lines log.
#[derive(Debug)]
pub struct FileDatastore {
    path: PathBuf,
    table: RwLock<FactTable>,
    log: Mutex<File>,
}

impl FileDatastore {
    /// Open or create the log at `path` and replay it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut table = FactTable::default();
        let mut skipped = 0usize;
        {
            let reader = BufReader::new(&log);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogLine>(line) {
                    Ok(entry) if entry.tx > table.latest => table.apply(entry.tx, &entry.facts),
                    Ok(entry) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = index + 1,
                            tx = entry.tx,
                            "skipping out-of-order datastore transaction"
                        );
                        skipped += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = index + 1,
                            error = %err,
                            "skipping unreadable datastore log line"
                        );
                        skipped += 1;
                    }
                }
            }
        }

        // A torn final write leaves no newline; start the next record on a fresh line
        if ends_without_newline(&mut log)? {
            log.write_all(b"\n")?;
            log.sync_data()?;
        }

        tracing::debug!(
            path = %path.display(),
            latest_tx = table.latest,
            keys = table.keys.len(),
            skipped,
            "opened datastore"
        );

        Ok(Self {
            path,
            table: RwLock::new(table),
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_without_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl Datastore for FileDatastore {
    fn commit(&self, tx: Transaction) -> Result<TxId> {
        // The log mutex serializes writers; readers only wait for the table swap
        let mut log = self.log.lock()?;
        let id = self.table.read()?.latest + 1;
        if tx.is_empty() {
            return Ok(id - 1);
        }

        let line = LogLine {
            tx: id,
            facts: tx.facts,
        };
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        log.write_all(&encoded)?;
        log.sync_data()?;

        self.table.write()?.apply(id, &line.facts);
        Ok(id)
    }

    fn get(&self, key: &str, as_of: Option<TxId>) -> Result<Option<Value>> {
        Ok(self.table.read()?.get(key, as_of))
    }

    fn scan_prefix(&self, prefix: &str, as_of: Option<TxId>) -> Result<Vec<(String, Value)>> {
        Ok(self.table.read()?.scan(prefix, as_of))
    }

    fn latest_tx(&self) -> Result<TxId> {
        Ok(self.table.read()?.latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn put(store: &dyn Datastore, key: &str, value: Value) -> TxId {
        let mut tx = Transaction::new();
        tx.assert(key, value);
        store.commit(tx).unwrap()
    }

    #[test]
    fn test_point_in_time_reads() {
        let store = MemoryDatastore::new();
        let t1 = put(&store, "a", json!(1));
        let t2 = put(&store, "a", json!(2));

        let mut tx = Transaction::new();
        tx.retract("a");
        let t3 = store.commit(tx).unwrap();

        assert_eq!(store.get("a", Some(t1)).unwrap(), Some(json!(1)));
        assert_eq!(store.get("a", Some(t2)).unwrap(), Some(json!(2)));
        assert_eq!(store.get("a", Some(t3)).unwrap(), None);
        assert_eq!(store.get("a", None).unwrap(), None);
        assert_eq!(store.get("a", Some(0)).unwrap(), None);
    }

    #[test]
    fn test_empty_transaction_is_noop() {
        let store = MemoryDatastore::new();
        assert_eq!(store.commit(Transaction::new()).unwrap(), 0);
        put(&store, "k", json!("v"));
        assert_eq!(store.commit(Transaction::new()).unwrap(), 1);
        assert_eq!(store.latest_tx().unwrap(), 1);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryDatastore::new();
        let mut tx = Transaction::new();
        tx.assert("content/b", json!(2));
        tx.assert("content/a", json!(1));
        tx.assert("contents", json!(0));
        tx.assert("loadout/x", json!(3));
        store.commit(tx).unwrap();

        let keys: Vec<String> = store
            .scan_prefix("content/", None)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["content/a", "content/b"]);
    }

    #[test]
    fn test_last_fact_in_transaction_wins() {
        let store = MemoryDatastore::new();
        let mut tx = Transaction::new();
        tx.assert("k", json!(1));
        tx.retract("k");
        tx.assert("k", json!(3));
        store.commit(tx).unwrap();
        assert_eq!(store.get("k", None).unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_file_datastore_replays() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta/metadata.log");
        {
            let store = FileDatastore::open(&path).unwrap();
            put(&store, "x", json!({"n": 1}));
            put(&store, "y", json!({"n": 2}));
        }

        let store = FileDatastore::open(&path).unwrap();
        assert_eq!(store.latest_tx().unwrap(), 2);
        #[derive(Deserialize)]
        struct N {
            n: u32,
        }
        let y: N = store.get_json("y").unwrap().unwrap();
        assert_eq!(y.n, 2);
        assert_eq!(store.scan_json::<N>("").unwrap().len(), 2);
    }

    #[test]
    fn test_file_datastore_skips_torn_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metadata.log");
        {
            let store = FileDatastore::open(&path).unwrap();
            put(&store, "kept", json!(true));
        }
        // Simulate a crash in the middle of writing tx 2
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"tx":2,"facts":[{"op":"ass"#).unwrap();
        drop(file);

        let store = FileDatastore::open(&path).unwrap();
        assert_eq!(store.latest_tx().unwrap(), 1);
        assert_eq!(store.get("kept", None).unwrap(), Some(json!(true)));

        // New commits land on their own line and survive another reopen
        put(&store, "after", json!(1));
        drop(store);
        let store = FileDatastore::open(&path).unwrap();
        assert_eq!(store.get("after", None).unwrap(), Some(json!(1)));
        assert_eq!(store.latest_tx().unwrap(), 2);
    }
}
