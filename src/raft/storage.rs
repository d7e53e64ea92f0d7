//! `openraft` v1 `RaftStorage` implementation backed by `sled` (§4.9
//! Storage — this is the BoltDB analogue of the original fabric design).
//! Bridged into the v2 `(RaftLogStorage, RaftStateMachine)` split via
//! `openraft::storage::Adaptor::new(store)`, exactly as the gossip-discovery
//! cluster this module grew out of.

use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{FabricCommand, FabricResponse, NodeId, Node, TypeConfig};

const TREE_LOG: &str = "raft_log";
const TREE_META: &str = "raft_meta";
const TREE_STATE: &str = "raft_state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_COMMITTED: &[u8] = b"committed";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";
const KEY_KV_PREFIX: &str = "kv:";

fn io_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageIOError::write(&e).into()
}

fn idx_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Persistent Raft log + state machine in a single `sled::Db`. Log entries
/// live in `raft_log` keyed by big-endian index (so range scans stay
/// ordered); vote/membership/applied-index bookkeeping lives in `raft_meta`;
/// the applied key/value state machine lives in `raft_state`.
pub struct SledStorage {
    log: sled::Tree,
    meta: sled::Tree,
    state: sled::Tree,
    snapshot: Option<Snapshot<TypeConfig>>,
    config_tx: watch::Sender<Option<String>>,
}

impl SledStorage {
    pub fn open(data_dir: &std::path::Path) -> anyhow::Result<(Self, watch::Receiver<Option<String>>)> {
        let db = sled::open(data_dir)?;
        let log = db.open_tree(TREE_LOG)?;
        let meta = db.open_tree(TREE_META)?;
        let state = db.open_tree(TREE_STATE)?;
        let (config_tx, config_rx) = watch::channel(None);
        Ok((Self { log, meta, state, snapshot: None, config_tx }, config_rx))
    }

    fn read_meta<T: for<'de> Deserialize<'de>>(&self, key: &[u8]) -> Result<Option<T>, StorageError<NodeId>> {
        match self.meta.get(key).map_err(io_err)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| io_err_ser(e)),
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value).map_err(io_err_ser)?;
        self.meta.insert(key, bytes).map_err(io_err)?;
        Ok(())
    }
}

fn io_err_ser(e: serde_json::Error) -> StorageError<NodeId> {
    StorageIOError::read(&e).into()
}

impl RaftLogReader<TypeConfig> for SledStorage {
    async fn try_get_log_entries<RB>(&mut self, range: RB) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        read_log_range(&self.log, range)
    }
}

fn read_log_range<RB>(tree: &sled::Tree, range: RB) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
where
    RB: RangeBounds<u64>,
{
    let start = match range.start_bound() {
        std::ops::Bound::Included(i) => idx_key(*i).to_vec(),
        std::ops::Bound::Excluded(i) => idx_key(i + 1).to_vec(),
        std::ops::Bound::Unbounded => idx_key(0).to_vec(),
    };
    let mut out = Vec::new();
    for item in tree.range(start..) {
        let (k, v) = item.map_err(io_err)?;
        let idx = u64::from_be_bytes(k.as_ref().try_into().unwrap_or_default());
        if !range.contains(&idx) {
            if matches!(range.end_bound(), std::ops::Bound::Excluded(e) if idx >= *e)
                || matches!(range.end_bound(), std::ops::Bound::Included(e) if idx > *e)
            {
                break;
            }
            continue;
        }
        let entry: Entry<TypeConfig> = serde_json::from_slice(&v).map_err(io_err_ser)?;
        out.push(entry);
    }
    Ok(out)
}

/// Snapshot of the log tree at the moment a log reader is requested, per the
/// v1 `get_log_reader` contract (callers must not observe later writes).
pub struct SledLogReader {
    entries: Vec<Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for SledLogReader {
    async fn try_get_log_entries<RB>(&mut self, range: RB) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.entries.iter().filter(|e| range.contains(&e.get_log_id().index)).cloned().collect())
    }
}

pub struct SledSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, Node>,
    kv: std::collections::BTreeMap<String, Vec<u8>>,
}

impl RaftSnapshotBuilder<TypeConfig> for SledSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let bytes = super::snapshot::encode_monolithic(&self.kv).map_err(io_err)?;
        let snap_id = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis().to_string();

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(std::io::Cursor::new(bytes)),
        })
    }
}

impl RaftStorage<TypeConfig> for SledStorage {
    type LogReader = SledLogReader;
    type SnapshotBuilder = SledSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(KEY_VOTE, vote)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_meta(KEY_VOTE)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = self.read_meta(KEY_LAST_PURGED)?;
        let last = self.log.last().map_err(io_err)?;
        let last_log_id = match last {
            Some((_, v)) => {
                let entry: Entry<TypeConfig> = serde_json::from_slice(&v).map_err(io_err_ser)?;
                Some(*entry.get_log_id())
            }
            None => last_purged_log_id,
        };
        Ok(LogState { last_purged_log_id, last_log_id })
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(KEY_COMMITTED, &committed)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_meta(KEY_COMMITTED)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        let entries = read_log_range(&self.log, ..).unwrap_or_default();
        SledLogReader { entries }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            let idx = entry.get_log_id().index;
            let bytes = serde_json::to_vec(&entry).map_err(io_err_ser)?;
            self.log.insert(idx_key(idx), bytes).map_err(io_err)?;
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let from = idx_key(log_id.index);
        let keys: Vec<_> = self.log.range(from..).keys().filter_map(Result::ok).collect();
        for k in keys {
            self.log.remove(k).map_err(io_err)?;
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let upto = idx_key(log_id.index.saturating_add(1));
        let keys: Vec<_> = self.log.range(..upto).keys().filter_map(Result::ok).collect();
        for k in keys {
            self.log.remove(k).map_err(io_err)?;
        }
        self.write_meta(KEY_LAST_PURGED, &Some(log_id))
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        let last_applied = self.read_meta(KEY_LAST_APPLIED)?;
        let membership = self.read_meta(KEY_MEMBERSHIP)?.unwrap_or_default();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<FabricResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.write_meta(KEY_LAST_APPLIED, &Some(*entry.get_log_id()))?;

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(FabricResponse { ok: true, message: "noop".into() });
                }
                openraft::EntryPayload::Normal(cmd) => {
                    let resp = self.apply_command(cmd)?;
                    responses.push(resp);
                }
                openraft::EntryPayload::Membership(m) => {
                    let membership = StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    self.write_meta(KEY_MEMBERSHIP, &membership)?;
                    responses.push(FabricResponse { ok: true, message: "membership change applied".into() });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let (last_applied, last_membership) = self.last_applied_state().await.unwrap_or_default();
        let kv = self
            .state
            .scan_prefix(KEY_KV_PREFIX)
            .filter_map(Result::ok)
            .map(|(k, v)| (String::from_utf8_lossy(&k[KEY_KV_PREFIX.len()..]).into_owned(), v.to_vec()))
            .collect();
        SledSnapshotBuilder { last_applied, last_membership, kv }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<std::io::Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<std::io::Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let kv = super::snapshot::decode_monolithic(snapshot.get_ref()).map_err(|e| {
            if e.is_corrupted() {
                warn!(snapshot_id = %meta.snapshot_id, error = %e, "rejecting corrupted snapshot");
            }
            io_err(e)
        })?;
        self.state.clear().map_err(io_err)?;
        for (k, v) in &kv {
            self.state.insert(format!("{KEY_KV_PREFIX}{k}"), v.clone()).map_err(io_err)?;
        }
        self.write_meta(KEY_LAST_APPLIED, &meta.last_log_id)?;
        self.write_meta(KEY_MEMBERSHIP, &meta.last_membership)?;
        let _ = self.config_tx.send(kv.get("__config").map(|v| String::from_utf8_lossy(v).into_owned()));
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

impl SledStorage {
    fn apply_command(&self, cmd: &FabricCommand) -> Result<FabricResponse, StorageError<NodeId>> {
        match cmd {
            FabricCommand::Put { key, value } => {
                self.state.insert(format!("{KEY_KV_PREFIX}{key}"), value.clone()).map_err(io_err)?;
                if key == "__config" {
                    let _ = self.config_tx.send(Some(String::from_utf8_lossy(value).into_owned()));
                }
                Ok(FabricResponse { ok: true, message: format!("put {key}") })
            }
            FabricCommand::Delete { key } => {
                self.state.remove(format!("{KEY_KV_PREFIX}{key}")).map_err(io_err)?;
                Ok(FabricResponse { ok: true, message: format!("deleted {key}") })
            }
            FabricCommand::ApplyLargeChunk { request_id, seq, total, bytes } => {
                super::chunking::ChunkAssembler::accumulate(&self.state, request_id, *seq, *total, bytes)
                    .map_err(io_err)?;
                Ok(FabricResponse { ok: true, message: format!("chunk {seq}/{total} for {request_id}") })
            }
            FabricCommand::Noop => {
                info!("applied noop raft entry");
                Ok(FabricResponse { ok: true, message: "noop".into() })
            }
        }
    }
}

/// Wraps `Adaptor::new(store)` into the split interface `Raft::new` expects,
/// matching the bridging idiom this module is grounded on.
pub fn split(store: SledStorage) -> (impl openraft::storage::RaftLogStorage<TypeConfig>, impl openraft::storage::RaftStateMachine<TypeConfig>) {
    openraft::storage::Adaptor::new(store)
}

pub type ArcSledStorage = Arc<tokio::sync::Mutex<SledStorage>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_log_range_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = SledStorage::open(dir.path()).unwrap();

        let entries: Vec<Entry<TypeConfig>> = (1..=3)
            .map(|i| Entry {
                log_id: LogId::new(openraft::CommittedLeaderId::new(1, 0), i),
                payload: openraft::EntryPayload::Normal(FabricCommand::Noop),
            })
            .collect();
        storage.append_to_log(entries).await.unwrap();

        let read = storage.try_get_log_entries(1..=3).await.unwrap();
        assert_eq!(read.len(), 3);
    }

    #[tokio::test]
    async fn purge_removes_entries_up_to_and_including_log_id() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = SledStorage::open(dir.path()).unwrap();

        let entries: Vec<Entry<TypeConfig>> = (1..=5)
            .map(|i| Entry {
                log_id: LogId::new(openraft::CommittedLeaderId::new(1, 0), i),
                payload: openraft::EntryPayload::Normal(FabricCommand::Noop),
            })
            .collect();
        storage.append_to_log(entries).await.unwrap();

        let purge_id = LogId::new(openraft::CommittedLeaderId::new(1, 0), 3);
        storage.purge_logs_upto(purge_id).await.unwrap();

        let remaining = storage.try_get_log_entries(..).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.get_log_id().index > 3));
    }

    #[tokio::test]
    async fn install_snapshot_rejects_corrupted_bytes_and_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = SledStorage::open(dir.path()).unwrap();
        storage.state.insert(format!("{KEY_KV_PREFIX}untouched"), b"before".to_vec()).unwrap();

        let mut kv = std::collections::BTreeMap::new();
        kv.insert("a".to_string(), b"1".to_vec());
        let mut encoded = super::super::snapshot::encode_monolithic(&kv).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let meta = SnapshotMeta { last_log_id: None, last_membership: StoredMembership::default(), snapshot_id: "1".into() };
        assert!(storage.install_snapshot(&meta, Box::new(std::io::Cursor::new(encoded))).await.is_err());
        assert_eq!(storage.state.get(format!("{KEY_KV_PREFIX}untouched")).unwrap().unwrap().as_ref(), b"before");
    }

    #[tokio::test]
    async fn apply_put_persists_into_the_state_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = SledStorage::open(dir.path()).unwrap();

        let entry = Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 0), 1),
            payload: openraft::EntryPayload::Normal(FabricCommand::Put { key: "k".into(), value: b"v".to_vec() }),
        };
        let responses = storage.apply_to_state_machine(&[entry]).await.unwrap();
        assert!(responses[0].ok);
        assert_eq!(storage.state.get(format!("{KEY_KV_PREFIX}k")).unwrap().unwrap().as_ref(), b"v");
    }
}
