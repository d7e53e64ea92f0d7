//! `ApplyLarge` chunking (§4.9 ApplyLarge chunking, R3): splits a payload too
//! large for one log entry into a sequence of `FabricCommand::ApplyLargeChunk`
//! entries, and reassembles them as they're applied to the state machine.

use serde::{Deserialize, Serialize};

use super::FabricCommand;

/// Entries are kept well under typical gRPC/transport frame limits; large
/// client payloads (snapshots shipped through the log instead of the
/// dedicated snapshot RPC, bulk config pushes) are split at this boundary.
pub const CHUNK_SIZE_BYTES: usize = 256 * 1024;

/// Splits `bytes` into a sequence of chunk commands sharing `request_id`,
/// ready to be submitted to `Raft::client_write` one at a time (callers must
/// preserve ordering — the log itself provides it as long as they're
/// submitted from a single client task).
pub fn split(request_id: String, bytes: &[u8]) -> Vec<FabricCommand> {
    if bytes.is_empty() {
        return vec![FabricCommand::ApplyLargeChunk { request_id, seq: 0, total: 1, bytes: Vec::new() }];
    }

    let total = bytes.len().div_ceil(CHUNK_SIZE_BYTES) as u32;
    bytes
        .chunks(CHUNK_SIZE_BYTES)
        .enumerate()
        .map(|(i, chunk)| FabricCommand::ApplyLargeChunk {
            request_id: request_id.clone(),
            seq: i as u32,
            total,
            bytes: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartialRequest {
    total: u32,
    received: Vec<Option<Vec<u8>>>,
}

const TREE_PREFIX: &str = "chunk:";

/// Reassembles chunks as they're applied by the state machine. Partial state
/// for in-flight `request_id`s is kept in the same `sled::Tree` the rest of
/// the state machine uses, so it survives a restart mid-assembly.
pub struct ChunkAssembler;

impl ChunkAssembler {
    /// Records one chunk; once every `seq` in `0..total` has arrived the
    /// complete, reassembled payload is written to `state` under
    /// `request_id` itself and the partial bookkeeping entry is removed.
    pub fn accumulate(
        state: &sled::Tree,
        request_id: &str,
        seq: u32,
        total: u32,
        bytes: &[u8],
    ) -> sled::Result<()> {
        let key = format!("{TREE_PREFIX}{request_id}");
        let mut partial: PartialRequest = state
            .get(&key)?
            .and_then(|v| serde_json::from_slice(&v).ok())
            .unwrap_or_else(|| PartialRequest { total, received: vec![None; total as usize] });

        if (seq as usize) < partial.received.len() {
            partial.received[seq as usize] = Some(bytes.to_vec());
        }

        if partial.received.iter().all(Option::is_some) {
            let assembled: Vec<u8> = partial.received.into_iter().flatten().flatten().collect();
            state.insert(format!("kv:{request_id}"), assembled)?;
            state.remove(&key)?;
        } else {
            let encoded = serde_json::to_vec(&partial).unwrap_or_default();
            state.insert(&key, encoded)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_produces_consistent_total_across_chunks() {
        let bytes = vec![7u8; CHUNK_SIZE_BYTES * 2 + 10];
        let chunks = split("req-1".into(), &bytes);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            if let FabricCommand::ApplyLargeChunk { total, .. } = c {
                assert_eq!(*total, 3);
            } else {
                panic!("expected ApplyLargeChunk");
            }
        }
    }

    #[test]
    fn empty_payload_still_produces_one_chunk() {
        let chunks = split("req-2".into(), &[]);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn assembler_reassembles_once_all_chunks_arrive() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let state = db.open_tree("state").unwrap();

        let bytes = vec![1u8, 2, 3, 4, 5, 6, 7];
        // force 3 tiny chunks by calling accumulate directly
        ChunkAssembler::accumulate(&state, "r", 0, 3, &bytes[0..3]).unwrap();
        ChunkAssembler::accumulate(&state, "r", 2, 3, &bytes[5..7]).unwrap();
        assert!(state.get("kv:r").unwrap().is_none());

        ChunkAssembler::accumulate(&state, "r", 1, 3, &bytes[3..5]).unwrap();
        let assembled = state.get("kv:r").unwrap().unwrap();
        assert_eq!(assembled.as_ref(), &bytes[..]);
        assert!(state.get("chunk:r").unwrap().is_none());
    }
}
