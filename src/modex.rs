use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes};
use dashmap::DashMap;
use tracing::debug;

use crate::coordinator::protocol::{ProtocolError, get_bytes, get_proc, put_bytes, put_proc};
use crate::pmix::{Proc, RANK_WILDCARD, Scope};

/// The data a process contributes for one scope at a fence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModexData {
    pub proc: Proc,
    pub blob: Bytes,
}

impl ModexData {
    pub fn new(proc: Proc, blob: impl Into<Bytes>) -> Self {
        Self {
            proc,
            blob: blob.into(),
        }
    }

    /// Copy of `self` that does not share the blob's backing buffer.
    pub fn deep_copy(&self) -> Self {
        Self {
            proc: self.proc.clone(),
            blob: Bytes::copy_from_slice(&self.blob),
        }
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        put_proc(buf, &self.proc);
        put_bytes(buf, &self.blob);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let proc = get_proc(buf)?;
        let blob = get_bytes(buf)?;
        Ok(Self { proc, blob })
    }
}

#[derive(Clone, Debug)]
struct Snapshot {
    seq: u64,
    scope: Scope,
    data: ModexData,
}

/// Append-only store of modex blobs, indexed by process.
///
/// Every submitted snapshot is retained. Readers get them in submission order,
/// so a reader that applies them in turn ends up with the latest value of each
/// key.
#[derive(Debug, Default)]
pub struct ModexRegistry {
    entries: DashMap<Proc, Vec<Snapshot>>,
    seq: AtomicU64,
}

impl ModexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a deep copy of `data`.
    pub fn store(&self, scope: Scope, data: &ModexData) {
        debug!(proc = %data.proc, ?scope, size = data.blob.len(), "Storing modex data");
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(data.proc.clone())
            .or_default()
            .push(Snapshot {
                seq,
                scope,
                data: data.deep_copy(),
            });
    }

    /// Copies of every snapshot stored for `proc`. A wildcard rank selects
    /// every process of the namespace.
    pub fn get(&self, proc: &Proc) -> Vec<ModexData> {
        debug!(%proc, "Getting modex data");
        let mut snapshots = if proc.rank == RANK_WILDCARD {
            self.entries
                .iter()
                .filter(|e| e.key().nspace == proc.nspace)
                .flat_map(|e| e.value().clone())
                .collect::<Vec<_>>()
        } else {
            self.entries
                .get(proc)
                .map(|e| e.value().clone())
                .unwrap_or_default()
        };
        snapshots.sort_by_key(|s| s.seq);
        snapshots.into_iter().map(|s| s.data.deep_copy()).collect()
    }

    /// Scopes of the snapshots stored for `proc`, in submission order.
    pub fn scopes(&self, proc: &Proc) -> Vec<Scope> {
        self.entries
            .get(proc)
            .map(|e| e.iter().map(|s| s.scope).collect())
            .unwrap_or_default()
    }

    /// Total number of stored snapshots
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
