use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use crate::coordinator::protocol::{ProtocolError, ensure, get_string, put_string};
use crate::pmix::{PmixError, Proc, Scope, Value, check_key};

/// Key for the KV store: (namespace, rank, key)
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct KvKey {
    pub proc: Proc,
    pub key: String,
}

impl KvKey {
    pub fn new(proc: Proc, key: impl Into<String>) -> Self {
        Self {
            proc,
            key: key.into(),
        }
    }
}

/// Client-side key-value store.
///
/// Holds the entries put by this process, and the entries of other processes
/// (and our own shared ones) once a fence has made them visible.
#[derive(Debug, Default)]
pub struct KvStore {
    /// Entries put by this process
    own: DashMap<String, (Scope, Value)>,
    /// Data made visible by completed fences
    data: DashMap<KvKey, Value>,
    /// Processes released by a fence, and whether their modex data is present
    fenced: DashMap<Proc, bool>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value put by this process
    pub fn put(&self, scope: Scope, key: &str, value: Value) -> Result<(), PmixError> {
        check_key(key)?;
        self.own.insert(key.to_owned(), (scope, value));
        Ok(())
    }

    /// Get one of our own Local entries. These need no fence.
    pub fn get_local(&self, key: &str) -> Option<Value> {
        self.own
            .get(key)
            .filter(|e| e.0 == Scope::Local)
            .map(|e| e.1.clone())
    }

    /// Get a value made visible by a fence
    pub fn get(&self, key: &KvKey) -> Option<Value> {
        self.data.get(key).map(|v| v.clone())
    }

    /// Pack our own entries of `scope` into a modex blob.
    /// Format: count:u32, then (key, value) records.
    pub fn pack(&self, scope: Scope) -> Option<Bytes> {
        let entries = self
            .own
            .iter()
            .filter(|e| e.value().0 == scope)
            .map(|e| (e.key().clone(), e.value().1.clone()))
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return None;
        }

        let mut buf = BytesMut::new();
        buf.put_u32(entries.len() as u32);
        for (key, value) in &entries {
            put_string(&mut buf, key);
            value.encode(&mut buf);
        }
        Some(buf.freeze())
    }

    /// Unpack a modex blob of `proc`. Later records replace earlier ones.
    pub fn unpack(&self, proc: &Proc, mut blob: Bytes) -> Result<usize, ProtocolError> {
        ensure(&blob, 4)?;
        let count = blob.get_u32() as usize;
        for _ in 0..count {
            let key = get_string(&mut blob)?;
            let value = Value::decode(&mut blob)?;
            self.data.insert(KvKey::new(proc.clone(), key), value);
        }
        Ok(count)
    }

    /// Make our own shared entries visible to ourselves, as of this fence.
    pub fn commit(&self, me: &Proc) {
        for e in self.own.iter().filter(|e| e.value().0.is_shared()) {
            self.data
                .insert(KvKey::new(me.clone(), e.key().clone()), e.value().1.clone());
        }
    }

    /// Record that a fence released `proc`. `fetched` tells whether its
    /// modex data as of that fence came with the release. If not, what we
    /// hold for `proc` is stale until fetched again.
    pub fn mark_fenced(&self, proc: Proc, fetched: bool) {
        self.fenced.insert(proc, fetched);
    }

    /// Drop everything we hold for `proc`, ahead of a fresh fetch.
    pub fn invalidate(&self, proc: &Proc) {
        self.data.retain(|k, _| k.proc != *proc);
    }

    /// `None` if no completed fence covered `proc`, else whether its data has
    /// been fetched.
    pub fn fence_state(&self, proc: &Proc) -> Option<bool> {
        self.fenced.get(proc).map(|f| *f)
    }

    /// Get statistics
    pub fn stats(&self) -> KvStoreStats {
        KvStoreStats {
            num_own: self.own.len(),
            num_visible: self.data.len(),
            num_fenced: self.fenced.len(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct KvStoreStats {
    pub num_own: usize,
    pub num_visible: usize,
    pub num_fenced: usize,
}
