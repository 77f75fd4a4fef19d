use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{UnixStream, unix::OwnedReadHalf, unix::OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::protocol::{Frame, Message, ProtocolError, read_frame, write_frame};
use crate::kv_store::{KvKey, KvStore};
use crate::modex::ModexData;

use super::{
    PmixError, PmixStatus, Proc, Range, Scope, Value, check_key,
    env::ClientIdentity,
    info::{App, Info},
    module::Lookup,
};

type PendingRequests = Arc<DashMap<u64, oneshot::Sender<Message>>>;

struct Inner {
    proc: Proc,
    fence_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingRequests,
    next_id: AtomicU64,
    store: KvStore,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connection of one process to its local server.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Route responses to the requests waiting on them, until the connection
/// closes. Outstanding requests then fail.
async fn read_responses(mut reader: OwnedReadHalf, pending: PendingRequests) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match pending.remove(&frame.request_id) {
                Some((_, tx)) => {
                    if tx.send(frame.message).is_err() {
                        debug!(request_id = frame.request_id, "Requester went away");
                    }
                }
                None => {
                    warn!(request_id = frame.request_id, "Response to unknown request");
                }
            },
            Ok(None) => {
                debug!("Server closed connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "Error reading from server");
                break;
            }
        }
    }
    pending.clear();
}

impl Client {
    /// Connect to the server named by `identity` and authenticate.
    pub async fn init(identity: &ClientIdentity, credential: &str) -> Result<Self, PmixError> {
        let stream = UnixStream::connect(&identity.server_uri)
            .await
            .map_err(|e| {
                error!(uri = %identity.server_uri.display(), error = %e, "Failed to connect to server");
                PmixError::Unreachable
            })?;
        let (reader, writer) = stream.into_split();
        let pending = PendingRequests::default();
        let reader = tokio::spawn(read_responses(reader, pending.clone()));

        let client = Self {
            inner: Arc::new(Inner {
                proc: identity.proc(),
                fence_timeout: identity.fence_timeout,
                writer: Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(0),
                store: KvStore::new(),
                reader,
            }),
        };

        let response = client
            .request(Message::Hello {
                nspace: identity.nspace.clone(),
                rank: identity.rank,
                credential: credential.to_owned(),
            })
            .await?;
        expect_status(response)?;
        info!(proc = %client.inner.proc, "Client initialized");

        Ok(client)
    }

    pub fn proc(&self) -> &Proc {
        &self.inner.proc
    }

    pub fn rank(&self) -> u32 {
        self.inner.proc.rank
    }

    pub fn namespace(&self) -> &str {
        &self.inner.proc.nspace
    }

    pub fn store(&self) -> &KvStore {
        &self.inner.store
    }

    async fn send(&self, message: Message) -> Result<(u64, oneshot::Receiver<Message>), PmixError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &Frame::new(id, message)).await {
            warn!(error = %e, "Failed to send request");
            self.inner.pending.remove(&id);
            return Err(PmixError::Unreachable);
        }
        Ok((id, rx))
    }

    async fn request(&self, message: Message) -> Result<Message, PmixError> {
        let (_, rx) = self.send(message).await?;
        rx.await.map_err(|_| PmixError::Unreachable)
    }

    async fn request_timeout(&self, message: Message, timeout: Duration) -> Result<Message, PmixError> {
        let (id, rx) = self.send(message).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(response) => response.map_err(|_| PmixError::Unreachable),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(PmixError::Timeout)
            }
        }
    }

    /// Store a value under `key`, to be shared with others at the next fence
    /// unless `scope` is `Local`.
    pub fn put(&self, scope: Scope, key: &str, value: impl Into<Value>) -> Result<(), PmixError> {
        self.inner.store.put(scope, key, value.into())
    }

    /// Barrier across `ranges` (all of our namespace if empty). With
    /// `collect`, the data of every participant is delivered with the
    /// release. Otherwise it is fetched on demand by `get`.
    pub async fn fence(&self, ranges: &[Range], collect: bool) -> Result<(), PmixError> {
        let store = &self.inner.store;
        let data = Scope::SHARED
            .into_iter()
            .filter_map(|scope| store.pack(scope).map(|blob| (scope, blob)))
            .collect();

        let response = self
            .request_timeout(
                Message::Fence {
                    ranges: ranges.to_vec(),
                    collect,
                    data,
                },
                self.inner.fence_timeout,
            )
            .await
            .inspect_err(|e| warn!(proc = %self.inner.proc, error = %e, "Fence failed"))?;

        let (status, participants, data) = match response {
            Message::FenceRelease {
                status,
                participants,
                data,
            } => (status, participants, data),
            other => return Err(unexpected(&other)),
        };
        status.check()?;

        let me = &self.inner.proc;
        for proc in participants {
            let fetched = collect || proc == *me;
            store.mark_fenced(proc, fetched);
        }
        store.commit(me);
        self.unpack(data)?;
        debug!(proc = %self.inner.proc, collect, "Fence released");
        Ok(())
    }

    /// Non-blocking `fence`. `cb` is called exactly once, from a task.
    pub fn fence_nb<F>(&self, ranges: Vec<Range>, collect: bool, cb: F)
    where
        F: FnOnce(Result<(), PmixError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { cb(client.fence(&ranges, collect).await) });
    }

    /// Look up `key` as put by `proc`.
    ///
    /// Our own `Local` entries are visible at once. Everything else is
    /// visible only once a fence covering `proc` has completed.
    pub async fn get(&self, proc: &Proc, key: &str) -> Result<Value, PmixError> {
        check_key(key)?;
        let store = &self.inner.store;
        if *proc == self.inner.proc {
            if let Some(value) = store.get_local(key) {
                return Ok(value);
            }
        }

        match store.fence_state(proc) {
            Some(false) => self.fetch_modex(proc).await?,
            Some(true) => {}
            None => debug!(%proc, key, "Get before fence"),
        }
        store
            .get(&KvKey::new(proc.clone(), key))
            .ok_or(PmixError::NotFound)
    }

    /// Fetch the data of `proc` from the server after a non-collecting fence.
    /// The server returns every snapshot released so far, replacing whatever
    /// we held before.
    async fn fetch_modex(&self, proc: &Proc) -> Result<(), PmixError> {
        debug!(%proc, "Direct modex request");
        let response = self.request(Message::GetModex { proc: proc.clone() }).await?;
        let (status, data) = match response {
            Message::ModexResponse { status, data } => (status, data),
            other => return Err(unexpected(&other)),
        };
        status.check()?;
        self.inner.store.invalidate(proc);
        self.unpack(data)?;
        self.inner.store.mark_fenced(proc.clone(), true);
        Ok(())
    }

    fn unpack(&self, data: Vec<ModexData>) -> Result<(), PmixError> {
        for ModexData { proc, blob } in data {
            self.inner.store.unpack(&proc, blob).map_err(|e| {
                warn!(%proc, error = %e, "Malformed modex data");
                PmixError::Error
            })?;
        }
        Ok(())
    }

    pub async fn get_job_info(&self) -> Result<Vec<Info>, PmixError> {
        let response = self.request(Message::JobInfo).await?;
        let (status, infos) = match response {
            Message::JobInfoResponse { status, infos } => (status, infos),
            other => return Err(unexpected(&other)),
        };
        status.check()?;
        Ok(infos)
    }

    pub async fn abort(&self, status: PmixStatus, message: &str) -> Result<(), PmixError> {
        warn!(proc = %self.inner.proc, status = status.as_str(), msg = message, "Requesting abort");
        let response = self
            .request(Message::Abort {
                status,
                message: message.to_owned(),
            })
            .await?;
        expect_status(response)
    }

    pub async fn publish(&self, scope: Scope, infos: &[Info]) -> Result<(), PmixError> {
        let response = self
            .request(Message::Publish {
                scope,
                infos: infos.to_vec(),
            })
            .await?;
        expect_status(response)
    }

    pub async fn lookup(&self, scope: Scope, keys: &[&str]) -> Result<Lookup, PmixError> {
        let keys = keys.iter().map(|k| (*k).to_owned()).collect();
        let response = self.request(Message::Lookup { scope, keys }).await?;
        let (status, infos, nspace) = match response {
            Message::LookupResponse {
                status,
                infos,
                nspace,
            } => (status, infos, nspace),
            other => return Err(unexpected(&other)),
        };
        status.check()?;
        Ok(Lookup { infos, nspace })
    }

    pub async fn unpublish(&self, scope: Scope, keys: &[&str]) -> Result<(), PmixError> {
        let keys = keys.iter().map(|k| (*k).to_owned()).collect();
        let response = self.request(Message::Unpublish { scope, keys }).await?;
        expect_status(response)
    }

    /// Ask the server to launch `apps`. Returns the new namespace.
    pub async fn spawn(&self, apps: &[App]) -> Result<String, PmixError> {
        let response = self
            .request(Message::Spawn {
                apps: apps.to_vec(),
            })
            .await?;
        let (status, nspace) = match response {
            Message::SpawnResponse { status, nspace } => (status, nspace),
            other => return Err(unexpected(&other)),
        };
        status.check()?;
        Ok(nspace)
    }

    pub async fn connect(&self, ranges: &[Range]) -> Result<(), PmixError> {
        let response = self
            .request(Message::Connect {
                ranges: ranges.to_vec(),
            })
            .await?;
        expect_status(response)
    }

    pub async fn disconnect(&self, ranges: &[Range]) -> Result<(), PmixError> {
        let response = self
            .request(Message::Disconnect {
                ranges: ranges.to_vec(),
            })
            .await?;
        expect_status(response)
    }

    /// Tell the server we are done. Other handles to this connection become
    /// unusable.
    pub async fn finalize(self) -> Result<(), PmixError> {
        let response = self.request(Message::Finalize).await?;
        expect_status(response)?;
        info!(proc = %self.inner.proc, "Client finalized");
        Ok(())
    }
}

fn expect_status(response: Message) -> Result<(), PmixError> {
    match response {
        Message::Status { status } => status.check(),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Message) -> PmixError {
    let e = ProtocolError::UnexpectedMessage(response.message_type());
    warn!(error = %e, "Bad response from server");
    PmixError::Error
}
