use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream, unix::OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::coordinator::{
    FenceCoordinator, ReadyFence, Release,
    fence::resolve_participants,
    protocol::{Frame, Message, ProtocolError, read_frame, write_frame},
};
use crate::modex::ModexData;

use super::{
    PmixError, PmixStatus, Proc, RANK_WILDCARD, Range, Scope, check_nspace,
    env::EnvVars,
    info::{self, App, Info},
    module::{Completion, ServerModule},
};

/// File name of the server socket inside its directory
const SOCKET_NAME: &str = "pmix-server.sock";

struct NamespaceRecord {
    nprocs: u32,
    infos: Vec<Info>,
}

struct ClientRecord {
    /// Effective user the client must run as
    uid: u32,
    connected: bool,
}

/// State shared by the server and its connection tasks
struct Shared<M> {
    module: M,
    namespaces: DashMap<String, NamespaceRecord>,
    clients: DashMap<Proc, ClientRecord>,
    fences: FenceCoordinator,
}

pub struct Server<M: ServerModule> {
    shared: Arc<Shared<M>>,
    listener: UnixListener,
    uri: PathBuf,
    tmpdir: PathBuf,
}

impl<M: ServerModule> Server<M> {
    /// Start listening in `dirname`. Must be called from within a tokio
    /// runtime.
    pub fn init(dirname: &Path, module: M) -> Result<Self, ServerError> {
        fs::create_dir_all(dirname)?;
        let uri = dirname.join(SOCKET_NAME);
        let listener = UnixListener::bind(&uri)?;
        info!(uri = %uri.display(), "PMIx server listening");

        Ok(Self {
            shared: Arc::new(Shared {
                module,
                namespaces: DashMap::new(),
                clients: DashMap::new(),
                fences: FenceCoordinator::new(),
            }),
            listener,
            uri,
            tmpdir: dirname.to_owned(),
        })
    }

    /// Path clients connect to
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    pub fn module(&self) -> &M {
        &self.shared.module
    }

    pub async fn run(&self) -> Result<Infallible, ServerError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.serve_connection(stream).await {
                    warn!(error = %e, "Connection error");
                }
            });
        }
    }
}

impl<M: ServerModule> Drop for Server<M> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.uri) {
            debug!(error = %e, "Could not remove server socket");
        }
    }
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

async fn respond(writer: &Writer, request_id: u64, message: Message) -> Result<(), ProtocolError> {
    let mut w = writer.lock().await;
    write_frame(&mut *w, &Frame::new(request_id, message)).await
}

fn status_of(r: Result<(), PmixError>) -> Message {
    Message::Status {
        status: PmixStatus::from(r),
    }
}

impl<M: ServerModule> Shared<M> {
    async fn serve_connection(self: Arc<Self>, stream: UnixStream) -> Result<(), ServerError> {
        let peer_uid = match stream.peer_cred() {
            Ok(cred) => {
                debug!(uid = cred.uid(), gid = cred.gid(), pid = ?cred.pid(), "New connection");
                Some(cred.uid())
            }
            Err(e) => {
                debug!(error = %e, "No peer credentials");
                None
            }
        };
        let (mut reader, writer) = stream.into_split();
        let writer: Writer = Arc::new(Mutex::new(writer));

        let Some(hello) = read_frame(&mut reader).await? else {
            debug!("Connection closed before handshake");
            return Ok(());
        };
        let proc = match self.handshake(hello.message, peer_uid) {
            Ok(proc) => proc,
            Err(e) => {
                respond(&writer, hello.request_id, status_of(Err(e))).await?;
                return Ok(());
            }
        };
        respond(&writer, hello.request_id, status_of(Ok(()))).await?;
        info!(%proc, "Client connected");

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    warn!(%proc, "Client disconnected without finalizing");
                    break;
                }
                Err(e) => {
                    error!(%proc, error = %e, "Error reading from client");
                    break;
                }
            };

            if let Message::Finalize = frame.message {
                let sent = respond(&writer, frame.request_id, status_of(Ok(()))).await;
                info!(%proc, "Client finalized");
                self.fences.withdraw(&proc);
                self.terminated(&proc);
                return sent.map_err(Into::into);
            }

            let shared = self.clone();
            let writer = writer.clone();
            let proc = proc.clone();
            tokio::spawn(async move {
                let response = shared.handle(&proc, frame.message).await;
                if let Some(status) = response.status().filter(|s| !s.is_success()) {
                    debug!(%proc, status = status.as_str(), "Request failed");
                }
                if let Err(e) = respond(&writer, frame.request_id, response).await {
                    warn!(%proc, error = %e, "Failed to send response");
                }
            });
        }

        self.fences.withdraw(&proc);
        self.terminated(&proc);
        Ok(())
    }

    fn handshake(&self, message: Message, peer_uid: Option<u32>) -> Result<Proc, PmixError> {
        let (nspace, rank, credential) = match message {
            Message::Hello {
                nspace,
                rank,
                credential,
            } => (nspace, rank, credential),
            other => {
                warn!(message_type = ?other.message_type(), "Expected handshake");
                return Err(PmixError::BadParam);
            }
        };
        check_nspace(&nspace)?;
        let proc = Proc::new(nspace, rank);

        let mut client = self.clients.get_mut(&proc).ok_or_else(|| {
            warn!(%proc, "Connection from unregistered client");
            PmixError::NotFound
        })?;
        if let Err(e) = self.module.authenticate(&credential) {
            warn!(%proc, "Client failed authentication");
            return Err(e);
        }
        if peer_uid.is_some_and(|uid| uid != client.uid) {
            warn!(%proc, ?peer_uid, expected = client.uid, "Client runs as another user");
            return Err(PmixError::AuthFailed);
        }
        if client.connected {
            warn!(%proc, "Client is already connected");
            return Err(PmixError::BadParam);
        }
        client.connected = true;
        Ok(proc)
    }

    fn terminated(&self, proc: &Proc) {
        if let Some(mut client) = self.clients.get_mut(proc) {
            client.connected = false;
        }
        if let Err(e) = self.module.terminated(proc) {
            warn!(%proc, error = %e, "Terminated handler failed");
        }
    }

    async fn handle(&self, proc: &Proc, message: Message) -> Message {
        match message {
            Message::Abort { status, message } => {
                warn!(%proc, status = status.as_str(), msg = %message, "Client requested abort");
                status_of(self.module.abort(proc, status.0, &message))
            }
            Message::Fence {
                ranges,
                collect,
                data,
            } => match self.fence(proc, ranges, collect, data).await {
                Ok(release) => Message::FenceRelease {
                    status: release.status,
                    participants: release.participants,
                    data: release.data,
                },
                Err(e) => Message::FenceRelease {
                    status: e.into(),
                    participants: vec![],
                    data: vec![],
                },
            },
            Message::GetModex { proc: target } => {
                let (status, data) = match self.direct_modex(&target).await {
                    Ok(data) => (PmixStatus::SUCCESS, data),
                    Err(e) => (e.into(), vec![]),
                };
                Message::ModexResponse { status, data }
            }
            Message::JobInfo => {
                let (status, infos) = match self.job_info(proc) {
                    Ok(infos) => (PmixStatus::SUCCESS, infos),
                    Err(e) => (e.into(), vec![]),
                };
                Message::JobInfoResponse { status, infos }
            }
            Message::Publish { scope, infos } => status_of(self.module.publish(scope, &infos)),
            Message::Lookup { scope, keys } => match self.module.lookup(scope, &keys) {
                Ok(lookup) => Message::LookupResponse {
                    status: PmixStatus::SUCCESS,
                    infos: lookup.infos,
                    nspace: lookup.nspace,
                },
                Err(e) => Message::LookupResponse {
                    status: e.into(),
                    infos: vec![],
                    nspace: None,
                },
            },
            Message::Unpublish { scope, keys } => status_of(self.module.unpublish(scope, &keys)),
            Message::Spawn { apps } => match self.spawn(&apps).await {
                Ok(nspace) => Message::SpawnResponse {
                    status: PmixStatus::SUCCESS,
                    nspace,
                },
                Err(e) => Message::SpawnResponse {
                    status: e.into(),
                    nspace: String::new(),
                },
            },
            Message::Connect { ranges } => {
                let (cb, pending) = Completion::channel();
                self.module.connect(&ranges, cb);
                status_of(pending.wait().await)
            }
            Message::Disconnect { ranges } => {
                let (cb, pending) = Completion::channel();
                self.module.disconnect(&ranges, cb);
                status_of(pending.wait().await)
            }
            other => {
                warn!(%proc, message_type = ?other.message_type(), "Unexpected message from client");
                status_of(Err(PmixError::BadParam))
            }
        }
    }

    async fn fence(
        &self,
        proc: &Proc,
        ranges: Vec<Range>,
        collect: bool,
        data: Vec<(Scope, Bytes)>,
    ) -> Result<Release, PmixError> {
        let participants = resolve_participants(&ranges, proc, |ns| {
            self.namespaces.get(ns).map(|n| n.nprocs)
        })?;

        let mut contributed = Vec::with_capacity(data.len());
        for (scope, blob) in data {
            if !scope.is_shared() {
                warn!(%proc, ?scope, "Refusing modex data of local scope");
                return Err(PmixError::InvalidScope);
            }
            contributed.push((scope, ModexData::new(proc.clone(), blob)));
        }

        let (rx, ready) = self.fences
            .arrive(proc.clone(), participants, ranges, collect, contributed)?;
        if let Some(ready) = ready {
            self.complete_fence(ready).await;
        }
        rx.await.map_err(|_| PmixError::Error)
    }

    /// Run the host barrier for a fence whose participants have all arrived,
    /// hand their data to the host, then release them.
    async fn complete_fence(&self, mut fence: ReadyFence) {
        let (cb, pending) = Completion::channel();
        self.module.fence_nb(&fence.ranges, fence.collect, cb);
        let payload = match pending.wait().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(fence_id = fence.id, error = %e, "Host fence failed");
                self.fences.release(fence, e.into(), vec![]);
                return;
            }
        };

        for (scope, data) in std::mem::take(&mut fence.data) {
            if let Err(e) = self.module.store_modex(scope, data) {
                warn!(fence_id = fence.id, error = %e, "Failed to store modex data");
                self.fences.release(fence, e.into(), vec![]);
                return;
            }
        }

        if !fence.collect {
            self.fences.release(fence, PmixStatus::SUCCESS, vec![]);
            return;
        }

        let gathered = join_all(fence.participants.iter().map(|p| self.get_modex(p))).await;
        match gathered.into_iter().collect::<Result<Vec<_>, _>>() {
            Ok(data) => {
                let data = data.into_iter().flatten().chain(payload).collect();
                self.fences.release(fence, PmixStatus::SUCCESS, data);
            }
            Err(e) => self.fences.release(fence, e.into(), vec![]),
        }
    }

    async fn get_modex(&self, proc: &Proc) -> Result<Vec<ModexData>, PmixError> {
        let (cb, pending) = Completion::channel();
        self.module.get_modex_nb(proc, cb);
        pending.wait().await
    }

    async fn direct_modex(&self, target: &Proc) -> Result<Vec<ModexData>, PmixError> {
        if target.rank == RANK_WILDCARD {
            let data = self.get_modex(target).await?;
            return Ok(data
                .into_iter()
                .filter(|d| self.fences.is_released(&d.proc))
                .collect());
        }
        if !self.fences.is_released(target) {
            debug!(%target, "Direct modex request before fence");
            return Err(PmixError::NotFound);
        }
        self.get_modex(target).await
    }

    fn job_info(&self, proc: &Proc) -> Result<Vec<Info>, PmixError> {
        let mut infos = self
            .namespaces
            .get(&proc.nspace)
            .map(|n| n.infos.clone())
            .ok_or(PmixError::NotFound)?;
        infos.push(Info::new(info::RANK, proc.rank));
        infos.extend(self.module.get_job_info(proc)?);
        Ok(infos)
    }

    async fn spawn(&self, apps: &[App]) -> Result<String, PmixError> {
        let (cb, pending) = Completion::channel();
        self.module.spawn(apps, cb);
        pending.wait().await
    }
}

/// A namespace registered with a server. Deregistered on drop.
pub struct Namespace<'a, M: ServerModule> {
    server: &'a Server<M>,
    nspace: String,
}

impl<'a, M: ServerModule> Namespace<'a, M> {
    pub fn register(server: &'a Server<M>, nspace: &str, nprocs: u32) -> Result<Self, PmixError> {
        check_nspace(nspace)?;
        if nprocs == 0 {
            return Err(PmixError::BadParam);
        }

        let infos = vec![
            Info::new(info::JOB_SIZE, nprocs),
            Info::new(info::LOCAL_SIZE, nprocs),
            Info::new(info::NSPACE, nspace),
        ];
        match server.shared.namespaces.entry(nspace.to_owned()) {
            Entry::Occupied(_) => return Err(PmixError::BadParam),
            Entry::Vacant(v) => {
                v.insert(NamespaceRecord { nprocs, infos });
            }
        }
        info!(nspace, nprocs, "Registered namespace");

        Ok(Self {
            server,
            nspace: nspace.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.nspace
    }
}

impl<'a, M: ServerModule> Drop for Namespace<'a, M> {
    fn drop(&mut self) {
        let shared = &self.server.shared;
        shared.namespaces.remove(&self.nspace);
        shared.clients.retain(|p, _| p.nspace != self.nspace);
    }
}

/// A client registered with a server. Deregistered on drop.
pub struct Client<'a, M: ServerModule> {
    namespace: &'a Namespace<'a, M>,
    proc: Proc,
}

impl<'a, M: ServerModule> Client<'a, M> {
    pub fn register(namespace: &'a Namespace<'a, M>, rank: u32) -> Result<Self, PmixError> {
        let shared = &namespace.server.shared;
        let nprocs = shared
            .namespaces
            .get(&namespace.nspace)
            .map(|n| n.nprocs)
            .ok_or(PmixError::NotFound)?;
        if rank >= nprocs {
            return Err(PmixError::BadParam);
        }

        let uid = nix::unistd::geteuid();
        let gid = nix::unistd::getegid();
        let proc = Proc::new(namespace.nspace.clone(), rank);
        shared.clients.insert(
            proc.clone(),
            ClientRecord {
                uid: uid.as_raw(),
                connected: false,
            },
        );
        debug!(%proc, uid = uid.as_raw(), gid = gid.as_raw(), "Registered client");

        Ok(Client { namespace, proc })
    }

    pub fn proc(&self) -> &Proc {
        &self.proc
    }

    /// Environment for launching this client
    pub fn envs(&self) -> EnvVars {
        let server = self.namespace.server;
        EnvVars::for_client(&self.proc, &server.uri, &server.tmpdir)
    }

    /// Whether the client is connected right now
    pub fn is_connected(&self) -> bool {
        self.namespace
            .server
            .shared
            .clients
            .get(&self.proc)
            .is_some_and(|c| c.connected)
    }
}

impl<'a, M: ServerModule> Drop for Client<'a, M> {
    fn drop(&mut self) {
        self.namespace.server.shared.clients.remove(&self.proc);
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
