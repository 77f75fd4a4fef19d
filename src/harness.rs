//! The exchange test: a server module backed by a modex registry, the client
//! scenario run by every rank, and the server side that launches the ranks
//! and waits for them to terminate.

use std::io;
use std::path::PathBuf;
use std::pin::pin;
use std::process::ExitStatus;
use std::time::Duration;

use dashmap::DashSet;
use futures::future::{Either, select};
use tempdir::TempDir;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::CREDENTIAL_VAR;
use crate::launcher::{LaunchError, Launcher};
use crate::modex::{ModexData, ModexRegistry};
use crate::pmix::{
    PmixError, Proc, Range, Scope, Value,
    client::Client,
    env::ClientIdentity,
    info::{self, App, Info},
    module::{Lookup, ModexCallback, OpCallback, ServerModule, SpawnCallback},
    server::{self, Namespace, Server, ServerError},
};

pub const DEFAULT_NSPACE: &str = "pmix-test";
pub const DEFAULT_CREDENTIAL: &str = "pmix-test-credential";
pub const DEFAULT_NPROCS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Namespace handed out for every spawn request
pub const SPAWNED_NSPACE: &str = "foobar";

/// Interval at which the server re-checks for termination
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long after its clients exit the server waits for their termination
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Server module for the exchange test.
///
/// Accepts clients presenting the shared secret, keeps every modex snapshot
/// in a registry, and completes once every expected process has terminated.
pub struct TestServerModule {
    credential: String,
    registry: ModexRegistry,
    expected: usize,
    terminated: DashSet<Proc>,
    complete: watch::Sender<bool>,
}

impl TestServerModule {
    pub fn new(credential: impl Into<String>, expected: usize) -> Self {
        Self {
            credential: credential.into(),
            registry: ModexRegistry::new(),
            expected,
            terminated: DashSet::new(),
            complete: watch::Sender::new(false),
        }
    }

    pub fn registry(&self) -> &ModexRegistry {
        &self.registry
    }

    pub fn num_terminated(&self) -> usize {
        self.terminated.len()
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Wait until every expected process has terminated. Returns `false` if
    /// `timeout` expires first.
    pub async fn wait_complete(&self, timeout: Duration) -> bool {
        let mut rx = self.complete.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                // Either a change or the poll interval wakes us up
                let _ = tokio::time::timeout(POLL_INTERVAL, rx.changed()).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl ServerModule for TestServerModule {
    fn authenticate(&self, credential: &str) -> Result<(), PmixError> {
        if credential == self.credential {
            Ok(())
        } else {
            Err(PmixError::AuthFailed)
        }
    }

    fn terminated(&self, proc: &Proc) -> Result<(), PmixError> {
        if self.terminated.insert(proc.clone()) {
            info!(%proc, "Process terminated");
        }
        if self.terminated.len() >= self.expected {
            self.complete.send_replace(true);
        }
        Ok(())
    }

    fn abort(&self, proc: &Proc, status: i32, msg: &str) -> Result<(), PmixError> {
        warn!(%proc, status, msg, "Abort requested");
        Ok(())
    }

    fn fence_nb(&self, _ranges: &[Range], _collect: bool, cb: ModexCallback) {
        cb.complete(Ok(vec![]))
    }

    fn store_modex(&self, scope: Scope, data: ModexData) -> Result<(), PmixError> {
        self.registry.store(scope, &data);
        Ok(())
    }

    fn get_modex_nb(&self, proc: &Proc, cb: ModexCallback) {
        cb.complete(Ok(self.registry.get(proc)))
    }

    fn get_job_info(&self, _proc: &Proc) -> Result<Vec<Info>, PmixError> {
        Ok(vec![])
    }

    fn publish(&self, _scope: Scope, _infos: &[Info]) -> Result<(), PmixError> {
        Ok(())
    }

    fn lookup(&self, _scope: Scope, _keys: &[String]) -> Result<Lookup, PmixError> {
        Ok(Lookup::default())
    }

    fn unpublish(&self, _scope: Scope, _keys: &[String]) -> Result<(), PmixError> {
        Ok(())
    }

    fn spawn(&self, apps: &[App], cb: SpawnCallback) {
        info!(napps = apps.len(), "Spawn requested");
        cb.complete(Ok(SPAWNED_NSPACE.to_owned()))
    }

    fn connect(&self, _ranges: &[Range], cb: OpCallback) {
        cb.complete(Ok(()))
    }

    fn disconnect(&self, _ranges: &[Range], cb: OpCallback) {
        cb.complete(Ok(()))
    }
}

pub fn local_key(rank: u32) -> String {
    format!("local-key-{rank}")
}

pub fn remote_key(rank: u32) -> String {
    format!("remote-key-{rank}")
}

pub fn global_key(rank: u32) -> String {
    format!("global-key-{rank}")
}

pub fn local_value(rank: u32) -> Value {
    Value::Int(12340 + rank as i32)
}

pub fn remote_value(rank: u32) -> Value {
    Value::String(format!("Test string #{rank}"))
}

pub fn global_value(rank: u32) -> Value {
    Value::Float(10.15 + rank as f32)
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        source: PmixError,
    },
    #[error("Key {key}: expected {expected:?}, got {actual:?}")]
    Mismatch {
        key: String,
        expected: Value,
        actual: Value,
    },
    #[error("Key {key} of another rank is visible")]
    LocalLeak { key: String },
    #[error("Job size missing from job info")]
    MissingJobSize,
}

fn step(step: &'static str) -> impl FnOnce(PmixError) -> ScenarioError {
    move |source| ScenarioError::Step { step, source }
}

/// Put one entry per scope for our rank.
pub fn put_entries(client: &Client) -> Result<(), ScenarioError> {
    let rank = client.rank();
    client
        .put(Scope::Local, &local_key(rank), local_value(rank))
        .map_err(step("put local"))?;
    client
        .put(Scope::Remote, &remote_key(rank), remote_value(rank))
        .map_err(step("put remote"))?;
    client
        .put(Scope::Global, &global_key(rank), global_value(rank))
        .map_err(step("put global"))?;
    Ok(())
}

async fn expect_value(client: &Client, proc: &Proc, key: String, expected: Value) -> Result<(), ScenarioError> {
    let actual = client.get(proc, &key).await.map_err(step("get"))?;
    if actual != expected {
        return Err(ScenarioError::Mismatch {
            key,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Check everything `rank` put is visible to us, except its local entry if
/// `rank` is not us.
pub async fn check_rank(client: &Client, rank: u32) -> Result<(), ScenarioError> {
    let proc = Proc::new(client.namespace(), rank);
    if rank == client.rank() {
        expect_value(client, &proc, local_key(rank), local_value(rank)).await?;
    } else {
        match client.get(&proc, &local_key(rank)).await {
            Err(PmixError::NotFound) => {}
            Err(e) => return Err(step("get")(e)),
            Ok(_) => return Err(ScenarioError::LocalLeak { key: local_key(rank) }),
        }
    }
    expect_value(client, &proc, remote_key(rank), remote_value(rank)).await?;
    expect_value(client, &proc, global_key(rank), global_value(rank)).await?;
    Ok(())
}

async fn job_size(client: &Client) -> Result<u32, ScenarioError> {
    let infos = client.get_job_info().await.map_err(step("get job info"))?;
    match info::find(&infos, info::JOB_SIZE) {
        Some(Value::Uint32(size)) => Ok(*size),
        _ => Err(ScenarioError::MissingJobSize),
    }
}

async fn exchange(client: &Client) -> Result<(), ScenarioError> {
    put_entries(client)?;
    client.fence(&[], true).await.map_err(step("fence"))?;

    for rank in 0..job_size(client).await? {
        check_rank(client, rank).await?;
        info!(rank, "rank {rank} is OK");
    }
    Ok(())
}

/// Run the exchange for one rank. Finalizes even if a step fails.
pub async fn run_client(identity: &ClientIdentity, credential: &str) -> Result<(), ScenarioError> {
    let client = Client::init(identity, credential)
        .await
        .map_err(step("init"))?;
    if client.namespace() != DEFAULT_NSPACE {
        warn!(nspace = client.namespace(), "Unexpected namespace");
    }

    let result = exchange(&client).await;
    if let Err(e) = &result {
        error!(rank = client.rank(), error = %e, "Exchange failed");
    }

    info!(rank = client.rank(), "Finalizing client");
    let finalized = client.finalize().await.map_err(step("finalize"));
    result.and(finalized)
}

/// Parameters of one server run
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub nspace: String,
    pub credential: String,
    pub nprocs: u32,
    /// Bound on the whole run
    pub timeout: Duration,
    /// Client program and its arguments
    pub command: Vec<String>,
    /// Where to create the server directory. A fresh temporary directory if
    /// unset.
    pub tmpdir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            nspace: DEFAULT_NSPACE.to_owned(),
            credential: DEFAULT_CREDENTIAL.to_owned(),
            nprocs: DEFAULT_NPROCS,
            timeout: DEFAULT_TIMEOUT,
            command,
            tmpdir: None,
        }
    }
}

/// Outcome of a server run
#[derive(Debug)]
pub struct RunSummary {
    /// Whether every client terminated within the timeout
    pub complete: bool,
    pub statuses: Vec<(Proc, ExitStatus)>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.complete && self.statuses.iter().all(|(_, s)| s.success())
    }
}

/// Serve one namespace: launch a client per rank and wait until all of them
/// have terminated, or the timeout expires.
pub async fn run_server(config: ServerConfig) -> Result<RunSummary, HarnessError> {
    let tmpdir = match &config.tmpdir {
        Some(dir) => TempDir::new_in(dir, "pmix-server")?,
        None => TempDir::new("pmix-server")?,
    };
    let module = TestServerModule::new(&config.credential, config.nprocs as usize);
    let s = Server::init(tmpdir.path(), module)?;
    let ns = Namespace::register(&s, &config.nspace, config.nprocs)?;
    let clients = (0..config.nprocs)
        .map(|rank| server::Client::register(&ns, rank))
        .collect::<Result<Vec<_>, _>>()?;

    let mut launcher = Launcher::new();
    for c in &clients {
        let mut envs = c.envs();
        envs.set(CREDENTIAL_VAR, &config.credential);
        launcher.spawn(&config.command, c.proc(), &envs)?;
    }

    let supervise = async {
        let finished = {
            let wait = pin!(launcher.wait_all());
            let complete = pin!(s.module().wait_complete(config.timeout));
            match select(wait, complete).await {
                Either::Left((statuses, _)) => {
                    let statuses = statuses?;
                    let complete = s.module().wait_complete(EXIT_GRACE).await;
                    Some((statuses, complete))
                }
                Either::Right((true, wait)) => Some((wait.await?, true)),
                Either::Right((false, _)) => None,
            }
        };
        match finished {
            Some(finished) => Ok::<_, HarnessError>(finished),
            None => {
                warn!(timeout = ?config.timeout, "Timed out waiting for clients");
                launcher.terminate()?;
                Ok((launcher.wait_all().await?, false))
            }
        }
    };

    let (statuses, complete) = match select(pin!(s.run()), pin!(supervise)).await {
        Either::Left((Ok(never), _)) => match never {},
        Either::Left((Err(e), _)) => return Err(e.into()),
        Either::Right((finished, _)) => finished?,
    };

    info!(
        complete,
        num_terminated = s.module().num_terminated(),
        "Server run finished"
    );
    Ok(RunSummary { complete, statuses })
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("PMIx error: {0}")]
    Pmix(#[from] PmixError),
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),
}
