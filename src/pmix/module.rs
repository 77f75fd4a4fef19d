use tokio::sync::oneshot;

use super::{
    PmixError, Proc, Range, Scope,
    info::{App, Info},
};
use crate::modex::ModexData;

/// Completion handle for an operation that finishes asynchronously.
///
/// `complete` consumes the handle, so it can be called at most once. Dropping
/// the handle without completing it fails the operation with
/// `PmixError::Error`.
#[derive(Debug)]
pub struct Completion<T>(oneshot::Sender<Result<T, PmixError>>);

impl<T> Completion<T> {
    pub fn channel() -> (Self, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (Completion(tx), Pending(rx))
    }

    pub fn complete(self, result: Result<T, PmixError>) {
        // If the receiver is dropped, there is nobody left to tell.
        self.0.send(result).unwrap_or_default()
    }
}

/// Receiving end of a `Completion`.
#[derive(Debug)]
pub struct Pending<T>(oneshot::Receiver<Result<T, PmixError>>);

impl<T> Pending<T> {
    pub async fn wait(self) -> Result<T, PmixError> {
        self.0.await.unwrap_or(Err(PmixError::Error))
    }
}

/// Completed with modex data: the fence payload or direct modex results.
pub type ModexCallback = Completion<Vec<ModexData>>;
/// Completed with the namespace of the spawned job.
pub type SpawnCallback = Completion<String>;
pub type OpCallback = Completion<()>;

/// Result of a lookup: the found values and the namespace that published them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Lookup {
    pub infos: Vec<Info>,
    pub nspace: Option<String>,
}

/// Host-side handlers, invoked by the server on protocol events.
///
/// Optional events default to `NotSupported`.
pub trait ServerModule: Send + Sync + 'static {
    /// Check the credential a client presented at connection.
    fn authenticate(&self, credential: &str) -> Result<(), PmixError>;

    /// A client finalized or its connection went away.
    fn terminated(&self, proc: &Proc) -> Result<(), PmixError>;

    fn abort(&self, _proc: &Proc, _status: i32, _msg: &str) -> Result<(), PmixError> {
        Err(PmixError::NotSupported)
    }

    /// Host barrier, called once every local participant has arrived. Any data
    /// returned through `cb` is forwarded to the participants of a
    /// collecting fence.
    fn fence_nb(&self, ranges: &[Range], collect: bool, cb: ModexCallback);

    /// Take ownership of one scope's data contributed by a process at a fence.
    fn store_modex(&self, scope: Scope, data: ModexData) -> Result<(), PmixError>;

    /// Look up the stored data of a process.
    fn get_modex_nb(&self, proc: &Proc, cb: ModexCallback);

    fn get_job_info(&self, _proc: &Proc) -> Result<Vec<Info>, PmixError> {
        Err(PmixError::NotSupported)
    }

    fn publish(&self, _scope: Scope, _infos: &[Info]) -> Result<(), PmixError> {
        Err(PmixError::NotSupported)
    }

    fn lookup(&self, _scope: Scope, _keys: &[String]) -> Result<Lookup, PmixError> {
        Err(PmixError::NotSupported)
    }

    fn unpublish(&self, _scope: Scope, _keys: &[String]) -> Result<(), PmixError> {
        Err(PmixError::NotSupported)
    }

    fn spawn(&self, _apps: &[App], cb: SpawnCallback) {
        cb.complete(Err(PmixError::NotSupported))
    }

    fn connect(&self, _ranges: &[Range], cb: OpCallback) {
        cb.complete(Err(PmixError::NotSupported))
    }

    fn disconnect(&self, _ranges: &[Range], cb: OpCallback) {
        cb.complete(Err(PmixError::NotSupported))
    }
}
