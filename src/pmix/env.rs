use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::info;

use super::{Proc, get_version_str};

/// Environment variable names
pub const NAMESPACE_VAR: &str = "PMIX_NAMESPACE";
pub const RANK_VAR: &str = "PMIX_RANK";
pub const SERVER_URI_VAR: &str = "PMIX_SERVER_URI";
pub const SERVER_TMPDIR_VAR: &str = "PMIX_SERVER_TMPDIR";
pub const VERSION_VAR: &str = "PMIX_VERSION";
pub const FENCE_TIMEOUT_VAR: &str = "PMIX_FENCE_TIMEOUT";

/// Default bound on how long a client waits for a fence
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Variables a server exports to a client it launches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub(crate) fn for_client(proc: &Proc, server_uri: &Path, tmpdir: &Path) -> Self {
        Self(vec![
            (NAMESPACE_VAR.to_owned(), proc.nspace.clone()),
            (RANK_VAR.to_owned(), proc.rank.to_string()),
            (
                SERVER_URI_VAR.to_owned(),
                server_uri.to_string_lossy().into_owned(),
            ),
            (
                SERVER_TMPDIR_VAR.to_owned(),
                tmpdir.to_string_lossy().into_owned(),
            ),
            (VERSION_VAR.to_owned(), get_version_str().to_owned()),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Add `key`, replacing an earlier value.
    pub fn set(&mut self, key: &str, value: &str) {
        self.0.retain(|(k, _)| k != key);
        self.0.push((key.to_owned(), value.to_owned()));
    }
}

/// Client identity, as handed over by the launching server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub nspace: String,
    pub rank: u32,
    /// Path of the server's socket
    pub server_uri: PathBuf,
    pub tmpdir: Option<PathBuf>,
    pub fence_timeout: Duration,
}

impl ClientIdentity {
    /// Read the client identity from environment variables
    ///
    /// Expected environment variables (set by `Client::envs` on the server):
    /// - PMIX_NAMESPACE: Namespace of the job
    /// - PMIX_RANK: Rank of this process
    /// - PMIX_SERVER_URI: Socket path of the local server
    /// - PMIX_SERVER_TMPDIR: (optional) Server's temporary directory
    /// - PMIX_FENCE_TIMEOUT: (optional) Fence timeout in seconds, defaults to 60
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_vars(env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, EnvError> {
        let mut vars = vars.into_iter().collect::<HashMap<_, _>>();
        let mut take = |name: &'static str| vars.remove(name).ok_or(EnvError::MissingVar(name));

        let nspace = take(NAMESPACE_VAR)?;
        let rank = take(RANK_VAR)?
            .parse()
            .map_err(|_| EnvError::InvalidValue(RANK_VAR))?;
        let server_uri = take(SERVER_URI_VAR)?.into();
        let tmpdir = take(SERVER_TMPDIR_VAR).ok().map(PathBuf::from);
        let fence_timeout = match take(FENCE_TIMEOUT_VAR) {
            Ok(secs) => Duration::from_secs(
                secs.parse()
                    .map_err(|_| EnvError::InvalidValue(FENCE_TIMEOUT_VAR))?,
            ),
            Err(_) => DEFAULT_FENCE_TIMEOUT,
        };

        let identity = Self {
            nspace,
            rank,
            server_uri,
            tmpdir,
            fence_timeout,
        };

        info!(
            nspace = %identity.nspace,
            rank = identity.rank,
            server = %identity.server_uri.display(),
            "Client identity loaded"
        );

        Ok(identity)
    }

    pub fn proc(&self) -> Proc {
        Proc::new(self.nspace.clone(), self.rank)
    }
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Missing environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn owned(vars: &EnvVars) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn test_env_vars() {
        let proc = Proc::new("foo", 2);
        let vars = EnvVars::for_client(&proc, Path::new("/tmp/x/sock"), Path::new("/tmp/x"));
        assert_eq!(vars.get(RANK_VAR), Some("2"));
        assert_eq!(vars.get(VERSION_VAR), Some(get_version_str()));

        let identity = ClientIdentity::from_vars(owned(&vars)).unwrap();
        assert_eq!(identity.proc(), proc);
        assert_eq!(identity.server_uri, Path::new("/tmp/x/sock"));
        assert_eq!(identity.tmpdir.as_deref(), Some(Path::new("/tmp/x")));
        assert_eq!(identity.fence_timeout, DEFAULT_FENCE_TIMEOUT);

        let mut vars = vars;
        vars.set(RANK_VAR, "3");
        vars.set("PMIX_TEST_CREDENTIAL", "secret");
        assert_eq!(vars.get(RANK_VAR), Some("3"));
        assert_eq!(vars.iter().filter(|(k, _)| *k == RANK_VAR).count(), 1);
        assert_eq!(vars.get("PMIX_TEST_CREDENTIAL"), Some("secret"));
    }

    #[test]
    fn test_env_errors() {
        let proc = Proc::new("foo", 0);
        let vars = owned(&EnvVars::for_client(&proc, Path::new("s"), Path::new("t")));

        let missing = vars
            .iter()
            .filter(|(k, _)| k != SERVER_URI_VAR)
            .cloned();
        assert!(matches!(
            ClientIdentity::from_vars(missing),
            Err(EnvError::MissingVar(SERVER_URI_VAR))
        ));

        let bad_rank = vars.iter().cloned().map(|(k, v)| {
            if k == RANK_VAR { (k, "x".to_owned()) } else { (k, v) }
        });
        assert!(matches!(
            ClientIdentity::from_vars(bad_rank),
            Err(EnvError::InvalidValue(RANK_VAR))
        ));

        let timeout = vars
            .iter()
            .cloned()
            .chain([(FENCE_TIMEOUT_VAR.to_owned(), "5".to_owned())]);
        assert_eq!(
            ClientIdentity::from_vars(timeout).unwrap().fence_timeout,
            Duration::from_secs(5)
        );
    }
}
