use std::io;
use std::process::ExitStatus;

use futures::future::join_all;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::pmix::{Proc, env::EnvVars};

struct Launched {
    proc: Proc,
    child: Child,
    status: Option<ExitStatus>,
}

/// Child processes launched for the ranks of a job.
///
/// Children still running when the launcher is dropped receive SIGTERM.
#[derive(Default)]
pub struct Launcher {
    children: Vec<Launched>,
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `command` for `proc`, with `envs` added to our own environment.
    pub fn spawn(&mut self, command: &[String], proc: &Proc, envs: &EnvVars) -> Result<(), LaunchError> {
        let (program, args) = command.split_first().ok_or(LaunchError::EmptyCommand)?;
        let child = Command::new(program)
            .args(args)
            .envs(envs.iter())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;
        info!(%proc, %program, pid = ?child.id(), "Launched client");

        self.children.push(Launched {
            proc: proc.clone(),
            child,
            status: None,
        });
        Ok(())
    }

    /// Wait for every child to exit.
    pub async fn wait_all(&mut self) -> Result<Vec<(Proc, ExitStatus)>, LaunchError> {
        let results = join_all(self.children.iter_mut().map(|l| async move {
            if l.status.is_none() {
                let status = l.child.wait().await?;
                debug!(proc = %l.proc, %status, "Client exited");
                l.status = Some(status);
            }
            Ok::<_, io::Error>(())
        }))
        .await;
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(LaunchError::Wait)?;

        Ok(self
            .children
            .iter()
            .filter_map(|l| l.status.map(|s| (l.proc.clone(), s)))
            .collect())
    }

    /// Send SIGTERM to every child that has not exited yet.
    pub fn terminate(&mut self) -> Result<(), LaunchError> {
        for l in self.children.iter_mut().filter(|l| l.status.is_none()) {
            if let Ok(Some(status)) = l.child.try_wait() {
                l.status = Some(status);
                continue;
            }
            let Some(pid) = l.child.id() else { continue };
            warn!(proc = %l.proc, pid, "Terminating client");
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        }
        Ok(())
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(error = %e, "Failed to terminate clients");
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No command to launch")]
    EmptyCommand,
    #[error("Failed to launch {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Failed to wait for client: {0}")]
    Wait(io::Error),
    #[error("Failed to signal client: {0}")]
    Signal(#[from] nix::Error),
}
