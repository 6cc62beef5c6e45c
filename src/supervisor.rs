use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::files::write_atomically;
use crate::options::ProxyOptions;

#[derive(Debug, Error)]
pub enum Error {
    #[error("nghttpx executable not found, tried {0:?}")]
    ExecutableNotFound(Vec<PathBuf>),
    #[error("Failed to launch {}: {source}", .program.display())]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Re-read the configuration file.
    Hangup,
    Kill,
}

/// A running proxy process.
#[async_trait]
pub trait ProxyProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Delivers `signal`, returning whether delivery succeeded.
    fn signal(&mut self, signal: Signal) -> bool;

    fn has_exited(&mut self) -> bool;

    /// Waits for the process to exit and reaps it.
    async fn wait(&mut self) -> io::Result<()>;
}

/// Starts proxy processes.
pub trait Launcher: Send {
    fn launch(&self, command: &ProxyCommand) -> io::Result<Box<dyn ProxyProcess>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ProxyCommand {
    /// `<program> --conf <config_file> [<default key> <default cert>]`
    pub fn new(program: PathBuf, options: &ProxyOptions) -> Self {
        let mut args = vec![
            OsString::from("--conf"),
            options.config_file.clone().into_os_string(),
        ];
        let (key, cert) = &options.default_certificate;
        if key.exists() && cert.exists() {
            args.push(key.clone().into_os_string());
            args.push(cert.clone().into_os_string());
        }
        ProxyCommand { program, args }
    }
}

/// Returns the first candidate that exists.
pub fn locate_executable(candidates: &[PathBuf]) -> Result<PathBuf, Error> {
    candidates
        .iter()
        .find(|candidate| candidate.exists())
        .cloned()
        .ok_or_else(|| Error::ExecutableNotFound(candidates.to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
    /// Held only while the hangup is delivered; `reload` always returns in
    /// `Running` or `Stopped`.
    Reloading,
}

/// What handling one configuration led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The configuration file could not be written; nothing was touched.
    WriteFailed,
    Reloaded,
    /// Reloading failed and the process was replaced.
    Restarted,
    /// Neither reload nor restart succeeded.
    Failed,
}

/// Owns the proxy process: writes each received configuration and makes the
/// proxy pick it up, by hangup signal or else by restarting it.
pub struct Supervisor<L> {
    launcher: L,
    options: ProxyOptions,
    process: Option<Box<dyn ProxyProcess>>,
    state: State,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, options: ProxyOptions) -> Self {
        Supervisor {
            launcher,
            options,
            process: None,
            state: State::Stopped,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Launches the proxy unless one is already tracked.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.process.is_some() {
            return Ok(());
        }

        let program = locate_executable(&self.options.executable_candidates)?;
        let command = ProxyCommand::new(program, &self.options);
        tracing::info!(program = %command.program.display(), args = ?command.args, "starting nghttpx");
        let process = self
            .launcher
            .launch(&command)
            .map_err(|source| Error::LaunchFailed {
                program: command.program.clone(),
                source,
            })?;

        tracing::info!(pid = ?process.id(), "nghttpx started");
        self.process = Some(process);
        self.state = State::Running;
        Ok(())
    }

    /// Kills the tracked process, if any, and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            tracing::info!(pid = ?process.id(), "stopping nghttpx");
            if !process.signal(Signal::Kill) {
                tracing::warn!(pid = ?process.id(), "unable to signal nghttpx");
            }
            if let Err(error) = process.wait().await {
                tracing::error!(%error, "unable to wait for nghttpx");
            }
        }
        self.state = State::Stopped;
    }

    /// Asks the tracked process to re-read its configuration.
    pub fn reload(&mut self) -> bool {
        let process = match self.process.as_mut() {
            Some(process) => process,
            None => return false,
        };
        if process.has_exited() {
            tracing::warn!(pid = ?process.id(), "nghttpx exited unexpectedly");
            self.process = None;
            self.state = State::Stopped;
            return false;
        }

        self.state = State::Reloading;
        let delivered = process.signal(Signal::Hangup);
        self.state = State::Running;
        delivered
    }

    pub async fn restart(&mut self) -> bool {
        self.stop().await;
        match self.start() {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(%error, "unable to start nghttpx");
                false
            }
        }
    }

    /// Writes `doc` to the configuration file and makes the proxy load it.
    pub async fn apply(&mut self, doc: &str) -> Outcome {
        tracing::info!("reloading configuration");
        let config_file = &self.options.config_file;
        if let Err(error) = write_atomically(config_file, doc.as_bytes(), 0o644) {
            tracing::error!(%error, path = %config_file.display(), "unable to write configuration");
            return Outcome::WriteFailed;
        }

        if self.reload() {
            return Outcome::Reloaded;
        }
        if self.restart().await {
            return Outcome::Restarted;
        }
        tracing::error!("unable to restart nghttpx, waiting for the next configuration");
        Outcome::Failed
    }

    /// Applies configurations as they arrive until `shutdown` is cancelled or
    /// the sender goes away, then stops the proxy.
    pub async fn run(mut self, mut configs: mpsc::Receiver<String>, shutdown: CancellationToken) {
        loop {
            let doc = tokio::select! {
                _ = shutdown.cancelled() => break,
                doc = configs.recv() => match doc {
                    Some(doc) => doc,
                    None => break,
                },
            };
            let outcome = self.apply(&doc).await;
            tracing::debug!(?outcome, state = ?self.state(), "configuration handled");
        }

        self.stop().await;
        tracing::info!("supervisor terminated");
    }
}

/// Launches nghttpx as a child process.
#[derive(Debug, Default)]
pub struct NghttpxLauncher;

impl Launcher for NghttpxLauncher {
    fn launch(&self, command: &ProxyCommand) -> io::Result<Box<dyn ProxyProcess>> {
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl ProxyProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn signal(&mut self, signal: Signal) -> bool {
        let pid = match self.child.id() {
            Some(pid) => pid,
            None => return false,
        };
        let signal = match signal {
            Signal::Hangup => libc::SIGHUP,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) takes plain integers and touches no memory.
        unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) -> io::Result<()> {
        let status = self.child.wait().await?;
        tracing::info!(%status, "nghttpx exited");
        Ok(())
    }
}
