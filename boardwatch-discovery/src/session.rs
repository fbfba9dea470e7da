//! Lifecycle of one discovery subprocess.
//!
//! A [`DiscoverySession`] owns exactly one child process, its pipes and the
//! [`ProtocolClient`] speaking to it, and walks the protocol state machine:
//!
//! ```text
//! Inactive -> Alive -> Running <-> Idle -> Quitting -> Dead
//! ```
//!
//! Any state can fall to `Dead` when the process exits on its own. Failures
//! are returned as [`SessionError`]s; the manager turns them into warnings.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};

use crate::client::{EventSender, ProtocolClient};
use crate::descriptor::{DiscoveryDescriptor, DiscoveryId};
use crate::error::{SessionError, SessionResult};
use crate::port::Port;
use crate::protocol::{self, CommandReply, DecodeTracker, PROTOCOL_VERSION};

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not spawned yet.
    Inactive,
    /// Spawned and handshake done.
    Alive,
    /// Streaming events after `START_SYNC`.
    Running,
    /// Stopped, process kept for reuse.
    Idle,
    /// `QUIT` sent, waiting for exit.
    Quitting,
    /// Process gone, handles released.
    Dead,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Alive => "alive",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Quitting => "quitting",
            Self::Dead => "dead",
        }
    }

    /// States in which a child process is held.
    pub fn has_process(self) -> bool {
        matches!(self, Self::Alive | Self::Running | Self::Idle | Self::Quitting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and identity knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_agent: String,
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub quit_grace: Duration,
    pub decode_failure_threshold: u32,
    pub decode_window: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("boardwatch {}", env!("CARGO_PKG_VERSION")),
            handshake_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            quit_grace: Duration::from_secs(2),
            decode_failure_threshold: 3,
            decode_window: Duration::from_secs(10),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// One discovery subprocess and its protocol state.
pub struct DiscoverySession {
    descriptor: DiscoveryDescriptor,
    options: SessionOptions,
    state: SessionState,
    child: Option<Child>,
    client: Option<ProtocolClient<ChildStdin>>,
}

impl DiscoverySession {
    /// Create a session in the [`SessionState::Inactive`] state.
    pub fn new(descriptor: DiscoveryDescriptor, options: SessionOptions) -> Self {
        Self {
            descriptor,
            options,
            state: SessionState::Inactive,
            child: None,
            client: None,
        }
    }

    pub fn id(&self) -> &DiscoveryId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DiscoveryDescriptor {
        &self.descriptor
    }

    /// Last known state; call [`refresh`](Self::refresh) to notice a crash.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// OS process id while a process is held.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// `false` once the tool produced too many malformed lines.
    pub fn is_healthy(&self) -> bool {
        self.client.as_ref().is_none_or(ProtocolClient::is_healthy)
    }

    /// Observe an unexpected exit and move to [`SessionState::Dead`].
    pub fn refresh(&mut self) -> SessionState {
        if matches!(
            self.state,
            SessionState::Alive | SessionState::Running | SessionState::Idle
        ) {
            let closed = self.client.as_ref().is_some_and(ProtocolClient::is_closed);
            let exited = self
                .child
                .as_mut()
                .is_some_and(|c| !matches!(c.try_wait(), Ok(None)));
            if closed || exited {
                log::warn!("discovery {}: process is gone", self.descriptor.id);
                self.release();
            }
        }
        self.state
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> SessionResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn client_mut(&mut self, operation: &'static str) -> SessionResult<&mut ProtocolClient<ChildStdin>> {
        let state = self.state;
        self.client.as_mut().ok_or_else(|| SessionError::InvalidState {
            operation,
            state: state.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Spawn the tool and perform the `HELLO` handshake (Inactive -> Alive).
    ///
    /// # Errors
    /// On any failure the process is killed, the session is `Dead` and the
    /// cause is returned.
    pub async fn start(&mut self) -> SessionResult<()> {
        self.require("start", &[SessionState::Inactive])?;
        let id = self.descriptor.id.clone();

        log::info!(
            "discovery {id}: spawning {} {:?}",
            self.descriptor.executable.display(),
            self.descriptor.args
        );
        let mut child = match Command::new(&self.descriptor.executable)
            .args(&self.descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.state = SessionState::Dead;
                return Err(SessionError::SpawnFailure {
                    path: self.descriptor.executable.clone(),
                    source,
                });
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.child = Some(child);
            self.terminate().await;
            return Err(SessionError::UnexpectedExit(
                "failed to capture discovery stdio".to_string(),
            ));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(id.clone(), stderr));
        }

        let tracker = DecodeTracker::new(
            self.options.decode_failure_threshold,
            self.options.decode_window,
        );
        self.client = Some(ProtocolClient::new(id.clone(), stdin, stdout, tracker));
        self.child = Some(child);

        match self.handshake().await {
            Ok(()) => {
                self.state = SessionState::Alive;
                log::info!("discovery {id}: handshake complete");
                Ok(())
            }
            Err(e) => {
                log::debug!("discovery {id}: handshake failed: {e}");
                self.terminate().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> SessionResult<()> {
        let hello = protocol::Command::Hello {
            protocol_version: PROTOCOL_VERSION,
            user_agent: self.options.user_agent.clone(),
        };
        let timeout = self.options.handshake_timeout;
        let reply = match self.client_mut("start")?.send(&hello, timeout).await {
            Ok(reply) => reply,
            Err(SessionError::CommandTimeout { .. }) => {
                return Err(SessionError::HandshakeTimeout(millis(timeout)));
            }
            Err(e) => return Err(e),
        };
        if !reply.is_ok() {
            return Err(SessionError::HandshakeRejected(reply.message));
        }
        match reply.protocol_version {
            Some(version) if version > PROTOCOL_VERSION => Err(SessionError::HandshakeRejected(
                format!("unsupported protocol version {version}"),
            )),
            _ => Ok(()),
        }
    }

    /// Begin streaming events into `events` (Alive/Idle -> Running).
    pub async fn start_sync(&mut self, events: EventSender) -> SessionResult<()> {
        self.refresh();
        self.require("start_sync", &[SessionState::Alive, SessionState::Idle])?;
        self.client_mut("start_sync")?.sink().attach(events);
        match self.command(protocol::Command::StartSync).await {
            Ok(_) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                if let Some(client) = &self.client {
                    client.sink().detach();
                }
                Err(e)
            }
        }
    }

    /// Pause event streaming, keeping the process (Running -> Idle).
    pub async fn stop(&mut self) -> SessionResult<()> {
        self.refresh();
        self.require("stop", &[SessionState::Running])?;
        self.command(protocol::Command::Stop).await?;
        if let Some(client) = &self.client {
            client.sink().detach();
        }
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Poll the tool with `START`, `LIST`, `STOP` and return the listed ports.
    pub async fn list(&mut self) -> SessionResult<Vec<Port>> {
        self.refresh();
        self.require("list", &[SessionState::Alive, SessionState::Idle])?;
        self.command(protocol::Command::Start).await?;
        let reply = self.command(protocol::Command::List).await?;
        self.command(protocol::Command::Stop).await?;
        self.state = SessionState::Idle;
        Ok(reply.ports)
    }

    /// Send a command and require an OK reply. Transport-level failures
    /// terminate the process.
    async fn command(&mut self, command: protocol::Command) -> SessionResult<CommandReply> {
        let timeout = self.options.command_timeout;
        let result = self.client_mut(command.name())?.send(&command, timeout).await;
        match result {
            Ok(reply) if reply.is_ok() => Ok(reply),
            Ok(reply) => Err(SessionError::CommandFailed {
                command: command.name().to_string(),
                message: reply.message,
            }),
            Err(e) => {
                log::debug!("discovery {}: {e}", self.descriptor.id);
                if !matches!(e, SessionError::InvalidState { .. }) {
                    self.terminate().await;
                }
                Err(e)
            }
        }
    }

    /// Ask the tool to quit, force-killing it after the grace period
    /// (any state -> Quitting -> Dead). Safe to call repeatedly.
    pub async fn quit(&mut self) {
        if self.state == SessionState::Dead || self.child.is_none() {
            self.release();
            return;
        }
        let id = self.descriptor.id.clone();
        let deadline = Instant::now() + self.options.quit_grace;
        self.state = SessionState::Quitting;

        if let Some(client) = self.client.as_mut() {
            client.mark_quitting();
            client.sink().detach();
            if !client.is_closed() {
                match client.send(&protocol::Command::Quit, self.options.quit_grace).await {
                    Ok(_) => log::debug!("discovery {id}: quit acknowledged"),
                    Err(e) => log::debug!("discovery {id}: quit not acknowledged: {e}"),
                }
                client.close_input().await;
            }
        }

        if let Some(child) = self.child.as_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(Ok(status)) => log::info!("discovery {id}: exited with {status}"),
                Ok(Err(e)) => {
                    log::warn!("discovery {id}: wait failed: {e}, killing");
                    kill_child(&id, child).await;
                }
                Err(_) => {
                    log::warn!(
                        "discovery {id}: did not exit within {}ms, killing",
                        millis(self.options.quit_grace)
                    );
                    kill_child(&id, child).await;
                }
            }
        }
        self.release();
    }

    /// Kill the process immediately and move to `Dead`.
    async fn terminate(&mut self) {
        if let Some(client) = &self.client {
            client.mark_quitting();
            client.sink().detach();
        }
        if let Some(child) = self.child.as_mut() {
            kill_child(&self.descriptor.id, child).await;
        }
        self.release();
    }

    fn release(&mut self) {
        if let Some(client) = &self.client {
            client.sink().detach();
        }
        self.client = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.state = SessionState::Dead;
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        // Best-effort kill of the child process.
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

async fn kill_child(id: &DiscoveryId, child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::debug!("discovery {id}: kill: {e}");
    }
}

/// Log the tool's stderr with its identifier.
async fn drain_stderr(id: DiscoveryId, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    log::warn!("discovery {id} stderr: {trimmed}");
                }
            }
        }
    }
}
