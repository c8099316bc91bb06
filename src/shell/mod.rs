//! Interactive gateway shell
//!
//! Each inbound `shell` channel gets a [`ShellSession`]: a command table, an
//! interpreter task that owns the session's streams, and one periodic
//! flusher per output stream. The session ends exactly once, through its
//! [`ExitHandler`].

pub mod commands;
pub mod exit;
pub mod interpreter;
pub mod io;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditService, SessionTerminator};
use crate::ssh::TunnelSettings;

pub use commands::{Command, CommandTable, ShellIo};
pub use exit::{ExitHandler, SessionExit};
pub use interpreter::Interpreter;

use io::{InputStream, LineReader, OutputStream, PeriodicFlusher, SharedOutput};

/// Terminal dimensions negotiated by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

/// Terminal type and live size of the inbound client
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub term: String,
    pub size: watch::Receiver<TermSize>,
}

/// Read-only per-session state
pub struct ShellContext {
    pub user: String,
    pub topology: String,
    pub tunnel: Arc<TunnelSettings>,
    pub audit: Arc<AuditService>,
    pub terminal: TerminalInfo,
    pub flush_interval: Duration,
    /// Cancelled once the inbound client is gone
    pub disconnected: CancellationToken,
}

/// Byte streams of an inbound session
pub struct ShellStreams {
    pub input: InputStream,
    pub output: OutputStream,
    pub error: OutputStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Starting,
    Interpreting,
    Exited,
}

/// A running shell
pub struct ShellSession {
    state: Arc<watch::Sender<ShellState>>,
    exit: Arc<ExitHandler>,
    task: JoinHandle<()>,
}

impl ShellSession {
    /// Build the command table and spawn the interpreter
    pub fn start(ctx: Arc<ShellContext>, streams: ShellStreams) -> (Self, oneshot::Receiver<SessionExit>) {
        let (exit, exit_rx) = ExitHandler::new();
        let (state, _) = watch::channel(ShellState::Starting);
        let state = Arc::new(state);

        let commands = CommandTable::standard(&ctx, &exit);
        let interpreter = Interpreter::new(&ctx.user, &ctx.topology, commands, exit.clone());
        let io = ShellIo {
            input: LineReader::new(streams.input),
            out: SharedOutput::new(streams.output),
            err: SharedOutput::new(streams.error),
        };

        let task_state = state.clone();
        let flush_interval = ctx.flush_interval;
        let user = ctx.user.clone();
        let task = tokio::spawn(async move {
            let _out_flusher = PeriodicFlusher::start(&io.out, flush_interval);
            let _err_flusher = PeriodicFlusher::start(&io.err, flush_interval);
            task_state.send_replace(ShellState::Interpreting);
            interpreter.run(io).await;
            task_state.send_replace(ShellState::Exited);
            debug!(user = %user, "Interpreter finished");
        });

        (Self { state, exit, task }, exit_rx)
    }

    pub fn state(&self) -> ShellState {
        *self.state.borrow()
    }

    /// Give the interpreter up to `grace` to wind down, then abort it
    ///
    /// A relay in progress ends once its input or output fails, which lets
    /// the tunnel close its channel and the audit tap end normally.
    pub async fn finish(mut self, grace: Duration) {
        if time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Interpreter still running after {:?}, aborting", grace);
        }
    }

    /// Stop the interpreter and anything it is relaying
    ///
    /// Fires the exit handler if the interpreter had not done so yet.
    pub fn abort(&self) {
        self.task.abort();
        self.exit.terminate("session aborted");
        self.state.send_replace(ShellState::Exited);
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
pub(crate) fn test_context(user: &str) -> Arc<ShellContext> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};

    let config = crate::config::test_config();
    let identity = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let tunnel = TunnelSettings::from_config(&config, Arc::new(identity))
        .with_timeout(Duration::from_secs(1));
    let sink: Arc<dyn crate::audit::AuditSink> = Arc::new(crate::audit::RecordingSink::default());
    let (_size_tx, size) = watch::channel(TermSize::default());

    Arc::new(ShellContext {
        user: user.to_string(),
        topology: config.topology.clone(),
        tunnel: Arc::new(tunnel),
        audit: Arc::new(AuditService::from_config(&config, sink)),
        terminal: TerminalInfo {
            term: "xterm".to_string(),
            size,
        },
        flush_interval: config.flush_interval,
        disconnected: CancellationToken::new(),
    })
}
