//! Per-connection russh handler
//!
//! Authenticates through the configured authenticator chain, accepts a single
//! session channel and runs a [`ShellSession`] on it. Shell output goes back
//! through [`ChannelWriter`]s; channel data feeds an unbounded pipe so the
//! transport is never blocked by the interpreter.
//!
//! When the client goes away the input pipe fails, so the interpreter and any
//! relay it runs unwind on their own: the tunnel closes its channel, the
//! audit tap ends and the exit handler fires. Sessions that do not unwind in
//! time are aborted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{self as ssh_server, Auth, Handle, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use secrecy::SecretString;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{ChannelWriter, SSH_EXTENDED_DATA_STDERR};
use super::GatewayShared;
use crate::auth::{AuthDecision, AuthRequest, Credential};
use crate::shell::exit::EXIT_ERROR;
use crate::shell::io::{pipe, PipeWriter};
use crate::shell::{SessionExit, ShellContext, ShellSession, ShellStreams, TermSize, TerminalInfo};

const DEFAULT_TERM: &str = "vt100";

/// How long a shell may take to unwind once it has exited or lost its client
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct GatewayHandler {
    peer: Option<SocketAddr>,
    shared: Arc<GatewayShared>,
    user: Option<String>,
    channel: Option<ChannelId>,
    term: String,
    size: watch::Sender<TermSize>,
    input: Option<PipeWriter>,
    watcher: Option<JoinHandle<()>>,
    disconnected: CancellationToken,
}

impl GatewayHandler {
    pub(super) fn new(peer: Option<SocketAddr>, shared: Arc<GatewayShared>) -> Self {
        let (size, _) = watch::channel(TermSize::default());
        Self {
            peer,
            shared,
            user: None,
            channel: None,
            term: DEFAULT_TERM.to_string(),
            size,
            input: None,
            watcher: None,
            disconnected: CancellationToken::new(),
        }
    }

    fn is_session_channel(&self, channel: ChannelId) -> bool {
        self.channel == Some(channel)
    }

    fn start_shell(&mut self, channel: ChannelId, session: &Session) {
        let user = self.user.clone().unwrap_or_default();
        let handle = session.handle();
        let (input, reader) = pipe();

        let ctx = Arc::new(ShellContext {
            user: user.clone(),
            topology: self.shared.topology.clone(),
            tunnel: self.shared.tunnel.clone(),
            audit: self.shared.audit.clone(),
            terminal: TerminalInfo {
                term: self.term.clone(),
                size: self.size.subscribe(),
            },
            flush_interval: self.shared.flush_interval,
            disconnected: self.disconnected.clone(),
        });
        let streams = ShellStreams {
            input: Box::new(reader),
            output: Box::new(ChannelWriter::stdout(handle.clone(), channel)),
            error: Box::new(ChannelWriter::stderr(handle.clone(), channel)),
        };

        let (shell, exit_rx) = ShellSession::start(ctx, streams);
        info!(peer = %display_addr(self.peer), user = %user, "Shell started");

        self.input = Some(input);
        self.watcher = Some(tokio::spawn(watch_exit(shell, exit_rx, handle, channel, user)));
    }

    /// The client is gone: fail pending reads and stop any relay
    fn disconnect(&mut self, reason: &str) {
        self.disconnected.cancel();
        if let Some(input) = self.input.take() {
            input.fail(io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string()));
        }
    }

    fn refuse(&self, channel: ChannelId, what: &str, session: &mut Session) -> Result<(), russh::Error> {
        warn!(
            peer = %display_addr(self.peer),
            user = %self.user.as_deref().unwrap_or("<unknown>"),
            "Refusing {} request",
            what
        );
        session.channel_failure(channel)
    }
}

/// Tear the channel down once the shell has exited
async fn watch_exit(
    shell: ShellSession,
    exit_rx: oneshot::Receiver<SessionExit>,
    handle: Handle,
    channel: ChannelId,
    user: String,
) {
    let exit = exit_rx.await.unwrap_or(SessionExit::Normal(EXIT_ERROR));
    shell.finish(SESSION_CLOSE_GRACE).await;

    if let SessionExit::Failure { message, .. } = &exit {
        let summary = CryptoVec::from_slice(format!("{}\r\n", message).as_bytes());
        let _ = handle
            .extended_data(channel, SSH_EXTENDED_DATA_STDERR, summary)
            .await;
    }

    let code = exit.code();
    info!(user = %user, code, "Shell exited");
    // Exit codes are non-negative by construction
    let _ = handle.exit_status_request(channel, code as u32).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

impl Drop for GatewayHandler {
    fn drop(&mut self) {
        self.disconnect("client disconnected");
        if let Some(watcher) = self.watcher.take() {
            reap(watcher, SESSION_CLOSE_GRACE * 2);
        }
        debug!(peer = %display_addr(self.peer), "Connection handler dropped");
    }
}

/// Let a session watcher run for up to `grace`, then abort it
fn reap(watcher: JoinHandle<()>, grace: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        watcher.abort();
        return;
    };
    let abort = watcher.abort_handle();
    runtime.spawn(async move {
        if time::timeout(grace, watcher).await.is_err() {
            warn!("Session did not close within {:?}, aborting", grace);
            abort.abort();
        }
    });
}

impl ssh_server::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let request = AuthRequest {
            username: user.to_string(),
            credential: Credential::Password(SecretString::from(password)),
        };

        match self.shared.authenticator.authenticate(request).await {
            AuthDecision::Accept => {
                info!(peer = %display_addr(self.peer), user, "Password authentication accepted");
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            AuthDecision::Reject | AuthDecision::Pending => {
                warn!(peer = %display_addr(self.peer), user, "Password authentication rejected");
                Ok(Auth::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<ssh_server::Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            debug!(peer = %display_addr(self.peer), "Refusing second session channel");
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel) {
            return session.channel_failure(channel);
        }
        if !term.is_empty() {
            self.term = term.to_string();
        }
        self.size.send_replace(TermSize {
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        });
        debug!(term, cols = col_width, rows = row_height, "PTY requested");
        session.channel_success(channel)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.is_session_channel(channel) {
            self.size.send_replace(TermSize {
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
            });
        }
        session.channel_success(channel)
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel) || self.watcher.is_some() {
            return session.channel_failure(channel);
        }
        session.channel_success(channel)?;
        self.start_shell(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "exec", session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, name, session)
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if !self.is_session_channel(channel) {
            return Ok(());
        }
        if let Some(input) = &self.input {
            if input.write(data).is_err() {
                self.input = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if self.is_session_channel(channel) {
            self.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if self.is_session_channel(channel) {
            self.disconnect("session channel closed");
            info!(
                peer = %display_addr(self.peer),
                user = %self.user.as_deref().unwrap_or("<unknown>"),
                "Session channel closed"
            );
        }
        Ok(())
    }
}

/// Display helper for log fields
pub(super) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "<unknown>".into())
}
