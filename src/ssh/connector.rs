//! Outbound tunnel (`connect` command)
//!
//! Opens an SSH session to a node inside the protected network as the
//! gateway's tunnel user, optionally switches identity on the remote side,
//! and relays the caller's terminal until the remote shell closes. Every
//! byte sent to the node passes through an audit tap first; the audit worker
//! brackets the tapped transcript with "Logged in" and "Logged out" markers,
//! and the closing marker follows the tap however the relay ends.

use std::io::{self, Cursor};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use tokio::io::{AsyncRead, AsyncReadExt, Chain};
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::elevation::render_login_command;
use super::handler::TunnelHandler;
use super::target::{parse_target, Target};
use crate::audit::{AuditWork, SessionTerminator};
use crate::error::{GatewayError, Result};
use crate::shell::commands::{Command, ShellIo};
use crate::shell::exit::{ExitHandler, EXIT_SSH_ERROR};
use crate::shell::io::{tap, SharedOutput, TapWriter, TeeReader};
use crate::shell::{ShellContext, TermSize};

/// Terminal modes requested on the remote PTY
const TUNNEL_PTY_MODES: [(Pty, u32); 4] = [
    (Pty::ECHO, 1),
    (Pty::ICANON, 1),
    (Pty::VEOL, b'\r' as u32),
    (Pty::ICRNL, 1),
];

const RELAY_BUFFER_SIZE: usize = 8192;

/// Relay chunks the audit tap may hold before the relay waits for the worker
const TAP_CAPACITY: usize = 64;

/// The `connect <host>[:<port>]` command
pub struct ConnectCommand {
    ctx: Arc<ShellContext>,
    exit: Arc<ExitHandler>,
}

impl ConnectCommand {
    pub fn new(ctx: Arc<ShellContext>, exit: Arc<ExitHandler>) -> Self {
        Self { ctx, exit }
    }

    /// Connect, relay, and release the session on every path
    async fn tunnel(&self, target: &Target, io: &mut ShellIo) -> Result<i32> {
        let prefix = match &self.ctx.tunnel.login_command {
            Some(template) => render_login_command(template, &self.ctx.user)?.into_bytes(),
            None => Vec::new(),
        };

        let session = self.establish(target).await?;
        info!(user = %self.ctx.user, target = %target, "Tunnel established");

        let outcome = self.open_and_relay(&session, target, prefix, io).await;

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            debug!(target = %target, "Disconnect failed: {}", e);
        }
        info!(user = %self.ctx.user, target = %target, "Tunnel closed");
        outcome
    }

    /// Resolve, connect and authenticate within the connect timeout
    async fn establish(&self, target: &Target) -> Result<Handle<TunnelHandler>> {
        let settings = &self.ctx.tunnel;
        match timeout(settings.connect_timeout, self.connect_and_authenticate(target)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(settings.timeout_ms())),
        }
    }

    async fn connect_and_authenticate(&self, target: &Target) -> Result<Handle<TunnelHandler>> {
        let settings = &self.ctx.tunnel;

        let addr = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| GatewayError::connection(format!("cannot resolve {}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| GatewayError::connection(format!("no address for {}", target.host)))?;
        debug!(target = %target, %addr, "Connecting");

        let config = Arc::new(client::Config {
            nodelay: true,
            ..Default::default()
        });
        let mut session = client::connect(config, addr, TunnelHandler::new(target.to_string()))
            .await
            .map_err(|e| GatewayError::connection(e.to_string()))?;

        let key = PrivateKeyWithHashAlg::new(settings.identity.clone(), None);
        let auth = session
            .authenticate_publickey(&settings.tunnel_user, key)
            .await
            .map_err(|e| GatewayError::auth(e.to_string()))?;
        if !auth.success() {
            return Err(GatewayError::auth(format!(
                "public key for '{}' rejected",
                settings.tunnel_user
            )));
        }

        Ok(session)
    }

    async fn open_channel(
        &self,
        session: &Handle<TunnelHandler>,
        size: TermSize,
    ) -> Result<Channel<client::Msg>> {
        let channel = session.channel_open_session().await?;
        channel
            .request_pty(
                true,
                &self.ctx.terminal.term,
                size.cols,
                size.rows,
                size.pix_width,
                size.pix_height,
                &TUNNEL_PTY_MODES,
            )
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    async fn open_and_relay(
        &self,
        session: &Handle<TunnelHandler>,
        target: &Target,
        prefix: Vec<u8>,
        io: &mut ShellIo,
    ) -> Result<i32> {
        let settings = &self.ctx.tunnel;
        let mut size = self.ctx.terminal.size.clone();
        let initial = *size.borrow_and_update();

        let mut channel = match timeout(settings.connect_timeout, self.open_channel(session, initial)).await {
            Ok(channel) => channel?,
            Err(_) => return Err(GatewayError::Timeout(settings.timeout_ms())),
        };

        let outcome = self
            .audited_relay(&mut channel, target, prefix, io, &mut size)
            .await;

        if let Err(e) = channel.eof().await {
            debug!(target = %target, "Channel eof failed: {}", e);
        }
        if let Err(e) = channel.close().await {
            debug!(target = %target, "Channel close failed: {}", e);
        }
        outcome
    }

    async fn audited_relay(
        &self,
        channel: &mut Channel<client::Msg>,
        target: &Target,
        prefix: Vec<u8>,
        io: &mut ShellIo,
        size: &mut watch::Receiver<TermSize>,
    ) -> Result<i32> {
        let audit = &self.ctx.audit;
        let user = self.ctx.user.as_str();
        let resource = target.to_string();

        let (writer, tapped) = tap(TAP_CAPACITY);
        let session = Arc::downgrade(&self.exit);
        let session: Weak<dyn SessionTerminator> = session;
        let work = AuditWork {
            resource: resource.clone(),
            user: user.to_string(),
            source: Box::new(tapped),
            encoding: self.ctx.tunnel.audit_encoding,
            session,
        };

        // Refused work means no relay at all
        audit.submit(work).await?;

        let source = command_stream(prefix, io.input.raw(), writer);
        let status = relay(
            channel,
            source,
            &io.out,
            &io.err,
            size,
            &self.ctx.disconnected,
        )
        .await?;
        debug!(user, resource = %resource, ?status, "Relay finished");
        Ok(status.map_or(EXIT_SSH_ERROR, |code| code as i32))
    }
}

#[async_trait]
impl Command for ConnectCommand {
    fn name(&self) -> &str {
        "connect"
    }

    fn args(&self) -> &str {
        "<host>[:<port>]"
    }

    fn description(&self) -> &str {
        "Open a shell on a cluster node"
    }

    async fn handle(&self, _command: &str, remainder: &str, io: &mut ShellIo) -> std::io::Result<i32> {
        let target = match parse_target(remainder) {
            Ok(target) => target,
            Err(e) => {
                io.err.write_line(&format!("connect: {}", e)).await?;
                io.err.write_line("usage: connect <host>[:<port>]").await?;
                return Ok(EXIT_SSH_ERROR);
            }
        };

        match self.tunnel(&target, io).await {
            Ok(code) => Ok(code),
            Err(GatewayError::Io(e)) => Err(e),
            Err(e) => {
                warn!(user = %self.ctx.user, target = %target, "Tunnel failed: {}", e);
                io.err.write_line(&failure_message(&target, &e)).await?;
                Ok(EXIT_SSH_ERROR)
            }
        }
    }
}

/// User-facing text for a failed tunnel
fn failure_message(target: &Target, error: &GatewayError) -> String {
    match error {
        GatewayError::Timeout(ms) => format!("Connection to {} timed out after {}ms", target, ms),
        GatewayError::Unauthorized(msg) => format!("Access to {} denied: {}", target, msg),
        GatewayError::AuditUnavailable(msg) => {
            format!("Connection to {} aborted: audit unavailable ({})", target, msg)
        }
        GatewayError::InvalidParams(msg) => format!("connect: {}", msg),
        GatewayError::Connection(msg) => format!("Connection to {} failed: {}", target, msg),
        other => format!("Connection to {} failed: {}", target, other),
    }
}

/// The bytes sent to the node: the login prefix, then the caller's input
///
/// Everything read is copied into `tap` for auditing.
pub(crate) fn command_stream<R>(
    prefix: Vec<u8>,
    input: R,
    tap: TapWriter,
) -> TeeReader<Chain<Cursor<Vec<u8>>, R>>
where
    R: AsyncRead + Unpin,
{
    TeeReader::new(Cursor::new(prefix).chain(input), tap)
}

/// Pump bytes both ways until the remote channel closes
///
/// Returns the remote exit status, if one was sent. Fails once `disconnected`
/// is cancelled. `source` is dropped on return, which ends the audited
/// transcript.
async fn relay<R>(
    channel: &mut Channel<client::Msg>,
    mut source: R,
    out: &SharedOutput,
    err: &SharedOutput,
    size: &mut watch::Receiver<TermSize>,
    disconnected: &CancellationToken,
) -> Result<Option<u32>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut input_open = true;
    let mut resize_open = true;
    let mut exit_status = None;

    loop {
        tokio::select! {
            _ = disconnected.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client disconnected").into());
            }
            read = source.read(&mut buf), if input_open => {
                match read? {
                    0 => {
                        input_open = false;
                        channel.eof().await?;
                    }
                    n => channel.data(&buf[..n]).await?,
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    out.write_all(&data).await?;
                    out.flush().await?;
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    err.write_all(&data).await?;
                    err.flush().await?;
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            changed = size.changed(), if resize_open => match changed {
                Ok(()) => {
                    let new_size = *size.borrow_and_update();
                    channel
                        .window_change(new_size.cols, new_size.rows, new_size.pix_width, new_size.pix_height)
                        .await?;
                }
                Err(_) => resize_open = false,
            },
        }
    }

    Ok(exit_status)
}
