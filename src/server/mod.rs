//! Inbound SSH server
//!
//! [`SshGateway`] owns the lifecycle: audit pipeline, host key, russh
//! configuration and the accept loop. Each accepted connection gets a
//! [`GatewayHandler`] from [`GatewayServer`].

mod channel;
mod handler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::server::{self as ssh_server, Server as _};
use russh::{MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::audit::{sink_from_config, AuditService};
use crate::auth::{build_authenticator, Authenticator};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::ssh::{load_identity, load_or_generate_host_key, TunnelSettings};

pub use channel::ChannelWriter;
pub use handler::GatewayHandler;

use handler::display_addr;

/// How long `stop` lets the audit worker drain
const AUDIT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// State shared by every connection
pub(crate) struct GatewayShared {
    topology: String,
    tunnel: Arc<TunnelSettings>,
    audit: Arc<AuditService>,
    authenticator: Arc<dyn Authenticator>,
    flush_interval: Duration,
}

/// Factory invoked for every accepted connection
pub struct GatewayServer {
    shared: Arc<GatewayShared>,
}

impl ssh_server::Server for GatewayServer {
    type Handler = GatewayHandler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = %display_addr(addr), "Client connected");
        GatewayHandler::new(addr, self.shared.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as ssh_server::Handler>::Error) {
        warn!(?error, "Session ended with error");
    }
}

/// The SSH gateway
pub struct SshGateway {
    config: Arc<Config>,
    audit: Arc<AuditService>,
    authenticator: Arc<dyn Authenticator>,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SshGateway {
    /// Build the audit pipeline and authenticator from configuration
    pub fn new(config: Config) -> Result<Self> {
        let sink = sink_from_config(&config)?;
        let audit = Arc::new(AuditService::from_config(&config, sink));
        let authenticator = build_authenticator(&config, audit.clone())?;
        Ok(Self::with_components(config, audit, authenticator))
    }

    /// Use an existing audit service and authenticator
    pub fn with_components(
        config: Config,
        audit: Arc<AuditService>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            audit,
            authenticator,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn audit(&self) -> &Arc<AuditService> {
        &self.audit
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Start the audit pipeline and begin accepting connections
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.listener.lock().is_some() {
            return Err(GatewayError::config("gateway already started"));
        }

        let host_key = load_or_generate_host_key(&self.config.host_key).await?;
        let identity = load_identity(&self.config.identity_key)?;
        let tunnel = TunnelSettings::from_config(&self.config, Arc::new(identity));

        let mut server_config = ssh_server::Config {
            auth_rejection_time: Duration::from_millis(500),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            nodelay: true,
            ..Default::default()
        };
        server_config.methods = MethodSet::empty();
        server_config.methods.push(MethodKind::Password);
        server_config.keys.push(host_key);

        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        self.audit.start()?;

        let server = GatewayServer {
            shared: Arc::new(GatewayShared {
                topology: self.config.topology.clone(),
                tunnel: Arc::new(tunnel),
                audit: self.audit.clone(),
                authenticator: self.authenticator.clone(),
                flush_interval: self.config.flush_interval,
            }),
        };
        let task = tokio::spawn(accept_loop(listener, Arc::new(server_config), server));

        *self.listener.lock() = Some(task);
        *self.local_addr.lock() = Some(local_addr);
        info!(
            addr = %local_addr,
            topology = %self.config.topology,
            mode = ?self.config.auth_mode,
            "SSH gateway listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, end every open session and drain the audit pipeline
    pub async fn stop(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
            let _ = listener.await;
            info!("SSH gateway stopped accepting connections");
        }
        self.local_addr.lock().take();
        self.audit.stop(AUDIT_DRAIN_GRACE).await;
    }
}

/// Accept connections until aborted
///
/// Sessions live in the join set, so aborting this task ends them too.
async fn accept_loop(listener: TcpListener, config: Arc<ssh_server::Config>, mut server: GatewayServer) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let handler = server.new_client(Some(peer));
                let config = config.clone();
                sessions.spawn(async move {
                    match ssh_server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(e) = session.await {
                                warn!(peer = %peer, "Session error: {}", e);
                            }
                        }
                        Err(e) => warn!(peer = %peer, "Handshake failed: {}", e),
                    }
                    info!(peer = %peer, "Client disconnected");
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use russh::client;
    use russh::keys::PublicKey;
    use russh::ChannelMsg;

    use super::*;
    use crate::audit::{AuditKind, AuditOutcome, AuditSink, RecordingSink};
    use crate::config::test_config;
    use crate::ssh::connector::fake_node::start_node;

    struct AcceptAll;

    impl client::Handler for AcceptAll {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> std::result::Result<bool, Self::Error> {
            Ok(true)
        }
    }

    fn gateway(dir: &Path) -> (Arc<RecordingSink>, SshGateway) {
        let users = dir.join("users.json");
        std::fs::write(&users, r#"{"users":[{"name":"alice","password":"secret"}]}"#).unwrap();

        let mut config = test_config();
        config.host_key = dir.join("host_key");
        config.identity_key = dir.join("host_key");
        config.realm_users = Some(users);

        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn AuditSink> = sink.clone();
        let audit = Arc::new(AuditService::from_config(&config, dyn_sink));
        let authenticator = build_authenticator(&config, audit.clone()).unwrap();
        (sink, SshGateway::with_components(config, audit, authenticator))
    }

    async fn connect(addr: SocketAddr) -> client::Handle<AcceptAll> {
        let config = Arc::new(client::Config::default());
        client::connect(config, addr, AcceptAll).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_password_login_and_shell() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, gateway) = gateway(dir.path());
        let addr = gateway.start().await.unwrap();
        assert_eq!(gateway.local_addr(), Some(addr));

        let mut session = connect(addr).await;
        let auth = session.authenticate_password("alice", "secret").await.unwrap();
        assert!(auth.success());

        let mut channel = session.channel_open_session().await.unwrap();
        channel
            .request_pty(false, "xterm", 120, 40, 0, 0, &[])
            .await
            .unwrap();
        channel.request_shell(false).await.unwrap();
        channel.data(&b"exit\r"[..]).await.unwrap();

        let mut stdout = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        assert_eq!(status, Some(0));
        assert!(String::from_utf8_lossy(&stdout).starts_with("alice@sandbox > "));

        gateway.stop().await;
        let events = sink.events();
        assert_eq!(events[0].kind, AuditKind::Authentication);
        assert_eq!(events[0].outcome, AuditOutcome::Success);
        assert_eq!(events[0].user, "alice");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_password_rejected_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, gateway) = gateway(dir.path());
        let addr = gateway.start().await.unwrap();

        let mut session = connect(addr).await;
        let auth = session.authenticate_password("alice", "wrong").await.unwrap();
        assert!(!auth.success());

        gateway.stop().await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Failure);
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_mid_tunnel_closes_tunnel() {
        let (target, node) = start_node(Some(0)).await;
        let dir = tempfile::tempdir().unwrap();
        let (sink, gateway) = gateway(dir.path());
        let addr = gateway.start().await.unwrap();

        let session = {
            let mut session = connect(addr).await;
            let auth = session.authenticate_password("alice", "secret").await.unwrap();
            assert!(auth.success());
            session
        };
        let channel = session.channel_open_session().await.unwrap();
        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .unwrap();
        channel.request_shell(false).await.unwrap();
        channel
            .data(format!("connect {}\r", target).as_bytes())
            .await
            .unwrap();
        channel.data(&b"whoami\n"[..]).await.unwrap();
        eventually("input on the node", || {
            node.lock().received.windows(7).any(|w| w == b"whoami\n")
        })
        .await;

        // Gone without typing exit
        session
            .disconnect(russh::Disconnect::ByApplication, "bye", "en")
            .await
            .unwrap();
        drop(channel);
        drop(session);

        eventually("tunnel channel close", || node.lock().client_closed).await;
        let resource = target.to_string();
        eventually("logout marker", || {
            sink.events()
                .iter()
                .any(|e| e.resource == resource && e.kind == AuditKind::LoggedOut)
        })
        .await;

        let tunnel: Vec<String> = sink
            .events()
            .into_iter()
            .filter(|e| e.resource == resource)
            .map(|e| e.message)
            .collect();
        assert_eq!(tunnel.first().map(String::as_str), Some("Logged in"));
        assert!(tunnel.contains(&format!("alice@{}:whoami", resource)));
        assert_eq!(tunnel.last().map(String::as_str), Some("Logged out"));

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_sink, gateway) = gateway(dir.path());
        gateway.start().await.unwrap();
        assert!(matches!(gateway.start().await, Err(GatewayError::Config(_))));
        gateway.stop().await;
        assert_eq!(gateway.local_addr(), None);
    }
}
