//! Audit trail
//!
//! Audit events describe who did what through the gateway: authentication
//! results, the login/logout markers bounding each tunnel, and every line of
//! transcript typed into a tunnel. Events are produced by the [`AuditService`]
//! worker and handed to an [`AuditSink`], which is the only durable part of the
//! trail and lives outside this crate's concern.

pub mod pipeline;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};

pub use pipeline::{AuditService, AuditWork, SessionTerminator};

/// Marker recorded when a tunnel is established
pub const LOGGED_IN: &str = "Logged in";

/// Marker recorded when a tunnel is torn down
pub const LOGGED_OUT: &str = "Logged out";

/// What an audit event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Authentication,
    LoggedIn,
    LoggedOut,
    Transcript,
}

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub outcome: AuditOutcome,
    pub user: String,
    /// `host:port` of the tunnel target, empty for authentication events
    pub resource: String,
    pub message: String,
}

impl AuditEvent {
    fn new(
        kind: AuditKind,
        outcome: AuditOutcome,
        user: &str,
        resource: &str,
        message: String,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            outcome,
            user: user.to_string(),
            resource: resource.to_string(),
            message,
        }
    }

    /// Principal authentication result
    pub fn authentication(user: &str, success: bool) -> Self {
        let (outcome, message) = if success {
            (AuditOutcome::Success, "principal authentication succeeded")
        } else {
            (AuditOutcome::Failure, "principal authentication failed")
        };
        Self::new(AuditKind::Authentication, outcome, user, "", message.to_string())
    }

    pub fn logged_in(user: &str, resource: &str) -> Self {
        Self::new(
            AuditKind::LoggedIn,
            AuditOutcome::Success,
            user,
            resource,
            LOGGED_IN.to_string(),
        )
    }

    pub fn logged_out(user: &str, resource: &str) -> Self {
        Self::new(
            AuditKind::LoggedOut,
            AuditOutcome::Success,
            user,
            resource,
            LOGGED_OUT.to_string(),
        )
    }

    /// One transcript line, formatted as `<user>@<resource>:<line>`
    pub fn transcript(user: &str, resource: &str, line: &str) -> Self {
        Self::new(
            AuditKind::Transcript,
            AuditOutcome::Success,
            user,
            resource,
            format!("{}@{}:{}", user, resource, line),
        )
    }
}

/// Destination of audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Sink that writes events to the `audit` tracing target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            kind = ?event.kind,
            outcome = ?event.outcome,
            user = %event.user,
            resource = %event.resource,
            "{}",
            event.message
        );
    }
}

/// Sink that appends one JSON document per event to a file
pub struct JsonLinesAuditSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesAuditSink {
    /// Open (or create) the audit log for appending
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut writer = self.writer.lock();
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!("Failed to write audit event: {}", e);
        }
    }
}

impl std::fmt::Debug for JsonLinesAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesAuditSink").finish_non_exhaustive()
    }
}

/// Sink selected by configuration: the audit log file if one is set,
/// otherwise the `audit` tracing target
pub fn sink_from_config(config: &Config) -> Result<Arc<dyn AuditSink>> {
    match &config.audit_log {
        Some(path) => {
            let sink = JsonLinesAuditSink::open(path).map_err(|e| {
                GatewayError::config(format!("Failed to open audit log {}: {}", path.display(), e))
            })?;
            info!("Writing audit events to {}", path.display());
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingAuditSink)),
    }
}

/// In-memory sink for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }
}

#[cfg(test)]
impl AuditSink for RecordingSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_format() {
        let event = AuditEvent::transcript("guest", "node1:22", "ls -la");
        assert_eq!(event.message, "guest@node1:22:ls -la");
        assert_eq!(event.kind, AuditKind::Transcript);
        assert_eq!(event.resource, "node1:22");
    }

    #[test]
    fn test_markers() {
        assert_eq!(AuditEvent::logged_in("guest", "node1:22").message, "Logged in");
        assert_eq!(AuditEvent::logged_out("guest", "node1:22").message, "Logged out");
    }

    #[test]
    fn test_authentication_outcome() {
        let ok = AuditEvent::authentication("guest", true);
        assert_eq!(ok.outcome, AuditOutcome::Success);
        let failed = AuditEvent::authentication("guest", false);
        assert_eq!(failed.outcome, AuditOutcome::Failure);
        assert_eq!(failed.kind, AuditKind::Authentication);
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let sink = JsonLinesAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::logged_in("guest", "node1:22"));
        sink.record(AuditEvent::transcript("guest", "node1:22", "whoami"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "transcript");
        assert_eq!(second["message"], "guest@node1:22:whoami");
    }

    #[test]
    fn test_sink_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::test_config();
        assert!(sink_from_config(&config).is_ok());

        let path = dir.path().join("audit.log");
        config.audit_log = Some(path.clone());
        let sink = sink_from_config(&config).unwrap();
        sink.record(AuditEvent::authentication("guest", true));
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"authentication\""));

        config.audit_log = Some(dir.path().join("missing").join("audit.log"));
        assert!(matches!(sink_from_config(&config), Err(GatewayError::Config(_))));
    }
}
