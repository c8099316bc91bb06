//! Process-wide audit pipeline
//!
//! A bounded queue feeds one worker task. Events are forwarded as soon as
//! they are dequeued. Streams are read line by line, all of them at once, so
//! one long-lived tunnel never holds back another tunnel or an authentication
//! event. Each stream is bracketed by its own "Logged in" and "Logged out"
//! markers: the first is recorded when the worker picks the stream up, the
//! second once the stream has ended.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use encoding_rs::Encoding;
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::{AuditEvent, AuditSink};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::shell::io::{InputStream, LineReader};

/// Narrow capability used to end a session whose audit tap broke
pub trait SessionTerminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// One audited tunnel: its byte stream and who is behind it
pub struct AuditWork {
    /// `host:port` of the tunnel target
    pub resource: String,
    pub user: String,
    pub source: InputStream,
    pub encoding: &'static Encoding,
    pub session: Weak<dyn SessionTerminator>,
}

impl fmt::Debug for AuditWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditWork")
            .field("resource", &self.resource)
            .field("user", &self.user)
            .field("encoding", &self.encoding.name())
            .finish_non_exhaustive()
    }
}

enum AuditItem {
    Marker(AuditEvent),
    Stream(AuditWork),
}

impl AuditItem {
    fn describe(&self) -> String {
        match self {
            AuditItem::Marker(event) => format!("marker '{}' for {}", event.message, event.user),
            AuditItem::Stream(work) => format!("stream {}@{}", work.user, work.resource),
        }
    }
}

/// Audit queue and its worker
pub struct AuditService {
    sink: Arc<dyn AuditSink>,
    capacity: usize,
    submit_timeout: Duration,
    queue: Mutex<Option<mpsc::Sender<AuditItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    dropped: AtomicU64,
}

impl AuditService {
    pub fn new(sink: Arc<dyn AuditSink>, capacity: usize, submit_timeout: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            sink,
            capacity: capacity.max(1),
            submit_timeout,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            stop,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config, sink: Arc<dyn AuditSink>) -> Self {
        Self::new(sink, config.audit_queue_size, config.audit_submit_timeout)
    }

    /// Create the queue and spawn the worker
    pub fn start(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.is_some() {
            return Err(GatewayError::config("audit pipeline already started"));
        }

        self.stop.send_replace(false);
        let (tx, rx) = mpsc::channel(self.capacity);
        let worker = AuditWorker {
            sink: self.sink.clone(),
            rx,
            stop: self.stop.subscribe(),
        };
        *self.worker.lock() = Some(tokio::spawn(worker.run()));
        *queue = Some(tx);

        info!(capacity = self.capacity, "Audit pipeline started");
        Ok(())
    }

    /// Queue a tunnel stream for transcript auditing
    pub async fn submit(&self, work: AuditWork) -> Result<()> {
        self.enqueue(AuditItem::Stream(work)).await
    }

    /// Queue a single event
    pub async fn record_event(&self, event: AuditEvent) -> Result<()> {
        self.enqueue(AuditItem::Marker(event)).await
    }

    /// Number of items dropped because the queue stayed full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.queue.lock().is_some()
    }

    async fn enqueue(&self, item: AuditItem) -> Result<()> {
        let queue = self.queue.lock().clone();
        let Some(queue) = queue else {
            return Err(GatewayError::audit_unavailable("audit pipeline is not running"));
        };

        match queue.send_timeout(item, self.submit_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Audit queue full, dropping {}", item.describe());
                Err(GatewayError::audit_unavailable(format!(
                    "audit queue full after {}ms",
                    self.submit_timeout.as_millis()
                )))
            }
            Err(SendTimeoutError::Closed(item)) => {
                warn!("Audit pipeline stopped, dropping {}", item.describe());
                Err(GatewayError::audit_unavailable("audit pipeline stopped"))
            }
        }
    }

    /// Close the queue and wait for the worker
    ///
    /// Queued items and open streams are drained for up to `grace`; after
    /// that the stop flag is raised and any stream still open is abandoned.
    pub async fn stop(&self, grace: Duration) {
        self.queue.lock().take();
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };

        if time::timeout(grace, &mut worker).await.is_err() {
            warn!("Audit worker still busy after {:?}, stopping", grace);
            self.stop.send_replace(true);
            if let Err(e) = worker.await {
                error!("Audit worker failed: {}", e);
            }
        }
        info!(dropped = self.dropped_count(), "Audit pipeline stopped");
    }
}

impl fmt::Debug for AuditService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditService")
            .field("capacity", &self.capacity)
            .field("submit_timeout", &self.submit_timeout)
            .field("dropped", &self.dropped_count())
            .finish_non_exhaustive()
    }
}

struct AuditWorker {
    sink: Arc<dyn AuditSink>,
    rx: mpsc::Receiver<AuditItem>,
    stop: watch::Receiver<bool>,
}

impl AuditWorker {
    async fn run(mut self) {
        let mut streams: SelectAll<BoxStream<'static, AuditEvent>> = SelectAll::new();
        let mut accepting = true;

        while accepting || !streams.is_empty() {
            tokio::select! {
                _ = self.stop.changed() => {
                    if !streams.is_empty() {
                        warn!(open = streams.len(), "Audit worker stopping with open streams");
                    }
                    break;
                }
                item = self.rx.recv(), if accepting => match item {
                    Some(AuditItem::Marker(event)) => self.sink.record(event),
                    Some(AuditItem::Stream(work)) => {
                        self.sink.record(AuditEvent::logged_in(&work.user, &work.resource));
                        streams.push(Transcript::new(work).into_events());
                    }
                    None => accepting = false,
                },
                Some(event) = streams.next(), if !streams.is_empty() => self.sink.record(event),
            }
        }
        debug!("Audit worker exiting");
    }
}

/// Line-by-line reader of one tunnel stream
struct Transcript {
    reader: LineReader<InputStream>,
    resource: String,
    user: String,
    encoding: &'static Encoding,
    session: Weak<dyn SessionTerminator>,
}

impl Transcript {
    fn new(work: AuditWork) -> Self {
        Self {
            reader: LineReader::transcript(work.source),
            resource: work.resource,
            user: work.user,
            encoding: work.encoding,
            session: work.session,
        }
    }

    /// Transcript lines in read order, then the "Logged out" marker
    fn into_events(self) -> BoxStream<'static, AuditEvent> {
        stream::unfold(Some(self), |state| async move {
            let mut transcript = state?;
            match transcript.next_line().await {
                Some(event) => Some((event, Some(transcript))),
                None => {
                    let closing = AuditEvent::logged_out(&transcript.user, &transcript.resource);
                    Some((closing, None))
                }
            }
        })
        .boxed()
    }

    /// Next non-empty line; `None` at end of stream or after a read failure
    async fn next_line(&mut self) -> Option<AuditEvent> {
        loop {
            match self.reader.read_line().await {
                Ok(Some(bytes)) if bytes.is_empty() => continue,
                Ok(Some(bytes)) => {
                    let (text, _) = self.encoding.decode_without_bom_handling(&bytes);
                    return Some(AuditEvent::transcript(&self.user, &self.resource, &text));
                }
                Ok(None) => return None,
                Err(e) => {
                    error!(user = %self.user, resource = %self.resource, "Audit stream failed: {}", e);
                    if let Some(session) = self.session.upgrade() {
                        session.terminate(&format!("audit stream failed: {}", e));
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditKind, RecordingSink};
    use crate::shell::io::pipe;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTerminator {
        calls: AtomicUsize,
    }

    impl SessionTerminator for CountingTerminator {
        fn terminate(&self, _reason: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn work(user: &str, resource: &str, source: InputStream, session: &Arc<CountingTerminator>) -> AuditWork {
        let session = Arc::downgrade(session);
        let session: Weak<dyn SessionTerminator> = session;
        AuditWork {
            resource: resource.to_string(),
            user: user.to_string(),
            source,
            encoding: encoding_rs::UTF_8,
            session,
        }
    }

    fn service(sink: &Arc<RecordingSink>, capacity: usize, timeout_ms: u64) -> AuditService {
        let sink: Arc<dyn AuditSink> = sink.clone();
        AuditService::new(sink, capacity, Duration::from_millis(timeout_ms))
    }

    /// Messages recorded for one resource, in order
    fn messages_for(sink: &RecordingSink, resource: &str) -> Vec<String> {
        sink.events()
            .into_iter()
            .filter(|e| e.resource == resource)
            .map(|e| e.message)
            .collect()
    }

    async fn wait_until(sink: &RecordingSink, done: impl Fn(&RecordingSink) -> bool) {
        let waited = time::timeout(Duration::from_secs(2), async {
            while !done(sink) {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "audit events not recorded: {:?}", sink.messages());
    }

    #[tokio::test]
    async fn test_streams_are_bracketed_by_markers() {
        let sink = Arc::new(RecordingSink::default());
        let audit = service(&sink, 8, 500);
        audit.start().unwrap();

        let session = Arc::new(CountingTerminator::default());
        audit
            .submit(work(
                "alice",
                "node1:22",
                Box::new(&b"whoami\r\n\r\nexit\r\n"[..]),
                &session,
            ))
            .await
            .unwrap();
        audit
            .submit(work("bob", "node2:2222", Box::new(&b"pwd\n"[..]), &session))
            .await
            .unwrap();
        audit.stop(Duration::from_secs(5)).await;

        assert_eq!(
            messages_for(&sink, "node1:22"),
            vec!["Logged in", "alice@node1:22:whoami", "alice@node1:22:exit", "Logged out"]
        );
        assert_eq!(
            messages_for(&sink, "node2:2222"),
            vec!["Logged in", "bob@node2:2222:pwd", "Logged out"]
        );
        assert_eq!(session.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_stream_does_not_hold_back_others() {
        let sink = Arc::new(RecordingSink::default());
        let audit = service(&sink, 4, 100);
        audit.start().unwrap();
        let session = Arc::new(CountingTerminator::default());

        // Stays open for the whole test
        let (_idle_writer, idle) = pipe();
        audit
            .submit(work("alice", "node1:22", Box::new(idle), &session))
            .await
            .unwrap();

        let (writer, reader) = pipe();
        audit
            .submit(work("bob", "node2:22", Box::new(reader), &session))
            .await
            .unwrap();
        writer.write(b"rm -rf /data\n").unwrap();
        drop(writer);

        for user in ["mallory", "eve", "trudy", "oscar", "peggy"] {
            audit
                .record_event(AuditEvent::authentication(user, false))
                .await
                .unwrap();
        }

        wait_until(&sink, |sink| {
            messages_for(sink, "node2:22").last().map(String::as_str) == Some("Logged out")
                && sink.events().iter().filter(|e| e.kind == AuditKind::Authentication).count() == 5
        })
        .await;

        assert_eq!(
            messages_for(&sink, "node2:22"),
            vec!["Logged in", "bob@node2:22:rm -rf /data", "Logged out"]
        );
        assert_eq!(messages_for(&sink, "node1:22"), vec!["Logged in"]);

        // The queue keeps draining while the first tunnel is open
        audit
            .submit(work("carol", "node3:22", Box::new(&b"ls\n"[..]), &session))
            .await
            .unwrap();
        assert_eq!(audit.dropped_count(), 0);

        audit.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_failed_stream_terminates_only_its_session() {
        let sink = Arc::new(RecordingSink::default());
        let audit = service(&sink, 8, 500);
        audit.start().unwrap();

        let (writer, reader) = pipe();
        writer.write(b"rm -rf").unwrap();
        writer.fail(io::Error::new(io::ErrorKind::ConnectionReset, "tap broken"));

        let broken = Arc::new(CountingTerminator::default());
        let healthy = Arc::new(CountingTerminator::default());
        audit
            .submit(work("mallory", "node1:22", Box::new(reader), &broken))
            .await
            .unwrap();
        audit
            .submit(work("alice", "node2:22", Box::new(&b"uptime\n"[..]), &healthy))
            .await
            .unwrap();
        audit.stop(Duration::from_secs(5)).await;

        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(messages_for(&sink, "node1:22"), vec!["Logged in", "Logged out"]);
        assert_eq!(
            messages_for(&sink, "node2:22"),
            vec!["Logged in", "alice@node2:22:uptime", "Logged out"]
        );
    }

    /// Sink that blocks the worker while the test holds its gate
    #[derive(Default)]
    struct GatedSink {
        gate: std::sync::Mutex<()>,
        entered: AtomicUsize,
        inner: RecordingSink,
    }

    impl AuditSink for GatedSink {
        fn record(&self, event: AuditEvent) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let _open = self.gate.lock().unwrap();
            self.inner.record(event);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_and_counts() {
        let sink = Arc::new(GatedSink::default());
        let shared: Arc<dyn AuditSink> = sink.clone();
        let audit = AuditService::new(shared, 1, Duration::from_millis(50));
        audit.start().unwrap();

        let gate = sink.gate.lock().unwrap();
        audit
            .record_event(AuditEvent::authentication("alice", true))
            .await
            .unwrap();
        while sink.entered.load(Ordering::SeqCst) == 0 {
            time::sleep(Duration::from_millis(5)).await;
        }

        // The worker is stuck in the sink; one slot left
        audit
            .record_event(AuditEvent::authentication("bob", true))
            .await
            .unwrap();
        let err = audit
            .record_event(AuditEvent::authentication("carol", true))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuditUnavailable(_)));
        assert_eq!(audit.dropped_count(), 1);

        drop(gate);
        audit.stop(Duration::from_secs(5)).await;
        let users: Vec<String> = sink.inner.events().into_iter().map(|e| e.user).collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_submit_before_start_fails() {
        let sink = Arc::new(RecordingSink::default());
        let audit = service(&sink, 4, 50);
        let err = audit
            .record_event(AuditEvent::authentication("alice", true))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuditUnavailable(_)));
        assert!(!audit.is_running());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let audit = service(&sink, 4, 50);
        audit.start().unwrap();
        assert!(audit.start().is_err());
        audit.stop(Duration::from_millis(100)).await;
        assert!(!audit.is_running());
    }
}
