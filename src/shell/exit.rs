//! Exactly-once session termination

use std::error::Error;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::audit::SessionTerminator;

/// Normal termination
pub const EXIT_OK: i32 = 0;

/// Interpreter or transport failure
pub const EXIT_ERROR: i32 = 1;

/// Unknown command
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Tunnel or argument failure in `connect`
pub const EXIT_SSH_ERROR: i32 = 255;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Normal(i32),
    Failure { code: i32, message: String },
}

impl SessionExit {
    pub fn code(&self) -> i32 {
        match self {
            SessionExit::Normal(code) => *code,
            SessionExit::Failure { code, .. } => *code,
        }
    }
}

/// Single-fire termination signal for one session
///
/// The first of [`normal_exit`](Self::normal_exit) or
/// [`failure`](Self::failure) wins; every later call is a no-op.
#[derive(Debug)]
pub struct ExitHandler {
    signal: Mutex<Option<oneshot::Sender<SessionExit>>>,
}

impl ExitHandler {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<SessionExit>) {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(Self {
            signal: Mutex::new(Some(tx)),
        });
        (handler, rx)
    }

    /// Returns true if this call terminated the session
    pub fn normal_exit(&self, code: i32) -> bool {
        self.fire(SessionExit::Normal(code))
    }

    /// Terminate with [`EXIT_ERROR`] and a summary of `error` and its sources
    pub fn failure(&self, error: &dyn Error) -> bool {
        self.fire(SessionExit::Failure {
            code: EXIT_ERROR,
            message: render_error(error),
        })
    }

    pub fn has_exited(&self) -> bool {
        self.signal.lock().is_none()
    }

    fn fire(&self, exit: SessionExit) -> bool {
        let Some(signal) = self.signal.lock().take() else {
            return false;
        };
        debug!(code = exit.code(), "Session exiting");
        // The receiver may already be gone if the connection closed first
        let _ = signal.send(exit);
        true
    }
}

impl SessionTerminator for ExitHandler {
    fn terminate(&self, reason: &str) {
        let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, reason.to_string());
        self.failure(&error);
    }
}

fn render_error(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(message, "\r\n  caused by: {}", cause);
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::io;

    #[tokio::test]
    async fn test_normal_exit_fires_once() {
        let (handler, rx) = ExitHandler::new();
        assert!(!handler.has_exited());
        assert!(handler.normal_exit(EXIT_OK));
        assert!(!handler.normal_exit(3));
        assert!(handler.has_exited());
        assert_eq!(rx.await.unwrap(), SessionExit::Normal(0));
    }

    #[tokio::test]
    async fn test_failure_renders_source_chain() {
        let (handler, rx) = ExitHandler::new();
        let err = GatewayError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        assert!(handler.failure(&err));

        match rx.await.unwrap() {
            SessionExit::Failure { code, message } => {
                assert_eq!(code, EXIT_ERROR);
                assert!(message.starts_with("IO error: pipe closed"));
                assert!(message.contains("caused by: pipe closed"));
            }
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_maps_to_failure() {
        let (handler, rx) = ExitHandler::new();
        handler.terminate("audit stream failed");
        assert_eq!(rx.await.unwrap().code(), EXIT_ERROR);
    }

    #[test]
    fn test_fire_without_receiver() {
        let (handler, rx) = ExitHandler::new();
        drop(rx);
        assert!(handler.normal_exit(EXIT_OK));
        assert!(handler.has_exited());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exit_fires_exactly_once() {
        for _ in 0..50 {
            let (handler, rx) = ExitHandler::new();

            let a = {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.failure(&io::Error::new(io::ErrorKind::Other, "read failed"))
                })
            };
            let b = {
                let handler = handler.clone();
                tokio::spawn(async move { handler.normal_exit(EXIT_OK) })
            };

            let fired = [a.await.unwrap(), b.await.unwrap()];
            assert_eq!(fired.iter().filter(|f| **f).count(), 1);
            assert!(rx.await.is_ok());
        }
    }
}
