//! Read-dispatch loop of a session

use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use super::commands::{CommandTable, ShellIo};
use super::exit::{ExitHandler, EXIT_OK};

pub struct Interpreter {
    user: String,
    prompt: String,
    commands: CommandTable,
    exit: Arc<ExitHandler>,
}

impl Interpreter {
    pub fn new(user: &str, topology: &str, commands: CommandTable, exit: Arc<ExitHandler>) -> Self {
        Self {
            user: user.to_string(),
            prompt: format!("{}@{} > ", user, topology),
            commands,
            exit,
        }
    }

    /// Run until end of input, `exit`, or a stream failure
    ///
    /// Always reports the outcome through the exit handler and closes both
    /// output streams.
    pub async fn run(self, mut io: ShellIo) {
        match self.interpret(&mut io).await {
            Ok(code) => {
                self.exit.normal_exit(code);
            }
            Err(e) => {
                warn!(user = %self.user, "Session I/O failed: {}", e);
                self.exit.failure(&e);
            }
        }

        if let Err(e) = io.out.shutdown().await {
            debug!("Closing output failed: {}", e);
        }
        if let Err(e) = io.err.shutdown().await {
            debug!("Closing error output failed: {}", e);
        }
    }

    async fn interpret(&self, io: &mut ShellIo) -> io::Result<i32> {
        let mut last = EXIT_OK;

        while !self.exit.has_exited() {
            io.out.write_str(&self.prompt).await?;
            io.out.flush().await?;

            let Some(line) = io.input.read_line().await? else {
                break;
            };
            io.out.write_all(b"\r\n").await?;

            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (command, remainder) = match line.split_once(' ') {
                Some((command, remainder)) => (command, remainder.trim_start()),
                None => (line, ""),
            };
            debug!(user = %self.user, command, "Dispatching command");

            last = self
                .commands
                .lookup(command)
                .handle(command, remainder, io)
                .await?;
            io.out.flush().await?;
            io.err.flush().await?;
        }

        Ok(last)
    }
}
