//! Shell command table and the built-in commands

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use super::exit::{ExitHandler, EXIT_COMMAND_NOT_FOUND, EXIT_OK};
use super::io::{InputStream, LineReader, SharedOutput};
use super::ShellContext;
use crate::ssh::ConnectCommand;

/// Streams a command runs against
pub struct ShellIo {
    pub input: LineReader<InputStream>,
    pub out: SharedOutput,
    pub err: SharedOutput,
}

/// A shell command
///
/// `handle` returns the command's exit code. An `Err` is a stream failure
/// and ends the session.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Argument grammar shown by `help`
    fn args(&self) -> &str {
        ""
    }

    fn description(&self) -> &str;

    async fn handle(&self, command: &str, remainder: &str, io: &mut ShellIo) -> io::Result<i32>;
}

/// Commands available in a session, keyed by their token
pub struct CommandTable {
    commands: BTreeMap<String, Arc<dyn Command>>,
    fallback: Arc<dyn Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
            fallback: Arc::new(UnknownCommand),
        }
    }

    /// The `connect`, `help` and `exit` commands
    pub fn standard(ctx: &Arc<ShellContext>, exit: &Arc<ExitHandler>) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(ConnectCommand::new(ctx.clone(), exit.clone())));
        table.register(Arc::new(ExitCommand::new(exit.clone())));

        let help = HelpCommand::new(&table);
        table.register(Arc::new(help));
        table
    }

    pub fn register(&mut self, command: Arc<dyn Command>) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// Case-sensitive lookup, falling back to the unknown-command handler
    pub fn lookup(&self, token: &str) -> Arc<dyn Command> {
        self.commands
            .get(token)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn commands(&self) -> impl Iterator<Item = &Arc<dyn Command>> {
        self.commands.values()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback for any token without a registered command
pub struct UnknownCommand;

#[async_trait]
impl Command for UnknownCommand {
    fn name(&self) -> &str {
        ""
    }

    fn description(&self) -> &str {
        "Unknown command"
    }

    async fn handle(&self, command: &str, _remainder: &str, io: &mut ShellIo) -> io::Result<i32> {
        io.err
            .write_line(&format!("-knox: {}: command not found", command))
            .await?;
        io.err
            .write_line("Type 'help' for the list of available commands.")
            .await?;
        Ok(EXIT_COMMAND_NOT_FOUND)
    }
}

/// Lists the commands, column aligned
pub struct HelpCommand {
    rows: Vec<(String, String, String)>,
}

impl HelpCommand {
    /// Snapshot of `table` plus the help command itself
    pub fn new(table: &CommandTable) -> Self {
        let mut rows: Vec<(String, String, String)> = table
            .commands()
            .map(|c| (c.name().to_string(), c.args().to_string(), c.description().to_string()))
            .collect();
        rows.push((
            "help".to_string(),
            String::new(),
            "Show this list of commands".to_string(),
        ));
        rows.sort();
        Self { rows }
    }

    fn render(&self) -> Vec<String> {
        let name_width = self.rows.iter().map(|r| r.0.len()).max().unwrap_or(0);
        let args_width = self.rows.iter().map(|r| r.1.len()).max().unwrap_or(0);
        self.rows
            .iter()
            .map(|(name, args, description)| {
                format!(
                    "{:name_width$}  {:args_width$}  {}",
                    name,
                    args,
                    description,
                    name_width = name_width,
                    args_width = args_width
                )
            })
            .collect()
    }
}

#[async_trait]
impl Command for HelpCommand {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "Show this list of commands"
    }

    async fn handle(&self, _command: &str, _remainder: &str, io: &mut ShellIo) -> io::Result<i32> {
        for line in self.render() {
            io.out.write_line(&line).await?;
        }
        Ok(EXIT_OK)
    }
}

/// Ends the session
pub struct ExitCommand {
    exit: Arc<ExitHandler>,
}

impl ExitCommand {
    pub fn new(exit: Arc<ExitHandler>) -> Self {
        Self { exit }
    }
}

#[async_trait]
impl Command for ExitCommand {
    fn name(&self) -> &str {
        "exit"
    }

    fn description(&self) -> &str {
        "Close the session"
    }

    async fn handle(&self, _command: &str, _remainder: &str, _io: &mut ShellIo) -> io::Result<i32> {
        self.exit.normal_exit(EXIT_OK);
        Ok(EXIT_OK)
    }
}
