//! Interactive operator console

use crate::application::AdminView;
use crate::logging::LogControl;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

const PROMPT: &str = "CLI> ";

const HELP: &str = "\
Commands:
  users | ul       show SIP accounts
  calls | cl       show active calls
  onlines | rr     show registered devices
  set debug on     enable debug logging
  set debug off    reduce logging to warnings
  show loggers     show the active log filter
  help             show this help
  exit             shut down
";

/// Outcome of one console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Continue(String),
    Exit(String),
}

pub struct Console {
    view: AdminView,
    logs: Arc<dyn LogControl>,
}

impl Console {
    pub fn new(view: AdminView, logs: Arc<dyn LogControl>) -> Self {
        Self { view, logs }
    }

    pub async fn execute(&self, line: &str) -> ConsoleAction {
        let output = match line.trim() {
            "" => String::new(),
            "users" | "ul" => self.view.render_accounts().await,
            "calls" | "cl" => self.view.render_calls().await,
            "onlines" | "rr" => self.view.render_registrations().await,
            "set debug on" => self.set_level("debug"),
            "set debug off" => self.set_level("warn"),
            "show loggers" => format!("{}\n", self.logs.current()),
            "help" => HELP.to_string(),
            "exit" => return ConsoleAction::Exit("Exiting...\n".to_string()),
            other => format!("Unknown command: {}, type 'help'\n", other),
        };
        ConsoleAction::Continue(output)
    }

    fn set_level(&self, level: &str) -> String {
        match self.logs.set_level(level) {
            Ok(()) => {
                info!("Log level set to {}", level);
                format!("Log level set to {}\n", level)
            }
            Err(e) => format!("Failed to set log level: {}\n", e),
        }
    }

    /// Read commands until `exit` or end of input
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.write_all(b"Please select a command.\n").await?;
        let mut lines = reader.lines();

        loop {
            writer.write_all(PROMPT.as_bytes()).await?;
            writer.flush().await?;

            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            match self.execute(&line).await {
                ConsoleAction::Continue(output) => writer.write_all(output.as_bytes()).await?,
                ConsoleAction::Exit(output) => {
                    writer.write_all(output.as_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }
    }
}
