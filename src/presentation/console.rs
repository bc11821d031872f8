//! Terminal front end
//!
//! A status line, the latest inbound text, a send box (every non-command
//! line) and a connect button (`/connect`).

use crate::domain::error::SessionError;
use crate::domain::models::{
    Alert, AppEvent, MessageSeverity, SendOutcome, SessionState, StatusMessage,
};
use crate::infrastructure::bluetooth::peripheral::PeripheralDirectory;
use crate::infrastructure::bluetooth::{SessionConfig, SessionManager};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const BELL: char = '\u{7}';

pub const HELP: &str = "Commands: /connect, /status, /retry, /help, /quit. Anything else is sent.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Status,
    Retry,
    Help,
    Quit,
    Send(String),
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        // Whitespace-only lines are sent
        if line.is_empty() {
            return Self::Empty;
        }
        match line.trim() {
            "/connect" => Self::Connect,
            "/status" => Self::Status,
            "/retry" => Self::Retry,
            "/help" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            // Outbound text keeps its own whitespace
            _ => Self::Send(line.to_string()),
        }
    }
}

/// Render an event as one terminal line; `None` for events with no output
pub fn format_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::StateChanged { status, .. } => Some(format!("[status] {}", status)),
        AppEvent::MessageReceived(text) => Some(format!("<< {}", text)),
        AppEvent::LogMessage(StatusMessage { message, severity }) => match severity {
            // Info lines already reach the log
            MessageSeverity::Info => None,
            MessageSeverity::Success => Some(format!("[ok] {}", message)),
            MessageSeverity::Warning => Some(format!("[warn] {}", message)),
            MessageSeverity::Error => Some(format!("[error] {}", message)),
        },
        AppEvent::Alert(Alert::Disconnected) => {
            Some(format!("{}*** Device disconnected ***", BELL))
        }
    }
}

fn describe_send(outcome: SendOutcome) -> Option<String> {
    match outcome {
        SendOutcome::Sent(mode) => Some(format!(">> sent ({})", mode)),
        SendOutcome::NotReady => Some("Not connected. Use /connect first.".to_string()),
        SendOutcome::Empty => None,
    }
}

fn print_line(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn print_status(manager: &SessionManager) {
    let snapshot = manager.snapshot();
    print_line(&format!("Status: {}", snapshot.status));
    if let Some(device) = &snapshot.device_name {
        print_line(&format!("Device: {}", device));
    }
    let listening_on = snapshot
        .notify_endpoint
        .as_ref()
        .filter(|_| snapshot.state.is_listening());
    if let Some(notify) = listening_on {
        print_line(&format!("Notify: {}", notify));
    }
    if let (Some(write), Some(mode)) = (&snapshot.write_endpoint, snapshot.write_mode) {
        print_line(&format!("Write: {} ({})", write, mode));
    }
    print_line(&format!("Latest: {}", snapshot.latest_inbound));
    if let Some(pending) = &snapshot.pending_outbound {
        print_line(&format!("Pending: {}", pending));
    }
}

fn spawn_send(manager: &SessionManager, text: Option<String>) {
    let manager = manager.clone();
    tokio::spawn(async move {
        let result = match text {
            Some(text) => manager.send(&text).await,
            None => manager.send_pending().await,
        };
        match result {
            Ok(outcome) => {
                if let Some(line) = describe_send(outcome) {
                    print_line(&line);
                }
            }
            // Already reported on the event channel
            Err(e) => debug!("Send finished with error: {}", e),
        }
    });
}

/// Run the console until `/quit` or end of input
pub async fn run(
    directory: Arc<dyn PeripheralDirectory>,
    config: SessionConfig,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let manager = SessionManager::new(directory, config, event_tx);

    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(line) = format_event(&event) {
                print_line(&line);
            }
        }
    });

    print_line(HELP);
    print_line(&format!("Status: {}", SessionState::Idle));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Connect => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.connect().await {
                        debug!("Connect finished with error: {}", e);
                        if e == SessionError::Busy {
                            print_line("A connection attempt is already in progress.");
                        }
                    }
                });
            }
            ConsoleCommand::Status => print_status(&manager),
            ConsoleCommand::Retry => spawn_send(&manager, None),
            ConsoleCommand::Help => print_line(HELP),
            ConsoleCommand::Quit => {
                info!("Shutting down");
                break;
            }
            ConsoleCommand::Send(text) => spawn_send(&manager, Some(text)),
        }
    }

    drop(manager);
    event_task.abort();
    if let Err(e) = event_task.await {
        if !e.is_cancelled() {
            error!("Event printer failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WriteMode;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("/connect"), ConsoleCommand::Connect);
        assert_eq!(ConsoleCommand::parse("  /status \n"), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("/exit"), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse(""), ConsoleCommand::Empty);
        assert_eq!(ConsoleCommand::parse("\r\n"), ConsoleCommand::Empty);
        assert_eq!(
            ConsoleCommand::parse("   "),
            ConsoleCommand::Send("   ".to_string())
        );
        assert_eq!(
            ConsoleCommand::parse(" hello world\r\n"),
            ConsoleCommand::Send(" hello world".to_string())
        );
    }

    #[test]
    fn test_format_events() {
        let alert = format_event(&AppEvent::Alert(Alert::Disconnected)).unwrap();
        assert!(alert.starts_with(BELL));
        assert!(alert.contains("Device disconnected"));

        assert_eq!(
            format_event(&AppEvent::MessageReceived("héllo".to_string())).as_deref(),
            Some("<< héllo")
        );
        assert_eq!(
            format_event(&AppEvent::StateChanged {
                state: SessionState::Connected,
                status: "Connected & Listening".to_string(),
            })
            .as_deref(),
            Some("[status] Connected & Listening")
        );

        let info = AppEvent::LogMessage(StatusMessage {
            message: "Scanning for devices...".to_string(),
            severity: MessageSeverity::Info,
        });
        assert!(format_event(&info).is_none());
    }

    #[test]
    fn test_describe_send() {
        assert!(describe_send(SendOutcome::Sent(WriteMode::WithoutResponse))
            .unwrap()
            .starts_with(">> sent"));
        assert!(describe_send(SendOutcome::NotReady).is_some());
        assert!(describe_send(SendOutcome::Empty).is_none());
    }
}
