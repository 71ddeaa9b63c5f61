//! Line-oriented editor over stdin, linked to a sync server.

use std::error::Error;

use coedit_collab::client::{ClientLink, LinkConfig, LinkEvent, NoticeLevel};
use coedit_collab::surface::SharedBuffer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  /show           print the local document
  /set <text>     replace the local document
  /append <text>  append a line to the local document
  /send           send the local document to the server
  /users          list connected participants
  /status         print the link state
  /quit           exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorCommand {
    Show,
    Set(String),
    Append(String),
    Send,
    Users,
    Status,
    Help,
    Quit,
}

/// Parse one input line. Returns `None` for blank or unknown input.
pub fn parse_command(line: &str) -> Option<EditorCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.to_string()),
        None => (line.trim(), String::new()),
    };
    let cmd = match head.to_ascii_lowercase().as_str() {
        "/show" => EditorCommand::Show,
        "/set" => EditorCommand::Set(rest),
        "/append" => EditorCommand::Append(rest),
        "/send" => EditorCommand::Send,
        "/users" => EditorCommand::Users,
        "/status" => EditorCommand::Status,
        "/help" => EditorCommand::Help,
        "/quit" | "/exit" => EditorCommand::Quit,
        _ => return None,
    };
    Some(cmd)
}

pub async fn run(config: LinkConfig, user: String) -> Result<(), Box<dyn Error>> {
    println!("[client] linking to {}", config.server_url);
    println!("[client] type /help for commands");

    let buffer = SharedBuffer::default();
    let mut link = ClientLink::start(config, buffer.clone(), user);
    if let Some(events) = link.take_event_rx() {
        tokio::spawn(print_events(events));
    }

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin_lines.next_line().await? {
        let Some(cmd) = parse_command(&line) else {
            if !line.trim().is_empty() {
                println!("[client] unknown command, try /help");
            }
            continue;
        };
        match cmd {
            EditorCommand::Show => println!("{}", buffer.text()),
            EditorCommand::Set(text) => buffer.set_text(text),
            EditorCommand::Append(text) => {
                if !buffer.text().is_empty() {
                    buffer.push_str("\n");
                }
                buffer.push_str(&text);
            }
            EditorCommand::Send => {
                // Failures are also printed as error notices.
                if let Err(e) = link.send_edit().await {
                    log::warn!("Send failed: {e}");
                }
            }
            EditorCommand::Users => {
                let users = link.roster().await;
                println!("[client] {} connected", users.len());
                for id in users {
                    println!("  {id}");
                }
            }
            EditorCommand::Status => {
                println!(
                    "[client] {:?}, {} edits queued",
                    link.connection_state().await,
                    link.queued_len().await
                );
            }
            EditorCommand::Help => println!("{HELP}"),
            EditorCommand::Quit => break,
        }
    }

    link.shutdown().await;
    Ok(())
}

async fn print_events(mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Status(state) => println!("[status] {state:?}"),
            LinkEvent::TransportError(e) => println!("[status] Error: {e}"),
            LinkEvent::InitialState {
                content,
                last_updated,
            } => {
                println!("[server] document as of {last_updated}:");
                println!("{content}");
            }
            LinkEvent::DocumentReplaced { content } => {
                println!("[server] document updated:");
                println!("{content}");
            }
            LinkEvent::Conflict {
                current_content, ..
            } => {
                println!("[server] local document reset to:");
                println!("{current_content}");
            }
            LinkEvent::Roster(users) => println!("[server] {} connected", users.len()),
            LinkEvent::Notice(notice) => {
                let level = match notice.level {
                    NoticeLevel::Info => "info",
                    NoticeLevel::Warning => "warning",
                    NoticeLevel::Error => "error",
                };
                println!("[{level}] {}", notice.text);
            }
        }
    }
}
