//! Interactive room client

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use huddle_core::{Attachment, ChatMessage, ParticipantProfile, RoomKey, SessionConfig};
use huddle_net::{Session, TcpTransport, Transport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::state::ChatView;

/// Largest file `/file` will send
const MAX_ATTACHMENT_BYTES: u64 = 512 * 1024;

pub struct JoinOptions {
    pub room: String,
    pub password: String,
    pub name: Option<String>,
    pub broker: Option<String>,
    pub config: SessionConfig,
}

/// What a line typed by the user asks for
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Text(&'a str),
    Who,
    File(&'a str),
    Quit,
    Unknown(&'a str),
    Empty,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line);
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    match name {
        "who" => Input::Who,
        "quit" | "exit" => Input::Quit,
        "file" if !arg.is_empty() => Input::File(arg),
        _ => Input::Unknown(name),
    }
}

pub async fn run(options: JoinOptions) -> Result<()> {
    let room = RoomKey::new(&options.room, &options.password).context("Invalid room")?;
    let profile = match &options.name {
        Some(name) => ParticipantProfile::with_username(name).context("Invalid name")?,
        None => ParticipantProfile::generate(),
    };
    let broker = options
        .broker
        .clone()
        .unwrap_or_else(|| options.config.broker_addr.clone());

    info!(room = %room, broker = %broker, username = %profile.username, "Joining room");
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(broker.clone()));
    let mut session = Session::start(transport, room.clone(), profile.clone(), options.config)
        .await
        .with_context(|| format!("Could not join {} via {}", room, broker))?;

    println!(
        "Joined {} as {} ({}). Type /who, /file <path> or /quit.",
        room,
        profile.username,
        session.role()
    );

    let mut view = ChatView::new(profile.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Text(text) => {
                        session.send_message(ChatMessage::text(&profile, text)).await?;
                    }
                    Input::Who => {
                        for line in view.who() {
                            println!("{}", line);
                        }
                    }
                    Input::File(path) => match read_attachment(Path::new(path)) {
                        Ok(attachment) => {
                            session
                                .send_message(ChatMessage::attachment(&profile, attachment))
                                .await?;
                        }
                        Err(e) => println!("! {:#}", e),
                    },
                    Input::Unknown(name) => println!("! Unknown command /{}", name),
                    Input::Quit => break,
                }
            }

            event = session.next_event() => {
                let Some(event) = event else {
                    break;
                };
                for line in view.apply(event) {
                    println!("{}", line);
                }
            }
        }
    }

    session.stop().await;
    println!("Left {}", room);
    Ok(())
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Cannot read {}", path.display()))?
        .len();
    if size > MAX_ATTACHMENT_BYTES {
        bail!(
            "{} is too large ({}, limit {})",
            path.display(),
            huddle_core::format_file_size(size),
            huddle_core::format_file_size(MAX_ATTACHMENT_BYTES)
        );
    }

    let bytes = std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok(Attachment::from_bytes(&filename, None, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  hello there "), Input::Text("hello there"));
        assert_eq!(parse_input("/who"), Input::Who);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/file  notes.txt"), Input::File("notes.txt"));
        assert_eq!(parse_input("/file"), Input::Unknown("file"));
        assert_eq!(parse_input("/dance"), Input::Unknown("dance"));
        assert_eq!(parse_input("   "), Input::Empty);
    }
}
