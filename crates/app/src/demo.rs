//! In-process demo: several participants in one room over a memory network

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use huddle_core::{ChatMessage, ParticipantProfile, RoomKey, SessionConfig};
use huddle_net::{MemoryNetwork, Session, Transport};
use tokio::time::Instant;

use crate::state::ChatView;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Participant {
    profile: ParticipantProfile,
    session: Session,
    view: ChatView,
}

impl Participant {
    /// Print whatever happened since the last call
    fn drain(&mut self) {
        while let Some(event) = self.session.try_next_event() {
            for line in self.view.apply(event) {
                println!("[{}] {}", self.profile.username, line);
            }
        }
    }
}

pub async fn run(peers: usize, room: Option<String>, password: String) -> Result<()> {
    if peers == 0 {
        bail!("The demo needs at least one participant");
    }
    let room_id = room.unwrap_or_else(RoomKey::random_room_id);
    let room = RoomKey::new(&room_id, &password).context("Invalid room")?;

    let transport: Arc<dyn Transport> = Arc::new(MemoryNetwork::new());
    let config = SessionConfig {
        heartbeat_interval_ms: 1000,
        idle_timeout_secs: 0,
        ..SessionConfig::default()
    };

    println!("Room {} with {} participants", room, peers);
    let mut participants = Vec::with_capacity(peers);
    for _ in 0..peers {
        let profile = ParticipantProfile::generate();
        let session = Session::start(transport.clone(), room.clone(), profile.clone(), config.clone())
            .await
            .with_context(|| format!("{} could not join", profile.username))?;
        println!("{} is the {}", profile.username, session.role());
        participants.push(Participant {
            view: ChatView::new(profile.clone()),
            profile,
            session,
        });
    }

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        for p in participants.iter_mut() {
            p.drain();
        }
        if participants
            .iter()
            .all(|p| p.view.room().online_count() == peers)
        {
            break;
        }
        if Instant::now() >= deadline {
            bail!("Mesh did not form within {:?}", SETTLE_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for p in &participants {
        let greeting = format!("Hi, I'm {}", p.profile.username);
        p.session
            .send_message(ChatMessage::text(&p.profile, greeting))
            .await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    for p in participants.iter_mut() {
        p.drain();
    }

    for p in &participants {
        p.session.stop().await;
    }
    let delivered: usize = participants
        .iter()
        .map(|p| p.view.room().message_count())
        .sum();
    println!("Done: {} messages delivered in total", delivered);
    Ok(())
}
