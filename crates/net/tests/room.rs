use std::sync::Arc;
use std::time::Duration;

use huddle_core::{ChatMessage, MessageBody, ParticipantProfile, PeerStatus, RoomKey, SessionConfig};
use huddle_net::{Broker, MemoryNetwork, Role, Session, SessionEvent, TcpTransport, Transport};

const WAIT: Duration = Duration::from_secs(5);

fn kitchen() -> RoomKey {
    RoomKey::new("kitchen", "007").unwrap()
}

fn config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval_ms: 0,
        idle_timeout_secs: 0,
        ..SessionConfig::default()
    }
}

async fn join(transport: Arc<dyn Transport>, name: &str) -> (Session, ParticipantProfile) {
    let profile = ParticipantProfile::with_username(name).unwrap();
    let session = Session::start(transport, kitchen(), profile.clone(), config())
        .await
        .unwrap();
    (session, profile)
}

async fn connected(session: &Session) -> usize {
    session
        .peers()
        .await
        .iter()
        .filter(|p| p.status == PeerStatus::Connected)
        .count()
}

/// Pump events until `n` peers are connected
async fn wait_for_peers(session: &mut Session, n: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while connected(session).await != n {
        assert!(tokio::time::Instant::now() < deadline, "Timed out waiting for {} peers", n);
        let _ = tokio::time::timeout(Duration::from_millis(100), session.next_event()).await;
    }
}

/// Pump events until a text message with `content` arrives
async fn wait_for_text(session: &mut Session, content: &str) -> ChatMessage {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, session.next_event()).await {
            Ok(Some(SessionEvent::Message(msg))) => {
                if matches!(&msg.body, MessageBody::Text { content: c } if c == content) {
                    return msg;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("Session ended"),
            Err(_) => panic!("Timed out waiting for {:?}", content),
        }
    }
}

#[tokio::test]
async fn test_three_participants_form_a_mesh() {
    let net = MemoryNetwork::new();
    let transport: Arc<dyn Transport> = Arc::new(net.clone());

    let (mut a, _) = join(transport.clone(), "Pho").await;
    let (mut b, _) = join(transport.clone(), "Taco").await;
    let (mut c, c_profile) = join(transport.clone(), "Naan").await;

    assert_eq!(a.role(), Role::Hub);
    assert_eq!(b.role(), Role::Client);
    assert_eq!(c.role(), Role::Client);

    wait_for_peers(&mut a, 2).await;
    wait_for_peers(&mut b, 2).await;
    wait_for_peers(&mut c, 2).await;

    let members = a.members().await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(b.members().await.is_none());

    c.send_message(ChatMessage::text(&c_profile, "dinner is ready"))
        .await
        .unwrap();
    let seen_by_a = wait_for_text(&mut a, "dinner is ready").await;
    let seen_by_b = wait_for_text(&mut b, "dinner is ready").await;
    assert_eq!(seen_by_a, seen_by_b);
    assert_eq!(seen_by_a.sender_name, "Naan");
    wait_for_text(&mut c, "dinner is ready").await;

    c.stop().await;
    wait_for_peers(&mut a, 1).await;
    wait_for_peers(&mut b, 1).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_profiles_travel_over_the_mesh() {
    let net = MemoryNetwork::new();
    let transport: Arc<dyn Transport> = Arc::new(net);

    let (mut a, _) = join(transport.clone(), "Pho").await;
    let (mut b, _) = join(transport.clone(), "Taco").await;
    wait_for_peers(&mut a, 1).await;
    wait_for_peers(&mut b, 1).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let names: Vec<String> = a
            .peers()
            .await
            .iter()
            .map(|p| p.display_name().to_string())
            .collect();
        if names == vec!["Taco".to_string()] {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "Profile never arrived: {:?}", names);
        let _ = tokio::time::timeout(Duration::from_millis(100), a.next_event()).await;
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_clients_notice_hub_leaving() {
    let net = MemoryNetwork::new();
    let transport: Arc<dyn Transport> = Arc::new(net.clone());

    let (a, _) = join(transport.clone(), "Pho").await;
    let (mut b, _) = join(transport.clone(), "Taco").await;
    wait_for_peers(&mut b, 1).await;

    a.stop().await;
    assert!(!net.is_claimed("hub_kitchen_007"));

    let mut hub_lost = false;
    let deadline = tokio::time::Instant::now() + WAIT;
    while !hub_lost || connected(&b).await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "Hub departure not noticed");
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), b.next_event()).await {
            hub_lost |= event == SessionEvent::HubLost;
        }
    }

    b.stop().await;
}

#[tokio::test]
async fn test_room_over_tcp_broker() {
    let broker = Broker::start(0).await.unwrap();
    let transport: Arc<dyn Transport> =
        Arc::new(TcpTransport::new(format!("127.0.0.1:{}", broker.addr().port())));

    let (mut a, a_profile) = join(transport.clone(), "Pho").await;
    let (mut b, _) = join(transport.clone(), "Taco").await;
    assert_eq!(a.role(), Role::Hub);
    assert_eq!(b.role(), Role::Client);
    assert!(broker
        .identities()
        .await
        .contains(&"hub_kitchen_007".to_string()));

    wait_for_peers(&mut a, 1).await;
    wait_for_peers(&mut b, 1).await;

    a.send_message(ChatMessage::text(&a_profile, "over the wire"))
        .await
        .unwrap();
    let msg = wait_for_text(&mut b, "over the wire").await;
    assert_eq!(msg.sender_id, a_profile.user_id);

    a.stop().await;
    b.stop().await;
    broker.shutdown();
}
