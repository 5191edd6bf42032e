//! End-to-end calls between coordinators wired through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use meshcall::peer::{ConnectionState, LocalTrack, LoopbackFactory};
use meshcall::relay::Relay;
use meshcall::session::{CallState, SessionCommand, SessionCoordinator, SessionEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    id: String,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<CallState>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    async fn connect(relay: &Arc<Relay>) -> Self {
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
        let id = relay.connect(outbox).await;

        let (signal_tx, mut signal_rx) = mpsc::channel(100);
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let (commands, commands_rx) = mpsc::channel(16);

        let factory = Arc::new(LoopbackFactory::new());
        let (session, events) = SessionCoordinator::new(factory, signal_tx, WAIT);
        let state = session.monitor().subscribe();

        let down = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if inbound_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        let up_relay = Arc::clone(relay);
        let from = id.clone();
        let up = tokio::spawn(async move {
            while let Some(msg) = signal_rx.recv().await {
                up_relay.handle(&from, msg).await;
            }
        });
        let run = tokio::spawn(session.run(inbound_rx, commands_rx));

        Self {
            id,
            commands,
            state,
            events,
            tasks: vec![down, up, run],
        }
    }

    async fn join(&mut self, name: &str, tracks: Vec<LocalTrack>) {
        for track in tracks {
            self.command(SessionCommand::AddTrack(track)).await;
        }
        self.command(SessionCommand::JoinRoom {
            room: "r1".to_string(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
        })
        .await;
    }

    async fn joined(&mut self, name: &str, tracks: Vec<LocalTrack>) {
        self.join(name, tracks).await;
        self.wait_for(|s| s.room.as_deref() == Some("r1")).await;
    }

    async fn command(&self, cmd: SessionCommand) {
        self.commands.send(cmd).await.unwrap();
    }

    async fn wait_for(&mut self, f: impl FnMut(&CallState) -> bool) -> CallState {
        timeout(WAIT, self.state.wait_for(f))
            .await
            .expect("timed out waiting for call state")
            .expect("session stopped")
            .clone()
    }

    async fn next_event(&mut self, f: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("session stopped");
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Drops the relay connection as if the socket had closed.
    async fn disconnect(self, relay: &Relay) {
        for task in &self.tasks {
            task.abort();
        }
        relay.disconnect(&self.id).await;
    }
}

fn track(id: &str, mime_type: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "local-stream".to_owned(),
    ))
}

fn connected_with(state: &CallState, peer: &str, tracks: &[&str]) -> bool {
    state.participant(peer).map_or(false, |p| {
        p.connection == ConnectionState::Connected
            && tracks.iter().all(|t| p.remote_tracks.iter().any(|r| r == t))
    })
}

#[tokio::test]
async fn test_two_peers_negotiate_and_exchange_tracks() {
    let relay = Arc::new(Relay::new(4));
    let mut a = Client::connect(&relay).await;
    let mut b = Client::connect(&relay).await;

    a.joined(
        "Alice",
        vec![track("a-mic", MIME_TYPE_OPUS), track("a-cam", MIME_TYPE_VP8)],
    )
    .await;
    b.join("Bob", vec![track("b-mic", MIME_TYPE_OPUS)]).await;

    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    let seen_by_a = a.wait_for(|s| connected_with(s, &b_id, &["b-mic"])).await;
    let seen_by_b = b
        .wait_for(|s| connected_with(s, &a_id, &["a-mic", "a-cam"]))
        .await;

    let bob = seen_by_a.participant(&b.id).unwrap();
    assert_eq!(bob.name, "Bob");
    assert_eq!(bob.email, "bob@example.com");
    assert_eq!(seen_by_b.participant(&a.id).unwrap().name, "Alice");
    assert_eq!(seen_by_a.local_id.as_deref(), Some(a.id.as_str()));

    let mut members = relay.room_members("r1").await;
    members.sort();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(members, expected);
}

#[tokio::test]
async fn test_join_into_full_room_is_refused() {
    let relay = Arc::new(Relay::new(2));
    let mut a = Client::connect(&relay).await;
    let mut b = Client::connect(&relay).await;
    let mut c = Client::connect(&relay).await;

    a.joined("Alice", vec![]).await;
    b.joined("Bob", vec![]).await;
    c.join("Carol", vec![]).await;

    let event = c
        .next_event(|e| matches!(e, SessionEvent::RoomFull { .. }))
        .await;
    assert!(matches!(event, SessionEvent::RoomFull { room } if room == "r1"));
    assert_eq!(c.state.borrow().room, None);
    assert_eq!(relay.room_members("r1").await.len(), 2);
}

#[tokio::test]
async fn test_video_toggle_reaches_the_rest_of_the_room() {
    let relay = Arc::new(Relay::new(4));
    let mut a = Client::connect(&relay).await;
    let mut b = Client::connect(&relay).await;
    let mut d = Client::connect(&relay).await;

    a.joined("Alice", vec![]).await;
    b.joined("Bob", vec![]).await;
    d.joined("Dave", vec![]).await;

    let a_id = a.id.clone();
    b.wait_for(|s| connected_with(s, &a_id, &[])).await;
    d.wait_for(|s| connected_with(s, &a_id, &[])).await;

    a.command(SessionCommand::ToggleVideo).await;

    for peer in [&mut b, &mut d] {
        let state = peer
            .wait_for(|s| s.participant(&a_id).map_or(false, |p| p.is_video_off))
            .await;
        let alice = state.participant(&a_id).unwrap();
        assert!(!alice.is_muted);
        assert_eq!(alice.connection, ConnectionState::Connected);
    }
    assert!(a.state.borrow().is_video_off);
}

#[tokio::test]
async fn test_departure_cleans_up_remaining_peers() {
    let relay = Arc::new(Relay::new(4));
    let mut a = Client::connect(&relay).await;
    let mut b = Client::connect(&relay).await;
    let mut d = Client::connect(&relay).await;

    a.joined("Alice", vec![]).await;
    b.joined("Bob", vec![]).await;
    d.joined("Dave", vec![]).await;

    let b_id = b.id.clone();
    a.wait_for(|s| connected_with(s, &b_id, &[])).await;
    d.wait_for(|s| connected_with(s, &b_id, &[])).await;

    b.disconnect(&relay).await;

    for peer in [&mut a, &mut d] {
        let state = peer
            .wait_for(|s| !s.participants.contains_key(&b_id))
            .await;
        assert_eq!(state.participants.len(), 1);
    }
    assert_eq!(relay.room_members("r1").await.len(), 2);
}

#[tokio::test]
async fn test_end_call_notifies_peers() {
    let relay = Arc::new(Relay::new(4));
    let mut a = Client::connect(&relay).await;
    let mut b = Client::connect(&relay).await;

    a.joined("Alice", vec![]).await;
    b.joined("Bob", vec![]).await;

    let a_id = a.id.clone();
    b.wait_for(|s| connected_with(s, &a_id, &[])).await;

    a.command(SessionCommand::EndCall).await;
    a.next_event(|e| matches!(e, SessionEvent::CallEnded)).await;

    let state = b.wait_for(|s| s.participants.is_empty()).await;
    assert_eq!(state.room.as_deref(), Some("r1"));
}
