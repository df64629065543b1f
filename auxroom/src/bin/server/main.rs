mod rooms;

use std::time::Duration;
use std::{
    collections::HashMap,
    env,
    error::Error,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use shared::lib::{
    current_unix_epoch, pause_playback, resume_playback, tick, Input, Output, RoomUser,
};

use futures::{
    channel::mpsc::{unbounded, UnboundedSender},
    future, pin_mut,
    stream::TryStreamExt,
    StreamExt,
};

use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use tungstenite::protocol::Message;

use rooms::{
    chat_message, get_or_create, join_user, queue_track, remove_user, unqueue_track, Registry,
    RoomHandle,
};

type Tx = UnboundedSender<Message>;
type PeerMap = Arc<Mutex<HashMap<SocketAddr, Peer>>>;

#[derive(Debug)]
struct Peer {
    tx: Tx,
    room_id: Option<String>,
    last_heartbeat: u64,
}

const CONNECTION_TIMEOUT: u64 = 5_000;
const HEARTBEAT_INTERVAL: u64 = 2_000;
const TICK_INTERVAL: u64 = 1_000;

async fn handle_connection(
    peers_wrap: PeerMap,
    raw_stream: TcpStream,
    addr: SocketAddr,
    registry: Registry,
) -> Result<(), Box<dyn Error>> {
    log::debug!("incoming TCP connection from: {}", addr);

    let ws_stream = async_tungstenite::accept_async(raw_stream).await?;

    // Insert the write part of this peer to the peer map.
    let (tx, rx) = unbounded();
    peers_wrap.lock().unwrap().insert(
        addr,
        Peer {
            tx: tx.clone(),
            room_id: None,
            last_heartbeat: current_unix_epoch()?,
        },
    );

    let (outgoing, incoming) = ws_stream.split();

    let broadcast_incoming = incoming.try_for_each(|msg| {
        // Heartbeat check with a custom protocol as browsers don't support
        // the standard WebSocket ping protocol.
        if msg == Message::text("ping") {
            let _ = tx.unbounded_send(Message::text("pong"));
            if let Some(peer) = peers_wrap.lock().unwrap().get_mut(&addr) {
                peer.last_heartbeat = current_unix_epoch().unwrap_or(peer.last_heartbeat);
            }
        } else if let Err(e) =
            handle_message(registry.clone(), peers_wrap.clone(), tx.clone(), msg, addr)
        {
            log::error!("message from {} failed: {}", addr, e);
        }

        future::ok(())
    });

    let receive_from_others = rx.map(Ok).forward(outgoing);

    pin_mut!(broadcast_incoming, receive_from_others);
    future::select(broadcast_incoming, receive_from_others).await;

    log::debug!("{} disconnected", &addr);

    let room_id = {
        let mut peers = peers_wrap.lock().unwrap();
        peers.remove(&addr).and_then(|peer| peer.room_id)
    };

    // Disconnection is an implicit, immediate leave.
    if let Some(room_id) = room_id {
        leave_room(&registry, &peers_wrap, &room_id, &addr.to_string())?;
    }

    Ok(())
}

fn handle_message(
    registry: Registry,
    peers_wrap: PeerMap,
    tx: Tx,
    msg: Message,
    addr: SocketAddr,
) -> Result<(), Box<dyn Error>> {
    let input: Result<Input, serde_json::Error> = serde_json::from_str(msg.to_text()?);
    let socket_id = addr.to_string();

    let input = match input {
        Ok(input) => input,
        Err(e) => {
            log::warn!("couldn't deserialize: {:?}, serde error: {:?}", msg.to_text(), e);
            return Ok(());
        }
    };

    match input {
        Input::Join { room_id, user_name } => {
            let now = current_unix_epoch()?;

            // One room per connection. Joining another room leaves the old
            // one first, so each roster tracks channel membership exactly.
            let previous = peers_wrap
                .lock()
                .unwrap()
                .get_mut(&addr)
                .and_then(|peer| peer.room_id.replace(room_id.clone()));

            if let Some(previous) = previous {
                if previous != room_id {
                    leave_room(&registry, &peers_wrap, &previous, &socket_id)?;
                }
            }

            let name = if user_name.trim().is_empty() {
                format!("guest-{}", addr.port())
            } else {
                user_name
            };

            let user = RoomUser {
                id: socket_id.clone(),
                name,
                socket_id: socket_id.clone(),
                joined_at: now,
            };

            let handle = get_or_create(&registry, &room_id);
            let snapshot = {
                let mut room = handle.lock().unwrap();
                join_user(&mut room, user.clone());
                room.clone()
            };

            send_to_room_except(
                &peers_wrap,
                &room_id,
                addr,
                &serde_json::to_string(&Output::UserJoined(user))?,
            );
            tx.unbounded_send(serde_json::to_string(&Output::RoomState(snapshot))?.into())?;
        }
        Input::AddTrack { room_id, track } => {
            let now = current_unix_epoch()?;
            let handle = get_or_create(&registry, &room_id);
            let snapshot = {
                let mut room = handle.lock().unwrap();
                queue_track(&mut room, track, &socket_id, now);
                room.clone()
            };

            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::RoomState(snapshot))?,
            );
        }
        Input::RemoveTrack { room_id, track_id } => {
            let handle = get_or_create(&registry, &room_id);
            let snapshot = {
                let mut room = handle.lock().unwrap();
                unqueue_track(&mut room, &track_id);
                room.clone()
            };

            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::RoomState(snapshot))?,
            );
        }
        Input::Play { room_id } => {
            let now = current_unix_epoch()?;
            let handle = get_or_create(&registry, &room_id);
            let snapshot = {
                let mut room = handle.lock().unwrap();
                resume_playback(&mut room, now);
                room.clone()
            };

            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::RoomState(snapshot))?,
            );
        }
        Input::Pause { room_id } => {
            let now = current_unix_epoch()?;
            let handle = get_or_create(&registry, &room_id);
            let snapshot = {
                let mut room = handle.lock().unwrap();
                pause_playback(&mut room, now);
                room.clone()
            };

            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::RoomState(snapshot))?,
            );
        }
        Input::Chat {
            room_id,
            message,
            user_name,
        } => {
            let now = current_unix_epoch()?;
            let handle = get_or_create(&registry, &room_id);
            let chat = {
                let room = handle.lock().unwrap();
                chat_message(&room, &socket_id, user_name, message, now)
            };

            // Chat is fire-and-forget: broadcast, never merged into the
            // room snapshot.
            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::ChatMessage(chat))?,
            );
        }
        Input::SyncTime { room_id } => {
            let handle = get_or_create(&registry, &room_id);
            let snapshot = handle.lock().unwrap().clone();

            tx.unbounded_send(serde_json::to_string(&Output::RoomState(snapshot))?.into())?;
        }
    }

    Ok(())
}

fn leave_room(
    registry: &Registry,
    peers_wrap: &PeerMap,
    room_id: &str,
    socket_id: &str,
) -> Result<(), Box<dyn Error>> {
    let handle = get_or_create(registry, room_id);
    let snapshot = {
        let mut room = handle.lock().unwrap();
        remove_user(&mut room, socket_id, current_unix_epoch()?);
        room.clone()
    };

    send_to_room(
        peers_wrap,
        room_id,
        &serde_json::to_string(&Output::UserLeft {
            socket_id: socket_id.to_string(),
        })?,
    );
    send_to_room(
        peers_wrap,
        room_id,
        &serde_json::to_string(&Output::RoomState(snapshot))?,
    );

    Ok(())
}

fn send_to_room(peers_wrap: &PeerMap, room_id: &str, data: &str) {
    let peers = peers_wrap.lock().unwrap();
    let recipients = peers
        .values()
        .filter(|peer| peer.room_id.as_deref() == Some(room_id));

    for peer in recipients {
        // A peer that disconnected mid-broadcast just misses the message.
        let _ = peer.tx.unbounded_send(Message::text(data));
    }
}

fn send_to_room_except(peers_wrap: &PeerMap, room_id: &str, skip: SocketAddr, data: &str) {
    let peers = peers_wrap.lock().unwrap();
    let recipients = peers
        .iter()
        .filter(|(addr, peer)| **addr != skip && peer.room_id.as_deref() == Some(room_id));

    for (_, peer) in recipients {
        let _ = peer.tx.unbounded_send(Message::text(data));
    }
}

/// Runs the playback clock over every registered room, then reschedules
/// itself a second out. Only a clock-driven advancement is broadcast;
/// clients derive the live position from `startedAt` between snapshots.
fn clock_tick(registry: Registry, peers_wrap: PeerMap) -> Result<(), Box<dyn Error>> {
    let now = current_unix_epoch()?;

    let handles: Vec<(String, RoomHandle)> = registry
        .lock()
        .unwrap()
        .iter()
        .map(|(id, handle)| (id.clone(), handle.clone()))
        .collect();

    for (room_id, handle) in handles {
        let advanced = {
            let mut room = handle.lock().unwrap();
            if tick(&mut room, now) {
                Some(room.clone())
            } else {
                None
            }
        };

        if let Some(snapshot) = advanced {
            log::info!(
                "room {}: now playing {:?}",
                room_id,
                snapshot.current_track.as_ref().map(|t| &t.name)
            );
            send_to_room(
                &peers_wrap,
                &room_id,
                &serde_json::to_string(&Output::RoomState(snapshot))?,
            );
        }
    }

    task::spawn(async move {
        task::sleep(Duration::from_millis(TICK_INTERVAL)).await;

        if let Err(e) = clock_tick(registry, peers_wrap) {
            log::error!("clock tick failed: {}", e);
        }
    });

    Ok(())
}

/// Closes the channel of any connection that has gone silent; the
/// connection task then runs the normal disconnect path.
fn heartbeat_check(peers_wrap: PeerMap) -> Result<(), Box<dyn Error>> {
    let now = current_unix_epoch()?;

    {
        let peers = peers_wrap.lock().unwrap();

        for (addr, peer) in peers.iter() {
            if now - peer.last_heartbeat >= CONNECTION_TIMEOUT {
                log::debug!("connection {} timed out", addr);
                peer.tx.close_channel();
            }
        }
    }

    task::spawn(async move {
        task::sleep(Duration::from_millis(HEARTBEAT_INTERVAL)).await;

        if let Err(e) = heartbeat_check(peers_wrap) {
            log::error!("heartbeat check failed: {}", e);
        }
    });

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    dotenv::dotenv().ok();

    let registry = Registry::default();
    let peers = PeerMap::new(Mutex::new(HashMap::new()));

    let url = format!("{}:{}", env::var("SERVER_URL")?, env::var("PORT")?);
    let listener = TcpListener::bind(&url).await?;
    log::info!("listening on: {}", &url);

    heartbeat_check(peers.clone())?;
    clock_tick(registry.clone(), peers.clone())?;

    // Let's spawn the handling of each connection in a separate task.
    while let Ok((stream, addr)) = listener.accept().await {
        let peers = peers.clone();
        let registry = registry.clone();

        task::spawn(async move {
            if let Err(e) = handle_connection(peers, stream, addr, registry).await {
                log::warn!("connection {} closed with error: {}", addr, e);
            }
        });
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    task::block_on(run())
}

#[cfg(test)]
mod test {
    use crate::rooms::*;
    use shared::lib::*;
    use std::sync::Arc;

    fn test_track(id: &str, duration_ms: u64) -> Track {
        Track {
            id: id.into(),
            name: format!("Track {}", id),
            artist: "Menahan Street Band".into(),
            album: "Make the Road by Walking".into(),
            preview_url: Some(format!("https://cdn.example.com/previews/{}.mp3", id)),
            image_url: None,
            duration_ms,
            added_by: None,
            added_at: None,
        }
    }

    fn test_user(id: &str) -> RoomUser {
        RoomUser {
            id: id.into(),
            name: format!("user {}", id),
            socket_id: id.into(),
            joined_at: 1_000,
        }
    }

    #[test]
    fn registry_returns_the_same_room_for_the_same_id() {
        let registry = Registry::default();

        let first = get_or_create(&registry, "lounge");
        let second = get_or_create(&registry, "lounge");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_rooms_are_never_evicted() {
        let registry = Registry::default();

        let handle = get_or_create(&registry, "lounge");
        {
            let mut room = handle.lock().unwrap();
            join_user(&mut room, test_user("a"));
            remove_user(&mut room, "a", 1_000);
            assert!(room.users.is_empty());
        }

        assert!(registry.lock().unwrap().contains_key("lounge"));
    }

    #[test]
    fn join_replaces_the_roster_entry_on_rejoin() {
        let mut room = Room::new("lounge".into());

        join_user(&mut room, test_user("a"));
        join_user(&mut room, test_user("b"));
        join_user(
            &mut room,
            RoomUser {
                name: "renamed".into(),
                ..test_user("a")
            },
        );

        assert_eq!(room.users.len(), 2);
        assert_eq!(room.users[0].id, "a");
        assert_eq!(room.users[0].name, "renamed");
        assert_eq!(room.users[1].id, "b");
    }

    #[test]
    fn adding_a_track_to_an_idle_room_starts_it() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));

        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);

        let current = room.current_track.as_ref().unwrap();
        assert_eq!(current.id, "t1");
        assert_eq!(current.added_by.as_deref(), Some("a"));
        assert_eq!(current.added_at, Some(5_000));
        assert!(room.is_playing);
        assert_eq!(room.current_time, 0);
        assert_eq!(room.started_at, Some(5_000));
        assert!(room.queue.is_empty());
        assert_eq!(room.current_dj.as_deref(), Some("a"));
    }

    #[test]
    fn adding_a_track_while_playing_only_queues_it() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);

        queue_track(&mut room, test_track("t2", 90_000), "a", 6_000);

        assert_eq!(room.current_track.as_ref().unwrap().id, "t1");
        assert_eq!(room.queue.len(), 1);
        assert_eq!(room.queue[0].id, "t2");
    }

    #[test]
    fn adding_a_track_to_a_paused_room_does_not_cut_it_off() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);
        pause_playback(&mut room, 15_000);

        queue_track(&mut room, test_track("t2", 90_000), "a", 20_000);

        assert_eq!(room.current_track.as_ref().unwrap().id, "t1");
        assert!(!room.is_playing);
        assert_eq!(room.current_time, 10_000);
        assert_eq!(room.queue.len(), 1);
    }

    #[test]
    fn a_queued_track_fills_a_missing_dj_seat() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);
        room.current_dj = None;
        join_user(&mut room, test_user("b"));

        queue_track(&mut room, test_track("t2", 90_000), "b", 6_000);

        assert_eq!(room.current_dj.as_deref(), Some("b"));
    }

    #[test]
    fn remove_track_is_a_noop_for_the_playing_track() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);
        queue_track(&mut room, test_track("t2", 90_000), "a", 6_000);

        unqueue_track(&mut room, "t1");

        assert_eq!(room.current_track.as_ref().unwrap().id, "t1");
        assert_eq!(room.queue.len(), 1);
    }

    #[test]
    fn remove_track_takes_exactly_one_matching_entry() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);
        queue_track(&mut room, test_track("t2", 90_000), "a", 6_000);
        queue_track(&mut room, test_track("t3", 60_000), "a", 7_000);
        queue_track(&mut room, test_track("t2", 90_000), "a", 8_000);

        unqueue_track(&mut room, "t2");

        let remaining: Vec<&str> = room.queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(remaining, vec!["t3", "t2"]);

        unqueue_track(&mut room, "unknown");
        assert_eq!(room.queue.len(), 2);
    }

    #[test]
    fn a_departing_dj_hands_off_to_the_next_track() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        join_user(&mut room, test_user("b"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);
        queue_track(&mut room, test_track("t2", 90_000), "b", 6_000);
        assert_eq!(room.current_dj.as_deref(), Some("a"));

        remove_user(&mut room, "a", 10_000);

        assert_eq!(room.users.len(), 1);
        assert_eq!(room.current_track.as_ref().unwrap().id, "t2");
        assert_eq!(room.started_at, Some(10_000));
        assert_eq!(room.current_dj.as_deref(), Some("b"));
    }

    #[test]
    fn a_departing_dj_with_nothing_queued_clears_the_room() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        join_user(&mut room, test_user("b"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);

        remove_user(&mut room, "a", 10_000);

        assert_eq!(room.current_track, None);
        assert!(!room.is_playing);
        assert_eq!(room.current_time, 0);
        assert_eq!(room.started_at, None);
        assert_eq!(room.current_dj, None);
        assert_eq!(room.users.len(), 1);
    }

    #[test]
    fn a_departing_listener_leaves_playback_alone() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));
        join_user(&mut room, test_user("b"));
        queue_track(&mut room, test_track("t1", 180_000), "a", 5_000);

        remove_user(&mut room, "b", 10_000);

        assert_eq!(room.current_track.as_ref().unwrap().id, "t1");
        assert!(room.is_playing);
        assert_eq!(room.current_dj.as_deref(), Some("a"));
    }

    #[test]
    fn chat_prefers_the_roster_name() {
        let mut room = Room::new("lounge".into());
        join_user(&mut room, test_user("a"));

        let chat = chat_message(&room, "a", "ignored".into(), "tune!".into(), 42_000);

        assert_eq!(chat.user_name, "user a");
        assert_eq!(chat.user_id, "a");
        assert_eq!(chat.id, "42000");
        assert_eq!(chat.timestamp, 42_000);
    }

    #[test]
    fn chat_falls_back_to_the_supplied_name() {
        let room = Room::new("lounge".into());

        let chat = chat_message(&room, "stranger", "Drifter".into(), "hi".into(), 42_000);

        assert_eq!(chat.user_name, "Drifter");
        assert_eq!(chat.user_id, "stranger");
    }

    #[test]
    fn the_lounge_runs_dry_after_the_last_track() {
        let registry = Registry::default();
        let handle = get_or_create(&registry, "lounge");
        let mut room = handle.lock().unwrap();

        join_user(&mut room, test_user("alice"));
        assert_eq!(room.users.len(), 1);
        assert_eq!(room.current_track, None);

        queue_track(&mut room, test_track("t1", 180_000), "alice", 0);
        assert!(room.is_playing);
        assert_eq!(room.current_time, 0);
        assert!(room.queue.is_empty());

        for second in 1..=181u64 {
            tick(&mut room, second * 1_000);
        }

        assert_eq!(room.current_track, None);
        assert!(!room.is_playing);
        assert_eq!(room.current_time, 0);
        assert_eq!(room.started_at, None);
        assert_eq!(room.current_dj, None);
    }
}
