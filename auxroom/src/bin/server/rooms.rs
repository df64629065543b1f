use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shared::lib::{advance_track, next_dj, ChatMessage, Room, RoomUser, Track};

pub type RoomHandle = Arc<Mutex<Room>>;
pub type Registry = Arc<Mutex<HashMap<String, RoomHandle>>>;

/// First reference creates the room. Entries are never evicted; an empty
/// room persists until the process exits.
pub fn get_or_create(registry: &Registry, room_id: &str) -> RoomHandle {
    registry
        .lock()
        .unwrap()
        .entry(room_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.to_string()))))
        .clone()
}

/// Add or replace the roster entry for this connection id. Replacing in
/// place keeps roster positions stable for a same-id rejoin.
pub fn join_user(room: &mut Room, user: RoomUser) {
    if let Some(existing) = room.users.iter_mut().find(|u| u.id == user.id) {
        *existing = user;
    } else {
        room.users.push(user);
    }

    if room.current_dj.is_none() && !room.queue.is_empty() {
        let dj = next_dj(room);
        room.current_dj = dj;
    }
}

/// A departing DJ hands the room straight to the next track, which
/// re-derives the DJ against the remaining roster.
pub fn remove_user(room: &mut Room, socket_id: &str, now: u64) {
    let was_dj = room.current_dj.as_deref() == Some(socket_id);

    room.users.retain(|u| u.id != socket_id);

    if was_dj {
        advance_track(room, now);
    }
}

/// Stamps attribution server-side and appends to the queue tail. An idle
/// room starts playing immediately.
pub fn queue_track(room: &mut Room, mut track: Track, added_by: &str, now: u64) {
    track.added_by = Some(added_by.to_string());
    track.added_at = Some(now);
    room.queue.push(track);

    if room.current_track.is_none() {
        advance_track(room, now);
    } else if room.current_dj.is_none() {
        let dj = next_dj(room);
        room.current_dj = dj;
    }
}

/// Removes the first queued entry with this id. The playing track is not in
/// the queue, so it cannot be removed from here.
pub fn unqueue_track(room: &mut Room, track_id: &str) {
    if let Some(ix) = room.queue.iter().position(|t| t.id == track_id) {
        room.queue.remove(ix);
    }
}

pub fn chat_message(
    room: &Room,
    socket_id: &str,
    user_name: String,
    message: String,
    now: u64,
) -> ChatMessage {
    let user_name = room
        .users
        .iter()
        .find(|u| u.id == socket_id)
        .map(|u| u.name.clone())
        .unwrap_or(user_name);

    ChatMessage {
        id: now.to_string(),
        message,
        user_name,
        user_id: socket_id.to_string(),
        timestamp: now,
    }
}
