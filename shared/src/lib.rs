pub mod lib {
    use serde::{Deserialize, Serialize};
    use std::time::{SystemTime, SystemTimeError};

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    pub struct Track {
        pub id: String,
        pub name: String,
        pub artist: String,
        pub album: String,
        pub preview_url: Option<String>,
        pub image_url: Option<String>,
        pub duration_ms: u64,
        // Stamped server-side when the track is enqueued, never taken from
        // the client payload.
        #[serde(default, rename = "addedBy")]
        pub added_by: Option<String>,
        #[serde(default, rename = "addedAt")]
        pub added_at: Option<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    pub struct RoomUser {
        pub id: String,
        pub name: String,
        #[serde(rename = "socketId")]
        pub socket_id: String,
        #[serde(rename = "joinedAt")]
        pub joined_at: u64,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    pub struct ChatMessage {
        pub id: String,
        pub message: String,
        #[serde(rename = "userName")]
        pub user_name: String,
        #[serde(rename = "userId")]
        pub user_id: String,
        pub timestamp: u64,
    }

    /// The full per-room snapshot broadcast to clients. `current_time` is the
    /// position captured at the last clock step; while playing, the live
    /// position is `now - started_at`.
    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    pub struct Room {
        #[serde(rename = "roomId")]
        pub id: String,
        #[serde(rename = "currentTrack")]
        pub current_track: Option<Track>,
        pub queue: Vec<Track>,
        pub users: Vec<RoomUser>,
        #[serde(rename = "currentDJ")]
        pub current_dj: Option<String>,
        #[serde(rename = "isPlaying")]
        pub is_playing: bool,
        #[serde(rename = "currentTime")]
        pub current_time: u64,
        #[serde(rename = "startedAt")]
        pub started_at: Option<u64>,
    }

    impl Room {
        pub fn new(id: String) -> Room {
            Room {
                id,
                current_track: None,
                queue: Vec::new(),
                users: Vec::new(),
                current_dj: None,
                is_playing: false,
                current_time: 0,
                started_at: None,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(tag = "type")]
    pub enum Input {
        #[serde(rename = "room:join", rename_all = "camelCase")]
        Join { room_id: String, user_name: String },
        #[serde(rename = "room:add-track", rename_all = "camelCase")]
        AddTrack { room_id: String, track: Track },
        #[serde(rename = "room:remove-track", rename_all = "camelCase")]
        RemoveTrack { room_id: String, track_id: String },
        #[serde(rename = "room:play", rename_all = "camelCase")]
        Play { room_id: String },
        #[serde(rename = "room:pause", rename_all = "camelCase")]
        Pause { room_id: String },
        #[serde(rename = "room:chat", rename_all = "camelCase")]
        Chat {
            room_id: String,
            message: String,
            user_name: String,
        },
        #[serde(rename = "room:sync-time", rename_all = "camelCase")]
        SyncTime { room_id: String },
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(tag = "type")]
    pub enum Output {
        #[serde(rename = "room:state")]
        RoomState(Room),
        #[serde(rename = "room:chat-message")]
        ChatMessage(ChatMessage),
        #[serde(rename = "room:user-joined")]
        UserJoined(RoomUser),
        #[serde(rename = "room:user-left", rename_all = "camelCase")]
        UserLeft { socket_id: String },
    }

    pub fn current_unix_epoch() -> Result<u64, SystemTimeError> {
        Ok(SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis() as u64)
    }

    /// Picks who gets credited for the track about to play.
    ///
    /// Empty queue: nobody. A seated DJ rotates round-robin by roster
    /// position, regardless of who queued the upcoming track. No seated DJ
    /// (or one that has disconnected): the contributor of the track at the
    /// front of the queue, if they are still in the roster.
    pub fn next_dj(room: &Room) -> Option<String> {
        if room.queue.is_empty() {
            return None;
        }

        let seated = room
            .current_dj
            .as_ref()
            .and_then(|dj| room.users.iter().position(|u| &u.id == dj));

        match seated {
            Some(ix) => Some(room.users[(ix + 1) % room.users.len()].id.clone()),
            None => {
                let contributor = room.queue[0].added_by.as_ref()?;
                room.users
                    .iter()
                    .find(|u| &u.id == contributor)
                    .map(|u| u.id.clone())
            }
        }
    }

    /// Moves the head of the queue into the playing slot, or clears the room
    /// back to idle when nothing is queued. Each track is dequeued exactly
    /// once, here.
    pub fn advance_track(room: &mut Room, now: u64) {
        // Derived before the dequeue so front-of-queue attribution sees the
        // track that is about to play.
        let dj = next_dj(room);

        if room.queue.is_empty() {
            room.current_track = None;
            room.is_playing = false;
            room.current_time = 0;
            room.started_at = None;
            room.current_dj = None;
        } else {
            let track = room.queue.remove(0);
            room.current_track = Some(track);
            room.is_playing = true;
            room.current_time = 0;
            room.started_at = Some(now);
            room.current_dj = dj;
        }
    }

    /// One clock step. Returns true when the current track ran out and the
    /// room advanced. Overshoot past the end of a track is not carried into
    /// the next one; it always starts at zero.
    pub fn tick(room: &mut Room, now: u64) -> bool {
        if !room.is_playing {
            return false;
        }

        let (started_at, duration_ms) = match (room.started_at, &room.current_track) {
            (Some(started_at), Some(track)) => (started_at, track.duration_ms),
            _ => return false,
        };

        let elapsed = now.saturating_sub(started_at);

        if elapsed >= duration_ms {
            advance_track(room, now);
            true
        } else {
            room.current_time = elapsed;
            false
        }
    }

    /// The stored position is the authoritative resume offset; the clock
    /// never free-runs while paused.
    pub fn resume_playback(room: &mut Room, now: u64) {
        if room.current_track.is_some() {
            room.is_playing = true;
            room.started_at = Some(now - room.current_time);
        }
    }

    /// Captures an up-to-date position, then stops the clock. `started_at`
    /// is left stale and ignored until the next resume.
    pub fn pause_playback(room: &mut Room, now: u64) {
        if room.current_track.is_some() {
            tick(room, now);
            room.is_playing = false;
        }
    }
}
