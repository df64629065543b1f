use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use std::{env, error::Error};

use shared::lib::{current_unix_epoch, Input, Output, Track};
use tungstenite::{client::client, Message};
use url::Url;

fn demo_track() -> Track {
    Track {
        id: "demo-track-1".into(),
        name: "Long Burn".into(),
        artist: "The Midnight Draft".into(),
        album: "Afterhours".into(),
        preview_url: Some("https://cdn.example.com/previews/demo-track-1.mp3".into()),
        image_url: None,
        duration_ms: 15_000,
        // The server stamps attribution on arrival.
        added_by: None,
        added_at: None,
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    dotenv::dotenv().ok();

    let addr = format!(
        "{}:{}",
        env::var("SERVER_URL").unwrap_or_else(|_| "127.0.0.1".into()),
        env::var("PORT").unwrap_or_else(|_| "3012".into())
    );
    let room_id = env::var("ROOM_ID").unwrap_or_else(|_| "lounge".into());
    let user_name = env::var("USER_NAME").unwrap_or_else(|_| "demo".into());

    let stream = TcpStream::connect(&addr)?;
    let (mut socket, _response) =
        client(Url::parse(&format!("ws://{}/", addr))?, stream).expect("websocket handshake");

    println!("connected to {}, joining room {}", addr, room_id);

    // The read timeout doubles as the heartbeat interval.
    socket
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(2_000)))?;

    socket.write_message(Message::Text(serde_json::to_string(&Input::Join {
        room_id: room_id.clone(),
        user_name,
    })?))?;
    socket.write_message(Message::Text(serde_json::to_string(&Input::AddTrack {
        room_id: room_id.clone(),
        track: demo_track(),
    })?))?;

    loop {
        match socket.read_message() {
            Ok(Message::Text(raw)) => {
                if raw == "pong" {
                    continue;
                }

                match serde_json::from_str::<Output>(&raw) {
                    Ok(Output::RoomState(room)) => {
                        let position = match (room.is_playing, room.started_at) {
                            (true, Some(started_at)) => current_unix_epoch()?
                                .saturating_sub(started_at),
                            _ => room.current_time,
                        };
                        println!(
                            "[{}] {} at {}ms, {} queued, {} listening",
                            room.id,
                            room.current_track
                                .as_ref()
                                .map(|t| t.name.as_str())
                                .unwrap_or("(nothing playing)"),
                            position,
                            room.queue.len(),
                            room.users.len()
                        );
                    }
                    Ok(Output::ChatMessage(chat)) => println!("<{}> {}", chat.user_name, chat.message),
                    Ok(Output::UserJoined(user)) => println!("* {} joined", user.name),
                    Ok(Output::UserLeft { socket_id }) => println!("* {} left", socket_id),
                    Err(e) => log::warn!("unrecognized message {:?}: {}", raw, e),
                }
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                socket.write_message(Message::Text("ping".into()))?;
            }
            Err(e) => {
                eprintln!("connection lost: {}", e);
                break;
            }
        }
    }

    Ok(())
}
