//! Sync Protocol Messages
//!
//! Wire types shared by the polling endpoints and the push socket, plus the
//! outbound actions the player hands to whichever transport is active.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Timestamp attached by the server or a peer.
///
/// The server stamps events with ISO-8601 strings while clients send epoch
/// milliseconds, so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(f64),
    Iso(String),
}

/// A track in the shared playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Server-side identifier (numbers are normalized to strings)
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    /// Display name, also the default file stem
    pub name: String,
    /// File extension without the dot
    #[serde(default = "default_format")]
    pub format: String,
    /// Absolute URL, when the server hosts the file elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Stored file name under `/api/music/storage/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
}

fn default_format() -> String {
    "mp3".to_string()
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Partial playback state delta. Only the fields present are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<Vec<Track>>,
    /// Index into the playlist, -1 when nothing is selected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_clients: Option<u32>,
}

/// Authoritative playback position published by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSync {
    /// Position in seconds
    pub position: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Number of clients currently attached to the shared session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientsUpdate {
    pub connected_clients: u32,
}

/// Full snapshot returned by `GET /api/songs`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SongsSnapshot {
    #[serde(default)]
    pub playlist: Vec<Track>,
    #[serde(default)]
    pub current_index: Option<i64>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub current_position: f64,
}

/// Inbound synchronization event, produced by both transports
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    State(StateUpdate),
    Position(PositionSync),
    Clients(ClientsUpdate),
}

/// JSON envelope carried over the push socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Messages this client sends over the push socket
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Announce ourselves after the socket opens
    UserLogin { username: String, user_id: String },
    /// Liveness ping
    Heartbeat { background: bool },
    /// Local playback position/state report
    PlayStateChange { position: f64, is_playing: bool },
    AddSong(Track),
    RemoveSong { song_id: String },
}

impl PushMessage {
    /// Envelope `type` for this message
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::UserLogin { .. } => "user_login",
            PushMessage::Heartbeat { .. } => "heartbeat",
            PushMessage::PlayStateChange { .. } => "play_state_change",
            PushMessage::AddSong(_) => "add_song",
            PushMessage::RemoveSong { .. } => "remove_song",
        }
    }

    /// Wrap the message in an envelope stamped with `now_ms`
    pub fn into_envelope(self, now_ms: u64) -> Envelope {
        let kind = self.kind().to_string();
        let data = match self {
            PushMessage::UserLogin { username, user_id } => {
                serde_json::json!({ "username": username, "userId": user_id })
            }
            PushMessage::Heartbeat { background } => serde_json::json!({ "background": background }),
            PushMessage::PlayStateChange { position, is_playing } => {
                serde_json::json!({ "position": position, "is_playing": is_playing })
            }
            PushMessage::AddSong(track) => serde_json::to_value(track).unwrap_or_default(),
            PushMessage::RemoveSong { song_id } => serde_json::json!({ "songId": song_id }),
        };

        Envelope {
            kind,
            data,
            timestamp: Some(Timestamp::Millis(now_ms as f64)),
        }
    }
}

#[derive(Deserialize)]
struct UserCount {
    count: u32,
}

/// Decode a text frame from the push socket.
///
/// Returns `Ok(None)` for messages that carry no state (heartbeat acks,
/// unknown types).
pub fn decode_inbound(text: &str) -> Result<Option<SyncEvent>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;

    let event = match envelope.kind.as_str() {
        "state_update" => Some(SyncEvent::State(serde_json::from_value(envelope.data)?)),
        "position_sync" => Some(SyncEvent::Position(serde_json::from_value(envelope.data)?)),
        "user_count" => {
            let UserCount { count } = serde_json::from_value(envelope.data)?;
            Some(SyncEvent::Clients(ClientsUpdate {
                connected_clients: count,
            }))
        }
        "clients_update" => Some(SyncEvent::Clients(serde_json::from_value(envelope.data)?)),
        "heartbeat" => None,
        other => {
            debug!("Ignoring push message of unknown type: {}", other);
            None
        }
    };

    Ok(event)
}

/// Actions the player forwards to the active transport
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Switch the shared session to another playlist entry
    ChangeSong { index: usize },
    /// Resume (`true`) or pause (`false`) shared playback
    SetPlaying(bool),
    /// Report our playback position
    ReportPosition { position: f64, is_playing: bool },
    /// Liveness heartbeat from the background keeper
    Heartbeat { background: bool },
    AddSong(Track),
    RemoveSong { id: String },
}

/// Outbound seam between the player and the transports.
///
/// `send` returns `false` when no transport is active or the transport
/// cannot carry the action.
pub trait ActionSink: Send + Sync {
    fn send(&self, action: OutboundAction) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_accepts_numbers() {
        let track: Track = serde_json::from_str(r#"{"id": 42, "name": "Song", "order": 1}"#).unwrap();
        assert_eq!(track.id, "42");
        assert_eq!(track.format, "mp3");
        assert!(track.url.is_none());
    }

    #[test]
    fn test_state_update_is_partial() {
        let update: StateUpdate = serde_json::from_str(r#"{"is_playing": true}"#).unwrap();
        assert_eq!(update.is_playing, Some(true));
        assert!(update.playlist.is_none());
        assert!(update.current_index.is_none());
        assert!(update.connected_clients.is_none());
    }

    #[test]
    fn test_position_timestamp_shapes() {
        let iso: PositionSync =
            serde_json::from_str(r#"{"position": 12.5, "timestamp": "2024-05-01T10:00:00"}"#).unwrap();
        assert_eq!(iso.timestamp, Some(Timestamp::Iso("2024-05-01T10:00:00".to_string())));

        let millis: PositionSync = serde_json::from_str(r#"{"position": 1, "timestamp": 1700000000000}"#).unwrap();
        assert_eq!(millis.timestamp, Some(Timestamp::Millis(1_700_000_000_000.0)));
    }

    #[test]
    fn test_decode_inbound_types() {
        let state = decode_inbound(r#"{"type":"state_update","data":{"current_index":2,"connected_clients":3}}"#)
            .unwrap()
            .unwrap();
        match state {
            SyncEvent::State(update) => {
                assert_eq!(update.current_index, Some(2));
                assert_eq!(update.connected_clients, Some(3));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let count = decode_inbound(r#"{"type":"user_count","data":{"count":5}}"#).unwrap();
        assert_eq!(count, Some(SyncEvent::Clients(ClientsUpdate { connected_clients: 5 })));

        assert_eq!(decode_inbound(r#"{"type":"heartbeat","timestamp":1}"#).unwrap(), None);
        assert_eq!(decode_inbound(r#"{"type":"mystery","data":{}}"#).unwrap(), None);
        assert!(decode_inbound("not json").is_err());
    }

    #[test]
    fn test_push_message_envelopes() {
        let env = PushMessage::RemoveSong { song_id: "7".into() }.into_envelope(1000);
        assert_eq!(env.kind, "remove_song");
        assert_eq!(env.data["songId"], "7");

        let env = PushMessage::UserLogin {
            username: "Listener".into(),
            user_id: "user_abc".into(),
        }
        .into_envelope(5);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "user_login");
        assert_eq!(json["data"]["userId"], "user_abc");
        assert_eq!(json["timestamp"], 5.0);
    }
}
