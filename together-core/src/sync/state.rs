//! Shared Playback State

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::protocol::Track;

/// How the next track is picked when advancing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, uniffi::Enum)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    /// Sequential, wrapping at the end
    #[default]
    List,
    /// Uniformly random entry
    Random,
    /// Repeat the current track
    Loop,
}

impl PlayMode {
    /// Human-readable label for notices
    pub fn label(&self) -> &'static str {
        match self {
            PlayMode::List => "list",
            PlayMode::Random => "shuffle",
            PlayMode::Loop => "repeat one",
        }
    }
}

/// Lifecycle of the loaded track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, uniffi::Enum)]
pub enum TrackPhase {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Ended,
    Error,
}

impl TrackPhase {
    /// Whether moving from `self` to `next` is a legal transition.
    /// Staying in the same phase is always allowed.
    pub fn can_transition_to(self, next: TrackPhase) -> bool {
        use TrackPhase::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (_, Idle) => true,
            (_, Loading) => true,
            (Loading, Playing) | (Loading, Paused) | (Loading, Error) => true,
            (Playing, Paused) | (Playing, Ended) | (Playing, Error) => true,
            (Paused, Playing) => true,
            _ => false,
        }
    }
}

/// Playback state shared by every client in the session
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub playlist: Vec<Track>,
    pub current_index: Option<usize>,
    pub is_playing: bool,
    /// Seconds into the current track
    pub current_time: f64,
    /// Track length in seconds, 0 when unknown
    pub duration: f64,
    pub play_mode: PlayMode,
    pub phase: TrackPhase,
    /// 0.0 to 1.0
    pub volume: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            playlist: Vec::new(),
            current_index: None,
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            play_mode: PlayMode::List,
            phase: TrackPhase::Idle,
            volume: 0.8,
        }
    }
}

impl PlaybackState {
    /// Currently selected track, if any
    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.and_then(|i| self.playlist.get(i))
    }

    /// Position of the track with `id` in the playlist
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.playlist.iter().position(|t| t.id == id)
    }

    /// Map a wire index (-1 for none) onto this playlist
    pub fn index_from_wire(&self, raw: i64) -> Option<usize> {
        usize::try_from(raw).ok().filter(|&i| i < self.playlist.len())
    }
}

/// Drop tracks whose id already appeared earlier in the list
pub fn dedup_tracks(tracks: Vec<Track>) -> Vec<Track> {
    let mut seen = std::collections::HashSet::new();
    tracks
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect()
}

/// Index to play after `current` under `mode`
pub fn next_index<R: Rng + ?Sized>(
    len: usize,
    current: Option<usize>,
    mode: PlayMode,
    rng: &mut R,
) -> Option<usize> {
    if len == 0 {
        return None;
    }

    let next = match mode {
        PlayMode::List => current.map_or(0, |i| (i + 1) % len),
        PlayMode::Random => rng.gen_range(0..len),
        PlayMode::Loop => current.filter(|&i| i < len).unwrap_or(0),
    };
    Some(next)
}

/// Index before `current`, wrapping to the last entry
pub fn previous_index(len: usize, current: Option<usize>) -> Option<usize> {
    if len == 0 {
        return None;
    }

    Some(match current {
        Some(0) | None => len - 1,
        Some(i) => (i - 1).min(len - 1),
    })
}
