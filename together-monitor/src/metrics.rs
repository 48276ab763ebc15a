//! Live state tracked for the monitor

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use together_core::sync::{PlayMode, PlaybackState, Track};
use together_core::{ConnectionState, TransportMode};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Transport,
    Playback,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Transport => "LINK",
            LogLevel::Playback => "PLAY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorStatus {
    Starting,
    Connected,
    Disconnected,
    Error,
}

/// Everything the dashboard renders
pub struct MonitorState {
    pub start_time: DateTime<Local>,
    pub server_url: String,
    pub status: MonitorStatus,

    pub transport: TransportMode,
    pub user_count: u32,
    pub last_heartbeat: Option<DateTime<Local>>,
    pub connection_error: Option<String>,
    /// Times the link changed transport (push promotions and fallbacks)
    pub transport_changes: u64,

    pub playlist: Vec<String>,
    pub current_index: Option<usize>,
    pub is_playing: bool,
    pub position: f64,
    pub duration: f64,
    pub play_mode: PlayMode,
    pub tracks_played: u64,

    pub logs: VecDeque<LogEntry>,
}

impl MonitorState {
    pub fn new(server_url: String) -> Self {
        Self {
            start_time: Local::now(),
            server_url,
            status: MonitorStatus::Starting,
            transport: TransportMode::None,
            user_count: 0,
            last_heartbeat: None,
            connection_error: None,
            transport_changes: 0,
            playlist: Vec::new(),
            current_index: None,
            is_playing: false,
            position: 0.0,
            duration: 0.0,
            play_mode: PlayMode::List,
            tracks_played: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Fold in a connection update, logging what changed
    pub fn apply_connection(&mut self, state: &ConnectionState) {
        if state.transport != self.transport {
            self.log(
                LogLevel::Transport,
                format!("Transport {:?} -> {:?}", self.transport, state.transport),
            );
            if self.transport != TransportMode::None && state.transport != TransportMode::None {
                self.transport_changes += 1;
            }
            self.transport = state.transport;
        }

        if state.error != self.connection_error {
            if let Some(error) = &state.error {
                self.log(LogLevel::Warning, error.clone());
            }
            self.connection_error = state.error.clone();
        }

        if state.needs_login {
            self.log(LogLevel::Error, "Server rejected the token, login required");
        }

        if !state.server_url.is_empty() {
            self.server_url = state.server_url.clone();
        }
        self.user_count = state.user_count;
        self.last_heartbeat = state
            .last_heartbeat
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
            .map(|t| t.with_timezone(&Local));

        self.status = if state.connected {
            MonitorStatus::Connected
        } else if state.needs_login || (state.error.is_some() && !state.connecting) {
            MonitorStatus::Error
        } else if state.connecting {
            MonitorStatus::Starting
        } else {
            MonitorStatus::Disconnected
        };
    }

    pub fn apply_playback(&mut self, state: &PlaybackState) {
        if state.is_playing != self.is_playing {
            self.log(LogLevel::Playback, if state.is_playing { "Playing" } else { "Paused" });
        }
        if state.play_mode != self.play_mode {
            self.log(LogLevel::Playback, format!("Play mode: {}", state.play_mode.label()));
        }

        self.playlist = state.playlist.iter().map(display_name).collect();
        self.current_index = state.current_index;
        self.is_playing = state.is_playing;
        self.position = state.current_time;
        self.duration = state.duration;
        self.play_mode = state.play_mode;
    }

    pub fn track_changed(&mut self, track: &Track) {
        self.tracks_played += 1;
        self.log(LogLevel::Playback, format!("Now playing: {}", display_name(track)));
    }

    pub fn now_playing(&self) -> Option<&str> {
        self.current_index
            .and_then(|i| self.playlist.get(i))
            .map(String::as_str)
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let secs = Local::now().signed_duration_since(self.start_time).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        }
    }
}

/// `Artist - Name`, or just the name
pub fn display_name(track: &Track) -> String {
    match track.artist.as_deref().filter(|a| !a.is_empty()) {
        Some(artist) => format!("{} - {}", artist, track.name),
        None => track.name.clone(),
    }
}

/// `m:ss`
pub fn format_position(secs: f64) -> String {
    let total = if secs.is_finite() { secs.max(0.0) as u64 } else { 0 };
    format!("{}:{:02}", total / 60, total % 60)
}
