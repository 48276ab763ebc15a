//! Terminal dashboard for the session monitor

use crate::listener::{self, ListenerConfig};
use crate::metrics::{format_position, LogLevel, MonitorState, MonitorStatus};
use crate::BoxError;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use together_core::TransportMode;

/// Scroll state for the activity log
struct DashboardState {
    /// Entries scrolled back from the newest (0 = following)
    log_scroll: usize,
    auto_scroll: bool,
}

impl DashboardState {
    /// Returns true when the user asked to quit
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        let oldest = log_count.saturating_sub(1);
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Up | KeyCode::Char('k') => self.scroll_back(1, oldest),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_forward(1),
            KeyCode::PageUp => self.scroll_back(10, oldest),
            KeyCode::PageDown => self.scroll_forward(10),
            KeyCode::Home => self.scroll_back(log_count, oldest),
            KeyCode::End => self.follow(),
            KeyCode::Char('a') => {
                if self.auto_scroll {
                    self.auto_scroll = false;
                } else {
                    self.follow();
                }
            }
            _ => {}
        }
        false
    }

    fn scroll_back(&mut self, by: usize, oldest: usize) {
        if oldest == 0 {
            return;
        }
        self.log_scroll = (self.log_scroll + by).min(oldest);
        self.auto_scroll = false;
    }

    fn scroll_forward(&mut self, by: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(by);
        if self.log_scroll == 0 {
            self.auto_scroll = true;
        }
    }

    fn follow(&mut self) {
        self.log_scroll = 0;
        self.auto_scroll = true;
    }
}

/// Run the dashboard
pub async fn run(state: Arc<RwLock<MonitorState>>, config: ListenerConfig) -> Result<(), BoxError> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Start the listener in background
    let state_for_listener = Arc::clone(&state);
    let listener_task = tokio::spawn(async move {
        if let Err(e) = listener::run(Arc::clone(&state_for_listener), config).await {
            state_for_listener.write().log(LogLevel::Error, format!("Listener stopped: {}", e));
        }
    });

    let mut ui = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
    };

    let tick_rate = Duration::from_millis(100);
    loop {
        if ui.auto_scroll {
            ui.log_scroll = 0;
        }

        terminal.draw(|f| draw(f, &state, &ui))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = state.read().logs.len();
                    if ui.handle_key(key, log_count) {
                        break;
                    }
                }
            }
        }
    }

    listener_task.abort();

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

fn draw(f: &mut Frame, state: &Arc<RwLock<MonitorState>>, ui: &DashboardState) {
    let m = state.read();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Connection + now playing
            Constraint::Min(8),    // Playlist + logs
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, rows[0], &m);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);
    draw_connection(f, middle[0], &m);
    draw_now_playing(f, middle[1], &m);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[2]);
    draw_playlist(f, bottom[0], &m);
    draw_logs(f, bottom[1], &m, ui);

    draw_footer(f, rows[3], ui);
}

fn draw_header(f: &mut Frame, area: Rect, m: &MonitorState) {
    let (status_text, status_color) = match m.status {
        MonitorStatus::Starting => ("CONNECTING", Color::Yellow),
        MonitorStatus::Connected => ("CONNECTED", Color::Green),
        MonitorStatus::Disconnected => ("OFFLINE", Color::DarkGray),
        MonitorStatus::Error => ("ERROR", Color::Red),
    };

    let title = Line::from(vec![
        Span::styled("Music Together Monitor", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  "),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ]);

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Session "));
    f.render_widget(header, area);
}

fn draw_connection(f: &mut Frame, area: Rect, m: &MonitorState) {
    let (transport, transport_color) = match m.transport {
        TransportMode::Push => ("push (WebSocket)", Color::Green),
        TransportMode::Poll => ("poll (HTTP)", Color::Yellow),
        TransportMode::None => ("none", Color::DarkGray),
    };
    let heartbeat = m
        .last_heartbeat
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    let mut lines = vec![
        Line::from(vec![
            Span::raw("Server: "),
            Span::styled(m.server_url.as_str(), Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Transport: "),
            Span::styled(transport, Style::default().fg(transport_color)),
            Span::styled(format!("  ({} switches)", m.transport_changes), Style::default().fg(Color::DarkGray)),
        ]),
        Line::from(vec![
            Span::raw("Listeners: "),
            Span::styled(
                m.user_count.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw("  Heartbeat: "),
            Span::styled(heartbeat, Style::default().fg(Color::White)),
        ]),
    ];
    if let Some(error) = &m.connection_error {
        lines.push(Line::from(Span::styled(error.as_str(), Style::default().fg(Color::Red))));
    }

    let block = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Connection "));
    f.render_widget(block, area);
}

fn draw_now_playing(f: &mut Frame, area: Rect, m: &MonitorState) {
    let block = Block::default().borders(Borders::ALL).title(" Now Playing ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(1), Constraint::Min(0)])
        .split(inner);

    let (state_text, state_color) = if m.is_playing { ("▶ playing", Color::Green) } else { ("⏸ paused", Color::Yellow) };
    let info = vec![
        Line::from(Span::styled(
            m.now_playing().unwrap_or("-"),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled(state_text, Style::default().fg(state_color)),
            Span::raw("  Mode: "),
            Span::styled(m.play_mode.label(), Style::default().fg(Color::Magenta)),
            Span::raw("  Played: "),
            Span::raw(m.tracks_played.to_string()),
        ]),
    ];
    f.render_widget(Paragraph::new(info), parts[0]);

    let ratio = if m.duration > 0.0 { (m.position / m.duration).clamp(0.0, 1.0) } else { 0.0 };
    let label = if m.duration > 0.0 {
        format!("{} / {}", format_position(m.position), format_position(m.duration))
    } else {
        format_position(m.position)
    };
    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio)
        .label(label);
    f.render_widget(gauge, parts[1]);
}

fn draw_playlist(f: &mut Frame, area: Rect, m: &MonitorState) {
    let visible = area.height.saturating_sub(2) as usize;
    // Keep the current track on screen
    let skip = m
        .current_index
        .map_or(0, |i| i.saturating_sub(visible.saturating_sub(1) / 2))
        .min(m.playlist.len().saturating_sub(visible));

    let items: Vec<ListItem> = m
        .playlist
        .iter()
        .enumerate()
        .skip(skip)
        .take(visible)
        .map(|(i, name)| {
            let current = m.current_index == Some(i);
            let style = if current {
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:>3} ", i + 1), Style::default().fg(Color::DarkGray)),
                Span::styled(if current { "▶ " } else { "  " }, style),
                Span::styled(name.as_str(), style),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Playlist ({}) ", m.playlist.len())),
    );
    f.render_widget(list, area);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &MonitorState, ui: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(ui.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Transport => Style::default().fg(Color::Magenta),
                LogLevel::Playback => Style::default().fg(Color::Green),
            };

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", entry.timestamp.format("%H:%M:%S")), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();

    let scroll_indicator = if ui.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - ui.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));
        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(ui.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(Margin {
                vertical: 1,
                horizontal: 0,
            }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, ui: &DashboardState) {
    let key = Style::default().fg(Color::Black).bg(Color::White);
    let (auto_text, auto_color) = if ui.auto_scroll { ("ON ", Color::Green) } else { ("OFF", Color::Yellow) };

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll  "),
        Span::styled(" PgUp/Dn ", key),
        Span::raw(" Page  "),
        Span::styled(" A ", key),
        Span::raw(" Follow: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_scrolling_stops_following() {
        let mut ui = DashboardState {
            log_scroll: 0,
            auto_scroll: true,
        };

        assert!(!ui.handle_key(press(KeyCode::Up), 5));
        assert_eq!(ui.log_scroll, 1);
        assert!(!ui.auto_scroll);

        ui.handle_key(press(KeyCode::PageUp), 5);
        assert_eq!(ui.log_scroll, 4);

        ui.handle_key(press(KeyCode::End), 5);
        assert_eq!(ui.log_scroll, 0);
        assert!(ui.auto_scroll);

        assert!(ui.handle_key(press(KeyCode::Char('q')), 5));
        assert!(ui.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL), 5));
    }

    #[test]
    fn test_no_scroll_without_history() {
        let mut ui = DashboardState {
            log_scroll: 0,
            auto_scroll: true,
        };
        ui.handle_key(press(KeyCode::Home), 1);
        assert_eq!(ui.log_scroll, 0);
        assert!(ui.auto_scroll);
    }
}
