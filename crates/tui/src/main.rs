//! hls-top
//!
//! Terminal dashboard for a running relay. Polls `/streams` and `/stats`
//! (default base `http://127.0.0.1:8787`, override with the first argument
//! or `HLS_RELAY_URL`).

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8787";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_VIEWER_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring relay status types)
// ============================================================================

/// One row of `GET /streams`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveStream {
    #[serde(rename = "streamId")]
    pub id: String,
    pub source: String,
    #[serde(rename = "streamUrl")]
    pub public_url: String,
    #[serde(rename = "referenceCount")]
    pub reference_count: u32,
    pub state: String,
    #[serde(rename = "createdAt")]
    pub created_at_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub pending_creations: usize,
    pub sessions_started: u64,
    pub coalesced_joins: u64,
    pub creation_failures: u64,
    pub abnormal_exits: u64,
    pub teardowns: u64,
}

/// Host resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Body of `GET /stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsResponse {
    pub timestamp_unix_ms: i64,
    pub manager: ManagerStats,
    pub host: HostMetrics,
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the dashboard
pub struct App {
    base_url: String,
    pub streams: Vec<ActiveStream>,
    pub stats: Option<StatsResponse>,
    /// Event log with sessions appearing and disappearing
    pub event_log: VecDeque<String>,
    /// Total viewers over time (elapsed_secs, viewers)
    pub viewer_history: VecDeque<(f64, f64)>,
    pub connected: bool,
    client: reqwest::Client,
    start_time: Instant,
}

/// Log lines describing how the session set changed between two polls.
pub fn session_changes(previous: &[ActiveStream], current: &[ActiveStream]) -> Vec<String> {
    let before: BTreeMap<&str, &ActiveStream> =
        previous.iter().map(|s| (s.id.as_str(), s)).collect();
    let after: BTreeMap<&str, &ActiveStream> =
        current.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut changes = Vec::new();
    for (id, stream) in &after {
        match before.get(id) {
            None => changes.push(format!("+ {} {}", short_id(id), stream.source)),
            Some(old) if old.reference_count != stream.reference_count => changes.push(format!(
                "~ {} viewers {} -> {}",
                short_id(id),
                old.reference_count,
                stream.reference_count
            )),
            Some(_) => {}
        }
    }
    for (id, stream) in &before {
        if !after.contains_key(id) {
            changes.push(format!("- {} {}", short_id(id), stream.source));
        }
    }
    changes
}

/// First block of a UUID, enough to tell sessions apart on screen
fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

impl App {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            streams: Vec::new(),
            stats: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            viewer_history: VecDeque::with_capacity(MAX_VIEWER_POINTS),
            connected: false,
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| format!("Connection failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("HTTP error on {}: {}", path, response.status()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| format!("JSON parse error on {}: {}", path, e))
    }

    /// Poll both status endpoints
    pub async fn refresh(&mut self) {
        let streams = self.get_json::<Vec<ActiveStream>>("/streams").await;
        let stats = self.get_json::<StatsResponse>("/stats").await;

        match (streams, stats) {
            (Ok(streams), Ok(stats)) => {
                if !self.connected {
                    self.log_event(format!("Connected to {}", self.base_url));
                }
                for change in session_changes(&self.streams, &streams) {
                    self.log_event(change);
                }
                self.record_viewers(&streams);
                self.streams = streams;
                self.stats = Some(stats);
                self.connected = true;
            }
            (Err(e), _) | (_, Err(e)) => {
                if self.connected {
                    self.log_event(e);
                }
                self.connected = false;
            }
        }
    }

    fn record_viewers(&mut self, streams: &[ActiveStream]) {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let viewers: u32 = streams.iter().map(|s| s.reference_count).sum();

        if self.viewer_history.len() >= MAX_VIEWER_POINTS {
            self.viewer_history.pop_front();
        }
        self.viewer_history.push_back((elapsed_secs, viewers as f64));
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the session table
fn render_sessions_table(f: &mut Frame, area: Rect, app: &App, now_ms: i64) {
    let header_cells = ["ID", "Source", "State", "Viewers", "Age"]
        .iter()
        .map(|h| {
            Cell::from(*h).style(
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            )
        });
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .streams
        .iter()
        .map(|stream| {
            let state_style = match stream.state.as_str() {
                "ready" => Style::default().fg(Color::Green),
                "failed" => Style::default().fg(Color::Red),
                _ => Style::default().fg(Color::Gray),
            };
            Row::new(vec![
                Cell::from(short_id(&stream.id).to_string()),
                Cell::from(stream.source.clone()),
                Cell::from(stream.state.clone()).style(state_style),
                Cell::from(stream.reference_count.to_string()),
                Cell::from(format_age(now_ms - stream.created_at_unix_ms)),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(10),
        Constraint::Min(24),
        Constraint::Length(10),
        Constraint::Length(8),
        Constraint::Length(10),
    ];

    let title = if app.connected {
        " Sessions "
    } else {
        " Sessions (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

/// Render CPU and memory usage gauges
fn render_host_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let host = app.stats.as_ref().map(|s| s.host.clone()).unwrap_or_default();
    let cpu = host.cpu_usage_percent as f64 / 100.0;
    let mem = host.mem_usage_percent as f64 / 100.0;

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem.clamp(0.0, 1.0))
        .label(format!("{:.1}%", mem * 100.0));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
}

/// Render lifetime counters
fn render_counters(f: &mut Frame, area: Rect, app: &App) {
    let stats = app
        .stats
        .as_ref()
        .map(|s| s.manager.clone())
        .unwrap_or_default();
    let host = app.stats.as_ref().map(|s| s.host.clone()).unwrap_or_default();

    let rows = vec![
        ("Started", stats.sessions_started.to_string()),
        ("Joins", stats.coalesced_joins.to_string()),
        ("Failures", stats.creation_failures.to_string()),
        ("Crashes", stats.abnormal_exits.to_string()),
        ("Teardowns", stats.teardowns.to_string()),
        (
            "Load",
            format!("{:.2} {:.2} {:.2}", host.load_avg_1, host.load_avg_5, host.load_avg_15),
        ),
    ]
    .into_iter()
    .map(|(label, value)| Row::new(vec![Cell::from(label), Cell::from(value)]))
    .collect::<Vec<_>>();

    let widths = [Constraint::Length(10), Constraint::Min(10)];
    let table = Table::new(rows, widths)
        .block(Block::default().borders(Borders::ALL).title(" Counters "));

    f.render_widget(table, area);
}

/// Render total viewers over time
fn render_viewer_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.viewer_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default().borders(Borders::ALL).title(" Viewers ");
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("viewers")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Viewers "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![Span::raw("0"), Span::raw(format!("{:.0}", max_y))]),
        );

    f.render_widget(chart, area);
}

/// Render event log, newest first
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with aggregate stats
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = match &app.stats {
        Some(stats) if app.connected => format!(
            " Sessions: {} | Starting: {} | Viewers: {} | Press 'q' to quit ",
            stats.manager.active_sessions,
            stats.manager.pending_creations,
            app.streams.iter().map(|s| s.reference_count).sum::<u32>(),
        ),
        _ => format!(" Connecting to {}... | Press 'q' to quit ", app.base_url),
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

/// Format a millisecond age as a short human-readable string
fn format_age(ms: i64) -> String {
    let total_secs = (ms.max(0) / 1000) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Left: sessions + events, right: host + counters + chart
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Min(0),
        ])
        .split(content_chunks[1]);

    render_sessions_table(f, left_chunks[0], app, now_unix_ms());
    render_event_log(f, left_chunks[1], app);
    render_host_gauges(f, right_chunks[0], app);
    render_counters(f, right_chunks[1], app);
    render_viewer_chart(f, right_chunks[2], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn relay_url() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HLS_RELAY_URL").ok())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let mut terminal = setup_terminal()?;

    let mut app = App::new(relay_url());
    app.log_event("hls-top started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    restore_terminal(&mut terminal)?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.refresh().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}
