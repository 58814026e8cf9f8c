//! Terminal dashboard with one gauge per probe
//!
//! Run with: cargo run --example gauge_dashboard
//!
//! ## Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | `S` | Start a new scan |
//! | `Up/Down` | Select a device |
//! | `Enter` | Connect to the selected device |
//! | `D` | Disconnect |
//! | `Tab` | Switch the probe whose threshold is edited |
//! | `+/-` | Raise/lower the threshold by 1°C |
//! | `U` | Toggle temperature units |
//! | `Q/Esc` | Quit |

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{prelude::*, widgets::*};
use smart_temp_ble::{
    celsius_to_fahrenheit, utils::gauge_fraction, DeviceManager, Probe, Result,
    TelemetrySnapshot,
};
use std::io::{self, stdout, Stdout};
use std::time::Duration;

/// Gauge full scale in °C.
const FULL_SCALE_CELSIUS: f64 = 300.0;

/// Temperature unit preference
#[derive(Clone, Copy, PartialEq, Eq)]
enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    fn format(&self, celsius: f64) -> String {
        match self {
            TemperatureUnit::Celsius => format!("{:.1}°C", celsius),
            TemperatureUnit::Fahrenheit => format!("{:.1}°F", celsius_to_fahrenheit(celsius)),
        }
    }

    fn toggle(&self) -> Self {
        match self {
            TemperatureUnit::Celsius => TemperatureUnit::Fahrenheit,
            TemperatureUnit::Fahrenheit => TemperatureUnit::Celsius,
        }
    }
}

struct App {
    manager: DeviceManager,
    snapshot: TelemetrySnapshot,
    selected_device: usize,
    edited_probe: Probe,
    unit: TemperatureUnit,
    status: String,
}

impl App {
    async fn new() -> Result<Self> {
        let manager = DeviceManager::new().await?;
        let snapshot = manager.snapshot();
        Ok(Self {
            manager,
            snapshot,
            selected_device: 0,
            edited_probe: Probe::P1,
            unit: TemperatureUnit::Celsius,
            status: "Press S to scan".to_string(),
        })
    }

    fn refresh(&mut self) {
        self.snapshot = self.manager.snapshot();
        let count = self.snapshot.devices.len();
        if count > 0 && self.selected_device >= count {
            self.selected_device = count - 1;
        }
    }

    async fn connect_selected(&mut self) {
        let Some(device) = self.snapshot.devices.get(self.selected_device).cloned() else {
            self.status = "No device selected".to_string();
            return;
        };
        self.status = match self.manager.connect(device.id.as_str()).await {
            Ok(()) => format!("Connecting to {}", device.display_name()),
            Err(e) => format!("Connect rejected: {}", e),
        };
    }

    async fn nudge_threshold(&mut self, delta: f64) {
        let current = self.snapshot.threshold(self.edited_probe).celsius();
        if let Err(e) = self
            .manager
            .set_threshold(self.edited_probe, current + delta)
            .await
        {
            self.status = format!("Threshold not set: {}", e);
        }
    }
}

/// Main terminal type alias
type Terminal = ratatui::Terminal<CrosstermBackend<Stdout>>;

fn setup_terminal() -> io::Result<Terminal> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()
}

fn render_ui(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(3), // P1 gauge
            Constraint::Length(3), // P2 gauge
            Constraint::Min(5),    // Devices
            Constraint::Length(1), // Status bar
        ])
        .split(frame.area());

    let header = Paragraph::new(format!(
        " BBQ THERMOMETER | {} | Malformed: {} ",
        app.snapshot.connection_state,
        app.manager.malformed_payloads()
    ))
    .block(Block::default().borders(Borders::ALL));
    frame.render_widget(header, chunks[0]);

    for (probe, area) in Probe::ALL.into_iter().zip([chunks[1], chunks[2]]) {
        render_gauge(frame, area, app, probe);
    }

    let items: Vec<ListItem> = app
        .snapshot
        .devices
        .iter()
        .map(|d| {
            ListItem::new(format!(
                "{:<24} {:>5} dBm  {}",
                d.display_name(),
                d.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".to_string()),
                d.id
            ))
        })
        .collect();
    let mut list_state = ListState::default();
    if !items.is_empty() {
        list_state.select(Some(app.selected_device));
    }
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Devices "))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    frame.render_stateful_widget(list, chunks[3], &mut list_state);

    let status = Paragraph::new(format!(
        " {} | editing {} | S scan  Enter connect  D disconnect  Tab/+/- threshold  U units  Q quit",
        app.status, app.edited_probe
    ));
    frame.render_widget(status, chunks[4]);
}

fn render_gauge(frame: &mut Frame, area: Rect, app: &App, probe: Probe) {
    let reading = app.snapshot.temperature(probe).unwrap_or_default();
    let threshold = app.snapshot.threshold(probe);
    let raised = app.snapshot.alert(probe).is_raised();

    let label = match reading.celsius() {
        Some(c) => app.unit.format(c),
        None => "--".to_string(),
    };
    let mut title = format!(" {} (target {}) ", probe, app.unit.format(threshold.celsius()));
    if probe == app.edited_probe {
        title.push('*');
    }

    let color = if raised { Color::Red } else { Color::Green };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(color))
        .ratio(gauge_fraction(reading, FULL_SCALE_CELSIUS))
        .label(label);
    frame.render_widget(gauge, area);
}

async fn run_app(terminal: &mut Terminal, mut app: App) -> Result<()> {
    loop {
        app.refresh();

        terminal
            .draw(|frame| render_ui(frame, &app))
            .map_err(|e| smart_temp_ble::Error::Internal(format!("Draw error: {}", e)))?;

        let has_event = event::poll(Duration::from_millis(100))
            .map_err(|e| smart_temp_ble::Error::Internal(format!("Poll error: {}", e)))?;
        if !has_event {
            continue;
        }

        let event = event::read()
            .map_err(|e| smart_temp_ble::Error::Internal(format!("Read error: {}", e)))?;
        let Event::Key(key) = event else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => break,
            KeyCode::Char('s') | KeyCode::Char('S') => {
                app.manager.start_scan().await?;
                app.selected_device = 0;
                app.status = "Scanning".to_string();
            }
            KeyCode::Char('d') | KeyCode::Char('D') => {
                app.manager.disconnect().await?;
                app.status = "Disconnected".to_string();
            }
            KeyCode::Up => {
                app.selected_device = app.selected_device.saturating_sub(1);
            }
            KeyCode::Down => {
                if app.selected_device + 1 < app.snapshot.devices.len() {
                    app.selected_device += 1;
                }
            }
            KeyCode::Enter => app.connect_selected().await,
            KeyCode::Tab => {
                app.edited_probe = match app.edited_probe {
                    Probe::P1 => Probe::P2,
                    Probe::P2 => Probe::P1,
                };
            }
            KeyCode::Char('+') | KeyCode::Char('=') => app.nudge_threshold(1.0).await,
            KeyCode::Char('-') => app.nudge_threshold(-1.0).await,
            KeyCode::Char('u') | KeyCode::Char('U') => app.unit = app.unit.toggle(),
            _ => {}
        }
    }

    app.manager.shutdown().await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to a file so output doesn't interfere with the TUI
    if let Ok(log_file) = std::fs::File::create("gauge_dashboard.log") {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("smart_temp_ble=info"))
            .with_writer(std::sync::Mutex::new(log_file))
            .with_ansi(false)
            .init();
    }

    // Setup terminal
    let mut terminal = setup_terminal().map_err(|e| {
        smart_temp_ble::Error::Internal(format!("Failed to setup terminal: {}", e))
    })?;

    let result = match App::new().await {
        Ok(app) => run_app(&mut terminal, app).await,
        Err(e) => Err(e),
    };

    // Restore terminal
    let _ = restore_terminal(&mut terminal);

    result
}
