/// dgxsim live monitor: attach to a running shell at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz [snapshot-path]
///
/// Polls the shell's snapshot (default /tmp/dgxsim_live.json, or
/// DGXSIM_SNAPSHOT_PATH) every 200ms and renders a live TUI dashboard:
///
///     ┌ header: cluster / drift status / last command ─────────────┐
///     │ node × GPU health heatmap       │ Summary gauges + counts  │
///     │ recent fault and state events                              │
///     │ q/esc: quit  …footer…                                      │
///
/// Press q or Esc to quit. The shell keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use dgxsim::cluster::SlurmState;
use dgxsim::config::SimConfig;
use dgxsim::gpu::HealthStatus;
use dgxsim::metrics::{read_metrics, LiveMetrics};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| SimConfig::load().snapshot_path);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics(path);
        terminal.draw(|f| render(f, metrics.as_ref(), path))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn health_color(h: HealthStatus) -> Color {
    match h {
        HealthStatus::OK => Color::Green,
        HealthStatus::Warning => Color::Yellow,
        HealthStatus::Critical => Color::Red,
    }
}

fn dim(text: impl Into<String>) -> Span<'static> {
    Span::styled(text.into(), Style::default().fg(Color::DarkGray))
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>, path: &Path) {
    let area = f.area();
    let num_nodes = metrics.map(|m| m.nodes.len()).unwrap_or(8);
    let events_height = metrics.map(|m| m.recent_events.len()).unwrap_or(0).clamp(1, 8) as u16 + 2;

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),                         // header
            Constraint::Min((num_nodes as u16 + 4).min(20)), // heatmap + summary
            Constraint::Length(events_height),             // events
            Constraint::Length(1),                         // footer
        ])
        .split(area);

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(58), Constraint::Percentage(42)])
        .split(rows[1]);

    render_heatmap(f, cols[0], metrics);
    render_summary(f, cols[1], metrics);
    render_events(f, rows[2], metrics);
    render_footer(f, rows[3], path);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚡ dgxsim cluster monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, status, generation, last) = metrics
        .map(|m| {
            (
                m.cluster_name.as_str(),
                m.status.as_str(),
                m.generation,
                m.last_command.as_deref().unwrap_or("—"),
            )
        })
        .unwrap_or(("—", "offline", 0, "—"));

    let status_color = match status {
        "running" => Color::Green,
        "paused" => Color::Yellow,
        _ => Color::DarkGray,
    };

    let spans = vec![
        dim("  cluster: "),
        Span::styled(name.to_string(), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        dim("   drift: "),
        Span::styled(status.to_uppercase(), Style::default().fg(status_color).add_modifier(Modifier::BOLD)),
        dim("   gen: "),
        Span::raw(generation.to_string()),
        dim("   last: "),
        Span::styled(last.to_string(), Style::default().fg(Color::Cyan)),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Health heatmap: one row per node, one cell per GPU
// ---------------------------------------------------------------------------

fn render_heatmap(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let title = metrics
        .map(|m| format!(" GPU health: {} nodes × {} GPUs ", m.nodes.len(), m.gpus_per_node))
        .unwrap_or_else(|| " GPU health ".to_string());
    let block = Block::default().title(title).borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        f.render_widget(
            Paragraph::new(vec![
                Line::raw(""),
                Line::from(dim("  No shell running.")),
                Line::from(dim("  Start dgxsim to see live data.")),
            ]),
            inner,
        );
        return;
    };

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" OK   "),
        Span::styled("██", Style::default().fg(Color::Yellow)),
        Span::raw(" Warning   "),
        Span::styled("██", Style::default().fg(Color::Red)),
        Span::raw(" Critical   "),
        dim("(number = util %)"),
    ]);
    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    for node in &m.nodes {
        let mut spans: Vec<Span> = vec![Span::styled(
            format!("  {:<8} ", node.id),
            Style::default().fg(health_color(node.health)),
        )];
        for g in &node.gpus {
            let color = health_color(g.health);
            spans.push(Span::styled(
                format!("{:>3}", g.utilization_pct),
                Style::default().fg(Color::Black).bg(color),
            ));
            spans.push(Span::raw(" "));
        }
        let state_color = match node.slurm_state {
            SlurmState::Drain | SlurmState::Down => Color::Red,
            SlurmState::Alloc | SlurmState::Mix => Color::Cyan,
            SlurmState::Idle => Color::DarkGray,
        };
        spans.push(Span::styled(format!(" {:<5}", node.slurm_state), Style::default().fg(state_color)));
        if node.degraded_ports > 0 {
            spans.push(Span::styled(
                format!(" IB×{}", node.degraded_ports),
                Style::default().fg(Color::Yellow),
            ));
        }
        lines.push(Line::from(spans));
    }

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Summary panel
// ---------------------------------------------------------------------------

fn ratio_gauge(title: &str, part: usize, total: usize, color: Color) -> Gauge<'static> {
    let pct = if total > 0 { (part * 100 / total) as u16 } else { 0 };
    Gauge::default()
        .block(Block::default().title(title.to_string()))
        .gauge_style(Style::default().fg(color))
        .percent(pct.min(100))
        .label(format!("{} / {}", part, total))
}

fn render_summary(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Summary ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };
    let s = &m.summary;

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // healthy GPUs
            Constraint::Length(2), // NVLinks
            Constraint::Length(2), // IB ports
            Constraint::Length(2), // utilization
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let gpu_color = if s.critical_gpus > 0 {
        Color::Red
    } else if s.warning_gpus > 0 {
        Color::Yellow
    } else {
        Color::Green
    };
    f.render_widget(ratio_gauge("Healthy GPUs", s.healthy_gpus, s.total_gpus, gpu_color), rows[0]);
    f.render_widget(
        ratio_gauge("NVLinks active", s.active_nvlinks, s.active_nvlinks + s.down_nvlinks, Color::Blue),
        rows[1],
    );
    f.render_widget(
        ratio_gauge("IB ports active", s.active_ib_ports, s.active_ib_ports + s.degraded_ib_ports, Color::Magenta),
        rows[2],
    );
    let util_gauge = Gauge::default()
        .block(Block::default().title("Avg utilization"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(s.avg_utilization_pct.clamp(0.0, 100.0) as u16)
        .label(format!("{:.1}%", s.avg_utilization_pct));
    f.render_widget(util_gauge, rows[3]);

    let slurm: Vec<String> = s.nodes_by_slurm_state.iter().map(|(k, v)| format!("{} {}", v, k)).collect();
    let text = vec![
        Line::from(vec![
            dim("Warning:   "),
            Span::styled(s.warning_gpus.to_string(), Style::default().fg(Color::Yellow)),
            dim("   Critical: "),
            Span::styled(s.critical_gpus.to_string(), Style::default().fg(Color::Red)),
        ]),
        Line::from(vec![dim("Avg temp:  "), Span::raw(format!("{:.1} °C", s.avg_temperature_c))]),
        Line::from(vec![dim("Power:     "), Span::raw(format!("{:.1} kW", s.total_power_w / 1000.0))]),
        Line::from(vec![
            dim("Fabric:    "),
            Span::raw(format!("NVLink {:.0} GB/s │ IB {:.0} GB/s", m.nvlink_bw_gb_s, m.infiniband_bw_gb_s)),
        ]),
        Line::from(vec![dim("Slurm:     "), Span::raw(slurm.join(", "))]),
    ];
    f.render_widget(Paragraph::new(text), rows[4]);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn render_events(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Recent events ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let events = metrics.map(|m| m.recent_events.as_slice()).unwrap_or(&[]);
    if events.is_empty() {
        f.render_widget(Paragraph::new(Line::from(dim("  —"))), inner);
        return;
    }
    let lines: Vec<Line> = events
        .iter()
        .rev()
        .map(|e| {
            let color = if e.message.contains("Critical") {
                Color::Red
            } else if e.message.contains("Warning") || e.message.contains("fault") {
                Color::Yellow
            } else {
                Color::Gray
            };
            let time = chrono::DateTime::from_timestamp_millis(e.timestamp_ms as i64)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            Line::from(vec![
                dim(format!("  {} ", time)),
                Span::styled(format!("{:<8} ", e.node), Style::default().fg(Color::Cyan)),
                Span::styled(e.message.clone(), Style::default().fg(color)),
            ])
        })
        .collect();
    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect, path: &Path) {
    let text = Paragraph::new(Span::styled(
        format!("  q / esc: quit    auto-refreshes every 200ms    reads {}", path.display()),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
