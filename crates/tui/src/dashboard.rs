//! Terminal dashboard rendering the shared view model.
//!
//! Rendering only: the keyboard controller owns input, the UI manager owns
//! state updates. The dashboard samples a snapshot a few times per second
//! and draws it.

use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use av1_batch_pipeline::OverlayTab;

use crate::state::{UiSnapshot, UiState, OVERLAY_TABS};

const DRAW_INTERVAL: Duration = Duration::from_millis(250);

/// Initialize the terminal for rendering.
pub fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore the terminal to its normal state.
pub fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draw loop; returns when `stop` is set.
pub fn run_dashboard(state: Arc<UiState>, stop: Arc<AtomicBool>) -> io::Result<()> {
    let mut terminal = setup_terminal()?;
    let result = loop {
        if stop.load(Ordering::Acquire) {
            break Ok(());
        }
        let snapshot = state.snapshot();
        if let Err(e) = terminal.draw(|f| draw(f, &snapshot)) {
            break Err(e);
        }
        std::thread::sleep(DRAW_INTERVAL);
    };
    restore_terminal(&mut terminal)?;
    result
}

pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}TB")
}

pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn draw(f: &mut Frame, snapshot: &UiSnapshot) {
    let area = f.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(area);

    draw_header(f, chunks[0], snapshot);

    let content = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(chunks[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(content[0]);
    draw_active_jobs(f, left[0], snapshot);
    draw_recent_jobs(f, left[1], snapshot);

    draw_queue(f, content[1], snapshot);
    draw_status_bar(f, chunks[2], snapshot);

    if snapshot.show_overlay {
        draw_overlay(f, area, snapshot);
    }
}

fn draw_header(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let counters = snapshot.counters;
    let mut spans = vec![
        Span::styled(
            format!(" {} ", snapshot.title),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "| Done: {} | Kept: {} | Failed: {} | HW-cap: {} | Skipped: {} ",
            counters.completed,
            counters.kept_original,
            counters.failed,
            counters.hw_cap,
            counters.skipped
        )),
        Span::raw(format!(
            "| Threads: {}/{} | {:.1} MB/s",
            snapshot.current_threads, snapshot.runtime_max_threads, snapshot.throughput_mb_s
        )),
    ];
    if let Some(eta) = snapshot.eta_secs {
        spans.push(Span::raw(format!(" | ETA {}", format_duration(eta))));
    }
    if snapshot.total_input_bytes > 0 {
        let saved = snapshot
            .total_input_bytes
            .saturating_sub(snapshot.total_output_bytes);
        spans.push(Span::raw(format!(" | Saved {}", format_size(saved))));
    }

    let header = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn draw_active_jobs(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" Active ({}) ", snapshot.active_jobs.len()));
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = snapshot.active_jobs.len().min((inner.height as usize).max(1));
    if rows == 0 {
        return;
    }
    let constraints = vec![Constraint::Length(1); rows];
    let slots = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(inner);

    for (slot, active) in slots.iter().zip(snapshot.active_jobs.iter()) {
        let label = format!(
            "{} {} {} {:.0}%",
            active.job.file_name(),
            active.job.quality_display,
            format_size(active.job.source.size_bytes),
            active.progress_percent
        );
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(Color::Cyan))
            .ratio((active.progress_percent / 100.0).clamp(0.0, 1.0))
            .label(label);
        f.render_widget(gauge, *slot);
    }
}

fn status_cell(job: &av1_batch_pipeline::CompressionJob) -> Cell<'static> {
    use av1_batch_pipeline::JobStatus;
    let (text, color) = match job.status {
        JobStatus::Completed => ("done", Color::Green),
        JobStatus::KeptOriginal => ("kept", Color::Yellow),
        JobStatus::Failed => ("failed", Color::Red),
        JobStatus::HwCapExceeded => ("hw-cap", Color::Magenta),
        JobStatus::Skipped => ("skipped", Color::DarkGray),
        JobStatus::Interrupted => ("stopped", Color::Red),
        JobStatus::Pending | JobStatus::Processing => ("...", Color::Gray),
    };
    Cell::from(text).style(Style::default().fg(color))
}

fn draw_recent_jobs(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let rows: Vec<Row> = snapshot
        .recent_jobs
        .iter()
        .map(|job| {
            let size_after = job
                .output_size_bytes
                .map(format_size)
                .unwrap_or_else(|| "-".to_string());
            Row::new(vec![
                status_cell(job),
                Cell::from(job.file_name()),
                Cell::from(format_size(job.source.size_bytes)),
                Cell::from(size_after),
                Cell::from(
                    job.duration_seconds
                        .map(format_duration)
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(8),
        Constraint::Min(20),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(8),
    ];
    let table = Table::new(rows, widths)
        .block(Block::default().borders(Borders::ALL).title(" Recent "));
    f.render_widget(table, area);
}

fn draw_queue(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let mut lines: Vec<Line> = Vec::new();
    if snapshot.discovery_finished {
        let d = &snapshot.discovery;
        lines.push(Line::from(format!(
            "found {} | queued {} | done before {}",
            d.files_found, d.files_to_process, d.already_compressed
        )));
        lines.push(Line::from(format!(
            "small {} | ext {} | err {}",
            d.ignored_small, d.ignored_wrong_ext, d.ignored_err
        )));
        lines.push(Line::from(""));
    }
    for file in &snapshot.pending_preview {
        lines.push(Line::from(format!(
            "{}  {}",
            file.file_name(),
            format_size(file.size_bytes)
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Queue ({}) ", snapshot.pending_total)),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn draw_status_bar(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let mut status = if snapshot.interrupt_requested {
        " INTERRUPTING ".to_string()
    } else if snapshot.shutdown_requested {
        " SHUTDOWN (press S to cancel) ".to_string()
    } else if snapshot.paused {
        " PAUSED (r refresh / s shutdown) ".to_string()
    } else if snapshot.waiting_for_input {
        " WAITING (r refresh / s quit) ".to_string()
    } else if snapshot.finished {
        " FINISHED ".to_string()
    } else {
        " RUNNING ".to_string()
    };
    if let Some(action) = &snapshot.last_action {
        status.push_str("| ");
        status.push_str(action);
        status.push(' ');
    }
    status.push_str("| , . threads  s shutdown  r refresh  Tab tabs  Ctrl+C abort ");

    let bar = Paragraph::new(status)
        .style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(bar, area);
}

fn overlay_title(tab: OverlayTab) -> &'static str {
    match tab {
        OverlayTab::Shortcuts => "Shortcuts",
        OverlayTab::Settings => "Settings",
        OverlayTab::Io => "Input/Output",
        OverlayTab::Errors => "Errors",
        OverlayTab::Logs => "Logs",
        OverlayTab::Tui => "Display",
    }
}

fn centered_rect(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

fn draw_overlay(f: &mut Frame, area: Rect, snapshot: &UiSnapshot) {
    let popup = centered_rect(area, 70, 70);
    f.render_widget(Clear, popup);

    let tabs_line: String = OVERLAY_TABS
        .iter()
        .map(|tab| {
            if *tab == snapshot.active_tab {
                format!("[{}]", overlay_title(*tab))
            } else {
                format!(" {} ", overlay_title(*tab))
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut lines: Vec<Line> = vec![Line::from(tabs_line), Line::from("")];
    match snapshot.active_tab {
        OverlayTab::Shortcuts => {
            for entry in [
                ", / <   fewer worker threads",
                ". / >   more worker threads",
                "s       toggle graceful shutdown",
                "r       refresh the queue",
                "c f m e l t   overlay tabs",
                "Tab     next tab, [ ] log pages",
                "Esc     close overlay",
                "Ctrl+C  interrupt immediately",
            ] {
                lines.push(Line::from(entry));
            }
        }
        OverlayTab::Settings | OverlayTab::Io => {
            for entry in &snapshot.config_lines {
                lines.push(Line::from(entry.clone()));
            }
        }
        OverlayTab::Errors | OverlayTab::Logs => {
            lines.push(Line::from(format!(
                "{} entries | page {}/{}",
                snapshot.session_log_total,
                snapshot.logs_page + 1,
                snapshot.logs_page_count
            )));
            lines.push(Line::from(""));
            for entry in &snapshot.session_log_page {
                lines.push(Line::from(format!(
                    "{} {} - {}",
                    entry.at.format("%H:%M:%S"),
                    entry.file_name,
                    entry.message
                )));
            }
        }
        OverlayTab::Tui => {
            lines.push(Line::from("Dashboard refreshes 4x per second."));
            lines.push(Line::from(
                "Progress bars show transcoder positions; the queue panel",
            ));
            lines.push(Line::from("previews the pending deque in submit order."));
        }
    }

    let overlay = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" {} ", overlay_title(snapshot.active_tab))),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(overlay, popup);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_formatting_scales_units() {
        assert_eq!(format_size(512), "512.0B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0GB");
    }

    #[test]
    fn duration_formatting_picks_units() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3700.0), "1h 1m");
        assert_eq!(format_duration(-5.0), "0s");
    }

    #[test]
    fn overlay_titles_cover_all_tabs() {
        for tab in OVERLAY_TABS {
            assert!(!overlay_title(*tab).is_empty());
        }
    }
}
