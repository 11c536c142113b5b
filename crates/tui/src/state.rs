//! View model for the dashboard, updated by the event manager and read by
//! the renderer as atomic snapshots.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use av1_batch_pipeline::{CompressionJob, DiscoveryStats, OverlayTab, VideoFile};

/// The last-action line disappears after this long.
const LAST_ACTION_TTL: Duration = Duration::from_secs(60);

/// Throughput window used for the rate and ETA estimates.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Overlay tab cycle order.
pub const OVERLAY_TABS: &[OverlayTab] = &[
    OverlayTab::Shortcuts,
    OverlayTab::Settings,
    OverlayTab::Io,
    OverlayTab::Errors,
    OverlayTab::Logs,
    OverlayTab::Tui,
];

/// Entries shown on each page of the logs tab.
pub const LOGS_PAGE_SIZE: usize = 10;

/// One failed or warned-about job captured for the logs tab.
#[derive(Debug, Clone)]
pub struct SessionLogEntry {
    pub file_name: String,
    pub message: String,
    pub at: chrono::DateTime<chrono::Local>,
}

/// An in-flight job with its observed start time.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job: CompressionJob,
    pub progress_percent: f64,
    pub started: Instant,
}

/// Aggregate counters derived from terminal job events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub completed: u64,
    pub kept_original: u64,
    pub failed: u64,
    pub hw_cap: u64,
    pub skipped: u64,
    pub interrupted: u64,
}

#[derive(Debug)]
struct Inner {
    counters: Counters,
    discovery: DiscoveryStats,
    discovery_finished: bool,
    active_jobs: Vec<ActiveJob>,
    recent_jobs: VecDeque<CompressionJob>,
    recent_capacity: usize,
    pending_preview: Vec<VideoFile>,
    pending_total: usize,
    current_threads: u32,
    runtime_max_threads: u32,
    total_input_bytes: u64,
    total_output_bytes: u64,
    throughput: VecDeque<(Instant, u64)>,
    last_action: Option<(String, Instant)>,
    shutdown_requested: bool,
    interrupt_requested: bool,
    paused: bool,
    finished: bool,
    waiting_for_input: bool,
    show_overlay: bool,
    active_tab: OverlayTab,
    logs_page: usize,
    session_log: Vec<SessionLogEntry>,
    config_lines: Vec<String>,
    title: String,
}

/// Thread-safe dashboard state.
#[derive(Debug)]
pub struct UiState {
    inner: Mutex<Inner>,
}

/// Plain copy of the state handed to the renderer.
#[derive(Debug, Clone)]
pub struct UiSnapshot {
    pub counters: Counters,
    pub discovery: DiscoveryStats,
    pub discovery_finished: bool,
    pub active_jobs: Vec<ActiveJob>,
    pub recent_jobs: Vec<CompressionJob>,
    pub pending_preview: Vec<VideoFile>,
    pub pending_total: usize,
    pub current_threads: u32,
    pub runtime_max_threads: u32,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    pub throughput_mb_s: f64,
    pub eta_secs: Option<f64>,
    pub last_action: Option<String>,
    pub shutdown_requested: bool,
    pub interrupt_requested: bool,
    pub paused: bool,
    pub finished: bool,
    pub waiting_for_input: bool,
    pub show_overlay: bool,
    pub active_tab: OverlayTab,
    pub logs_page: usize,
    pub logs_page_count: usize,
    pub session_log_page: Vec<SessionLogEntry>,
    pub session_log_total: usize,
    pub config_lines: Vec<String>,
    pub title: String,
}

impl UiState {
    pub fn new(recent_capacity: usize, initial_threads: u32, runtime_max_threads: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: Counters::default(),
                discovery: DiscoveryStats::default(),
                discovery_finished: false,
                active_jobs: Vec::new(),
                recent_jobs: VecDeque::with_capacity(recent_capacity),
                recent_capacity: recent_capacity.max(1),
                pending_preview: Vec::new(),
                pending_total: 0,
                current_threads: initial_threads,
                runtime_max_threads,
                total_input_bytes: 0,
                total_output_bytes: 0,
                throughput: VecDeque::new(),
                last_action: None,
                shutdown_requested: false,
                interrupt_requested: false,
                paused: false,
                finished: false,
                waiting_for_input: false,
                show_overlay: false,
                active_tab: OverlayTab::Shortcuts,
                logs_page: 0,
                session_log: Vec::new(),
                config_lines: Vec::new(),
                title: "av1-batch".to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ui state lock")
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.lock().title = title.into();
    }

    pub fn set_config_lines(&self, lines: Vec<String>) {
        self.lock().config_lines = lines;
    }

    pub fn set_discovery(&self, stats: DiscoveryStats) {
        let mut inner = self.lock();
        inner.discovery = stats;
        inner.discovery_finished = true;
    }

    pub fn set_queue(&self, preview: Vec<VideoFile>, total: usize) {
        let mut inner = self.lock();
        inner.pending_preview = preview;
        inner.pending_total = total;
    }

    pub fn set_threads(&self, threads: u32) {
        self.lock().current_threads = threads;
    }

    pub fn job_started(&self, job: CompressionJob) {
        let mut inner = self.lock();
        inner.active_jobs.retain(|a| a.job.source.path != job.source.path);
        inner.active_jobs.push(ActiveJob {
            job,
            progress_percent: 0.0,
            started: Instant::now(),
        });
    }

    pub fn job_progress(&self, job: &CompressionJob, percent: f64) {
        let mut inner = self.lock();
        if let Some(active) = inner
            .active_jobs
            .iter_mut()
            .find(|a| a.job.source.path == job.source.path)
        {
            active.progress_percent = percent;
        }
    }

    fn retire(inner: &mut Inner, job: CompressionJob, throughput_bytes: u64) {
        inner.active_jobs.retain(|a| a.job.source.path != job.source.path);
        if inner.recent_jobs.len() >= inner.recent_capacity {
            inner.recent_jobs.pop_back();
        }
        inner.recent_jobs.push_front(job);

        let now = Instant::now();
        inner.throughput.push_back((now, throughput_bytes));
        while let Some((at, _)) = inner.throughput.front() {
            if now.duration_since(*at) > THROUGHPUT_WINDOW {
                inner.throughput.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn job_completed(&self, job: CompressionJob, kept_original: bool) {
        let mut inner = self.lock();
        if kept_original {
            inner.counters.kept_original += 1;
        } else {
            inner.counters.completed += 1;
        }
        inner.total_input_bytes += job.source.size_bytes;
        inner.total_output_bytes += job.output_size_bytes.unwrap_or(0);
        let input_bytes = job.source.size_bytes;
        Self::retire(&mut inner, job, input_bytes);
    }

    pub fn job_failed(&self, job: CompressionJob, message: String) {
        let mut inner = self.lock();
        let interrupted = job.status == av1_batch_pipeline::JobStatus::Interrupted;
        if interrupted {
            inner.counters.interrupted += 1;
        } else {
            inner.counters.failed += 1;
        }
        inner.session_log.push(SessionLogEntry {
            file_name: job.file_name(),
            message,
            at: chrono::Local::now(),
        });
        Self::retire(&mut inner, job, 0);
    }

    pub fn job_skipped(&self, job: CompressionJob) {
        let mut inner = self.lock();
        inner.counters.skipped += 1;
        inner.active_jobs.retain(|a| a.job.source.path != job.source.path);
    }

    pub fn job_hw_cap(&self, job: CompressionJob, message: String) {
        let mut inner = self.lock();
        inner.counters.hw_cap += 1;
        inner.session_log.push(SessionLogEntry {
            file_name: job.file_name(),
            message,
            at: chrono::Local::now(),
        });
        Self::retire(&mut inner, job, 0);
    }

    pub fn warning(&self, file_name: String, message: String) {
        self.lock().session_log.push(SessionLogEntry {
            file_name,
            message,
            at: chrono::Local::now(),
        });
    }

    pub fn set_last_action(&self, message: String) {
        self.lock().last_action = Some((message, Instant::now()));
    }

    pub fn set_shutdown_requested(&self, toggled_on: bool) {
        self.lock().shutdown_requested = toggled_on;
    }

    pub fn set_interrupt_requested(&self) {
        let mut inner = self.lock();
        inner.interrupt_requested = true;
        inner.shutdown_requested = true;
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    pub fn set_finished(&self) {
        self.lock().finished = true;
    }

    pub fn set_waiting_for_input(&self) {
        self.lock().waiting_for_input = true;
    }

    pub fn toggle_overlay(&self, tab: Option<OverlayTab>) {
        let mut inner = self.lock();
        match tab {
            Some(tab) if inner.show_overlay && inner.active_tab == tab => {
                inner.show_overlay = false;
            }
            Some(tab) => {
                inner.show_overlay = true;
                inner.active_tab = tab;
            }
            None => inner.show_overlay = !inner.show_overlay,
        }
    }

    pub fn cycle_overlay_tab(&self, direction: i8) {
        let mut inner = self.lock();
        if !inner.show_overlay {
            inner.show_overlay = true;
            return;
        }
        let position = OVERLAY_TABS
            .iter()
            .position(|t| *t == inner.active_tab)
            .unwrap_or(0);
        let len = OVERLAY_TABS.len() as i64;
        let next = (position as i64 + direction as i64).rem_euclid(len) as usize;
        inner.active_tab = OVERLAY_TABS[next];
    }

    pub fn cycle_logs_page(&self, direction: i8) {
        let mut inner = self.lock();
        let pages = inner.session_log.len().div_ceil(LOGS_PAGE_SIZE).max(1);
        let next = (inner.logs_page as i64 + direction as i64).rem_euclid(pages as i64);
        inner.logs_page = next as usize;
    }

    pub fn close_overlay(&self) {
        self.lock().show_overlay = false;
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Point-in-time copy for the renderer.
    pub fn snapshot(&self) -> UiSnapshot {
        let inner = self.lock();
        let now = Instant::now();

        let window_bytes: u64 = inner.throughput.iter().map(|(_, bytes)| bytes).sum();
        let window_secs = inner
            .throughput
            .front()
            .map(|(at, _)| now.duration_since(*at).as_secs_f64())
            .unwrap_or(0.0)
            .max(1.0);
        let rate_bytes_s = window_bytes as f64 / window_secs;
        let throughput_mb_s = rate_bytes_s / (1024.0 * 1024.0);

        let remaining_files = inner.pending_total + inner.active_jobs.len();
        let eta_secs = if rate_bytes_s > 0.0 && remaining_files > 0 {
            let done = inner.counters.completed + inner.counters.kept_original;
            let avg_input = if done > 0 {
                inner.total_input_bytes as f64 / done as f64
            } else {
                0.0
            };
            (avg_input > 0.0).then(|| remaining_files as f64 * avg_input / rate_bytes_s)
        } else {
            None
        };

        let last_action = inner.last_action.as_ref().and_then(|(message, at)| {
            (now.duration_since(*at) < LAST_ACTION_TTL).then(|| message.clone())
        });

        let logs_page_count = inner.session_log.len().div_ceil(LOGS_PAGE_SIZE).max(1);
        let logs_page = inner.logs_page.min(logs_page_count - 1);
        let page_start = logs_page * LOGS_PAGE_SIZE;
        let session_log_page: Vec<SessionLogEntry> = inner
            .session_log
            .iter()
            .rev()
            .skip(page_start)
            .take(LOGS_PAGE_SIZE)
            .cloned()
            .collect();

        UiSnapshot {
            counters: inner.counters,
            discovery: inner.discovery.clone(),
            discovery_finished: inner.discovery_finished,
            active_jobs: inner.active_jobs.clone(),
            recent_jobs: inner.recent_jobs.iter().cloned().collect(),
            pending_preview: inner.pending_preview.clone(),
            pending_total: inner.pending_total,
            current_threads: inner.current_threads,
            runtime_max_threads: inner.runtime_max_threads,
            total_input_bytes: inner.total_input_bytes,
            total_output_bytes: inner.total_output_bytes,
            throughput_mb_s,
            eta_secs,
            last_action,
            shutdown_requested: inner.shutdown_requested,
            interrupt_requested: inner.interrupt_requested,
            paused: inner.paused,
            finished: inner.finished,
            waiting_for_input: inner.waiting_for_input,
            show_overlay: inner.show_overlay,
            active_tab: inner.active_tab,
            logs_page,
            logs_page_count,
            session_log_page,
            session_log_total: inner.session_log.len(),
            config_lines: inner.config_lines.clone(),
            title: inner.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av1_batch_pipeline::JobStatus;
    use std::path::PathBuf;

    fn job(name: &str, size: u64) -> CompressionJob {
        CompressionJob::new(
            VideoFile::new(PathBuf::from(format!("/in/{name}")), size),
            PathBuf::from(format!("/out/{name}")),
        )
    }

    #[test]
    fn counters_follow_terminal_events() {
        let state = UiState::new(5, 4, 8);
        let mut done = job("a.mp4", 100);
        done.output_size_bytes = Some(40);
        state.job_completed(done, false);

        let mut kept = job("b.mp4", 100);
        kept.output_size_bytes = Some(100);
        state.job_completed(kept, true);

        state.job_failed(job("c.mp4", 100), "boom".into());
        state.job_skipped(job("d.mp4", 100));
        state.job_hw_cap(job("e.mp4", 100), "cap".into());

        let counters = state.counters();
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.kept_original, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.hw_cap, 1);
    }

    #[test]
    fn interrupted_jobs_count_separately() {
        let state = UiState::new(5, 4, 8);
        let mut interrupted = job("a.mp4", 100);
        interrupted.status = JobStatus::Interrupted;
        state.job_failed(interrupted, "interrupted".into());

        let counters = state.counters();
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.interrupted, 1);
    }

    #[test]
    fn recent_jobs_are_bounded() {
        let state = UiState::new(2, 4, 8);
        for index in 0..5 {
            let mut done = job(&format!("{index}.mp4"), 10);
            done.output_size_bytes = Some(5);
            state.job_completed(done, false);
        }
        let snapshot = state.snapshot();
        assert_eq!(snapshot.recent_jobs.len(), 2);
        // Most recent first.
        assert_eq!(snapshot.recent_jobs[0].file_name(), "4.mp4");
    }

    #[test]
    fn active_jobs_track_start_and_progress() {
        let state = UiState::new(5, 4, 8);
        let running = job("a.mp4", 100);
        state.job_started(running.clone());
        state.job_progress(&running, 42.0);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.active_jobs.len(), 1);
        assert_eq!(snapshot.active_jobs[0].progress_percent, 42.0);

        let mut done = running;
        done.output_size_bytes = Some(50);
        state.job_completed(done, false);
        assert!(state.snapshot().active_jobs.is_empty());
    }

    #[test]
    fn overlay_toggle_and_cycle() {
        let state = UiState::new(5, 4, 8);
        state.toggle_overlay(Some(OverlayTab::Logs));
        assert!(state.snapshot().show_overlay);
        assert_eq!(state.snapshot().active_tab, OverlayTab::Logs);

        // Same tab again closes the overlay.
        state.toggle_overlay(Some(OverlayTab::Logs));
        assert!(!state.snapshot().show_overlay);

        state.toggle_overlay(None);
        state.cycle_overlay_tab(1);
        let tab_after = state.snapshot().active_tab;
        assert_ne!(tab_after, OverlayTab::Shortcuts);
        state.close_overlay();
        assert!(!state.snapshot().show_overlay);
    }

    #[test]
    fn logs_pagination_wraps() {
        let state = UiState::new(5, 4, 8);
        for index in 0..(LOGS_PAGE_SIZE * 2 + 3) {
            state.job_failed(job(&format!("{index}.mp4"), 1), "x".into());
        }
        let snapshot = state.snapshot();
        assert_eq!(snapshot.logs_page_count, 3);
        assert_eq!(snapshot.session_log_page.len(), LOGS_PAGE_SIZE);

        state.cycle_logs_page(-1);
        assert_eq!(state.snapshot().logs_page, 2, "backward wraps to the last page");
    }

    #[test]
    fn last_action_is_fresh() {
        let state = UiState::new(5, 4, 8);
        assert!(state.snapshot().last_action.is_none());
        state.set_last_action("Threads: 4 → 5".into());
        assert_eq!(state.snapshot().last_action.as_deref(), Some("Threads: 4 → 5"));
    }
}
