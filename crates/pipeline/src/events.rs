//! Domain events flowing through the event bus.
//!
//! Events decouple the pipeline from the dashboard and the keyboard
//! controller. Each variant is a state change or a control request; the
//! [`EventKind`] discriminant is what handlers subscribe to.

use std::path::PathBuf;

use crate::domain::{CompressionJob, VideoFile};

/// Summary counters published when discovery (or a refresh) completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// Files that passed the extension and size filters.
    pub files_found: usize,
    /// Files actually queued for processing.
    pub files_to_process: usize,
    /// Output newer than input; nothing to do.
    pub already_compressed: usize,
    pub ignored_small: usize,
    pub ignored_wrong_ext: usize,
    /// Stale error markers present with clean-errors off.
    pub ignored_err: usize,
    pub source_folders: usize,
}

/// Outcome attached to a `JobCompleted` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The compressed output was accepted.
    Compressed,
    /// Savings were below the threshold; the original was copied instead.
    KeptOriginal,
    /// The source already carried this system's tag and was relocated.
    AlreadyEncoded,
}

/// Overlay tabs the dashboard can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayTab {
    Shortcuts,
    Settings,
    Io,
    Errors,
    Logs,
    Tui,
}

/// All events carried by the bus.
#[derive(Debug, Clone)]
pub enum Event {
    DiscoveryStarted {
        directory: PathBuf,
    },
    DiscoveryFinished(DiscoveryStats),
    /// Pending queue changed; carries a bounded preview plus the full depth.
    QueueUpdated {
        pending: Vec<VideoFile>,
        total: usize,
    },
    JobStarted {
        job: CompressionJob,
    },
    JobProgress {
        job: CompressionJob,
        percent: f64,
    },
    JobCompleted {
        job: CompressionJob,
        outcome: CompletionOutcome,
    },
    JobFailed {
        job: CompressionJob,
        message: String,
    },
    JobSkipped {
        job: CompressionJob,
        reason: String,
    },
    HardwareCapabilityExceeded {
        job: CompressionJob,
    },
    /// Non-fatal adapter problem (e.g. metadata copy failed).
    JobWarning {
        path: PathBuf,
        message: String,
    },
    /// Keyboard request to grow or shrink the worker cap.
    ThreadControl {
        delta: i32,
    },
    /// Graceful-shutdown toggle.
    RequestShutdown,
    /// Immediate interrupt; cancels in-flight transcodes.
    InterruptRequested,
    RefreshRequested,
    RefreshFinished {
        added: usize,
        removed: usize,
    },
    /// Short feedback line shown in the dashboard for a bounded time.
    ActionMessage {
        message: String,
    },
    /// Freeze admission until refresh or shutdown.
    PauseRequested {
        reason: String,
    },
    /// Tear the run down.
    FatalRequested {
        reason: String,
    },
    ProcessingFinished,
    /// Processing is done and the run is waiting for operator input.
    WaitingForInput,
    ToggleOverlayTab {
        tab: Option<OverlayTab>,
    },
    CycleOverlayTab {
        direction: i8,
    },
    CycleLogsPage {
        direction: i8,
    },
    CloseOverlay,
}

/// Discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DiscoveryStarted,
    DiscoveryFinished,
    QueueUpdated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobSkipped,
    HardwareCapabilityExceeded,
    JobWarning,
    ThreadControl,
    RequestShutdown,
    InterruptRequested,
    RefreshRequested,
    RefreshFinished,
    ActionMessage,
    PauseRequested,
    FatalRequested,
    ProcessingFinished,
    WaitingForInput,
    ToggleOverlayTab,
    CycleOverlayTab,
    CycleLogsPage,
    CloseOverlay,
}

impl EventKind {
    /// Every kind, for subscribe-to-everything consumers like the UI manager.
    pub const ALL: &'static [EventKind] = &[
        EventKind::DiscoveryStarted,
        EventKind::DiscoveryFinished,
        EventKind::QueueUpdated,
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobSkipped,
        EventKind::HardwareCapabilityExceeded,
        EventKind::JobWarning,
        EventKind::ThreadControl,
        EventKind::RequestShutdown,
        EventKind::InterruptRequested,
        EventKind::RefreshRequested,
        EventKind::RefreshFinished,
        EventKind::ActionMessage,
        EventKind::PauseRequested,
        EventKind::FatalRequested,
        EventKind::ProcessingFinished,
        EventKind::WaitingForInput,
        EventKind::ToggleOverlayTab,
        EventKind::CycleOverlayTab,
        EventKind::CycleLogsPage,
        EventKind::CloseOverlay,
    ];
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DiscoveryStarted { .. } => EventKind::DiscoveryStarted,
            Event::DiscoveryFinished(_) => EventKind::DiscoveryFinished,
            Event::QueueUpdated { .. } => EventKind::QueueUpdated,
            Event::JobStarted { .. } => EventKind::JobStarted,
            Event::JobProgress { .. } => EventKind::JobProgress,
            Event::JobCompleted { .. } => EventKind::JobCompleted,
            Event::JobFailed { .. } => EventKind::JobFailed,
            Event::JobSkipped { .. } => EventKind::JobSkipped,
            Event::HardwareCapabilityExceeded { .. } => EventKind::HardwareCapabilityExceeded,
            Event::JobWarning { .. } => EventKind::JobWarning,
            Event::ThreadControl { .. } => EventKind::ThreadControl,
            Event::RequestShutdown => EventKind::RequestShutdown,
            Event::InterruptRequested => EventKind::InterruptRequested,
            Event::RefreshRequested => EventKind::RefreshRequested,
            Event::RefreshFinished { .. } => EventKind::RefreshFinished,
            Event::ActionMessage { .. } => EventKind::ActionMessage,
            Event::PauseRequested { .. } => EventKind::PauseRequested,
            Event::FatalRequested { .. } => EventKind::FatalRequested,
            Event::ProcessingFinished => EventKind::ProcessingFinished,
            Event::WaitingForInput => EventKind::WaitingForInput,
            Event::ToggleOverlayTab { .. } => EventKind::ToggleOverlayTab,
            Event::CycleOverlayTab { .. } => EventKind::CycleOverlayTab,
            Event::CycleLogsPage { .. } => EventKind::CycleLogsPage,
            Event::CloseOverlay => EventKind::CloseOverlay,
        }
    }
}
