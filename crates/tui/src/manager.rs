//! Folds bus events into the dashboard view model.

use std::sync::Arc;

use av1_batch_pipeline::{CompletionOutcome, Event, EventBus};

use crate::state::UiState;

/// Subscribes to every event kind and keeps [`UiState`] current. Handlers
/// run synchronously on the publishing thread and only take the state lock.
pub struct UiManager;

impl UiManager {
    pub fn attach(bus: &EventBus, state: Arc<UiState>) {
        bus.subscribe_all(move |event| match event {
            Event::DiscoveryStarted { .. } => {}
            Event::DiscoveryFinished(stats) => state.set_discovery(stats.clone()),
            Event::QueueUpdated { pending, total } => state.set_queue(pending.clone(), *total),
            Event::JobStarted { job } => state.job_started(job.clone()),
            Event::JobProgress { job, percent } => state.job_progress(job, *percent),
            Event::JobCompleted { job, outcome } => {
                let kept = matches!(outcome, CompletionOutcome::KeptOriginal);
                state.job_completed(job.clone(), kept);
            }
            Event::JobFailed { job, message } => state.job_failed(job.clone(), message.clone()),
            Event::JobSkipped { job, .. } => state.job_skipped(job.clone()),
            Event::HardwareCapabilityExceeded { job } => {
                let message = job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "hardware capability exceeded".to_string());
                state.job_hw_cap(job.clone(), message);
            }
            Event::JobWarning { path, message } => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                state.warning(file_name, message.clone());
            }
            Event::ThreadControl { .. } => {}
            Event::RequestShutdown => {}
            Event::InterruptRequested => state.set_interrupt_requested(),
            Event::RefreshRequested => {}
            Event::RefreshFinished { .. } => state.set_paused(false),
            Event::ActionMessage { message } => {
                // The shutdown toggle is visible only through its feedback
                // line, so mirror it into the state here.
                if message.starts_with("SHUTDOWN requested") {
                    state.set_shutdown_requested(true);
                } else if message.starts_with("SHUTDOWN cancelled") {
                    state.set_shutdown_requested(false);
                }
                state.set_last_action(message.clone());
            }
            Event::PauseRequested { reason } => {
                state.set_paused(true);
                state.set_last_action(format!("PAUSED: {reason}"));
            }
            Event::FatalRequested { reason } => {
                state.set_last_action(format!("FATAL: {reason}"));
            }
            Event::ProcessingFinished => state.set_finished(),
            Event::WaitingForInput => state.set_waiting_for_input(),
            Event::ToggleOverlayTab { tab } => state.toggle_overlay(*tab),
            Event::CycleOverlayTab { direction } => state.cycle_overlay_tab(*direction),
            Event::CycleLogsPage { direction } => state.cycle_logs_page(*direction),
            Event::CloseOverlay => state.close_overlay(),
        });
    }
}
