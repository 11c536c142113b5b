//! Terminal dashboard and keyboard controller for av1-batch.
//!
//! The dashboard renders a locked view model that the UI manager keeps in
//! sync with the event bus; the keyboard controller feeds control events
//! back into the bus from a dedicated input thread.

pub mod dashboard;
pub mod keyboard;
pub mod manager;
pub mod state;

pub use dashboard::{format_duration, format_size, restore_terminal, run_dashboard, setup_terminal};
pub use keyboard::{map_key, KeyboardController};
pub use manager::UiManager;
pub use state::{ActiveJob, Counters, SessionLogEntry, UiSnapshot, UiState, LOGS_PAGE_SIZE};
