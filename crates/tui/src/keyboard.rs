//! Keyboard controller: a dedicated input thread translating raw key
//! events into bus events. Delivery itself is synchronous through the bus.

use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

use av1_batch_pipeline::{Event, EventBus, OverlayTab};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Translate one key press into a bus event, if it is mapped.
///
/// The mapping: `,`/`<` and `.`/`>` adjust threads, `s` toggles graceful
/// shutdown, `r` refreshes the queue, `c f m e l t` open overlay tabs,
/// `Tab` cycles tabs, `[`/`]` page the logs tab, `Esc` closes the overlay,
/// and `Ctrl+C` requests the immediate interrupt.
pub fn map_key(code: KeyCode, modifiers: KeyModifiers) -> Option<Event> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        return match code {
            KeyCode::Char('c') | KeyCode::Char('C') => Some(Event::InterruptRequested),
            _ => None,
        };
    }

    match code {
        KeyCode::Char(',') | KeyCode::Char('<') => Some(Event::ThreadControl { delta: -1 }),
        KeyCode::Char('.') | KeyCode::Char('>') => Some(Event::ThreadControl { delta: 1 }),
        KeyCode::Char('s') | KeyCode::Char('S') => Some(Event::RequestShutdown),
        KeyCode::Char('r') | KeyCode::Char('R') => Some(Event::RefreshRequested),
        KeyCode::Char('c') | KeyCode::Char('C') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Settings),
        }),
        KeyCode::Char('f') | KeyCode::Char('F') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Io),
        }),
        KeyCode::Char('m') | KeyCode::Char('M') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Shortcuts),
        }),
        KeyCode::Char('e') | KeyCode::Char('E') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Errors),
        }),
        KeyCode::Char('l') | KeyCode::Char('L') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Logs),
        }),
        KeyCode::Char('t') | KeyCode::Char('T') => Some(Event::ToggleOverlayTab {
            tab: Some(OverlayTab::Tui),
        }),
        KeyCode::Tab => Some(Event::CycleOverlayTab { direction: 1 }),
        KeyCode::BackTab => Some(Event::CycleOverlayTab { direction: -1 }),
        KeyCode::Char('[') => Some(Event::CycleLogsPage { direction: -1 }),
        KeyCode::Char(']') => Some(Event::CycleLogsPage { direction: 1 }),
        KeyCode::Esc => Some(Event::CloseOverlay),
        _ => None,
    }
}

/// Runs the input loop on its own thread until stopped.
pub struct KeyboardController {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyboardController {
    /// Start reading keys. The terminal is expected to be in raw mode
    /// already (the dashboard puts it there).
    pub fn start(bus: Arc<EventBus>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("keyboard".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    match event::poll(POLL_INTERVAL) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            debug!("keyboard poll failed: {e}");
                            continue;
                        }
                    }
                    let Ok(TermEvent::Key(key)) = event::read() else {
                        continue;
                    };
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if let Some(mapped) = map_key(key.code, key.modifiers) {
                        bus.publish(mapped);
                    }
                }
            })
            .expect("spawn keyboard thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeyboardController {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
