//! The debounce-async combinator wrapping `application.requestUpdate` (§5):
//! watcher events within the coalescing window collapse into one dispatch,
//! and a notification arriving while an update is already running queues
//! exactly one follow-up rather than piling up a backlog.
//!
//! Must run inside a `tokio::task::LocalSet` — the controller graph is
//! `Rc`-based and not `Send`, matching the single-threaded cooperative
//! scheduler assumed throughout (§5).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

use crate::application::Application;

/// The only user-facing configuration surface: the debounce window and
/// whether to attempt full transitive `export *` cycle detection (unused by
/// the core today — see `instance::resolve_export`'s doc comment — kept
/// here so a future implementation of the open question has a home that
/// doesn't require an API break).
#[derive(Debug, Clone, Copy)]
pub struct UpdateConfig {
    pub debounce_window: Duration,
    pub cyclic_star_export_detection: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(100),
            cyclic_star_export_detection: false,
        }
    }
}

pub struct DebouncedUpdater {
    app: Rc<Application>,
    window: Duration,
    timer: RefCell<Option<JoinHandle<()>>>,
    in_flight: Rc<Cell<bool>>,
    queued: Rc<Cell<bool>>,
}

impl DebouncedUpdater {
    pub fn new(app: Rc<Application>, config: UpdateConfig) -> Self {
        Self {
            app,
            window: config.debounce_window,
            timer: RefCell::new(None),
            in_flight: Rc::new(Cell::new(false)),
            queued: Rc::new(Cell::new(false)),
        }
    }

    /// Watcher callback entry point. Resets the coalescing timer; only the
    /// last notification within `window` actually triggers a dispatch.
    pub fn notify(&self) {
        if let Some(handle) = self.timer.borrow_mut().take() {
            handle.abort();
        }
        let app = self.app.clone();
        let in_flight = self.in_flight.clone();
        let queued = self.queued.clone();
        let window = self.window;
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(window).await;
            fire(app, in_flight, queued).await;
        });
        *self.timer.borrow_mut() = Some(handle);
    }
}

async fn fire(app: Rc<Application>, in_flight: Rc<Cell<bool>>, queued: Rc<Cell<bool>>) {
    if in_flight.get() {
        queued.set(true);
        return;
    }
    in_flight.set(true);
    loop {
        queued.set(false);
        let outcome = app.request_update().await;
        debug!("requestUpdate settled: {outcome:?}");
        if !queued.get() {
            break;
        }
    }
    in_flight.set(false);
}
