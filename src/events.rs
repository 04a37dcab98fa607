//! Event definitions for the application event loop.
//!
//! Registry and console callbacks arrive on supervisor and pump tasks. The
//! [`EventBridge`] turns each of them into an [`Event`] on the loop's channel,
//! so only the loop ever touches UI state.

use crossterm::event::KeyEvent;
use tokio::sync::mpsc;

use crate::console::ConsoleView;
use crate::error::LaunchError;
use crate::registry::RegistryListener;
use crate::slot::SlotId;

/// Termination signal received by servdeck itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A server process was spawned.
    ProcessStarted { slot: SlotId, pid: Option<u32> },
    /// A server process exited; `None` when the OS gave no code.
    ProcessEnded { slot: SlotId, code: Option<i32> },
    /// `start` failed before the process ran.
    StartupFailed { slot: SlotId, error: String },
    /// Decoded console output.
    ConsoleOutput { slot: SlotId, text: String },
    OutputEnabled { slot: SlotId, enabled: bool },
    InputEnabled { slot: SlotId, enabled: bool },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// A line read from servdeck's own stdin (headless mode).
    Line(String),
    Shutdown { signal: ShutdownSignal },
}

/// Forwards registry and console callbacks to the event loop.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBridge {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    fn send(&self, event: Event) {
        // The loop is gone only during teardown.
        let _ = self.tx.send(event);
    }
}

impl RegistryListener for EventBridge {
    fn on_process_started(&self, slot: SlotId, pid: Option<u32>) {
        self.send(Event::ProcessStarted { slot, pid });
    }

    fn on_process_ended(&self, slot: SlotId, code: Option<i32>) {
        self.send(Event::ProcessEnded { slot, code });
    }

    fn on_startup_failed(&self, slot: SlotId, error: &LaunchError) {
        self.send(Event::StartupFailed {
            slot,
            error: error.to_string(),
        });
    }
}

impl ConsoleView for EventBridge {
    fn append(&self, slot: SlotId, text: String) {
        self.send(Event::ConsoleOutput { slot, text });
    }

    fn output_enabled(&self, slot: SlotId, enabled: bool) {
        self.send(Event::OutputEnabled { slot, enabled });
    }

    fn input_enabled(&self, slot: SlotId, enabled: bool) {
        self.send(Event::InputEnabled { slot, enabled });
    }
}
