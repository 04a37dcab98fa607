//! Console channel binding one child's stdio to its console view.
//!
//! A channel owns exactly one read pump (child output) and one write pump
//! (child input). It is attached once per run; a new run gets a new channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::pump::{ClosedHook, ReadPump, WritePump};
use crate::slot::SlotId;

/// Receiver of console output and of the per-direction enabled state.
///
/// Implementations are called from pump tasks and must hand the data over to
/// whatever owns the UI instead of touching it directly.
pub trait ConsoleView: Send + Sync {
    fn append(&self, slot: SlotId, text: String);
    fn output_enabled(&self, slot: SlotId, enabled: bool);
    fn input_enabled(&self, slot: SlotId, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Child stdout (merged with stderr).
    Output,
    /// Child stdin.
    Input,
}

/// Raised once per direction when its pump closes.
pub type StreamClosedHook = Arc<dyn Fn(StreamDirection) + Send + Sync>;

pub struct ConsoleChannel {
    slot: SlotId,
    output: ReadPump,
    input: WritePump,
    output_enabled: Arc<AtomicBool>,
    input_enabled: Arc<AtomicBool>,
}

impl ConsoleChannel {
    /// Creates both pumps and starts reading `output`.
    ///
    /// Each direction is reported enabled before its pump can report closure,
    /// so a view never sees "enabled" after "disabled" for the same run.
    pub fn attach<R, W>(
        slot: SlotId,
        output: R,
        input: W,
        view: Arc<dyn ConsoleView>,
        on_stream_closed: StreamClosedHook,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let input_enabled = Arc::new(AtomicBool::new(true));
        let input = WritePump::start(
            format!("{}-stdin", slot),
            input,
            direction_closed(
                slot,
                StreamDirection::Input,
                Arc::clone(&input_enabled),
                Arc::clone(&view),
                Arc::clone(&on_stream_closed),
            ),
        );
        view.input_enabled(slot, true);

        let output_enabled = Arc::new(AtomicBool::new(true));
        view.output_enabled(slot, true);
        let sink = Arc::clone(&view);
        let output = ReadPump::start(
            format!("{}-stdout", slot),
            output,
            move |text| sink.append(slot, text),
            direction_closed(
                slot,
                StreamDirection::Output,
                Arc::clone(&output_enabled),
                view,
                on_stream_closed,
            ),
        );

        Self {
            slot,
            output,
            input,
            output_enabled,
            input_enabled,
        }
    }

    /// Queues `text` for the child without waiting on the pipe. Dropped
    /// silently once stdin has closed.
    pub fn submit_input(&self, text: &str) {
        if let Err(err) = self.input.write(text) {
            debug!(slot = %self.slot, error = %err, "dropping input for closed stdin");
        }
    }

    /// Closes whichever pumps are still open. Returns without waiting for
    /// them; each still reports its closure through the view and hook.
    pub fn close(&self) {
        if !self.output.is_closed() {
            self.output.close();
        }
        self.input.close();
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Acquire)
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::Acquire)
    }
}

fn direction_closed(
    slot: SlotId,
    direction: StreamDirection,
    flag: Arc<AtomicBool>,
    view: Arc<dyn ConsoleView>,
    on_stream_closed: StreamClosedHook,
) -> ClosedHook {
    Box::new(move || {
        flag.store(false, Ordering::Release);
        match direction {
            StreamDirection::Output => view.output_enabled(slot, false),
            StreamDirection::Input => view.input_enabled(slot, false),
        }
        debug!(slot = %slot, ?direction, "console stream closed");
        on_stream_closed(direction);
    })
}
