//! The set of known server slots, partitioned into idle and running.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::command::CommandSource;
use crate::console::ConsoleView;
use crate::error::LaunchError;
use crate::process::{LifecycleHooks, ManagedProcess, RunState, ShutdownConfig};
use crate::slot::SlotId;

/// Callbacks the front end implements to follow process lifecycles.
///
/// Invoked from process supervisor tasks as well as from the caller of
/// `start`; implementations must marshal onto their own thread.
pub trait RegistryListener: Send + Sync {
    fn on_process_started(&self, slot: SlotId, pid: Option<u32>);
    fn on_process_ended(&self, slot: SlotId, code: Option<i32>);
    fn on_startup_failed(&self, slot: SlotId, error: &LaunchError);
}

#[derive(Debug, Default)]
struct Partition {
    idle: BTreeSet<SlotId>,
    running: BTreeSet<SlotId>,
}

impl Partition {
    fn move_to_running(&mut self, slot: SlotId) -> bool {
        if self.idle.remove(&slot) {
            self.running.insert(slot);
            true
        } else {
            false
        }
    }

    fn move_to_idle(&mut self, slot: SlotId) -> bool {
        if self.running.remove(&slot) {
            self.idle.insert(slot);
            true
        } else {
            false
        }
    }
}

/// Partition plus listener, shared with every process as its lifecycle hook.
struct RegistryShared {
    partition: Mutex<Partition>,
    listener: Arc<dyn RegistryListener>,
}

impl RegistryShared {
    fn partition(&self) -> MutexGuard<'_, Partition> {
        self.partition.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LifecycleHooks for RegistryShared {
    fn process_started(&self, slot: SlotId, pid: Option<u32>) {
        if self.partition().move_to_running(slot) {
            debug!(slot = %slot, "moved to running");
        } else {
            warn!(slot = %slot, "started process was not idle");
        }
        self.listener.on_process_started(slot, pid);
    }

    fn process_ended(&self, slot: SlotId, code: Option<i32>) {
        if self.partition().move_to_idle(slot) {
            debug!(slot = %slot, "moved to idle");
        } else {
            warn!(slot = %slot, "ended process was not running");
        }
        self.listener.on_process_ended(slot, code);
    }
}

/// Owns every [`ManagedProcess`] and the idle/running partition.
pub struct ProcessRegistry {
    processes: BTreeMap<SlotId, ManagedProcess>,
    shared: Arc<RegistryShared>,
    source: Arc<dyn CommandSource>,
    view: Arc<dyn ConsoleView>,
    shutdown: ShutdownConfig,
}

impl ProcessRegistry {
    pub fn new(
        source: Arc<dyn CommandSource>,
        view: Arc<dyn ConsoleView>,
        listener: Arc<dyn RegistryListener>,
        shutdown: ShutdownConfig,
    ) -> Self {
        Self {
            processes: BTreeMap::new(),
            shared: Arc::new(RegistryShared {
                partition: Mutex::new(Partition::default()),
                listener,
            }),
            source,
            view,
            shutdown,
        }
    }

    /// Registers an idle slot.
    pub fn add_slot(&mut self, slot: SlotId) -> Result<(), LaunchError> {
        if self.processes.contains_key(&slot) {
            return Err(LaunchError::SlotExists(slot));
        }
        let hooks: Arc<dyn LifecycleHooks> = self.shared.clone();
        self.processes.insert(
            slot,
            ManagedProcess::new(slot, hooks, Arc::clone(&self.view), self.shutdown),
        );
        self.shared.partition().idle.insert(slot);
        info!(slot = %slot, "slot added");
        Ok(())
    }

    /// Forgets an idle slot. A slot with a live process must be stopped and
    /// reported ended first.
    pub fn remove_slot(&mut self, slot: SlotId) -> Result<(), LaunchError> {
        let Some(process) = self.processes.get(&slot) else {
            return Err(LaunchError::UnknownSlot(slot));
        };
        let mut partition = self.shared.partition();
        if process.state() != RunState::Idle || partition.running.contains(&slot) {
            return Err(LaunchError::SlotRunning(slot));
        }
        partition.idle.remove(&slot);
        drop(partition);
        self.processes.remove(&slot);
        info!(slot = %slot, "slot removed");
        Ok(())
    }

    fn process(&self, slot: SlotId) -> Result<&ManagedProcess, LaunchError> {
        self.processes
            .get(&slot)
            .ok_or(LaunchError::UnknownSlot(slot))
    }

    /// Resolves the slot's command and starts it.
    ///
    /// Errors are returned; launch failures (command resolution, spawn) are
    /// also reported through `on_startup_failed`.
    pub fn start(&self, slot: SlotId) -> Result<Option<u32>, LaunchError> {
        let process = self.process(slot)?;
        let result = self
            .source
            .resolve(slot)
            .and_then(|command| process.start(&command));
        if let Err(err) = &result {
            if err.is_startup_failure() {
                warn!(slot = %slot, error = %err, "startup failed");
                self.shared.listener.on_startup_failed(slot, err);
            }
        }
        result
    }

    pub fn stop(&self, slot: SlotId) -> Result<(), LaunchError> {
        self.process(slot)?.stop()
    }

    /// Starts every idle slot, continuing past failures.
    pub fn start_all(&self) -> Vec<LaunchError> {
        let mut failures = Vec::new();
        for slot in self.idle_slots() {
            if let Err(err) = self.start(slot) {
                failures.push(err);
            }
        }
        failures
    }

    /// Requests termination of every running slot.
    pub fn stop_all(&self) {
        for slot in self.running_slots() {
            match self.stop(slot) {
                Ok(()) => {}
                // Exited between the snapshot and the request.
                Err(LaunchError::NotRunning(_)) => {}
                Err(err) => warn!(slot = %slot, error = %err, "stop failed"),
            }
        }
    }

    /// True when no slot is running.
    pub fn all_idle(&self) -> bool {
        self.shared.partition().running.is_empty()
    }

    pub fn idle_slots(&self) -> Vec<SlotId> {
        self.shared.partition().idle.iter().copied().collect()
    }

    pub fn running_slots(&self) -> Vec<SlotId> {
        self.shared.partition().running.iter().copied().collect()
    }

    pub fn is_running(&self, slot: SlotId) -> bool {
        self.shared.partition().running.contains(&slot)
    }

    /// All known slots in tab order.
    pub fn slots(&self) -> Vec<SlotId> {
        self.processes.keys().copied().collect()
    }

    pub fn state(&self, slot: SlotId) -> Option<RunState> {
        self.processes.get(&slot).map(ManagedProcess::state)
    }

    pub fn pid(&self, slot: SlotId) -> Option<u32> {
        self.processes.get(&slot).and_then(ManagedProcess::pid)
    }

    pub fn last_exit(&self, slot: SlotId) -> Option<Option<i32>> {
        self.processes.get(&slot).and_then(ManagedProcess::last_exit)
    }

    /// Queues a line for the slot's stdin; dropped when the slot is idle.
    pub fn submit_input(&self, slot: SlotId, text: &str) -> Result<(), LaunchError> {
        self.process(slot)?.submit_input(text);
        Ok(())
    }
}
