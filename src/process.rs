//! Lifecycle of a single server process.
//!
//! A [`ManagedProcess`] is reusable across runs. Each run spawns the child,
//! attaches a fresh [`ConsoleChannel`] and hands the child to a supervisor task,
//! which is then its only owner. When either console direction closes, the
//! run's cleanup guard lets exactly one closure through: the supervisor closes
//! the remaining pump, waits for the child to exit, moves the process back to
//! `Idle` and reports the exit code.

use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::console::{ConsoleChannel, ConsoleView, StreamClosedHook, StreamDirection};
use crate::error::LaunchError;
use crate::pump::{Latch, MergedReader};
use crate::slot::SlotId;

/// Receiver of run-state transitions.
///
/// Calls for one process are serialized and `process_started` always precedes
/// the matching `process_ended`. Both may arrive on any thread.
pub trait LifecycleHooks: Send + Sync {
    fn process_started(&self, slot: SlotId, pid: Option<u32>);
    fn process_ended(&self, slot: SlotId, code: Option<i32>);
}

/// The current lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No child process.
    Idle,
    /// Child spawned and console attached.
    Running,
    /// Termination requested, child not yet reaped.
    ShuttingDown,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::ShuttingDown,
            _ => RunState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::ShuttingDown => 2,
        }
    }

    /// Whether a child exists (running or shutting down).
    pub fn is_live(self) -> bool {
        !matches!(self, RunState::Idle)
    }
}

/// How a stop request is carried out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownConfig {
    kill_after: Option<Duration>,
}

impl ShutdownConfig {
    pub fn new(kill_after_ms: Option<u64>) -> Self {
        Self {
            kill_after: kill_after_ms.map(Duration::from_millis),
        }
    }

    fn kill_after(&self) -> Option<Duration> {
        self.kill_after
    }
}

#[derive(Debug)]
enum RunControl {
    Terminate,
}

struct ActiveRun {
    pid: Option<u32>,
    console: Arc<ConsoleChannel>,
    control: mpsc::UnboundedSender<RunControl>,
}

/// Per-run cleanup guard: the first stream closure fires the latch and wakes
/// the supervisor; every later one is ignored.
struct CleanupGuard {
    latch: Latch,
    closed: Notify,
}

struct ProcessShared {
    slot: SlotId,
    state: AtomicU8,
    run: Mutex<Option<ActiveRun>>,
    last_exit: Mutex<Option<Option<i32>>>,
}

impl ProcessShared {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A server slot's process handle, reusable across runs.
pub struct ManagedProcess {
    shared: Arc<ProcessShared>,
    hooks: Arc<dyn LifecycleHooks>,
    view: Arc<dyn ConsoleView>,
    shutdown: ShutdownConfig,
}

impl ManagedProcess {
    pub fn new(
        slot: SlotId,
        hooks: Arc<dyn LifecycleHooks>,
        view: Arc<dyn ConsoleView>,
        shutdown: ShutdownConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ProcessShared {
                slot,
                state: AtomicU8::new(RunState::Idle.as_u8()),
                run: Mutex::new(None),
                last_exit: Mutex::new(None),
            }),
            hooks,
            view,
            shutdown,
        }
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Process id of the current run.
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock_run().as_ref().and_then(|run| run.pid)
    }

    /// Exit code of the last completed run; `Some(None)` means the OS gave no code.
    pub fn last_exit(&self) -> Option<Option<i32>> {
        *self
            .shared
            .last_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `command` and attaches its console.
    ///
    /// Must be called from within a tokio runtime. On failure nothing is left
    /// behind and the process stays `Idle`.
    pub fn start(&self, command: &CommandSpec) -> Result<Option<u32>, LaunchError> {
        let slot = self.shared.slot;
        let mut run = self.shared.lock_run();
        if self.shared.state().is_live() || run.is_some() {
            return Err(LaunchError::AlreadyRunning(slot));
        }

        let mut child = spawn_child(slot, command)?;
        let (Some(stdout), Some(stderr), Some(stdin)) =
            (child.stdout.take(), child.stderr.take(), child.stdin.take())
        else {
            if let Err(err) = child.start_kill() {
                debug!(slot = %slot, error = %err, "could not kill half-spawned child");
            }
            return Err(LaunchError::MissingStdio(slot));
        };
        let pid = child.id();
        info!(slot = %slot, pid = ?pid, command = %command, "process started");

        self.shared.set_state(RunState::Running);
        self.hooks.process_started(slot, pid);

        let guard = Arc::new(CleanupGuard {
            latch: Latch::new(),
            closed: Notify::new(),
        });
        let on_stream_closed: StreamClosedHook = {
            let guard = Arc::clone(&guard);
            Arc::new(move |direction: StreamDirection| {
                if guard.latch.fire() {
                    debug!(slot = %slot, ?direction, "first stream closure, running cleanup");
                    guard.closed.notify_one();
                } else {
                    debug!(slot = %slot, ?direction, "cleanup already triggered");
                }
            })
        };
        let console = Arc::new(ConsoleChannel::attach(
            slot,
            MergedReader::new(stdout, stderr),
            stdin,
            Arc::clone(&self.view),
            on_stream_closed,
        ));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(Supervisor {
            shared: Arc::clone(&self.shared),
            hooks: Arc::clone(&self.hooks),
            console: Arc::clone(&console),
            guard,
            child,
            control: control_rx,
            shutdown: self.shutdown,
        }));

        *run = Some(ActiveRun {
            pid,
            console,
            control: control_tx,
        });
        Ok(pid)
    }

    /// Asks the running child to terminate. Does not wait for it to exit.
    pub fn stop(&self) -> Result<(), LaunchError> {
        let slot = self.shared.slot;
        let run = self.shared.lock_run();
        let Some(active) = run.as_ref() else {
            return Err(LaunchError::NotRunning(slot));
        };
        if self.shared.state() == RunState::Running {
            self.shared.set_state(RunState::ShuttingDown);
        }
        info!(slot = %slot, pid = ?active.pid, "stop requested");
        if active.control.send(RunControl::Terminate).is_err() {
            debug!(slot = %slot, "supervisor already finished");
        }
        Ok(())
    }

    /// Queues `text` for the child's stdin; a no-op without a live run.
    pub fn submit_input(&self, text: &str) {
        let console = self
            .shared
            .lock_run()
            .as_ref()
            .map(|run| Arc::clone(&run.console));
        match console {
            Some(console) => console.submit_input(text),
            None => debug!(slot = %self.shared.slot, "input dropped, process is idle"),
        }
    }
}

fn spawn_child(slot: SlotId, spec: &CommandSpec) -> Result<Child, LaunchError> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn().map_err(|source| LaunchError::Spawn {
        slot,
        program: spec.program.clone(),
        source,
    })
}

struct Supervisor {
    shared: Arc<ProcessShared>,
    hooks: Arc<dyn LifecycleHooks>,
    console: Arc<ConsoleChannel>,
    guard: Arc<CleanupGuard>,
    child: Child,
    control: mpsc::UnboundedReceiver<RunControl>,
    shutdown: ShutdownConfig,
}

async fn supervise(mut sv: Supervisor) {
    let slot = sv.shared.slot;
    let mut control_open = true;
    let mut kill_at: Option<tokio::time::Instant> = None;

    // Phase one: the console is live until a stream closes.
    loop {
        tokio::select! {
            _ = sv.guard.closed.notified() => break,
            msg = sv.control.recv(), if control_open => match msg {
                Some(RunControl::Terminate) => {
                    request_terminate(slot, &mut sv.child);
                    kill_at = sv.shutdown.kill_after().map(|d| tokio::time::Instant::now() + d);
                }
                None => control_open = false,
            },
            _ = sleep_until(kill_at), if kill_at.is_some() => {
                force_kill(slot, &mut sv.child);
                kill_at = None;
            }
        }
    }

    // Phase two: cleanup runs once per run. Closing the console only signals
    // the pumps, so stop requests keep being served while the child exits.
    debug!(
        slot = %slot,
        output_open = sv.console.output_enabled(),
        input_open = sv.console.input_enabled(),
        "closing remaining console streams"
    );
    sv.console.close();
    let status = loop {
        tokio::select! {
            status = sv.child.wait() => break status,
            msg = sv.control.recv(), if control_open => match msg {
                Some(RunControl::Terminate) => {
                    request_terminate(slot, &mut sv.child);
                    kill_at = sv.shutdown.kill_after().map(|d| tokio::time::Instant::now() + d);
                }
                None => control_open = false,
            },
            _ = sleep_until(kill_at), if kill_at.is_some() => {
                force_kill(slot, &mut sv.child);
                kill_at = None;
            }
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(slot = %slot, error = %err, "waiting for process failed");
            None
        }
    };
    info!(slot = %slot, code = ?code, "process exited");

    // Holding the run lock keeps a concurrent `start` from slipping its
    // started notification in ahead of this run's ended notification.
    let mut run = sv.shared.lock_run();
    *run = None;
    *sv
        .shared
        .last_exit
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(code);
    sv.shared.set_state(RunState::Idle);
    sv.hooks.process_ended(slot, code);
    drop(run);
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn request_terminate(slot: SlotId, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(slot = %slot, pid, "sending SIGTERM");
    send_unix_signal(pid, libc::SIGTERM);
}

#[cfg(not(unix))]
fn request_terminate(slot: SlotId, child: &mut Child) {
    force_kill(slot, child);
}

fn force_kill(slot: SlotId, child: &mut Child) {
    warn!(slot = %slot, pid = ?child.id(), "killing process");
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        send_unix_signal(pid, libc::SIGKILL);
    }
    if let Err(err) = child.start_kill() {
        debug!(slot = %slot, error = %err, "kill failed");
    }
}

#[cfg(unix)]
fn send_unix_signal(pid: u32, signal: libc::c_int) {
    // The child leads its own process group, so signal the group as well.
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, signal);
        let _ = libc::kill(pid, signal);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::console::tests::{RecordingView, Seen};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Hook {
        Started(SlotId),
        Ended(SlotId, Option<i32>),
    }

    struct HookRecorder {
        tx: mpsc::UnboundedSender<Hook>,
    }

    impl LifecycleHooks for HookRecorder {
        fn process_started(&self, slot: SlotId, _pid: Option<u32>) {
            let _ = self.tx.send(Hook::Started(slot));
        }

        fn process_ended(&self, slot: SlotId, code: Option<i32>) {
            let _ = self.tx.send(Hook::Ended(slot, code));
        }
    }

    fn managed(slot: SlotId) -> (ManagedProcess, Arc<RecordingView>, mpsc::UnboundedReceiver<Hook>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let view = Arc::new(RecordingView::default());
        let process = ManagedProcess::new(
            slot,
            Arc::new(HookRecorder { tx }),
            view.clone(),
            ShutdownConfig::default(),
        );
        (process, view, rx)
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    async fn next_hook(rx: &mut mpsc::UnboundedReceiver<Hook>) -> Hook {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for lifecycle hook")
            .expect("hook channel closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_exit_code_verbatim() {
        let (process, _view, mut hooks) = managed(SlotId::Center);
        process.start(&sh("exit 42")).unwrap();
        assert_eq!(next_hook(&mut hooks).await, Hook::Started(SlotId::Center));
        assert_eq!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Center, Some(42)));
        assert_eq!(process.state(), RunState::Idle);
        assert_eq!(process.last_exit(), Some(Some(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merges_stderr_into_console_output() {
        let (process, view, mut hooks) = managed(SlotId::Login);
        process.start(&sh("echo out; echo err 1>&2")).unwrap();
        next_hook(&mut hooks).await;
        assert_eq!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Login, Some(0)));
        let text = view.text(SlotId::Login);
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        assert!(view.snapshot().contains(&Seen::Output(SlotId::Login, false)));
        assert!(view.snapshot().contains(&Seen::Input(SlotId::Login, false)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ends_exactly_once_when_both_streams_close() {
        let (process, _view, mut hooks) = managed(SlotId::Game(2));
        for _ in 0..5 {
            process.start(&sh("exec 0<&-; exit 3")).unwrap();
            assert_eq!(next_hook(&mut hooks).await, Hook::Started(SlotId::Game(2)));
            assert_eq!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Game(2), Some(3)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hooks.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_double_start_and_idle_stop() {
        let (process, _view, mut hooks) = managed(SlotId::Shop);
        assert!(matches!(process.stop(), Err(LaunchError::NotRunning(SlotId::Shop))));

        process.start(&sh("read line; exit 0")).unwrap();
        assert!(matches!(
            process.start(&sh("exit 0")),
            Err(LaunchError::AlreadyRunning(SlotId::Shop))
        ));
        assert_eq!(next_hook(&mut hooks).await, Hook::Started(SlotId::Shop));

        process.submit_input("bye\n");
        assert_eq!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Shop, Some(0)));
        assert!(hooks.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_terminates_a_long_running_child() {
        let (process, _view, mut hooks) = managed(SlotId::Center);
        process.start(&sh("sleep 30")).unwrap();
        next_hook(&mut hooks).await;
        process.stop().unwrap();
        assert_eq!(process.state(), RunState::ShuttingDown);
        match next_hook(&mut hooks).await {
            Hook::Ended(SlotId::Center, code) => assert_ne!(code, Some(0)),
            other => panic!("unexpected hook {:?}", other),
        }
        assert_eq!(process.state(), RunState::Idle);
        assert!(process.pid().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_escalation_follows_ignored_sigterm() {
        let (tx, mut hooks) = mpsc::unbounded_channel();
        let process = ManagedProcess::new(
            SlotId::Login,
            Arc::new(HookRecorder { tx }),
            Arc::new(RecordingView::default()),
            ShutdownConfig::new(Some(200)),
        );
        process
            .start(&sh("trap '' TERM; echo ready; while :; do sleep 1; done"))
            .unwrap();
        next_hook(&mut hooks).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.stop().unwrap();
        assert_eq!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Login, None));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_process_idle() {
        let (process, view, mut hooks) = managed(SlotId::Game(0));
        let err = process
            .start(&CommandSpec::new("/definitely/not/a/server"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { slot: SlotId::Game(0), .. }));
        assert_eq!(process.state(), RunState::Idle);
        assert!(hooks.try_recv().is_err());
        assert!(view.snapshot().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_after_exit_does_not_hang() {
        let (process, _view, mut hooks) = managed(SlotId::Center);
        process.start(&sh("exit 0")).unwrap();
        next_hook(&mut hooks).await;
        next_hook(&mut hooks).await;
        process.submit_input("late\n");
        assert_eq!(process.state(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_to_a_child_that_never_reads_returns_at_once() {
        let (process, _view, mut hooks) = managed(SlotId::Game(1));
        process.start(&sh("sleep 30")).unwrap();
        next_hook(&mut hooks).await;

        let flood = "x".repeat(256 * 1024);
        let started = tokio::time::Instant::now();
        process.submit_input(&flood);
        process.submit_input("status\n");
        assert!(started.elapsed() < Duration::from_secs(1));

        process.stop().unwrap();
        assert!(matches!(next_hook(&mut hooks).await, Hook::Ended(SlotId::Game(1), _)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_reaches_child_while_input_is_stuck() {
        let (process, _view, mut hooks) = managed(SlotId::Shop);
        process
            .start(&sh("exec >/dev/null 2>&1; sleep 30"))
            .unwrap();
        next_hook(&mut hooks).await;
        process.submit_input(&"y".repeat(256 * 1024));
        tokio::time::sleep(Duration::from_millis(500)).await;

        process.stop().unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), hooks.recv())
            .await
            .expect("stop did not end the run");
        match ended {
            Some(Hook::Ended(SlotId::Shop, code)) => assert_ne!(code, Some(0)),
            other => panic!("unexpected hook {:?}", other),
        }
        assert_eq!(process.state(), RunState::Idle);
    }
}
