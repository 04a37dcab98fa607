//! servdeck: a terminal control panel for a cluster of game servers.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads `launcher.toml`, registers one slot per configured server and runs the
//! event loop that connects the process registry to the TUI (or, with
//! `--no-ui`, to plain stdout/stdin).

mod app;
mod command;
mod config;
mod console;
mod control;
mod error;
mod events;
mod output;
mod process;
mod pump;
mod registry;
mod slot;
mod tui;

use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::app::{exit_message, format_tool_message, App, AppAction};
use crate::command::build_command;
use crate::config::Config;
use crate::control::{ControlCommand, Target, HELP};
use crate::events::{Event, EventBridge, ShutdownSignal};
use crate::output::LineAssembler;
use crate::process::{RunState, ShutdownConfig};
use crate::registry::ProcessRegistry;
use crate::slot::SlotId;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "servdeck",
    version,
    about = "Launch and supervise center, login, game and shop servers",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the launcher configuration file.
    #[arg(long, default_value = "launcher.toml")]
    config: PathBuf,
    /// Disable the TUI: print console output to stdout and read control commands from stdin.
    #[arg(long)]
    no_ui: bool,
    /// Start every configured server on launch.
    #[arg(long)]
    start_all: bool,
    /// Log file used while the TUI owns the terminal.
    #[arg(long, default_value = "servdeck.log")]
    log_file: PathBuf,
    /// Force-kill a server still running this many milliseconds after a stop request.
    #[arg(long)]
    kill_after_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the resolved command line of every configured server and exit.
    #[command(name = "commands")]
    ShowCommands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    if let Some(Commands::ShowCommands) = &cli.command {
        return print_commands(&config);
    }
    init_logging(&cli)?;

    let slots = config.enabled_slots()?;
    let max_lines = config.max_lines();
    let shutdown = ShutdownConfig::new(cli.kill_after_ms.or(config.kill_after_ms));
    info!(config = %cli.config.display(), slots = slots.len(), "servdeck starting");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(EventBridge::new(event_tx.clone()));
    let mut registry = ProcessRegistry::new(Arc::new(config), bridge.clone(), bridge, shutdown);
    for slot in &slots {
        registry.add_slot(*slot)?;
    }
    let mut app = App::new(&slots, max_lines);
    let mut headless = cli.no_ui.then(HeadlessOutput::default);

    let mut terminal = if cli.no_ui {
        None
    } else {
        Some(tui::init_terminal().context("failed to initialise terminal")?)
    };
    if cli.no_ui {
        spawn_stdin_listener(event_tx.clone());
    } else {
        spawn_input_listener(event_tx.clone());
    }
    spawn_signal_listener(event_tx.clone());

    if cli.start_all {
        let reply = start_target(&registry, Target::All);
        report(&mut app, headless.as_mut(), reply);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());
    let mut shutting_down = false;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::ProcessStarted { slot, pid } => {
                        app.on_process_started(slot, pid);
                        if let Some(out) = headless.as_mut() {
                            match pid {
                                Some(pid) => out.print_tool(slot, &format!("process started (pid {})", pid)),
                                None => out.print_tool(slot, "process started"),
                            }
                        }
                    }
                    Event::ProcessEnded { slot, code } => {
                        app.on_process_ended(slot, code);
                        if let Some(out) = headless.as_mut() {
                            out.flush(slot);
                            out.print_tool(slot, &exit_message(code));
                        }
                        if shutting_down && registry.all_idle() {
                            info!("all servers offline, exiting");
                            app.should_quit = true;
                        }
                    }
                    Event::StartupFailed { slot, error } => {
                        if let Some(out) = headless.as_mut() {
                            out.print_tool(slot, &format!("startup failed: {}", error));
                        }
                        app.on_startup_failed(slot, error);
                    }
                    Event::ConsoleOutput { slot, text } => {
                        if let Some(out) = headless.as_mut() {
                            out.print_chunk(slot, &text);
                        }
                        app.on_console_output(slot, &text);
                    }
                    Event::OutputEnabled { slot, enabled } => app.on_output_enabled(slot, enabled),
                    Event::InputEnabled { slot, enabled } => app.on_input_enabled(slot, enabled),
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        if action == AppAction::Interrupt {
                            begin_shutdown(ShutdownSignal::Interrupt, &mut shutting_down, &registry, &mut app, None);
                        } else {
                            handle_app_action(action, &mut registry, &mut app);
                        }
                    }
                    Event::Resize { width, height } => {
                        debug!(width, height, "terminal resized");
                        if let Some(term) = terminal.as_mut() {
                            let _ = term.autoresize();
                        }
                    }
                    Event::Line(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let reply = match ControlCommand::parse(&line) {
                            Ok(command) => execute_command(command, &mut registry, &mut app),
                            Err(err) => err.to_string(),
                        };
                        if let Some(out) = headless.as_mut() {
                            out.print_message(&reply);
                        }
                    }
                    Event::Shutdown { signal } => {
                        begin_shutdown(signal, &mut shutting_down, &registry, &mut app, headless.as_mut());
                    }
                }
            }
            _ = ticker.tick() => {}
        }

        if let Some(term) = terminal.as_mut() {
            if let Err(err) = tui::draw(&mut app, term) {
                result = Err(err.into());
                break;
            }
        }
        if app.should_quit {
            break;
        }
    }

    if !registry.all_idle() {
        warn!(running = ?registry.running_slots(), "exiting with servers still running, killing them");
    }
    if let Some(term) = terminal {
        tui::restore_terminal(term)?;
    }
    result
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("servdeck=info"));
    if cli.no_ui {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        let log_file = std::fs::File::create(&cli.log_file)
            .with_context(|| format!("failed to create log file {}", cli.log_file.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(log_file)
                    .with_ansi(false),
            )
            .init();
    }
    Ok(())
}

fn print_commands(config: &Config) -> Result<()> {
    for slot in config.enabled_slots()? {
        let spec = build_command(config, slot)?;
        println!("{:<8} {}", slot.to_string(), spec);
        if let Some(cwd) = &spec.cwd {
            println!("{:<8} (in {})", "", cwd.display());
        }
    }
    Ok(())
}

/// First signal stops every server and exits once they are all offline; the
/// second exits right away.
fn begin_shutdown(
    signal: ShutdownSignal,
    shutting_down: &mut bool,
    registry: &ProcessRegistry,
    app: &mut App,
    headless: Option<&mut HeadlessOutput>,
) {
    if *shutting_down {
        warn!(signal = signal.label(), "second signal, exiting immediately");
        app.should_quit = true;
        return;
    }
    *shutting_down = true;
    info!(signal = signal.label(), "shutting down");
    let message = format!(
        "received {}, stopping servers (repeat to force quit)",
        signal.label()
    );
    if let Some(out) = headless {
        out.print_message(&message);
    }
    app.set_status_warning_persistent(message);
    stop_all(registry, app);
    if registry.all_idle() {
        app.should_quit = true;
    }
}

fn handle_app_action(action: AppAction, registry: &mut ProcessRegistry, app: &mut App) {
    match action {
        AppAction::None | AppAction::Interrupt => {}
        AppAction::Quit => {
            if registry.all_idle() {
                app.should_quit = true;
            } else {
                app.set_status_warning_for(
                    format!(
                        "{} server(s) still online, stop them first (X stops all)",
                        registry.running_slots().len()
                    ),
                    Duration::from_secs(3),
                );
            }
        }
        AppAction::Start(slot) => {
            let reply = start_target(registry, Target::Slot(slot));
            report(app, None, reply);
        }
        AppAction::Stop(slot) => {
            let reply = stop_target(registry, app, Target::Slot(slot));
            report(app, None, reply);
        }
        AppAction::StartAll => {
            let reply = start_target(registry, Target::All);
            report(app, None, reply);
        }
        AppAction::StopAll => {
            let reply = stop_target(registry, app, Target::All);
            report(app, None, reply);
        }
        AppAction::SendInput(slot, text) => {
            if let Err(err) = registry.submit_input(slot, &text) {
                app.set_status_warning_for(err.to_string(), Duration::from_secs(3));
            }
        }
        AppAction::Command(line) => {
            let reply = match ControlCommand::parse(&line) {
                Ok(command) => execute_command(command, registry, app),
                Err(err) => err.to_string(),
            };
            app.set_status_message(reply);
        }
    }
}

/// Runs a control command and returns the reply shown to the user.
fn execute_command(
    command: ControlCommand,
    registry: &mut ProcessRegistry,
    app: &mut App,
) -> String {
    match command {
        ControlCommand::Start(target) => start_target(registry, target),
        ControlCommand::Stop(target) => stop_target(registry, app, target),
        ControlCommand::Send { slot, text } => {
            let line = format!("{}\n", text);
            match registry.submit_input(slot, &line) {
                Ok(()) if registry.is_running(slot) => format!("sent to {}", slot),
                Ok(()) => format!("{} is offline, input dropped", slot),
                Err(err) => err.to_string(),
            }
        }
        ControlCommand::Add(slot) => {
            if !slot.is_dynamic() {
                return format!("{} is always configured", slot);
            }
            match registry.add_slot(slot) {
                Ok(()) => {
                    app.add_slot(slot);
                    format!("added {}", slot)
                }
                Err(err) => err.to_string(),
            }
        }
        ControlCommand::Remove(slot) => {
            if !slot.is_dynamic() {
                return format!("{} cannot be removed", slot);
            }
            match registry.remove_slot(slot) {
                Ok(()) => {
                    app.remove_slot(slot);
                    format!("removed {}", slot)
                }
                Err(err) => err.to_string(),
            }
        }
        ControlCommand::Status => status_report(registry),
        ControlCommand::Help => HELP.to_string(),
        ControlCommand::Quit => {
            if registry.all_idle() {
                app.should_quit = true;
                "bye".to_string()
            } else {
                format!(
                    "{} server(s) still online, stop them first",
                    registry.running_slots().len()
                )
            }
        }
    }
}

fn start_target(registry: &ProcessRegistry, target: Target) -> String {
    match target {
        Target::All => {
            let idle = registry.idle_slots().len();
            let failures = registry.start_all();
            if failures.is_empty() {
                format!("starting {} server(s)", idle)
            } else {
                let failed: Vec<String> = failures.iter().map(|err| err.slot().to_string()).collect();
                format!(
                    "started {} of {} server(s), failed: {}",
                    idle - failures.len(),
                    idle,
                    failed.join(", ")
                )
            }
        }
        Target::Slot(slot) => match registry.start(slot) {
            Ok(Some(pid)) => format!("started {} (pid {})", slot, pid),
            Ok(None) => format!("started {}", slot),
            Err(err) => err.to_string(),
        },
    }
}

fn stop_target(registry: &ProcessRegistry, app: &mut App, target: Target) -> String {
    match target {
        Target::All => {
            let count = stop_all(registry, app);
            format!("stopping {} server(s)", count)
        }
        Target::Slot(slot) => match registry.stop(slot) {
            Ok(()) => {
                app.on_stop_requested(slot);
                format!("stopping {}", slot)
            }
            Err(err) => err.to_string(),
        },
    }
}

fn stop_all(registry: &ProcessRegistry, app: &mut App) -> usize {
    let running = registry.running_slots();
    registry.stop_all();
    for slot in &running {
        app.on_stop_requested(*slot);
    }
    running.len()
}

fn status_report(registry: &ProcessRegistry) -> String {
    let entries: Vec<String> = registry
        .slots()
        .into_iter()
        .map(|slot| {
            let state = match registry.state(slot) {
                Some(RunState::Running) => "online".to_string(),
                Some(RunState::ShuttingDown) => "stopping".to_string(),
                _ => match registry.last_exit(slot) {
                    Some(Some(code)) => format!("offline (exit {})", code),
                    Some(None) => "offline (signal)".to_string(),
                    None => "offline".to_string(),
                },
            };
            match registry.pid(slot) {
                Some(pid) => format!("{}: {} pid {}", slot, state, pid),
                None => format!("{}: {}", slot, state),
            }
        })
        .collect();
    entries.join(", ")
}

fn report(app: &mut App, headless: Option<&mut HeadlessOutput>, message: String) {
    if let Some(out) = headless {
        out.print_message(&message);
    }
    app.set_status_message(message);
}

/// Line-prefixed console output for `--no-ui`.
#[derive(Debug, Default)]
struct HeadlessOutput {
    partial: HashMap<SlotId, LineAssembler>,
}

impl HeadlessOutput {
    fn print_chunk(&mut self, slot: SlotId, text: &str) {
        for line in self.partial.entry(slot).or_default().feed(text) {
            println!("[{}] {}", slot, line);
        }
    }

    fn flush(&mut self, slot: SlotId) {
        if let Some(line) = self.partial.get_mut(&slot).and_then(LineAssembler::take_partial) {
            println!("[{}] {}", slot, line);
        }
    }

    fn print_tool(&mut self, slot: SlotId, text: &str) {
        self.flush(slot);
        println!("[{}] {}", slot, format_tool_message(text));
    }

    fn print_message(&mut self, text: &str) {
        println!("{}", format_tool_message(text));
    }
}

fn spawn_input_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => Event::Key(key),
                Ok(crossterm::event::Event::Resize(width, height)) => Event::Resize { width, height },
                _ => continue,
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    return;
                }
            };
            loop {
                let signal = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => ShutdownSignal::Interrupt,
                        Err(_) => return,
                    },
                    _ = sigterm.recv() => ShutdownSignal::Terminate,
                };
                if tx.send(Event::Shutdown { signal }).is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                let signal = ShutdownSignal::Interrupt;
                if tx.send(Event::Shutdown { signal }).is_err() {
                    return;
                }
            }
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(Event::Line(line)).is_err() {
                break;
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_flags_and_subcommand() {
        let cli = Cli::parse_from([
            "servdeck",
            "--config",
            "world.toml",
            "--no-ui",
            "--start-all",
            "--kill-after-ms",
            "2500",
        ]);
        assert_eq!(cli.config, PathBuf::from("world.toml"));
        assert!(cli.no_ui && cli.start_all);
        assert_eq!(cli.kill_after_ms, Some(2500));
        assert_eq!(cli.log_file, PathBuf::from("servdeck.log"));

        let cli = Cli::parse_from(["servdeck", "commands"]);
        assert!(matches!(cli.command, Some(Commands::ShowCommands)));
        assert_eq!(cli.config, PathBuf::from("launcher.toml"));
    }

    fn test_registry() -> (ProcessRegistry, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(EventBridge::new(tx));
        let config: Config = toml::from_str("java = \"java\"\n").unwrap();
        let mut registry =
            ProcessRegistry::new(Arc::new(config), bridge.clone(), bridge, ShutdownConfig::default());
        registry.add_slot(SlotId::Center).unwrap();
        registry.add_slot(SlotId::Login).unwrap();
        (registry, rx)
    }

    #[test]
    fn control_commands_manage_dynamic_slots() {
        let (mut registry, _events) = test_registry();
        let mut app = App::new(&registry.slots(), 10);

        let reply = execute_command(ControlCommand::Add(SlotId::Game(2)), &mut registry, &mut app);
        assert_eq!(reply, "added game:2");
        assert!(app.view(SlotId::Game(2)).is_some());

        let reply = execute_command(ControlCommand::Add(SlotId::Center), &mut registry, &mut app);
        assert_eq!(reply, "center is always configured");

        let reply = execute_command(ControlCommand::Remove(SlotId::Game(2)), &mut registry, &mut app);
        assert_eq!(reply, "removed game:2");
        assert_eq!(registry.slots(), vec![SlotId::Center, SlotId::Login]);

        let reply = execute_command(ControlCommand::Status, &mut registry, &mut app);
        assert_eq!(reply, "center: offline, login: offline");
    }

    #[test]
    fn quit_and_stop_on_idle_registry() {
        let (mut registry, _events) = test_registry();
        let mut app = App::new(&registry.slots(), 10);

        let reply = execute_command(
            ControlCommand::Stop(Target::Slot(SlotId::Login)),
            &mut registry,
            &mut app,
        );
        assert_eq!(reply, "login is not running");

        let reply = execute_command(
            ControlCommand::Send { slot: SlotId::Center, text: "hi".into() },
            &mut registry,
            &mut app,
        );
        assert_eq!(reply, "center is offline, input dropped");

        execute_command(ControlCommand::Quit, &mut registry, &mut app);
        assert!(app.should_quit);
    }

    #[test]
    fn signal_on_idle_registry_quits() {
        let (registry, _events) = test_registry();
        let mut app = App::new(&registry.slots(), 10);
        let mut shutting_down = false;
        begin_shutdown(ShutdownSignal::Terminate, &mut shutting_down, &registry, &mut app, None);
        assert!(shutting_down);
        assert!(app.should_quit);
    }
}
