//! Application state and UI logic.
//!
//! This module holds the core `App` struct, which mirrors what the registry
//! reports about each slot (run status, pid, last exit code, which console
//! directions are live) together with per-slot scrollback and the input
//! buffers. Key presses are translated into `AppAction`s for the event loop.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::output::ConsoleBuffer;
use crate::slot::SlotId;

/// Modes of user input interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Standard navigation mode.
    Normal,
    /// Typing a line for the selected server's stdin.
    Input,
    /// Typing a control command after `:`.
    Command,
}

/// Run status of a slot as last reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Running,
    /// A stop was requested; the process has not exited yet.
    Stopping,
}

/// Display state for one server slot.
#[derive(Debug, Clone)]
pub struct SlotView {
    pub slot: SlotId,
    pub status: SlotStatus,
    pub pid: Option<u32>,
    /// Exit code of the last run; `Some(None)` when the OS gave none.
    pub last_exit: Option<Option<i32>>,
    pub last_error: Option<String>,
    pub console: ConsoleBuffer,
    pub scroll: usize,
    pub follow: bool,
    pub output_live: bool,
    pub input_live: bool,
    pub started_at: Option<Instant>,
}

impl SlotView {
    pub fn new(slot: SlotId, max_lines: usize) -> Self {
        Self {
            slot,
            status: SlotStatus::Idle,
            pid: None,
            last_exit: None,
            last_error: None,
            console: ConsoleBuffer::new(max_lines),
            scroll: 0,
            follow: true,
            output_live: false,
            input_live: false,
            started_at: None,
        }
    }
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    pub slots: Vec<SlotView>,
    /// Index of the currently selected slot.
    pub selected: usize,
    pub input_mode: InputMode,
    /// Buffer for stdin input.
    pub input_buffer: String,
    /// Buffer for the `:` command prompt.
    pub command_buffer: String,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Height of the console view area (for scrolling calculations).
    pub log_view_height: usize,
    /// Whether ANSI escapes are stripped from console output.
    pub strip_ansi: bool,
    pub show_help: bool,
    max_lines: usize,
    status_message: Option<StatusMessage>,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Exit the application once every server is idle.
    Quit,
    Start(SlotId),
    Stop(SlotId),
    StartAll,
    StopAll,
    /// Send a line (newline included) to a slot's stdin.
    SendInput(SlotId, String),
    /// Run a control command typed at the `:` prompt.
    Command(String),
    /// Ctrl-C while the terminal is in raw mode.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

impl App {
    pub fn new(slots: &[SlotId], max_lines: usize) -> Self {
        Self {
            slots: slots
                .iter()
                .map(|slot| SlotView::new(*slot, max_lines))
                .collect(),
            selected: 0,
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            command_buffer: String::new(),
            should_quit: false,
            log_view_height: 0,
            strip_ansi: true,
            show_help: false,
            max_lines,
            status_message: None,
        }
    }

    pub fn selected_slot(&self) -> Option<&SlotView> {
        self.slots.get(self.selected)
    }

    pub fn selected_slot_mut(&mut self) -> Option<&mut SlotView> {
        self.slots.get_mut(self.selected)
    }

    fn view_mut(&mut self, slot: SlotId) -> Option<&mut SlotView> {
        self.slots.iter_mut().find(|view| view.slot == slot)
    }

    pub fn view(&self, slot: SlotId) -> Option<&SlotView> {
        self.slots.iter().find(|view| view.slot == slot)
    }

    /// Shows a newly configured slot, keeping tab order.
    pub fn add_slot(&mut self, slot: SlotId) {
        if self.view(slot).is_some() {
            return;
        }
        let selected = self.selected_slot().map(|view| view.slot);
        let index = self.slots.partition_point(|view| view.slot < slot);
        self.slots.insert(index, SlotView::new(slot, self.max_lines));
        self.reselect(selected);
    }

    pub fn remove_slot(&mut self, slot: SlotId) {
        let selected = self.selected_slot().map(|view| view.slot);
        self.slots.retain(|view| view.slot != slot);
        if selected == Some(slot) {
            self.exit_input_mode();
            self.selected = self.selected.min(self.slots.len().saturating_sub(1));
        } else {
            self.reselect(selected);
        }
    }

    fn reselect(&mut self, slot: Option<SlotId>) {
        if let Some(index) = slot.and_then(|slot| self.slots.iter().position(|v| v.slot == slot)) {
            self.selected = index;
        }
    }

    pub fn on_process_started(&mut self, slot: SlotId, pid: Option<u32>) {
        let selected = self.selected_slot().map(|view| view.slot) == Some(slot);
        if let Some(view) = self.view_mut(slot) {
            view.status = SlotStatus::Running;
            view.pid = pid;
            view.last_error = None;
            view.started_at = Some(Instant::now());
            view.console.clear();
            view.scroll = 0;
            view.follow = true;
        }
        if selected {
            self.ensure_follow();
        }
    }

    pub fn on_process_ended(&mut self, slot: SlotId, code: Option<i32>) {
        if let Some(view) = self.view_mut(slot) {
            view.status = SlotStatus::Idle;
            view.pid = None;
            view.last_exit = Some(code);
            view.started_at = None;
        }
        self.push_tool_line(slot, exit_message(code));
    }

    pub fn on_startup_failed(&mut self, slot: SlotId, error: String) {
        if let Some(view) = self.view_mut(slot) {
            view.last_error = Some(error.clone());
        }
        self.push_tool_line(slot, format!("startup failed: {}", error));
        self.set_status_warning_for(error, Duration::from_secs(5));
    }

    pub fn on_stop_requested(&mut self, slot: SlotId) {
        if let Some(view) = self.view_mut(slot) {
            if view.status == SlotStatus::Running {
                view.status = SlotStatus::Stopping;
            }
        }
    }

    pub fn on_console_output(&mut self, slot: SlotId, text: &str) {
        let selected = self.selected_slot().map(|view| view.slot) == Some(slot);
        let mut follow = false;
        if let Some(view) = self.view_mut(slot) {
            let dropped = view.console.push_chunk(text);
            if !view.follow {
                view.scroll = view.scroll.saturating_sub(dropped);
            }
            follow = view.follow;
        }
        if selected && follow {
            self.ensure_follow();
        }
    }

    pub fn on_output_enabled(&mut self, slot: SlotId, enabled: bool) {
        if let Some(view) = self.view_mut(slot) {
            view.output_live = enabled;
        }
    }

    pub fn on_input_enabled(&mut self, slot: SlotId, enabled: bool) {
        let selected = self.selected_slot().map(|view| view.slot) == Some(slot);
        if let Some(view) = self.view_mut(slot) {
            view.input_live = enabled;
        }
        if !enabled && selected {
            self.exit_input_mode();
        }
    }

    /// Appends a servdeck message to a slot's console.
    pub fn push_tool_line(&mut self, slot: SlotId, text: impl AsRef<str>) {
        let selected = self.selected_slot().map(|view| view.slot) == Some(slot);
        let mut follow = false;
        if let Some(view) = self.view_mut(slot) {
            let dropped = view.console.push_line(format_tool_message(text.as_ref()));
            if !view.follow {
                view.scroll = view.scroll.saturating_sub(dropped);
            }
            follow = view.follow;
        }
        if selected && follow {
            self.ensure_follow();
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return AppAction::Interrupt;
        }
        match self.input_mode {
            InputMode::Input => self.handle_input_key(key),
            InputMode::Command => self.handle_command_key(key),
            InputMode::Normal => self.handle_normal_input(key),
        }
    }

    fn handle_input_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.exit_input_mode();
                AppAction::None
            }
            KeyCode::Enter => {
                let Some(slot) = self.selected_slot().map(|view| view.slot) else {
                    return AppAction::None;
                };
                let mut payload = std::mem::take(&mut self.input_buffer);
                payload.push('\n');
                AppAction::SendInput(slot, payload)
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
                AppAction::None
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input_buffer.push(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn handle_command_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.command_buffer.clear();
                AppAction::None
            }
            KeyCode::Enter => {
                self.input_mode = InputMode::Normal;
                let line = std::mem::take(&mut self.command_buffer);
                if line.trim().is_empty() {
                    AppAction::None
                } else {
                    AppAction::Command(line)
                }
            }
            KeyCode::Backspace => {
                self.command_buffer.pop();
                AppAction::None
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.command_buffer.push(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        let selected = self.selected_slot().map(|view| view.slot);
        match key.code {
            KeyCode::Char('q') => AppAction::Quit,
            KeyCode::Up => {
                if self.selected > 0 {
                    self.select(self.selected - 1);
                }
                AppAction::None
            }
            KeyCode::Down => {
                if self.selected + 1 < self.slots.len() {
                    self.select(self.selected + 1);
                }
                AppAction::None
            }
            KeyCode::Tab => {
                if !self.slots.is_empty() {
                    self.select((self.selected + 1) % self.slots.len());
                }
                AppAction::None
            }
            KeyCode::BackTab => {
                if !self.slots.is_empty() {
                    let len = self.slots.len();
                    self.select((self.selected + len - 1) % len);
                }
                AppAction::None
            }
            KeyCode::Char('s') => selected.map_or(AppAction::None, AppAction::Start),
            KeyCode::Char('x') => selected.map_or(AppAction::None, AppAction::Stop),
            KeyCode::Char('S') => AppAction::StartAll,
            KeyCode::Char('X') => AppAction::StopAll,
            KeyCode::Enter | KeyCode::Char('i') => {
                self.enter_input_mode();
                AppAction::None
            }
            KeyCode::Char(':') => {
                self.input_mode = InputMode::Command;
                self.command_buffer.clear();
                AppAction::None
            }
            KeyCode::Char('a') => {
                self.strip_ansi = !self.strip_ansi;
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = !self.show_help;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll_to_top();
                AppAction::None
            }
            KeyCode::End => {
                if let Some(view) = self.selected_slot_mut() {
                    view.follow = true;
                }
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn select(&mut self, index: usize) {
        self.exit_input_mode();
        self.selected = index;
        if self.selected_slot().map(|view| view.follow).unwrap_or(true) {
            self.ensure_follow();
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let view_height = self.log_view_height.max(1);
        if let Some(view) = self.selected_slot_mut() {
            let max_scroll = view.console.len().saturating_sub(view_height);
            let current = if view.follow { max_scroll } else { view.scroll };
            view.scroll = current.saturating_sub(amount).min(max_scroll);
            view.follow = false;
        }
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let view_height = self.log_view_height.max(1);
        if let Some(view) = self.selected_slot_mut() {
            let max_scroll = view.console.len().saturating_sub(view_height);
            let current = if view.follow { max_scroll } else { view.scroll };
            let next = (current + amount).min(max_scroll);
            view.scroll = next;
            view.follow = next == max_scroll;
        }
    }

    pub fn scroll_to_top(&mut self) {
        if let Some(view) = self.selected_slot_mut() {
            view.scroll = 0;
            view.follow = false;
        }
    }

    pub fn ensure_follow(&mut self) {
        let view_height = self.log_view_height.max(1);
        if let Some(view) = self.selected_slot_mut() {
            view.scroll = view.console.len().saturating_sub(view_height);
        }
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let view_height = height.max(1);
        if let Some(view) = self.selected_slot_mut() {
            let max_scroll = view.console.len().saturating_sub(view_height);
            if view.follow {
                view.scroll = max_scroll;
            } else {
                view.scroll = view.scroll.min(max_scroll);
            }
        }
    }

    fn enter_input_mode(&mut self) {
        match self.selected_slot() {
            Some(view) if view.input_live => {
                self.input_mode = InputMode::Input;
                self.input_buffer.clear();
            }
            Some(view) => {
                let label = view.slot.label();
                self.set_status_warning_for(
                    format!("{} is not accepting input", label),
                    Duration::from_secs(2),
                );
            }
            None => {}
        }
    }

    fn exit_input_mode(&mut self) {
        if self.input_mode == InputMode::Input {
            self.input_mode = InputMode::Normal;
            self.input_buffer.clear();
        }
    }

    pub fn status_line(&self) -> String {
        let Some(view) = self.selected_slot() else {
            return "No servers configured".to_string();
        };
        let status = match view.status {
            SlotStatus::Idle => "offline",
            SlotStatus::Running => "online",
            SlotStatus::Stopping => "stopping",
        };
        let pid = view
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        let exit = match view.last_exit {
            Some(Some(code)) => code.to_string(),
            Some(None) => "signal".to_string(),
            None => "-".to_string(),
        };
        let uptime = view
            .started_at
            .map(|t| format_duration(t.elapsed()))
            .unwrap_or_else(|| "-".into());
        format!(
            "{} | status: {} | pid: {} | last exit: {} | uptime: {} | lines: {} | follow: {} | input: {}",
            view.slot.label(),
            status,
            pid,
            exit,
            uptime,
            view.console.len(),
            if view.follow { "on" } else { "off" },
            if view.input_live { "open" } else { "closed" }
        )
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|view| view.status != SlotStatus::Idle)
            .count()
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        if let Some(message) = &self.status_message {
            let still_visible = match message.ttl {
                Some(ttl) => message.at.elapsed() < ttl,
                None => true,
            };
            if still_visible {
                return Some((message.text.as_str(), message.level));
            }
        }
        None
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    pub fn input_line(&self) -> &str {
        &self.input_buffer
    }
}

pub fn exit_message(code: Option<i32>) -> String {
    match code {
        Some(0) => "process ended successfully".to_string(),
        Some(code) => format!("process ended with code {}", code),
        None => "process ended by signal".to_string(),
    }
}

pub fn format_tool_message(text: &str) -> String {
    format!("[servdeck] {}", text)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
