//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the slot list, the selected console and the status bar with `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Terminal;

use crate::app::{App, InputMode, SlotStatus, SlotView, StatusLevel};
use crate::output::sanitize_text;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP_LINE: &str =
    "Up/Down select | s start | x stop | S start all | X stop all | Enter input | : command | a ansi | q quit | ? help";

/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Disables raw mode, leaves the alternate screen, and shows the cursor.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let title = window_title(app);
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(4)])
            .split(area);
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(28), Constraint::Percentage(72)])
            .split(vertical[0]);

        let border_style = Style::default().fg(Color::DarkGray);
        let items: Vec<ListItem> = app
            .slots
            .iter()
            .enumerate()
            .map(|(index, view)| slot_item(view, index == app.selected, main[0].width))
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title(format!("Servers ({} online)", app.running_count()))
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().add_modifier(Modifier::BOLD));
        frame.render_stateful_widget(list, main[0], &mut list_state(app.selected, app.slots.len()));

        let input_active = app.input_mode == InputMode::Input;
        let console_block = Block::default()
            .title(console_title(app))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(if input_active {
                Style::default().fg(Color::Green)
            } else {
                border_style
            });
        let console_area = console_block.inner(main[1]);
        app.set_log_view_height(console_area.height as usize);
        let (lines, total) = render_console_lines(
            app,
            console_area.height as usize,
            console_area.width as usize,
        );
        frame.render_widget(Paragraph::new(lines).block(console_block), main[1]);
        if total == 0 {
            let empty = Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, console_area);
        }

        let (help_line, help_style) = match app.input_mode {
            InputMode::Input => (
                format!("Input | {}_ | Enter to send | Esc to exit", app.input_line()),
                Style::default().fg(Color::Green),
            ),
            InputMode::Command => (
                format!(":{}_ | Enter to run | Esc to cancel", app.command_buffer),
                Style::default().fg(Color::Cyan),
            ),
            InputMode::Normal => match app.status_message() {
                Some((text, StatusLevel::Warning)) => {
                    (text.to_string(), Style::default().fg(Color::Yellow))
                }
                Some((text, StatusLevel::Info)) => {
                    (text.to_string(), Style::default().fg(Color::Gray))
                }
                None => (HELP_LINE.to_string(), Style::default().fg(Color::DarkGray)),
            },
        };
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(help_line, help_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[1]);

        if app.show_help {
            let popup_area = centered_rect(60, 60, area);
            let help_text = [
                "Navigation:",
                "  Up/Down    Select server",
                "  Tab        Cycle selection",
                "  PageUp/Dn  Scroll console",
                "  Home/End   Scroll to top/bottom",
                "",
                "Servers:",
                "  s / x      Start / stop selected",
                "  S / X      Start / stop all",
                "  Enter, i   Type a console command",
                "  :          Control command (try :help)",
                "",
                "General:",
                "  a          Toggle ANSI stripping",
                "  ?          Toggle this help",
                "  q          Quit (all servers must be offline)",
            ]
            .join("\n");
            let help_block = Paragraph::new(help_text)
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help_block, popup_area);
        }
    })?;
    Ok(())
}

fn slot_item(view: &SlotView, selected: bool, width: u16) -> ListItem<'static> {
    let indent = if selected { "> " } else { "  " };
    let base_style = if selected {
        Style::default()
    } else {
        Style::default().fg(Color::Gray)
    };
    let name_style = if selected {
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::White)
    };
    let mut text = Text::default();
    text.lines.push(Line::from(vec![
        Span::styled(indent, if selected { Style::default().fg(Color::Cyan) } else { base_style }),
        Span::styled(format!("[{}] ", status_char(view)), status_style(view)),
        Span::styled(view.slot.label(), name_style),
    ]));
    let detail = match (&view.status, &view.last_error, view.last_exit) {
        (SlotStatus::Idle, Some(error), _) => format!("failed: {}", error),
        (SlotStatus::Idle, None, Some(Some(code))) => format!("exited {}", code),
        (SlotStatus::Idle, None, Some(None)) => "killed".to_string(),
        (SlotStatus::Idle, None, None) => String::new(),
        (_, _, _) => view
            .pid
            .map(|pid| format!("pid {}", pid))
            .unwrap_or_default(),
    };
    if !detail.is_empty() {
        let available = (width as usize).saturating_sub(6);
        text.lines.push(Line::from(vec![
            Span::raw("    "),
            Span::styled(truncate(&detail, available), base_style),
        ]));
    }
    ListItem::new(text)
}

fn window_title(app: &App) -> String {
    match app.selected_slot() {
        Some(view) => format!("servdeck · {}", view.slot.label()),
        None => "servdeck".to_string(),
    }
}

fn console_title(app: &App) -> String {
    let Some(view) = app.selected_slot() else {
        return "Console".to_string();
    };
    let state = match view.status {
        SlotStatus::Idle => "offline",
        SlotStatus::Running if !view.output_live => "online, output closed",
        SlotStatus::Running => "online",
        SlotStatus::Stopping => "stopping",
    };
    format!("Console - {} ({})", view.slot.label(), state)
}

fn render_console_lines(app: &App, height: usize, width: usize) -> (Text<'static>, usize) {
    let Some(view) = app.selected_slot() else {
        return (Text::default(), 0);
    };
    let total = view.console.len();
    if height == 0 {
        return (Text::default(), total);
    }
    let start = if view.follow {
        total.saturating_sub(height)
    } else {
        view.scroll.min(total.saturating_sub(height))
    };
    let lines = view
        .console
        .iter()
        .skip(start)
        .take(height)
        .map(|line| {
            let text = truncate(&sanitize_text(line, app.strip_ansi), width.saturating_sub(1));
            if line.starts_with("[servdeck]") {
                Line::from(Span::styled(text, Style::default().fg(Color::DarkGray)))
            } else {
                Line::from(Span::raw(text))
            }
        })
        .collect::<Vec<_>>();
    (Text::from(lines), total)
}

fn list_state(selected: usize, len: usize) -> ListState {
    let mut state = ListState::default();
    if len > 0 {
        state.select(Some(selected.min(len - 1)));
    }
    state
}

fn status_char(view: &SlotView) -> char {
    match view.status {
        SlotStatus::Running => 'R',
        SlotStatus::Stopping => 'S',
        SlotStatus::Idle if view.last_error.is_some() => 'F',
        SlotStatus::Idle => match view.last_exit {
            Some(Some(0)) | None => '.',
            Some(_) => 'X',
        },
    }
}

fn status_style(view: &SlotView) -> Style {
    match status_char(view) {
        'R' => Style::default().fg(Color::Green),
        'S' => Style::default().fg(Color::Yellow),
        'F' | 'X' => Style::default().fg(Color::Red),
        _ => Style::default().fg(Color::DarkGray),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}
