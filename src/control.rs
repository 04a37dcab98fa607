//! Line-oriented control commands.
//!
//! The same grammar drives the TUI `:` prompt and the headless stdin console:
//!
//! ```text
//! start <slot>|all    stop <slot>|all    send <slot> <text>
//! add <slot>          remove <slot>      status    help    quit
//! ```

use thiserror::Error;

use crate::slot::{SlotId, SlotParseError};

pub const HELP: &str = "commands: start <slot>|all, stop <slot>|all, send <slot> <text>, \
add <slot>, remove <slot>, status, help, quit (slots: center, login, game:<id>, shop)";

/// A slot or every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Slot(SlotId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(Target),
    Stop(Target),
    Send { slot: SlotId, text: String },
    Add(SlotId),
    Remove(SlotId),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}' (try 'help')")]
    UnknownVerb(String),
    #[error("'{0}' needs a slot")]
    MissingSlot(&'static str),
    #[error("'send' needs text after the slot")]
    MissingText,
    #[error("'{0}' takes no arguments")]
    UnexpectedArgs(&'static str),
    #[error(transparent)]
    Slot(#[from] SlotParseError),
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self, ControlParseError> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_lowercase().as_str() {
            "" => Err(ControlParseError::Empty),
            "start" => Ok(ControlCommand::Start(parse_target("start", rest)?)),
            "stop" => Ok(ControlCommand::Stop(parse_target("stop", rest)?)),
            "add" => Ok(ControlCommand::Add(parse_slot("add", rest)?)),
            "remove" => Ok(ControlCommand::Remove(parse_slot("remove", rest)?)),
            "send" => {
                let (slot, text) = parse_send(rest)?;
                Ok(ControlCommand::Send {
                    slot,
                    text: text.to_string(),
                })
            }
            "status" => no_args("status", rest, ControlCommand::Status),
            "help" | "?" => no_args("help", rest, ControlCommand::Help),
            "quit" | "exit" => no_args("quit", rest, ControlCommand::Quit),
            _ => Err(ControlParseError::UnknownVerb(verb.to_string())),
        }
    }
}

fn parse_target(verb: &'static str, rest: &str) -> Result<Target, ControlParseError> {
    if rest.eq_ignore_ascii_case("all") {
        return Ok(Target::All);
    }
    parse_slot(verb, rest).map(Target::Slot)
}

fn parse_slot(verb: &'static str, rest: &str) -> Result<SlotId, ControlParseError> {
    if rest.is_empty() {
        return Err(ControlParseError::MissingSlot(verb));
    }
    Ok(rest.parse()?)
}

/// Splits `send` arguments into the slot and the text. The slot may be
/// written `game <n>`, so a bare `game` takes the next word as its id.
fn parse_send(rest: &str) -> Result<(SlotId, &str), ControlParseError> {
    if rest.is_empty() {
        return Err(ControlParseError::MissingSlot("send"));
    }
    let (first, after) = split_word(rest);
    let (slot, text) = if first.eq_ignore_ascii_case("game") {
        let (id, text) = split_word(after);
        (format!("{} {}", first, id).parse::<SlotId>()?, text)
    } else {
        (first.parse::<SlotId>()?, after)
    };
    if text.is_empty() {
        return Err(ControlParseError::MissingText);
    }
    Ok((slot, text))
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (text, ""),
    }
}

fn no_args(
    verb: &'static str,
    rest: &str,
    command: ControlCommand,
) -> Result<ControlCommand, ControlParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ControlParseError::UnexpectedArgs(verb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targets() {
        assert_eq!(
            ControlCommand::parse("start all").unwrap(),
            ControlCommand::Start(Target::All)
        );
        assert_eq!(
            ControlCommand::parse("  STOP game 4 ").unwrap(),
            ControlCommand::Stop(Target::Slot(SlotId::Game(4)))
        );
        assert_eq!(
            ControlCommand::parse("add shop").unwrap(),
            ControlCommand::Add(SlotId::Shop)
        );
        assert_eq!(
            ControlCommand::parse("remove game:9").unwrap(),
            ControlCommand::Remove(SlotId::Game(9))
        );
    }

    #[test]
    fn send_keeps_text_verbatim() {
        assert_eq!(
            ControlCommand::parse("send center  !notice  Server restart in 5 min").unwrap(),
            ControlCommand::Send {
                slot: SlotId::Center,
                text: "!notice  Server restart in 5 min".into()
            }
        );
        assert_eq!(
            ControlCommand::parse("send login").unwrap_err(),
            ControlParseError::MissingText
        );
        assert_eq!(
            ControlCommand::parse("send").unwrap_err(),
            ControlParseError::MissingSlot("send")
        );
    }

    #[test]
    fn send_accepts_spaced_game_slot() {
        assert_eq!(
            ControlCommand::parse("send game 4 !online").unwrap(),
            ControlCommand::Send {
                slot: SlotId::Game(4),
                text: "!online".into()
            }
        );
        assert_eq!(
            ControlCommand::parse("send game:4 !online").unwrap(),
            ControlCommand::Send {
                slot: SlotId::Game(4),
                text: "!online".into()
            }
        );
        assert_eq!(
            ControlCommand::parse("send GAME 12").unwrap_err(),
            ControlParseError::MissingText
        );
        assert!(matches!(
            ControlCommand::parse("send game hello").unwrap_err(),
            ControlParseError::Slot(SlotParseError::Unknown(_))
        ));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(ControlCommand::parse("   ").unwrap_err(), ControlParseError::Empty);
        assert_eq!(
            ControlCommand::parse("reboot").unwrap_err(),
            ControlParseError::UnknownVerb("reboot".into())
        );
        assert_eq!(
            ControlCommand::parse("start").unwrap_err(),
            ControlParseError::MissingSlot("start")
        );
        assert_eq!(
            ControlCommand::parse("status now").unwrap_err(),
            ControlParseError::UnexpectedArgs("status")
        );
        assert!(matches!(
            ControlCommand::parse("start game:300").unwrap_err(),
            ControlParseError::Slot(SlotParseError::GameIdOutOfRange(300))
        ));
    }

    #[test]
    fn aliases() {
        assert_eq!(ControlCommand::parse("?").unwrap(), ControlCommand::Help);
        assert_eq!(ControlCommand::parse("exit").unwrap(), ControlCommand::Quit);
    }
}
