//! Interactive chat commands
//!
//! A line starting with `/` is a command; anything else is sent as a message.

use blechat_core::session::ScanMode;

use crate::error::{CliError, Result};

pub const HELP: &str = "\
/peers                       list discovered peers
/connect <n>                 connect to peer n
/scan [interval|continuous]  start scanning
/stop                        stop scanning
/filter [on|off]             toggle the signal-strength filter
/reset                       forget discovered peers
/advertise <data>            change the advertised payload
/disconnect                  drop the current server
/status                      show sessions and role
/log                         show the conversation
/help                        show this list
/quit                        leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Message(String),
    Peers,
    Connect(usize),
    Scan(Option<ScanMode>),
    StopScan,
    /// `None` toggles
    Filter(Option<bool>),
    Reset,
    Advertise(String),
    Disconnect,
    Status,
    Log,
    Help,
    Quit,
}

/// Parse one line of input; `None` for a blank line
pub fn parse_line(line: &str) -> Result<Option<ChatInput>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(ChatInput::Message(line.to_string())));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim()).filter(|rest| !rest.is_empty())),
        None => (command, None),
    };

    let input = match (name, argument) {
        ("peers", None) => ChatInput::Peers,
        ("connect", Some(index)) => ChatInput::Connect(index.parse().map_err(|_| {
            CliError::InvalidCommand(format!("'{}' is not a peer number", index))
        })?),
        ("connect", None) => {
            return Err(CliError::InvalidCommand("usage: /connect <n>".to_string()))
        }
        ("scan", None) => ChatInput::Scan(None),
        ("scan", Some("interval")) => ChatInput::Scan(Some(ScanMode::Interval)),
        ("scan", Some("continuous")) => ChatInput::Scan(Some(ScanMode::Continuous)),
        ("stop", None) => ChatInput::StopScan,
        ("filter", None) => ChatInput::Filter(None),
        ("filter", Some("on")) => ChatInput::Filter(Some(true)),
        ("filter", Some("off")) => ChatInput::Filter(Some(false)),
        ("reset", None) => ChatInput::Reset,
        ("advertise", Some(data)) => ChatInput::Advertise(data.to_string()),
        ("disconnect", None) => ChatInput::Disconnect,
        ("status", None) => ChatInput::Status,
        ("log", None) => ChatInput::Log,
        ("help", None) => ChatInput::Help,
        ("quit" | "exit", None) => ChatInput::Quit,
        _ => {
            return Err(CliError::InvalidCommand(format!(
                "unknown command '{}' (try /help)",
                line
            )))
        }
    };
    Ok(Some(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ChatInput {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(parse("  hello there "), ChatInput::Message("hello there".to_string()));
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(parse("/connect 2"), ChatInput::Connect(2));
        assert_eq!(parse("/scan continuous"), ChatInput::Scan(Some(ScanMode::Continuous)));
        assert_eq!(parse("/scan"), ChatInput::Scan(None));
        assert_eq!(parse("/filter off"), ChatInput::Filter(Some(false)));
        assert_eq!(parse("/filter"), ChatInput::Filter(None));
        assert_eq!(parse("/advertise hi there"), ChatInput::Advertise("hi there".to_string()));
        assert_eq!(parse("/exit"), ChatInput::Quit);
    }

    #[test]
    fn test_bad_commands_are_rejected() {
        for line in ["/connect", "/connect two", "/scan sometimes", "/peers 3", "/dance"] {
            assert!(
                matches!(parse_line(line), Err(CliError::InvalidCommand(_))),
                "{} should be rejected",
                line
            );
        }
    }
}
