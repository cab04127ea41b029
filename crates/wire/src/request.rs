//! Parsing of request lines into a typed `Request`.
//!
//! Wire format (see `spec.md` §4.H / §6): one line of whitespace-separated
//! tokens. The first token is the command name; the rest are positional
//! arguments or `--flag=value` options.

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub tags: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Status,
    Version,
    Stop,
    Reload,
    Reset,
    SshConnect { alias: String, options: ConnectOptions },
    SshDisconnect { alias: String },
    SshDisconnectAll,
    SshReconnect { alias: String },
    ContextStatus { events: bool },
    Logs { lines: usize, no_history: bool },
    Attach,
    Askpass { alias: String, token: String },
    CompanionInit { alias: String, name: String, token: String },
    CompanionStatus,
    CompanionStart { alias: String, name: String },
    CompanionStop { alias: String, name: String },
    CompanionRestart { alias: String, name: String },
    CompanionAttach { alias: String, name: String, lines: usize, no_history: bool },
}

impl Request {
    /// Commands that switch the connection into a long-lived streaming
    /// mode instead of a single bounded envelope.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Request::Logs { .. } | Request::Attach | Request::CompanionAttach { .. })
    }
}

/// Split a line into tokens, collecting `--flag=value` tokens separately
/// from positional ones.
fn tokenize(line: &str) -> (Vec<String>, Vec<(String, String)>) {
    let mut positional = Vec::new();
    let mut flags = Vec::new();
    for tok in line.split_whitespace() {
        if let Some(rest) = tok.strip_prefix("--") {
            if let Some((k, v)) = rest.split_once('=') {
                flags.push((k.to_string(), v.to_string()));
                continue;
            }
        }
        positional.push(tok.to_string());
    }
    (positional, flags)
}

fn flag<'a>(flags: &'a [(String, String)], name: &str) -> Option<&'a str> {
    flags.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn require_positional(command: &str, positional: &[String], idx: usize, name: &str) -> Result<String, ProtocolError> {
    positional
        .get(idx)
        .cloned()
        .ok_or_else(|| ProtocolError::MissingArgument { command: command.to_string(), arg: name.to_string() })
}

pub fn parse(line: &str) -> Result<Request, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    let (positional, flags) = tokenize(line);
    let command = positional[0].to_ascii_uppercase();
    let rest = &positional[1..];

    match command.as_str() {
        "STATUS" => Ok(Request::Status),
        "VERSION" => Ok(Request::Version),
        "STOP" => Ok(Request::Stop),
        "RELOAD" => Ok(Request::Reload),
        "RESET" => Ok(Request::Reset),
        "SSH_CONNECT" => {
            let alias = require_positional(&command, rest, 0, "alias")?;
            let tags = flag(&flags, "tags").map(|s| s.split(',').map(str::to_string).collect()).unwrap_or_default();
            let env = flags
                .iter()
                .filter(|(k, _)| k == "env")
                .filter_map(|(_, v)| v.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect();
            Ok(Request::SshConnect { alias, options: ConnectOptions { tags, env } })
        }
        "SSH_DISCONNECT" => Ok(Request::SshDisconnect { alias: require_positional(&command, rest, 0, "alias")? }),
        "SSH_DISCONNECT_ALL" => Ok(Request::SshDisconnectAll),
        "SSH_RECONNECT" => Ok(Request::SshReconnect { alias: require_positional(&command, rest, 0, "alias")? }),
        "CONTEXT_STATUS" => Ok(Request::ContextStatus { events: rest.first().map(|s| s == "events").unwrap_or(false) }),
        "LOGS" => {
            let lines = rest.first().and_then(|s| s.parse().ok()).unwrap_or(0);
            let no_history = rest.iter().any(|s| s == "no_history");
            Ok(Request::Logs { lines, no_history })
        }
        "ATTACH" => Ok(Request::Attach),
        "ASKPASS" => {
            let alias = require_positional(&command, rest, 0, "alias")?;
            let token = require_positional(&command, rest, 1, "token")?;
            Ok(Request::Askpass { alias, token })
        }
        "COMPANION_INIT" => {
            let alias = require_positional(&command, rest, 0, "alias")?;
            let name = require_positional(&command, rest, 1, "name")?;
            let token = require_positional(&command, rest, 2, "token")?;
            Ok(Request::CompanionInit { alias, name, token })
        }
        "COMPANION_STATUS" => Ok(Request::CompanionStatus),
        "COMPANION_START" => Ok(Request::CompanionStart {
            alias: require_positional(&command, rest, 0, "alias")?,
            name: require_positional(&command, rest, 1, "name")?,
        }),
        "COMPANION_STOP" => Ok(Request::CompanionStop {
            alias: require_positional(&command, rest, 0, "alias")?,
            name: require_positional(&command, rest, 1, "name")?,
        }),
        "COMPANION_RESTART" => Ok(Request::CompanionRestart {
            alias: require_positional(&command, rest, 0, "alias")?,
            name: require_positional(&command, rest, 1, "name")?,
        }),
        "COMPANION_ATTACH" => {
            let alias = require_positional(&command, rest, 0, "alias")?;
            let name = require_positional(&command, rest, 1, "name")?;
            let lines = rest.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let no_history = rest.iter().any(|s| s == "no_history");
            Ok(Request::CompanionAttach { alias, name, lines, no_history })
        }
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_connect_with_tags_and_env() {
        let req = parse("SSH_CONNECT lab --tags=a,b --env=FOO=bar").unwrap();
        assert_eq!(
            req,
            Request::SshConnect {
                alias: "lab".into(),
                options: ConnectOptions { tags: vec!["a".into(), "b".into()], env: vec![("FOO".into(), "bar".into())] }
            }
        );
    }

    #[test]
    fn parses_companion_attach_with_lines_and_no_history() {
        let req = parse("COMPANION_ATTACH lab vpn 20 no_history").unwrap();
        assert_eq!(req, Request::CompanionAttach { alias: "lab".into(), name: "vpn".into(), lines: 20, no_history: true });
    }

    #[test]
    fn missing_argument_is_an_error() {
        assert!(matches!(parse("SSH_CONNECT"), Err(ProtocolError::MissingArgument { .. })));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(matches!(parse("FROB"), Err(ProtocolError::UnknownCommand(_))));
    }

    #[test]
    fn empty_line_is_an_error() {
        assert!(matches!(parse("   "), Err(ProtocolError::EmptyLine)));
    }

    #[test]
    fn is_streaming_flags_match_spec() {
        assert!(parse("ATTACH").unwrap().is_streaming());
        assert!(parse("LOGS 10").unwrap().is_streaming());
        assert!(!parse("STATUS").unwrap().is_streaming());
    }
}
