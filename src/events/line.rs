//! Lifecycle line grammar
//!
//! ```text
//! CMD <epoch_seconds> <command_text>
//! EXIT <epoch_seconds> <exit_code> <duration_ms> <cwd>
//! ```
//!
//! `command_text` and `cwd` run to the end of the line and may contain
//! spaces. Hooks percent-encode `%`, LF and CR in both fields so a multi-line
//! command still occupies a single transport line.

use chrono::DateTime;
use std::str::FromStr;
use thiserror::Error;

/// A syntactically valid line read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLifecycleLine {
    Cmd {
        timestamp: i64,
        command: String,
    },
    Exit {
        timestamp: i64,
        exit_code: i32,
        duration_ms: i64,
        cwd: String,
    },
}

impl RawLifecycleLine {
    pub fn timestamp(&self) -> i64 {
        match self {
            RawLifecycleLine::Cmd { timestamp, .. } | RawLifecycleLine::Exit { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Why a line was rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("empty line")]
    Empty,

    #[error("unknown verb '{0}'")]
    UnknownVerb(String),

    #[error("{verb} line is missing fields")]
    MissingFields { verb: &'static str },

    #[error("invalid {field} '{value}'")]
    InvalidNumber { field: &'static str, value: String },
}

impl FromStr for RawLifecycleLine {
    type Err = LineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        parse_line(line)
    }
}

/// Parse one transport line (terminator already stripped).
pub fn parse_line(line: &str) -> Result<RawLifecycleLine, LineError> {
    if line.trim().is_empty() {
        return Err(LineError::Empty);
    }

    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
        "CMD" => {
            let mut fields = rest.splitn(2, ' ');
            let timestamp = parse_timestamp(fields.next(), "CMD")?;
            let command = non_empty(fields.next(), "CMD")?;
            Ok(RawLifecycleLine::Cmd {
                timestamp,
                command: decode_field(command),
            })
        }
        "EXIT" => {
            let mut fields = rest.splitn(4, ' ');
            let timestamp = parse_timestamp(fields.next(), "EXIT")?;
            let exit_code = parse_number(fields.next(), "exit code", "EXIT")?;
            let duration_ms = parse_number(fields.next(), "duration", "EXIT")?;
            let cwd = non_empty(fields.next(), "EXIT")?;
            Ok(RawLifecycleLine::Exit {
                timestamp,
                exit_code,
                duration_ms,
                cwd: decode_field(cwd),
            })
        }
        other => Err(LineError::UnknownVerb(other.to_string())),
    }
}

fn non_empty<'a>(field: Option<&'a str>, verb: &'static str) -> Result<&'a str, LineError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(LineError::MissingFields { verb }),
    }
}

fn parse_number<T: FromStr>(
    field: Option<&str>,
    name: &'static str,
    verb: &'static str,
) -> Result<T, LineError> {
    let value = non_empty(field, verb)?;
    value.parse().map_err(|_| LineError::InvalidNumber {
        field: name,
        value: value.to_string(),
    })
}

fn parse_timestamp(field: Option<&str>, verb: &'static str) -> Result<i64, LineError> {
    let value = non_empty(field, verb)?;
    let invalid = || LineError::InvalidNumber {
        field: "timestamp",
        value: value.to_string(),
    };
    let timestamp: i64 = value.parse().map_err(|_| invalid())?;
    // Must be representable as a calendar time.
    DateTime::from_timestamp(timestamp, 0).ok_or_else(invalid)?;
    Ok(timestamp)
}

/// Percent-decode a hook field. Text that would not decode to valid UTF-8
/// is kept verbatim.
pub fn decode_field(raw: &str) -> String {
    if !raw.contains('%') {
        return raw.to_string();
    }
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Encode a field the way the shell hooks do.
pub fn encode_field(raw: &str) -> String {
    raw.replace('%', "%25")
        .replace('\n', "%0A")
        .replace('\r', "%0D")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_cmd_keeps_spaces() {
        assert_eq!(
            parse_line("CMD 1700000000 ls -la  /tmp").unwrap(),
            RawLifecycleLine::Cmd {
                timestamp: 1_700_000_000,
                command: "ls -la  /tmp".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_exit() {
        assert_eq!(
            parse_line("EXIT 1700000002 127 2013 /home/x/My Projects").unwrap(),
            RawLifecycleLine::Exit {
                timestamp: 1_700_000_002,
                exit_code: 127,
                duration_ms: 2013,
                cwd: "/home/x/My Projects".to_string(),
            }
        );
    }

    #[test]
    fn test_negative_exit_code_and_duration_are_syntactically_valid() {
        let line = parse_line("EXIT 5 -1 -20 /").unwrap();
        assert_eq!(
            line,
            RawLifecycleLine::Exit {
                timestamp: 5,
                exit_code: -1,
                duration_ms: -20,
                cwd: "/".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert_eq!(parse_line(""), Err(LineError::Empty));
        assert_eq!(
            parse_line("GARBAGE not a real line"),
            Err(LineError::UnknownVerb("GARBAGE".to_string()))
        );
        assert_eq!(
            parse_line("CMD 100"),
            Err(LineError::MissingFields { verb: "CMD" })
        );
        assert_eq!(
            parse_line("CMD 100 "),
            Err(LineError::MissingFields { verb: "CMD" })
        );
        assert_eq!(
            parse_line("CMD soon ls"),
            Err(LineError::InvalidNumber {
                field: "timestamp",
                value: "soon".to_string()
            })
        );
        assert_eq!(
            parse_line("EXIT 100 zero 5 /tmp"),
            Err(LineError::InvalidNumber {
                field: "exit code",
                value: "zero".to_string()
            })
        );
        assert_eq!(
            parse_line("EXIT 100 0 5"),
            Err(LineError::MissingFields { verb: "EXIT" })
        );
        assert!(parse_line("cmd 100 ls").is_err());
        assert!(parse_line("CMD 99999999999999999 ls").is_err());
    }

    #[test]
    fn test_encoded_fields_are_decoded() {
        let encoded = encode_field("for f in *; do\n  echo \"$f 100%\"\ndone");
        assert!(!encoded.contains('\n'));

        let line = format!("CMD 10 {encoded}");
        assert_eq!(
            parse_line(&line).unwrap(),
            RawLifecycleLine::Cmd {
                timestamp: 10,
                command: "for f in *; do\n  echo \"$f 100%\"\ndone".to_string(),
            }
        );
    }

    #[test]
    fn test_plus_is_not_a_space() {
        assert_eq!(decode_field("a+b%20c"), "a+b c");
    }

    #[test]
    fn test_undecodable_field_is_kept() {
        assert_eq!(decode_field("100%ff"), "100%ff");
    }
}
