//! Line protocol spoken by the decision server.
//!
//! Requests are single lines, `COMMAND [key]`. Replies are single-line JSON
//! objects tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::ratelimit::Verdict;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Consume a permit for the key
    Allow(String),
    /// Report permits left for the key
    Remaining(String),
    Ping,
}

impl Command {
    /// Parse one request line. The key is everything after the first space.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, key) = match line.split_once(' ') {
            Some((verb, key)) => (verb, key),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(Command::Allow(require_key(verb, key)?)),
            "REMAINING" => Ok(Command::Remaining(require_key(verb, key)?)),
            "PING" => Ok(Command::Ping),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

fn require_key(verb: &str, key: &str) -> Result<String, String> {
    if key.is_empty() {
        Err(format!("{} requires a key", verb.to_ascii_uppercase()))
    } else {
        Ok(key.to_string())
    }
}

/// A reply line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Verdict(Verdict),
    Remaining { key: String, remaining: i64 },
    Pong,
    Error { message: String },
}

impl Reply {
    /// Encode as a newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            // Serializing these variants cannot fail; keep the wire valid anyway
            Err(_) => "{\"type\":\"error\",\"message\":\"encoding failed\"}\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("ALLOW client-a\n"),
            Ok(Command::Allow("client-a".to_string()))
        );
        assert_eq!(
            Command::parse("remaining client a\r\n"),
            Ok(Command::Remaining("client a".to_string()))
        );
        assert_eq!(Command::parse("ping"), Ok(Command::Ping));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Command::parse("allow"),
            Err("ALLOW requires a key".to_string())
        );
        assert_eq!(
            Command::parse("allow "),
            Err("ALLOW requires a key".to_string())
        );
        assert_eq!(Command::parse(""), Err("empty command".to_string()));
        assert_eq!(
            Command::parse("DROP table"),
            Err("unknown command: DROP".to_string())
        );
    }

    #[test]
    fn test_reply_lines() {
        assert_eq!(Reply::Pong.to_line(), "{\"type\":\"pong\"}\n");
        assert_eq!(
            Reply::Remaining {
                key: "k".to_string(),
                remaining: 3
            }
            .to_line(),
            "{\"type\":\"remaining\",\"key\":\"k\",\"remaining\":3}\n"
        );

        let verdict = Reply::Verdict(Verdict {
            allowed: false,
            limit: 1.0,
            remaining: 0,
            reset_secs: Some(5),
            retry_after_secs: Some(5),
        });
        let line = verdict.to_line();
        assert!(line.starts_with("{\"type\":\"verdict\",\"allowed\":false"));
        assert_eq!(serde_json::from_str::<Reply>(line.trim_end()).unwrap(), verdict);
    }
}
