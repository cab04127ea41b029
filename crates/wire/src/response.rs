//! Response envelope: a list of status lines plus an optional JSON
//! payload, terminated by a blank line (`spec.md` §6).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

impl StatusLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Info => "INFO",
            StatusLevel::Warn => "WARN",
            StatusLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseLine {
    pub level: StatusLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub lines: Vec<ResponseLine>,
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, level: StatusLevel, message: impl Into<String>) -> Self {
        self.lines.push(ResponseLine { level, message: message.into() });
        self
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new().push(StatusLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new().push(StatusLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new().push(StatusLevel::Error, message)
    }

    pub fn not_found() -> Self {
        Self::error("not found")
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn is_error(&self) -> bool {
        self.lines.iter().any(|l| l.level == StatusLevel::Error)
    }
}

/// Typed JSON payloads used by the canonical commands. Kept separate
/// from `Envelope` so handlers build a typed struct and attach it, never
/// a bag of loose `serde_json::Value` fields.
pub mod payload {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct VersionPayload {
        pub version: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct TunnelStatusEntry {
        pub alias: String,
        pub desired: String,
        pub state: String,
        pub pid: Option<u32>,
        pub retry_count: u32,
        pub total_reconnects: u64,
        pub last_connected_epoch_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct StatusPayload {
        pub uptime_secs: u64,
        pub context: String,
        pub location: String,
        pub online: bool,
        pub tunnels: Vec<TunnelStatusEntry>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ContextTransitionEntry {
        pub from: String,
        pub to: String,
        pub trigger: String,
        pub epoch_ms: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct ContextStatusPayload {
        pub context: String,
        pub location: String,
        pub matched_rule: Option<String>,
        pub environment: BTreeMap<String, String>,
        #[serde(default)]
        pub history: Vec<ContextTransitionEntry>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CompanionStatusEntry {
        pub alias: String,
        pub name: String,
        pub state: String,
        pub pid: Option<u32>,
        pub exit_code: Option<i32>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CompanionStatusPayload {
        pub companions: Vec<CompanionStatusEntry>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct AskpassPayload {
        pub password: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CompanionInitPayload {
        pub command: Vec<String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_error_detects_error_level() {
        let env = Envelope::new().push(StatusLevel::Info, "hi").push(StatusLevel::Error, "boom");
        assert!(env.is_error());
    }
}
