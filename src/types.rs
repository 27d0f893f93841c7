use std::borrow::Cow;
use std::fmt;

use serde::Serialize;
use serde_json::value::RawValue;

use crate::error::ProbeError;
use crate::protocol::DEFAULT_PORT;

/// A host to probe together with the port it is probed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Step of a probe at which it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    Connect,
    Send,
    Receive,
    Parse,
}

impl ProbeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStage::Connect => "connect",
            ProbeStage::Send => "send",
            ProbeStage::Receive => "receive",
            ProbeStage::Parse => "parse",
        }
    }
}

impl fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of probing one host. Every host yields exactly one of these.
#[derive(Debug)]
pub enum ScanResult {
    Success {
        target: Target,
        status: Box<RawValue>,
    },
    Failure {
        target: Target,
        stage: ProbeStage,
        error: ProbeError,
    },
}

impl ScanResult {
    pub fn target(&self) -> &Target {
        match self {
            ScanResult::Success { target, .. } | ScanResult::Failure { target, .. } => target,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScanResult::Success { .. })
    }

    /// Human-readable failure reason, e.g. `connect: timed out after 30s`.
    pub fn reason(&self) -> Option<String> {
        match self {
            ScanResult::Success { .. } => None,
            ScanResult::Failure {
                error: error @ (ProbeError::EmptyResponse | ProbeError::Panicked),
                ..
            } => Some(error.to_string()),
            ScanResult::Failure { stage, error, .. } => Some(format!("{stage}: {error}")),
        }
    }

    /// The record persisted for a successful probe.
    pub fn record(&self) -> Option<SlpRecord<'_>> {
        match self {
            ScanResult::Success { target, status } => {
                let ip = if target.port == DEFAULT_PORT {
                    Cow::Borrowed(target.host.as_str())
                } else {
                    Cow::Owned(target.to_string())
                };
                Some(SlpRecord { ip, slp: status })
            }
            ScanResult::Failure { .. } => None,
        }
    }
}

/// One persisted line: `{"ip": "<host>", "slp": <status json>}`.
///
/// A host probed on a non-default port is written as `host:port`.
#[derive(Debug, Serialize)]
pub struct SlpRecord<'a> {
    pub ip: Cow<'a, str>,
    pub slp: &'a RawValue,
}

/// Aggregate counters for a finished scan.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub found_count: u64,
    pub failed_count: u64,
    pub elapsed_ms: u64,
}
