use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Port used for entries that do not name one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Username/password pairs tried, in order, once anonymous access is refused.
pub const DEFAULT_CREDENTIALS: &[(&str, &str)] = &[
    ("admin", "admin"),
    ("root", "root"),
    ("mqtt", "mqtt"),
    ("user", "user"),
    ("guest", "guest"),
    ("test", "test"),
    ("", ""),
    ("anonymous", ""),
];

/// One broker endpoint to audit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
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

    /// Key used in the result map and in every report format.
    pub fn key(&self) -> String {
        self.to_string()
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

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.username, self.password)
    }
}

/// The built-in credential sequence as owned values.
pub fn default_credentials() -> Vec<Credential> {
    DEFAULT_CREDENTIALS
        .iter()
        .map(|(u, p)| Credential::new(*u, *p))
        .collect()
}

/// Terminal classification of a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Unreachable,
    OpenAccess,
    Authenticated(Credential),
    AccessDenied,
}

impl ProbeOutcome {
    pub const UNREACHABLE: &'static str = "Not an MQTT broker or unreachable";
    pub const OPEN_ACCESS: &'static str = "Unauthenticated access allowed";
    pub const AUTHENTICATED: &'static str = "Login successful";
    pub const ACCESS_DENIED: &'static str = "No default credentials worked";

    /// Human-readable status used by every report format.
    pub fn status(&self) -> &'static str {
        match self {
            ProbeOutcome::Unreachable => Self::UNREACHABLE,
            ProbeOutcome::OpenAccess => Self::OPEN_ACCESS,
            ProbeOutcome::Authenticated(_) => Self::AUTHENTICATED,
            ProbeOutcome::AccessDenied => Self::ACCESS_DENIED,
        }
    }

    /// Credentials to report. Open access reports an empty pair.
    pub fn reported_credentials(&self) -> Option<Credential> {
        match self {
            ProbeOutcome::OpenAccess => Some(Credential::new("", "")),
            ProbeOutcome::Authenticated(c) => Some(c.clone()),
            ProbeOutcome::Unreachable | ProbeOutcome::AccessDenied => None,
        }
    }

    /// Rebuild an outcome from a report's status string and credential columns.
    pub fn from_status(status: &str, credential: Option<Credential>) -> Option<Self> {
        match status {
            Self::UNREACHABLE => Some(ProbeOutcome::Unreachable),
            Self::OPEN_ACCESS => Some(ProbeOutcome::OpenAccess),
            Self::AUTHENTICATED => credential.map(ProbeOutcome::Authenticated),
            Self::ACCESS_DENIED => Some(ProbeOutcome::AccessDenied),
            _ => None,
        }
    }

    /// Broker accepted a session, with or without credentials.
    pub fn is_vulnerable(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::OpenAccess | ProbeOutcome::Authenticated(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub target: Target,
    pub outcome: ProbeOutcome,
}

/// Aggregate results and progress counters, keyed by `host:port`.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub vulnerable_count: u64,
    pub entries: BTreeMap<String, ScanResult>,
}

impl ScanResults {
    /// Count of entries per status string, in first-seen key order.
    pub fn status_counts(&self) -> Vec<(&'static str, usize)> {
        let mut counts: Vec<(&'static str, usize)> = Vec::new();
        for r in self.entries.values() {
            let status = r.outcome.status();
            match counts.iter_mut().find(|(s, _)| *s == status) {
                Some((_, n)) => *n += 1,
                None => counts.push((status, 1)),
            }
        }
        counts
    }

    pub fn vulnerable(&self) -> impl Iterator<Item = &ScanResult> {
        self.entries.values().filter(|r| r.outcome.is_vulnerable())
    }
}
