use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::info;

use super::mode::NetworkMode;
use crate::constants::DEFAULT_AUDIT_CAPACITY;

/// Something the network gate decided or observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ModeChanged { from: NetworkMode, to: NetworkMode },
    AccessGranted { purpose: String },
    AccessDenied { purpose: String, mode: NetworkMode },
    AccessReleased { purpose: String },
    AllReleased { purposes: usize },
    HostBlocked { host: String },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModeChanged { from, to } => write!(f, "network mode changed: {} -> {}", from, to),
            Self::AccessGranted { purpose } => write!(f, "network access granted for {}", purpose),
            Self::AccessDenied { purpose, mode } => {
                write!(f, "network access denied for {} ({})", purpose, mode)
            }
            Self::AccessReleased { purpose } => write!(f, "network access released for {}", purpose),
            Self::AllReleased { purposes } => {
                write!(f, "released network access for {} purposes", purposes)
            }
            Self::HostBlocked { host } => write!(f, "request to unauthorized host blocked: {}", host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Bounded in-memory record of network decisions
///
/// The oldest entries are dropped once `capacity` is reached. Every entry is
/// also emitted as a tracing event on the `audit` target.
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        info!(target: "audit", "{}", event);

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(AuditEntry {
            timestamp: Utc::now(),
            event,
        });
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        info!(target: "audit", "audit log cleared");
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
