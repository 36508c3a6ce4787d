use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::audit::{AuditEvent, AuditLog};
use super::mode::NetworkMode;

/// Policy point every outbound request must pass through
#[cfg_attr(test, mockall::automock)]
pub trait NetworkAccessGate: Send + Sync {
    fn current_mode(&self) -> NetworkMode;

    /// Ask for access on behalf of `purpose`; every grant must be paired with
    /// a `release_access` for the same purpose
    fn request_access(&self, purpose: &str) -> bool;

    fn release_access(&self, purpose: &str);

    fn on_mode_changed(&self, mode: NetworkMode);
}

/// Counters exposed for status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateStats {
    pub granted: u64,
    pub denied: u64,
    pub active: usize,
}

/// Mode-driven gate with request accounting and an audit trail
pub struct NetworkGuard {
    mode: RwLock<NetworkMode>,
    /// Outstanding grants per purpose
    active: Mutex<HashMap<String, usize>>,
    granted: AtomicU64,
    denied: AtomicU64,
    allowed_hosts: Vec<String>,
    audit: Arc<AuditLog>,
}

impl NetworkGuard {
    pub fn new(mode: NetworkMode, allowed_hosts: Vec<String>, audit: Arc<AuditLog>) -> Self {
        Self {
            mode: RwLock::new(mode),
            active: Mutex::new(HashMap::new()),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            audit,
        }
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn has_active_requests(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            active: self.active.lock().values().sum(),
        }
    }

    /// Drop every outstanding grant
    pub fn release_all(&self) {
        let released = {
            let mut active = self.active.lock();
            let count = active.len();
            active.clear();
            count
        };
        self.audit.record(AuditEvent::AllReleased { purposes: released });
    }

    /// Emergency stop: go offline and forget every grant
    pub fn block_all(&self) {
        warn!("blocking all network access");
        self.on_mode_changed(NetworkMode::Offline);
        self.release_all();
    }

    /// Whether `host` is on the allow-list, either exactly or as a subdomain;
    /// every rejection, an empty host included, is audited
    pub fn validate_host(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_lowercase();
        let allowed = self.allowed_hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        });
        if !allowed {
            self.audit.record(AuditEvent::HostBlocked { host });
        }
        allowed
    }
}

impl NetworkAccessGate for NetworkGuard {
    fn current_mode(&self) -> NetworkMode {
        *self.mode.read()
    }

    fn request_access(&self, purpose: &str) -> bool {
        let mode = self.current_mode();
        if !mode.allows_network() {
            self.denied.fetch_add(1, Ordering::Relaxed);
            self.audit.record(AuditEvent::AccessDenied {
                purpose: purpose.to_string(),
                mode,
            });
            return false;
        }

        *self.active.lock().entry(purpose.to_string()).or_insert(0) += 1;
        self.granted.fetch_add(1, Ordering::Relaxed);
        self.audit.record(AuditEvent::AccessGranted {
            purpose: purpose.to_string(),
        });
        true
    }

    fn release_access(&self, purpose: &str) {
        let released = {
            let mut active = self.active.lock();
            match active.get_mut(purpose) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    true
                }
                Some(_) => {
                    active.remove(purpose);
                    true
                }
                None => false,
            }
        };

        if released {
            self.audit.record(AuditEvent::AccessReleased {
                purpose: purpose.to_string(),
            });
        } else {
            debug!(purpose, "release without an outstanding grant ignored");
        }
    }

    fn on_mode_changed(&self, mode: NetworkMode) {
        let previous = std::mem::replace(&mut *self.mode.write(), mode);
        if previous != mode {
            self.audit.record(AuditEvent::ModeChanged {
                from: previous,
                to: mode,
            });
        }
    }
}
