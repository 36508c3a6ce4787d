// Gateway module for network privacy - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod audit;
mod gate;
mod mode;

// Public re-exports - the ONLY way to access privacy functionality
pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use gate::{GateStats, NetworkAccessGate, NetworkGuard};
pub use mode::NetworkMode;

#[cfg(test)]
pub(crate) use gate::MockNetworkAccessGate;
