use serde::Serialize;

/// One core's row in `/v1/status` and `portico status`.
///
/// A capability is healthy until it records a warning; the daemon is
/// healthy only when every capability is.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityStatus {
    pub name: String,
    pub summary: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CapabilityStatus {
    pub fn new(name: &str, summary: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            summary: summary.into(),
            healthy: true,
            warnings: Vec::new(),
        }
    }

    /// Record a warning when `condition` holds.
    pub fn warn_if(mut self, condition: bool, warning: &str) -> Self {
        if condition {
            self.healthy = false;
            self.warnings.push(warning.to_string());
        }
        self
    }
}

/// Implemented by the CA, pairing, auth and router cores.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> CapabilityStatus;
}

/// True when no capability reports a warning.
pub fn all_healthy(capabilities: &[CapabilityStatus]) -> bool {
    capabilities.iter().all(|c| c.healthy)
}
