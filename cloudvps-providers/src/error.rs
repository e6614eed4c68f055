/// Errors surfaced by hypervisor clients.
///
/// Every variant carries the attempted operation and the node/vmid it targeted.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("authentication against {host} failed: {reason}")]
    Authentication { host: String, reason: String },

    #[error("hypervisor unavailable during {op} ({target}): {reason}")]
    Unavailable {
        op: &'static str,
        target: String,
        reason: String,
    },

    #[error("vmid {vmid} already exists on node {node}")]
    VmidInUse { node: String, vmid: u32 },

    #[error("{op}: {target} not found")]
    NotFound { op: &'static str, target: String },

    #[error("{op} ({target}) failed: status={status} body={body}")]
    Api {
        op: &'static str,
        target: String,
        status: u16,
        body: String,
    },

    #[error("{op} ({target}) returned a malformed response: {reason}")]
    Decode {
        op: &'static str,
        target: String,
        reason: String,
    },
}

impl HypervisorError {
    /// Network failures, timeouts and 5xx. Worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HypervisorError::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }

    pub fn op(&self) -> &'static str {
        match self {
            HypervisorError::Authentication { .. } => "authenticate",
            HypervisorError::VmidInUse { .. } => "create_vm",
            HypervisorError::Unavailable { op, .. }
            | HypervisorError::NotFound { op, .. }
            | HypervisorError::Api { op, .. }
            | HypervisorError::Decode { op, .. } => op,
        }
    }
}

/// Human-readable target of a call, e.g. `node=pve1 vmid=101`.
pub fn target(node: Option<&str>, vmid: Option<u32>) -> String {
    match (node, vmid) {
        (Some(n), Some(v)) => format!("node={} vmid={}", n, v),
        (Some(n), None) => format!("node={}", n),
        (None, Some(v)) => format!("vmid={}", v),
        (None, None) => "cluster".to_string(),
    }
}
