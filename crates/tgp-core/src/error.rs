//! Kernel error kinds
//!
//! One variant per user-visible failure class. Execution failures are
//! folded into `ExecutionResult.error` strings before they reach the agent;
//! everything else propagates as `KernelError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Sub-kind for persistence failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistFailure {
    /// Remote unreachable, DNS, TLS, transfer interrupted.
    Network,
    /// Credentials rejected by the remote.
    Auth,
    /// Local repository state prevented the operation.
    Repository,
}

impl std::fmt::Display for PersistFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistFailure::Network => write!(f, "network"),
            PersistFailure::Auth => write!(f, "auth"),
            PersistFailure::Repository => write!(f, "repository"),
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Jail escape, write-allow-list, or fetch-allow-list refusal. The
    /// message names the offending path or URL.
    #[error("Security Violation: {0}")]
    SecurityViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Compile error: {0}")]
    CompileError(String),

    #[error("Lint violation: {}", violations.join("; "))]
    LintViolation { violations: Vec<String> },

    #[error("Tool execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Guest memory limit exceeded ({0} bytes)")]
    MemoryLimit(usize),

    /// The guest threw; the payload is the user-facing message.
    #[error("{0}")]
    GuestThrew(String),

    #[error("Bridge call '{capability}' denied: {reason}")]
    BridgeDenied { capability: String, reason: String },

    #[error("Patch search text not found in {0}")]
    PatchNotFound(String),

    /// Push still rejected after the fetch-and-replay retry loop.
    #[error("Persist conflict: {0}")]
    PersistConflict(String),

    #[error("Persist failed ({kind}): {message}")]
    PersistError {
        kind: PersistFailure,
        message: String,
    },

    #[error("Internal sandbox error: {0}")]
    InternalSandboxError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Agent-facing error string for `ExecutionResult.error`.
    pub fn execution_message(&self) -> String {
        self.to_string()
    }

    /// Stable machine-readable code for structured tool results.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::ConfigInvalid(_) => "config_invalid",
            KernelError::SecurityViolation(_) => "security_violation",
            KernelError::NotFound(_) => "not_found",
            KernelError::CompileError(_) => "compile_error",
            KernelError::LintViolation { .. } => "lint_violation",
            KernelError::Timeout(_) => "timeout",
            KernelError::MemoryLimit(_) => "memory_limit",
            KernelError::GuestThrew(_) => "guest_threw",
            KernelError::BridgeDenied { .. } => "bridge_denied",
            KernelError::PatchNotFound(_) => "patch_not_found",
            KernelError::PersistConflict(_) => "persist_conflict",
            KernelError::PersistError { .. } => "persist_error",
            KernelError::InternalSandboxError(_) => "internal_sandbox_error",
            KernelError::Io(_) => "io_error",
        }
    }

    pub fn persist_error(kind: PersistFailure, message: impl Into<String>) -> Self {
        KernelError::PersistError {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_matches_agent_contract() {
        let err = KernelError::Timeout(5000);
        assert!(err.to_string().to_lowercase().contains("timed out"));
    }

    #[test]
    fn security_violation_names_offender() {
        let err = KernelError::SecurityViolation("../../etc/passwd".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Security Violation"));
        assert!(msg.contains("../../etc/passwd"));
    }

    #[test]
    fn persist_error_carries_sub_kind() {
        let err = KernelError::persist_error(PersistFailure::Auth, "401 from remote");
        assert!(err.to_string().contains("auth"));
        assert!(err.to_string().contains("401 from remote"));
    }
}
