//! Error taxonomy for faults the controller must tell apart.
//!
//! Errors travel as `anyhow::Error` with a [`CiError`] at the root of the chain;
//! callers classify them with `downcast_ref`. Expected per-test outcomes
//! (fail, error, timeout, invalid) are not errors: they are
//! [`TestStatus`](crate::core::types::TestStatus) values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CiError {
    /// Unusable settings file or option combination.
    #[error("invalid settings: {0}")]
    Settings(String),

    /// Malformed slice, whitelist or blacklist input, or a failed listing.
    /// Raised before any environment mutation.
    #[error("test selection failed: {0}")]
    Selection(String),

    /// Branch creation, patch download or patch apply failed.
    #[error("repository preparation failed for {repo}: {detail}")]
    RepoPrep { repo: String, detail: String },

    /// Host bootstrap or VM provisioning failed.
    #[error("environment preparation failed: {0}")]
    EnvPrep(String),

    /// The invocation layer failed outside the expected timeout path.
    #[error("execution fault in {test}: {detail}")]
    ExecutionFault { test: String, detail: String },
}

impl CiError {
    pub fn selection(err: impl std::fmt::Display) -> Self {
        Self::Selection(format!("{err:#}"))
    }

    pub fn repo_prep(repo: &str, err: impl std::fmt::Display) -> Self {
        Self::RepoPrep {
            repo: repo.to_string(),
            detail: format!("{err:#}"),
        }
    }

    pub fn env_prep(err: impl std::fmt::Display) -> Self {
        Self::EnvPrep(format!("{err:#}"))
    }

    pub fn execution_fault(test: &str, err: impl std::fmt::Display) -> Self {
        Self::ExecutionFault {
            test: test.to_string(),
            detail: format!("{err:#}"),
        }
    }
}

/// Find the [`CiError`] at the root (or anywhere) of an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&CiError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CiError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn classify_finds_root_error_under_context() {
        let err = Err::<(), _>(anyhow::Error::new(CiError::selection("bad slice line")))
            .context("select tests")
            .unwrap_err();
        assert!(matches!(classify(&err), Some(CiError::Selection(msg)) if msg == "bad slice line"));
    }

    #[test]
    fn classify_ignores_plain_errors() {
        let err = anyhow!("boom");
        assert!(classify(&err).is_none());
    }

    #[test]
    fn repo_prep_keeps_full_chain_in_detail() {
        let inner = anyhow!("exit 128").context("git am -3 /tmp/x.patch");
        let err = CiError::repo_prep("virt-test", &inner);
        assert_eq!(
            err.to_string(),
            "repository preparation failed for virt-test: git am -3 /tmp/x.patch: exit 128"
        );
    }
}
