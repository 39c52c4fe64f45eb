//! Write-authority policy
//!
//! Every engine write is vetted against the tab coordinator before it
//! touches a backend. The policy is configuration-driven: enforcement can
//! be disabled wholesale, individual stores can be exempted (migration
//! bookkeeping must write from any tab), and strict mode turns silent
//! no-ops into errors.

use std::sync::Arc;
use stowage_core::{AuthorityConfig, StowageError, StowageResult, TabCoordinator};
use tracing::debug;

/// Verdict for a single write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// The write may proceed
    Proceed,
    /// Authority denied; report success without touching storage
    SilentNoop,
    /// Authority denied; surface `WriteAuthorityDenied` (strict mode)
    Deny,
}

/// Configuration-driven authority check.
pub struct AuthorityPolicy {
    config: AuthorityConfig,
    coordinator: Arc<dyn TabCoordinator>,
}

impl AuthorityPolicy {
    /// Build a policy over a coordinator.
    pub fn new(config: AuthorityConfig, coordinator: Arc<dyn TabCoordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Decide whether a write to `store` may proceed.
    ///
    /// `bypass` is the per-call escape hatch (`bypass_authority`) used by
    /// replay and recovery paths that already ran the check upstream.
    pub fn check_write(&self, store: &str, bypass: bool) -> WriteDecision {
        if bypass || !self.config.enforce_write_authority {
            return WriteDecision::Proceed;
        }
        if self.config.exempt_stores.contains(store) {
            return WriteDecision::Proceed;
        }
        if self.coordinator.is_write_allowed() {
            return WriteDecision::Proceed;
        }
        debug!(store, strict = self.config.strict_mode, "write authority denied");
        if self.config.strict_mode {
            WriteDecision::Deny
        } else {
            WriteDecision::SilentNoop
        }
    }

    /// Convert a decision into a result: `Ok(true)` to proceed, `Ok(false)`
    /// for a silent no-op, `Err` in strict mode.
    pub fn authorize(&self, store: &str, bypass: bool) -> StowageResult<bool> {
        match self.check_write(store, bypass) {
            WriteDecision::Proceed => Ok(true),
            WriteDecision::SilentNoop => Ok(false),
            WriteDecision::Deny => Err(StowageError::WriteAuthorityDenied {
                store: store.to_string(),
            }),
        }
    }
}
