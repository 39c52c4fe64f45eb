//! Operation registry and replay idempotency adapter
//!
//! WAL entries name operations; this registry maps the names onto
//! handlers. During replay, `add` is transparently remapped to `put` so a
//! replayed insert cannot fail on a duplicate it already created. Because
//! of that rewrite, callers must not rely on duplicate rejection for
//! correctness: registering any other non-idempotent operation requires an
//! explicit replay review flag, and unreviewed ones are rejected outright.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{StowageError, StowageResult};
use tracing::debug;

/// Handler for one registered operation.
pub type OpHandler = Arc<dyn Fn(&[Value]) -> StowageResult<Value> + Send + Sync>;

/// The primitive rewritten during replay.
pub const ADD_OPERATION: &str = "add";

/// Its idempotent counterpart.
pub const PUT_OPERATION: &str = "put";

struct RegisteredOp {
    handler: OpHandler,
    idempotent: bool,
}

/// Registered operations, keyed by name.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: RwLock<HashMap<String, RegisteredOp>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation.
    ///
    /// `idempotent` declares that repeated application yields the same
    /// final state. Non-idempotent operations (other than the built-in
    /// `add`, which the replay adapter rewrites) must pass
    /// `replay_reviewed = true` or registration fails.
    pub fn register(
        &self,
        name: impl Into<String>,
        idempotent: bool,
        replay_reviewed: bool,
        handler: OpHandler,
    ) -> StowageResult<()> {
        let name = name.into();
        if !idempotent && !replay_reviewed && name != ADD_OPERATION {
            return Err(StowageError::InvalidOperation(format!(
                "operation '{name}' is not idempotent and has not been reviewed for replay"
            )));
        }
        self.handlers.write().insert(
            name,
            RegisteredOp {
                handler,
                idempotent,
            },
        );
        Ok(())
    }

    /// Whether an operation is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Whether a registered operation declared itself idempotent.
    pub fn is_idempotent(&self, name: &str) -> Option<bool> {
        self.handlers.read().get(name).map(|op| op.idempotent)
    }

    /// Resolve an operation for execution.
    ///
    /// With `replaying` set, `add` resolves to the handler registered for
    /// `put`.
    pub fn resolve(&self, name: &str, replaying: bool) -> StowageResult<OpHandler> {
        let effective = if replaying && name == ADD_OPERATION {
            debug!("replay adapter remapping add to put");
            PUT_OPERATION
        } else {
            name
        };
        self.handlers
            .read()
            .get(effective)
            .map(|op| Arc::clone(&op.handler))
            .ok_or_else(|| {
                StowageError::InvalidOperation(format!("operation '{effective}' is not registered"))
            })
    }
}
