//! Generic ensure-state loop

use crate::adapter::ResourceAdapter;
use crate::cache::StateCache;
use crate::changeset::{Operation, Plan, Step};
use crate::error::{CommandFailure, Result};
use crate::executor::{CommandExecutor, ExecOutput};
use crate::identity::{ResourceIdentity, ResourceKind};
use crate::tree::AttributeTree;
use serde::Serialize;
use serde_json::{Map, Value};

/// Result of reconciling one resource
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub changed: bool,
    pub msg: String,
    pub kind: ResourceKind,
    pub identity: String,
    pub check_mode: bool,

    /// Planned changes, applied unless in check mode
    pub changes: Vec<String>,

    #[serde(skip)]
    pub final_state: Option<AttributeTree>,

    /// Output of operations marked for capture, in order
    #[serde(skip)]
    pub captured: Vec<ExecOutput>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Outcome {
    pub fn to_response(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Drives one adapter through fetch, plan, apply and re-fetch
pub struct Reconciler<'a> {
    executor: &'a dyn CommandExecutor,
    check_mode: bool,
    cache: Option<&'a dyn StateCache>,
}

impl<'a> Reconciler<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            executor,
            check_mode: false,
            cache: None,
        }
    }

    pub fn check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    /// Read current state through a host-owned cache
    pub fn with_cache(mut self, cache: &'a dyn StateCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn reconcile(&self, adapter: &dyn ResourceAdapter) -> Result<Outcome> {
        let identity = adapter.identity();
        tracing::debug!("Reconciling {}", identity);

        let current = self.fetch(adapter)?;
        let Plan {
            changes,
            message,
            payload,
            scratch: _scratch,
        } = adapter.plan(self.executor, current.as_ref())?;

        let mut outcome = Outcome {
            changed: !changes.is_empty(),
            msg: message,
            kind: identity.kind,
            identity: identity.to_string(),
            check_mode: self.check_mode,
            changes: changes.descriptions(),
            final_state: None,
            captured: Vec::new(),
            payload,
        };

        if !outcome.changed {
            outcome.final_state = current;
        } else if self.check_mode {
            tracing::info!(
                "Check mode, not applying {}: {}",
                identity,
                changes.summary()
            );
            outcome.msg = format!("{} (check mode)", outcome.msg);
            outcome.final_state = current;
        } else {
            for operation in changes.operations() {
                if let Err(e) = self.apply(adapter, operation, &mut outcome.captured) {
                    self.refresh_cache(identity, None);
                    return Err(e);
                }
            }
            outcome.final_state = adapter.fetch(self.executor)?;
            self.refresh_cache(identity, outcome.final_state.as_ref());
        }

        if let Some(state) = &outcome.final_state {
            outcome
                .payload
                .entry(adapter.payload_key())
                .or_insert_with(|| state.value().clone());
        }
        adapter.finish(&mut outcome)?;
        Ok(outcome)
    }

    fn fetch(&self, adapter: &dyn ResourceAdapter) -> Result<Option<AttributeTree>> {
        let identity = adapter.identity();
        if let Some(cache) = self.cache {
            match cache.get(identity) {
                Ok(Some(hit)) => {
                    tracing::debug!("Using cached state for {}", identity);
                    return Ok(Some(hit));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("State cache read failed: {}", e),
            }
        }

        let current = adapter.fetch(self.executor)?;
        if current.is_some() {
            self.refresh_cache(identity, current.as_ref());
        }
        Ok(current)
    }

    fn refresh_cache(&self, identity: &ResourceIdentity, state: Option<&AttributeTree>) {
        let Some(cache) = self.cache else {
            return;
        };
        let result = match state {
            Some(state) => cache.put(identity, state),
            None => cache.evict(identity),
        };
        if let Err(e) = result {
            tracing::warn!("State cache update failed: {}", e);
        }
    }

    fn apply(
        &self,
        adapter: &dyn ResourceAdapter,
        operation: &Operation,
        captured: &mut Vec<ExecOutput>,
    ) -> Result<()> {
        for step in &operation.steps {
            match step {
                Step::Run(invocation) => {
                    let output = self
                        .executor
                        .execute(&invocation.argv, invocation.stdin.as_deref())?;
                    if !output.success() {
                        let failure = CommandFailure::new(&invocation.argv, &output);
                        if let Some(rollback) = &operation.rollback {
                            tracing::warn!("Rolling back with: {}", rollback.command_line());
                            let undo = self
                                .executor
                                .execute(&rollback.argv, rollback.stdin.as_deref());
                            if let Err(e) = undo {
                                tracing::warn!("Rollback failed: {}", e);
                            }
                        }
                        return Err(if operation.is_delete() {
                            adapter
                                .conflicts()
                                .classify(&adapter.identity().to_string(), failure)
                        } else {
                            crate::error::ReconcileError::ExternalCommand(failure)
                        });
                    }
                    if operation.capture {
                        captured.push(output);
                    }
                }
                Step::RemoveLocalFile(path) => match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}
