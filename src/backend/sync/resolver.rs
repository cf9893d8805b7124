//! # Conflict Resolver
//!
//! Pairs a claimed op with the current server record and decides what the
//! op does to it.
//!
//! ## Detection
//!
//! | op       | server record                      | conflict        |
//! |----------|------------------------------------|-----------------|
//! | `create` | exists                             | update-update   |
//! | `update` | `base_version < version`           | update-update   |
//! | `update` | missing or deleted                 | update-delete   |
//! | `delete` | `version > base_version`           | delete-update   |
//!
//! An op without a `base_version` never conflicts on version. A `delete` of
//! a record that is already gone applies as a no-op.
//!
//! ## Strategies
//!
//! The strategy is looked up per `(user, table)` override, then per table
//! from config, then the configured default.
//!
//! - **last-writer-wins** - the op's own effect is written over the server
//!   record (`update` patches, `create` replaces, `delete` tombstones)
//! - **server-wins** - nothing is written, the op still counts as applied
//! - **merge** - structural merge for `update` over an existing record,
//!   last-writer-wins otherwise
//! - **manual** - an unresolved conflict is parked for an external decision

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backend::error::BackendError;
use crate::backend::sync::merge::{JsonMerge, MergeOutcome, StructuralMerge};
use crate::shared::config::ResolverConfig;
use crate::shared::{
    ConflictType, OfflineOperation, OperationKind, ServerRecord, Strategy, SyncConflict, UserId,
};

/// What applying an op does to the record
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Compare-and-set write; `value: None` is a tombstone
    Write {
        value: Option<Value>,
        expected_version: i64,
    },
    /// Applied without touching the record
    Noop,
}

/// How an automatic strategy settled a detected conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub conflict_type: ConflictType,
    pub strategy: Strategy,
    /// Server value at detection time, `null` when absent
    pub server: Value,
    /// Value the record ends up with, `null` for a tombstone
    pub resolved: Value,
}

impl Settlement {
    pub fn into_conflict(self, op: &OfflineOperation, at: DateTime<Utc>) -> SyncConflict {
        SyncConflict::resolved_with(
            op,
            self.conflict_type,
            self.server,
            self.resolved,
            self.strategy,
            at,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub effect: Effect,
    pub settled: Option<Settlement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(Resolution),
    /// Manual strategy: record the conflict and leave the op `conflicted`
    Park(SyncConflict),
}

pub struct ConflictResolver {
    default_strategy: Strategy,
    tables: HashMap<String, Strategy>,
    overrides: RwLock<HashMap<(UserId, String), Strategy>>,
    merger: Arc<dyn StructuralMerge>,
}

fn live_value(current: Option<&ServerRecord>) -> Option<&Value> {
    current.and_then(|r| r.value.as_ref())
}

fn version_of(current: Option<&ServerRecord>) -> i64 {
    current.map(|r| r.version).unwrap_or(0)
}

/// Shallow field patch; a non-object on either side replaces
fn patch(base: &Value, fields: &Value) -> Value {
    match (base, fields) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut out = base.clone();
            for (k, v) in fields {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => fields.clone(),
    }
}

impl ConflictResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self::with_merger(config, Arc::new(JsonMerge))
    }

    pub fn with_merger(config: &ResolverConfig, merger: Arc<dyn StructuralMerge>) -> Self {
        Self {
            default_strategy: config.default_strategy,
            tables: config.tables.clone(),
            overrides: RwLock::new(HashMap::new()),
            merger,
        }
    }

    pub fn strategy_for(&self, user_id: UserId, table: &str) -> Strategy {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        overrides
            .get(&(user_id, table.to_string()))
            .or_else(|| self.tables.get(table))
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn set_override(&self, user_id: UserId, table: &str, strategy: Strategy) {
        tracing::info!(
            "[Sync] Strategy for user {} table {} set to {}",
            user_id,
            table,
            strategy.as_str()
        );
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((user_id, table.to_string()), strategy);
    }

    /// Which conflict, if any, `op` has with `current`
    pub fn detect(&self, op: &OfflineOperation, current: Option<&ServerRecord>) -> Option<ConflictType> {
        let exists = live_value(current).is_some();
        let v_server = version_of(current);
        match op.kind {
            OperationKind::Create if exists => Some(ConflictType::UpdateUpdate),
            OperationKind::Create => None,
            OperationKind::Update if !exists => Some(ConflictType::UpdateDelete),
            OperationKind::Update => match op.base_version {
                Some(v_client) if v_client < v_server => Some(ConflictType::UpdateUpdate),
                _ => None,
            },
            OperationKind::Delete if !exists => None,
            OperationKind::Delete => match op.base_version {
                Some(v_client) if v_server > v_client => Some(ConflictType::DeleteUpdate),
                _ => None,
            },
        }
    }

    /// Decide what `op` does given the current server record
    pub fn decide(
        &self,
        op: &OfflineOperation,
        current: Option<&ServerRecord>,
        at: DateTime<Utc>,
    ) -> Decision {
        let Some(conflict_type) = self.detect(op, current) else {
            return Decision::Apply(Resolution {
                effect: self.own_effect(op, current),
                settled: None,
            });
        };

        let strategy = self.strategy_for(op.user_id, &op.table);
        tracing::debug!(
            "[Sync] Op {} on {}/{}: {} conflict, strategy {}",
            op.op_id,
            op.table,
            op.record_id,
            conflict_type.as_str(),
            strategy.as_str()
        );
        match strategy {
            Strategy::Manual => {
                let server = live_value(current).cloned().unwrap_or(Value::Null);
                Decision::Park(SyncConflict::unresolved(op, conflict_type, server, at))
            }
            automatic => Decision::Apply(self.settle(op, current, conflict_type, automatic)),
        }
    }

    /// Apply an automatic strategy to a known conflict.
    ///
    /// Used inline by `decide` and later when a parked conflict is
    /// resolved; `current` must be the record as it is now.
    pub fn settle(
        &self,
        op: &OfflineOperation,
        current: Option<&ServerRecord>,
        conflict_type: ConflictType,
        strategy: Strategy,
    ) -> Resolution {
        let server = live_value(current).cloned().unwrap_or(Value::Null);
        let (effect, used) = match strategy {
            Strategy::ServerWins | Strategy::Manual => (Effect::Noop, Strategy::ServerWins),
            Strategy::LastWriterWins => (self.own_effect(op, current), Strategy::LastWriterWins),
            Strategy::Merge => match self.merged(op, current) {
                Some(value) => (
                    Effect::Write {
                        value: Some(value),
                        expected_version: version_of(current),
                    },
                    Strategy::Merge,
                ),
                None => (self.own_effect(op, current), Strategy::LastWriterWins),
            },
        };
        let resolved = match &effect {
            Effect::Write { value, .. } => value.clone().unwrap_or(Value::Null),
            Effect::Noop => server.clone(),
        };
        Resolution {
            effect,
            settled: Some(Settlement {
                conflict_type,
                strategy: used,
                server,
                resolved,
            }),
        }
    }

    /// Reject strategies that cannot close a parked conflict
    pub fn check_resolvable(strategy: Strategy) -> Result<(), BackendError> {
        if strategy == Strategy::Manual {
            return Err(BackendError::validation(
                "strategy",
                "manual cannot resolve a conflict",
            ));
        }
        Ok(())
    }

    fn own_effect(&self, op: &OfflineOperation, current: Option<&ServerRecord>) -> Effect {
        let expected_version = version_of(current);
        match op.kind {
            OperationKind::Create => Effect::Write {
                value: Some(op.payload.clone()),
                expected_version,
            },
            OperationKind::Update => {
                let value = match live_value(current) {
                    Some(existing) => patch(existing, &op.payload),
                    None => op.payload.clone(),
                };
                Effect::Write {
                    value: Some(value),
                    expected_version,
                }
            }
            OperationKind::Delete if live_value(current).is_none() => Effect::Noop,
            OperationKind::Delete => Effect::Write {
                value: None,
                expected_version,
            },
        }
    }

    fn merged(&self, op: &OfflineOperation, current: Option<&ServerRecord>) -> Option<Value> {
        if op.kind != OperationKind::Update {
            return None;
        }
        match self.merger.merge(live_value(current)?, &op.payload) {
            MergeOutcome::Merged(value) => Some(value),
            MergeOutcome::NotMergeable => None,
        }
    }
}
