//! # Sync Rules
//!
//! Merchant configuration describing how inventory changes propagate to
//! channel accounts, and the pure math that turns a new quantity into a
//! per-channel target quantity.
//!
//! ## Evaluation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Rule Evaluation (per mutation)                      │
//! │                                                                         │
//! │  inventory change (product P, new quantity Q)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  for each ACTIVE rule:                                                  │
//! │       │                                                                 │
//! │       ├── scope match?  ALL_PRODUCTS / PRODUCT_LIST / CATEGORY          │
//! │       │        │ no → skip rule                                         │
//! │       ▼        ▼ yes                                                    │
//! │  target_quantity(Q, last_pushed, record)                                │
//! │       │                                                                 │
//! │       ├── Exact       → Q                                               │
//! │       ├── Percentage  → floor(Q × p / 100)                              │
//! │       ├── Offset      → max(0, Q + o)                                   │
//! │       ├── Threshold   → Q only if |Q − last_pushed| ≥ d                 │
//! │       └── Custom      → sandboxed expression (failure isolated to rule) │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  one push job per (rule, target account), deduped per product/account   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rules are consumed read-only at evaluation time: edits take effect on the
//! next inventory change, never mid-flight.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::expr::Expr;
use crate::types::InventoryRecord;

// =============================================================================
// Strategy
// =============================================================================

/// How a target quantity is derived from a new inventory quantity.
///
/// Each variant carries its own typed parameter instead of one loose numeric
/// field, so a future multi-parameter strategy becomes a new struct variant
/// rather than overloaded semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "param")]
pub enum SyncStrategy {
    /// Push the new quantity as-is.
    Exact,
    /// Push `floor(new_quantity × pct / 100)`.
    Percentage(u32),
    /// Push `max(0, new_quantity + offset)`. Negative offsets reserve a buffer.
    Offset(i64),
    /// Push the new quantity only when it moved at least `delta` units since
    /// the last successful push (suppresses noisy small changes).
    Threshold(i64),
    /// Sandboxed expression over inventory fields (see [`crate::expr`]).
    Custom(String),
}

impl SyncStrategy {
    /// Short name for logs and storage.
    pub fn name(&self) -> &'static str {
        match self {
            SyncStrategy::Exact => "exact",
            SyncStrategy::Percentage(_) => "percentage",
            SyncStrategy::Offset(_) => "offset",
            SyncStrategy::Threshold(_) => "threshold",
            SyncStrategy::Custom(_) => "custom",
        }
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Which products a rule applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "value")]
pub enum RuleScope {
    /// Matches every product.
    AllProducts,
    /// Matches products whose ref is in the list.
    ProductList(Vec<String>),
    /// Matches products in the named category.
    Category(String),
}

impl RuleScope {
    /// Whether the scope covers the given inventory record.
    pub fn matches(&self, record: &InventoryRecord) -> bool {
        match self {
            RuleScope::AllProducts => true,
            RuleScope::ProductList(refs) => refs.iter().any(|r| r == &record.product_ref),
            RuleScope::Category(category) => record.category.as_deref() == Some(category.as_str()),
        }
    }
}

// =============================================================================
// Sync Rule
// =============================================================================

/// One merchant-configured propagation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRule {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Display name.
    pub name: String,

    /// Target derivation strategy.
    pub strategy: SyncStrategy,

    /// Product scope.
    pub scope: RuleScope,

    /// Channel accounts this rule pushes to.
    pub target_accounts: Vec<String>,

    /// Inactive rules are skipped at evaluation time.
    pub active: bool,
}

impl SyncRule {
    /// Whether this rule applies to the record (active + scope match).
    pub fn matches(&self, record: &InventoryRecord) -> bool {
        self.active && self.scope.matches(record)
    }

    /// Computes the target quantity for a new inventory quantity.
    ///
    /// Returns `Ok(None)` when the strategy suppresses the push (Threshold
    /// below its delta). Custom expression failures surface as
    /// [`CoreError::RuleEvaluation`] so the caller can isolate them per rule.
    ///
    /// `last_pushed` is the quantity most recently pushed successfully for
    /// the (product, account) pair being evaluated; `None` means nothing has
    /// been pushed yet, which never suppresses.
    pub fn target_quantity(
        &self,
        new_quantity: i64,
        last_pushed: Option<i64>,
        record: &InventoryRecord,
    ) -> CoreResult<Option<i64>> {
        match &self.strategy {
            SyncStrategy::Exact => Ok(Some(new_quantity)),

            SyncStrategy::Percentage(pct) => {
                // Euclidean division keeps floor semantics for negatives.
                let scaled = (new_quantity * *pct as i64).div_euclid(100);
                Ok(Some(scaled))
            }

            SyncStrategy::Offset(offset) => Ok(Some((new_quantity + offset).max(0))),

            SyncStrategy::Threshold(delta) => match last_pushed {
                Some(last) if (new_quantity - last).abs() < *delta => Ok(None),
                _ => Ok(Some(new_quantity)),
            },

            SyncStrategy::Custom(source) => {
                let expr = Expr::parse(source).map_err(|e| CoreError::RuleEvaluation {
                    rule_id: self.id.clone(),
                    reason: e.to_string(),
                })?;

                let vars: HashMap<String, f64> = HashMap::from([
                    ("quantity".to_string(), new_quantity as f64),
                    ("reserved".to_string(), record.reserved as f64),
                    ("available".to_string(), record.available() as f64),
                    ("min_threshold".to_string(), record.min_threshold as f64),
                ]);

                let value = expr.eval(&vars).map_err(|e| CoreError::RuleEvaluation {
                    rule_id: self.id.clone(),
                    reason: e.to_string(),
                })?;

                Ok(Some((value.floor() as i64).max(0)))
            }
        }
    }

    /// Validates merchant input before the rule is saved.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "name".to_string(),
            });
        }
        if self.target_accounts.is_empty() {
            return Err(ValidationError::NoTargets);
        }
        match &self.strategy {
            SyncStrategy::Percentage(pct) if *pct > 1000 => Err(ValidationError::OutOfRange {
                field: "percentage".to_string(),
                min: 0,
                max: 1000,
            }),
            SyncStrategy::Threshold(delta) if *delta <= 0 => Err(ValidationError::MustBePositive {
                field: "threshold".to_string(),
            }),
            SyncStrategy::Custom(source) => Expr::parse(source).map(|_| ()).map_err(|e| {
                ValidationError::InvalidFormat {
                    field: "expression".to_string(),
                    reason: e.to_string(),
                }
            }),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
