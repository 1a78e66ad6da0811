// Predicate rules for conditional-branch gating

//! # Branch Predicate Rules
//!
//! This module defines the predicate language used by conditional-branch
//! steps. A predicate is evaluated against the instance's accumulated
//! context (the submitted input plus every completed step's output, keyed
//! by step id) to decide which branch activates.
//!
//! ## Key Concepts
//!
//! - **Rule**: A single evaluatable predicate with an id and description
//! - **RuleCondition**: The actual logic - field checks and logical operations
//!
//! Field paths are dot-separated and resolved against nested JSON, so
//! `"price_quote.total"` reads the `total` field of the `price_quote`
//! step's output.

use serde::{Deserialize, Serialize};

/// A single predicate that can be evaluated against instance context
///
/// Rules are the building blocks of branch selection. Each rule has a
/// unique id, a human-readable description, and a condition that defines
/// the evaluation logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for this rule, used in logs and error messages
    pub id: String,

    /// Human-readable description of what this rule checks
    pub description: String,

    /// The actual condition logic to evaluate
    pub condition: RuleCondition,
}

/// Different types of conditions that can be evaluated
///
/// The enum is recursive: `And`, `Or` and `Not` nest further rules, which
/// enables arbitrarily complex logical expressions. Serialized as a tagged
/// union: `{"type": "FieldEquals", "field": "tier", "value": "gold"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleCondition {
    /// Check if a context field exists (regardless of value)
    FieldExists { field: String },

    /// Check if a field has a specific value (exact JSON equality)
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },

    /// Check if a numeric field is greater than a threshold
    ///
    /// The field value must be convertible to f64. Non-numeric fields fail
    /// this check.
    FieldGreaterThan { field: String, value: f64 },

    /// Check if a numeric field is less than a threshold
    FieldLessThan { field: String, value: f64 },

    /// Check if a string field contains a substring (case-sensitive)
    FieldContains { field: String, substring: String },

    /// Logical AND - all nested rules must pass. Empty vector passes,
    /// which makes `And { rules: vec![] }` usable as an always-true
    /// fallback branch.
    And { rules: Vec<Rule> },

    /// Logical OR - at least one nested rule must pass. Empty vector fails.
    Or { rules: Vec<Rule> },

    /// Logical NOT - the nested rule must fail for this to pass
    Not { rule: Box<Rule> },
}

impl Rule {
    /// Create a rule checking that a field exists
    pub fn field_exists<I: Into<String>, F: Into<String>>(id: I, field: F) -> Self {
        let field = field.into();
        Self {
            id: id.into(),
            description: format!("Field '{}' must exist", field),
            condition: RuleCondition::FieldExists { field },
        }
    }

    /// Create a rule checking that a field equals a value
    pub fn field_equals<I: Into<String>, F: Into<String>>(
        id: I,
        field: F,
        value: serde_json::Value,
    ) -> Self {
        let field = field.into();
        Self {
            id: id.into(),
            description: format!("Field '{}' must equal {}", field, value),
            condition: RuleCondition::FieldEquals { field, value },
        }
    }

    /// Create a rule checking that a numeric field exceeds a threshold
    pub fn field_greater_than<I: Into<String>, F: Into<String>>(
        id: I,
        field: F,
        value: f64,
    ) -> Self {
        let field = field.into();
        Self {
            id: id.into(),
            description: format!("Field '{}' must be greater than {}", field, value),
            condition: RuleCondition::FieldGreaterThan { field, value },
        }
    }

    /// Create an AND rule over nested rules
    pub fn and<I: Into<String>, D: Into<String>>(id: I, description: D, rules: Vec<Rule>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            condition: RuleCondition::And { rules },
        }
    }

    /// Create an OR rule over nested rules
    pub fn or<I: Into<String>, D: Into<String>>(id: I, description: D, rules: Vec<Rule>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            condition: RuleCondition::Or { rules },
        }
    }

    /// Create an always-true rule, for use as a fallback branch
    pub fn always<I: Into<String>>(id: I) -> Self {
        Self {
            id: id.into(),
            description: "Always matches".to_string(),
            condition: RuleCondition::And { rules: vec![] },
        }
    }

    /// Evaluate this rule against an instance context
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        self.condition.evaluate(context)
    }
}

impl RuleCondition {
    /// Evaluate the condition against an instance context
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        match self {
            RuleCondition::FieldExists { field } => !lookup_path(context, field).is_null(),
            RuleCondition::FieldEquals { field, value } => &lookup_path(context, field) == value,
            RuleCondition::FieldGreaterThan { field, value } => lookup_path(context, field)
                .as_f64()
                .map(|v| v > *value)
                .unwrap_or(false),
            RuleCondition::FieldLessThan { field, value } => lookup_path(context, field)
                .as_f64()
                .map(|v| v < *value)
                .unwrap_or(false),
            RuleCondition::FieldContains { field, substring } => lookup_path(context, field)
                .as_str()
                .map(|s| s.contains(substring.as_str()))
                .unwrap_or(false),
            RuleCondition::And { rules } => rules.iter().all(|r| r.evaluate(context)),
            RuleCondition::Or { rules } => rules.iter().any(|r| r.evaluate(context)),
            RuleCondition::Not { rule } => !rule.evaluate(context),
        }
    }
}

/// Resolve a dot-separated path against nested JSON
///
/// Returns `Value::Null` when any path segment is missing, which callers
/// treat as "field absent".
fn lookup_path(context: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(value) => current = value,
            None => return serde_json::Value::Null,
        }
    }
    current.clone()
}
