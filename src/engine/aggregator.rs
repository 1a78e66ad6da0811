// Result aggregation for parallel groups

//! # Result Aggregator
//!
//! Combines the outputs of a parallel group's children into one value
//! visible to downstream steps.
//!
//! ## Determinism
//!
//! Every merge rule tie-breaks by **declaration order**, never completion
//! order: `concat` lists children as declared, `first_success` takes the
//! lowest-indexed success. Replays of the same instance therefore produce
//! identical merged results regardless of real-world completion timing.
//!
//! ## Custom rules
//!
//! Workflow authors can register named merge functions. Definitions
//! referencing an unknown name are rejected at submission, before any
//! step runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{MergeRule, StepId};
use crate::{ConductorError, Result};

/// One child's contribution to a merge
///
/// `index` is the child's position in the group declaration. Children
/// excluded by best-effort or quorum handling arrive with
/// `succeeded == false` and are left out of the merge.
#[derive(Debug, Clone)]
pub struct ChildOutput {
    pub step: StepId,
    pub index: usize,
    pub succeeded: bool,
    pub output: Option<serde_json::Value>,
}

/// Signature for author-supplied merge rules
pub type MergeFn = dyn Fn(&[ChildOutput]) -> Result<serde_json::Value> + Send + Sync;

/// Central registry and executor for merge rules
pub struct ResultAggregator {
    /// Custom rules referenced by name from definitions
    custom_rules: HashMap<String, Arc<MergeFn>>,
}

impl ResultAggregator {
    /// Create an aggregator with no custom rules
    pub fn new() -> Self {
        Self {
            custom_rules: HashMap::new(),
        }
    }

    /// Create an aggregator with a small set of generally useful rules
    ///
    /// - `keyed_object`: object mapping child step id to its output
    /// - `sum`: numeric sum over child outputs
    pub fn with_common_rules() -> Self {
        let mut aggregator = Self::new();

        aggregator.register_rule("keyed_object", |children| {
            let mut object = serde_json::Map::new();
            for child in children.iter().filter(|c| c.succeeded) {
                object.insert(
                    child.step.as_str().to_string(),
                    child.output.clone().unwrap_or(serde_json::Value::Null),
                );
            }
            Ok(serde_json::Value::Object(object))
        });

        aggregator.register_rule("sum", |children| {
            let total: f64 = children
                .iter()
                .filter(|c| c.succeeded)
                .filter_map(|c| c.output.as_ref().and_then(|v| v.as_f64()))
                .sum();
            Ok(serde_json::json!(total))
        });

        aggregator
    }

    /// Register a named custom rule, replacing any existing rule with
    /// the same name
    pub fn register_rule<N, F>(&mut self, name: N, rule: F)
    where
        N: Into<String>,
        F: Fn(&[ChildOutput]) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.custom_rules.insert(name.into(), Arc::new(rule));
    }

    /// Whether a named custom rule is registered; used by submission
    /// validation
    pub fn has_rule(&self, name: &str) -> bool {
        self.custom_rules.contains_key(name)
    }

    /// Merge child outputs according to the declared rule
    pub fn merge(&self, children: &[ChildOutput], rule: &MergeRule) -> Result<serde_json::Value> {
        // Children are evaluated in declaration order however they finished
        let mut ordered: Vec<&ChildOutput> = children.iter().collect();
        ordered.sort_by_key(|c| c.index);

        match rule {
            MergeRule::Concat => Ok(serde_json::Value::Array(
                ordered
                    .iter()
                    .filter(|c| c.succeeded)
                    .map(|c| c.output.clone().unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
            MergeRule::FirstSuccess => ordered
                .iter()
                .find(|c| c.succeeded)
                .map(|c| c.output.clone().unwrap_or(serde_json::Value::Null))
                .ok_or_else(|| {
                    ConductorError::Internal("first_success merge with no successful child".into())
                }),
            MergeRule::Custom { name } => {
                let rule_fn = self.custom_rules.get(name).ok_or_else(|| {
                    ConductorError::MergeRuleNotFound { name: name.clone() }
                })?;
                let ordered_owned: Vec<ChildOutput> =
                    ordered.into_iter().cloned().collect();
                rule_fn(&ordered_owned)
            }
        }
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child(step: &str, index: usize, succeeded: bool, output: serde_json::Value) -> ChildOutput {
        ChildOutput {
            step: StepId::from(step),
            index,
            succeeded,
            output: Some(output),
        }
    }

    #[test]
    fn test_concat_uses_declaration_order() {
        let aggregator = ResultAggregator::new();
        // Completion order scrambled: index 2 finished first
        let children = vec![
            child("c", 2, true, json!("third")),
            child("a", 0, true, json!("first")),
            child("b", 1, true, json!("second")),
        ];

        let merged = aggregator.merge(&children, &MergeRule::Concat).unwrap();
        assert_eq!(merged, json!(["first", "second", "third"]));
    }

    #[test]
    fn test_concat_excludes_failed_children() {
        let aggregator = ResultAggregator::new();
        let children = vec![
            child("a", 0, true, json!(1)),
            child("b", 1, false, json!(2)),
            child("c", 2, true, json!(3)),
        ];

        let merged = aggregator.merge(&children, &MergeRule::Concat).unwrap();
        assert_eq!(merged, json!([1, 3]));
    }

    #[test]
    fn test_first_success_takes_lowest_index() {
        let aggregator = ResultAggregator::new();
        let children = vec![
            child("a", 0, false, json!("a")),
            child("b", 1, true, json!("b")),
            child("c", 2, true, json!("c")),
        ];

        let merged = aggregator
            .merge(&children, &MergeRule::FirstSuccess)
            .unwrap();
        assert_eq!(merged, json!("b"));
    }

    #[test]
    fn test_unknown_custom_rule_is_an_error() {
        let aggregator = ResultAggregator::new();
        let children = vec![child("a", 0, true, json!(1))];

        let err = aggregator
            .merge(
                &children,
                &MergeRule::Custom {
                    name: "missing".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ConductorError::MergeRuleNotFound { .. }));
    }

    #[test]
    fn test_common_rules() {
        let aggregator = ResultAggregator::with_common_rules();
        assert!(aggregator.has_rule("keyed_object"));
        assert!(aggregator.has_rule("sum"));

        let children = vec![
            child("price", 0, true, json!(10.5)),
            child("tax", 1, true, json!(2.0)),
        ];

        let summed = aggregator
            .merge(
                &children,
                &MergeRule::Custom {
                    name: "sum".to_string(),
                },
            )
            .unwrap();
        assert_eq!(summed, json!(12.5));

        let keyed = aggregator
            .merge(
                &children,
                &MergeRule::Custom {
                    name: "keyed_object".to_string(),
                },
            )
            .unwrap();
        assert_eq!(keyed, json!({"price": 10.5, "tax": 2.0}));
    }
}
