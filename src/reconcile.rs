//! Update planning for the mutable string-array fields on an account.
//!
//! A plan is computed in memory against the current array and validated by
//! [`ensure_single_operator`] before anything is translated to SQL, so an
//! update that mixes whole-array replacement with append semantics on the
//! same field fails here instead of racing at write time.

use std::{collections::HashSet, fmt};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const RAW_INSTITUTION_NAMES: &str = "raw_institution_names";
pub const FINGERPRINTS: &str = "fingerprints";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Replace,
    AppendUnique,
    ElementUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperator {
    /// Assign the whole array.
    Set,
    /// Append the listed values that are not already present.
    AddToSet,
    /// Replace the element equal to `match_value`.
    SetElement,
}

impl UpdateOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOperator::Set => "set",
            UpdateOperator::AddToSet => "add_to_set",
            UpdateOperator::SetElement => "set_element",
        }
    }
}

impl fmt::Display for UpdateOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMutation {
    pub operator: UpdateOperator,
    pub field: String,
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateDocument {
    mutations: Vec<FieldMutation>,
}

impl UpdateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: FieldMutation) {
        self.mutations.push(mutation);
    }

    pub fn extend(&mut self, other: UpdateDocument) {
        self.mutations.extend(other.mutations);
    }

    pub fn mutations(&self) -> &[FieldMutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    pub field: String,
    pub match_value: Option<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            field: RAW_INSTITUTION_NAMES.to_string(),
            match_value: None,
        }
    }
}

impl PlanOptions {
    pub fn for_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            match_value: None,
        }
    }

    pub fn matching(mut self, value: impl Into<String>) -> Self {
        self.match_value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub mode: UpdateMode,
    pub field: String,
    pub update: UpdateDocument,
    pub summary: PlanSummary,
    pub resulting: Vec<String>,
    pub applied: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("element update on `{field}` requires a match value")]
    MissingMatchValue { field: String },

    #[error("match value `{value}` is not present in `{field}`")]
    MatchValueNotFound { field: String, value: String },

    #[error("element update expects exactly one replacement value, got {count}")]
    InvalidReplacement { count: usize },

    #[error("replacement `{value}` already exists in `{field}`")]
    DuplicateValue { field: String, value: String },

    #[error("conflicting update operators on `{field}`: {}", .operators.join(", "))]
    ConflictingOperators { field: String, operators: Vec<String> },
}

/// Computes the update that brings `current` in line with `candidates`.
pub fn plan_update(
    mode: UpdateMode,
    current: &[String],
    candidates: &[String],
    options: &PlanOptions,
) -> Result<UpdatePlan, ReconcileError> {
    let field = options.field.clone();
    let candidates = dedupe(candidates);

    let plan = match mode {
        UpdateMode::Replace => {
            if candidates.as_slice() == current {
                noop(mode, field, current)
            } else {
                let added = candidates
                    .iter()
                    .filter(|value| !current.contains(value))
                    .cloned()
                    .collect();
                let removed = current
                    .iter()
                    .filter(|value| !candidates.contains(value))
                    .cloned()
                    .collect();
                let mut update = UpdateDocument::new();
                update.push(FieldMutation {
                    operator: UpdateOperator::Set,
                    field: field.clone(),
                    values: candidates.clone(),
                    match_value: None,
                });
                UpdatePlan {
                    mode,
                    field,
                    update,
                    summary: PlanSummary { added, removed },
                    resulting: candidates,
                    applied: true,
                }
            }
        }
        UpdateMode::AppendUnique => {
            let added: Vec<String> = candidates
                .into_iter()
                .filter(|value| !current.contains(value))
                .collect();
            if added.is_empty() {
                noop(mode, field, current)
            } else {
                let mut resulting = current.to_vec();
                resulting.extend(added.iter().cloned());
                let mut update = UpdateDocument::new();
                update.push(FieldMutation {
                    operator: UpdateOperator::AddToSet,
                    field: field.clone(),
                    values: added.clone(),
                    match_value: None,
                });
                UpdatePlan {
                    mode,
                    field,
                    update,
                    summary: PlanSummary {
                        added,
                        removed: Vec::new(),
                    },
                    resulting,
                    applied: true,
                }
            }
        }
        UpdateMode::ElementUpdate => {
            let target = options
                .match_value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ReconcileError::MissingMatchValue {
                    field: field.clone(),
                })?;
            let position = current
                .iter()
                .position(|value| value == target)
                .ok_or_else(|| ReconcileError::MatchValueNotFound {
                    field: field.clone(),
                    value: target.to_string(),
                })?;
            let replacement = match candidates.as_slice() {
                [single] => single.clone(),
                other => return Err(ReconcileError::InvalidReplacement { count: other.len() }),
            };

            if replacement == target {
                noop(mode, field, current)
            } else if current.contains(&replacement) {
                return Err(ReconcileError::DuplicateValue {
                    field,
                    value: replacement,
                });
            } else {
                let mut resulting = current.to_vec();
                resulting[position] = replacement.clone();
                let mut update = UpdateDocument::new();
                update.push(FieldMutation {
                    operator: UpdateOperator::SetElement,
                    field: field.clone(),
                    values: vec![replacement.clone()],
                    match_value: Some(target.to_string()),
                });
                UpdatePlan {
                    mode,
                    field,
                    update,
                    summary: PlanSummary {
                        added: vec![replacement],
                        removed: vec![target.to_string()],
                    },
                    resulting,
                    applied: true,
                }
            }
        }
    };

    ensure_single_operator(&plan.update)?;
    Ok(plan)
}

fn noop(mode: UpdateMode, field: String, current: &[String]) -> UpdatePlan {
    UpdatePlan {
        mode,
        field,
        update: UpdateDocument::new(),
        summary: PlanSummary::default(),
        resulting: current.to_vec(),
        applied: false,
    }
}

fn dedupe(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_string()))
        .map(str::to_string)
        .collect()
}

/// Rejects an update that touches the same field with more than one mutation.
pub fn ensure_single_operator(update: &UpdateDocument) -> Result<(), ReconcileError> {
    let mut seen: Vec<(&str, Vec<String>)> = Vec::new();
    for mutation in update.mutations() {
        match seen.iter_mut().find(|(field, _)| *field == mutation.field) {
            Some((_, operators)) => operators.push(mutation.operator.as_str().to_string()),
            None => seen.push((
                mutation.field.as_str(),
                vec![mutation.operator.as_str().to_string()],
            )),
        }
    }

    match seen.into_iter().find(|(_, operators)| operators.len() > 1) {
        Some((field, operators)) => Err(ReconcileError::ConflictingOperators {
            field: field.to_string(),
            operators,
        }),
        None => Ok(()),
    }
}

/// Flattens a loosely-shaped payload value into non-empty trimmed strings.
/// Objects yield their values in insertion order.
pub fn normalize_input(raw: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_strings(raw, &mut out);
    out
}

fn collect_strings(raw: &Value, out: &mut Vec<String>) {
    match raw {
        Value::String(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
        Value::Object(map) => map.values().for_each(|value| collect_strings(value, out)),
        Value::Array(items) => items.iter().for_each(|value| collect_strings(value, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn replace_with_identical_values_is_noop() {
        let plan = plan_update(
            UpdateMode::Replace,
            &strings(&["Alpha"]),
            &strings(&["Alpha"]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(!plan.applied);
        assert!(plan.update.is_empty());
        assert_eq!(plan.resulting, strings(&["Alpha"]));
    }

    #[test]
    fn replace_sets_deduplicated_candidates() {
        let plan = plan_update(
            UpdateMode::Replace,
            &[],
            &strings(&["Alpha", "Beta", "Alpha"]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.applied);
        assert_eq!(plan.resulting, strings(&["Alpha", "Beta"]));
        let mutation = &plan.update.mutations()[0];
        assert_eq!(mutation.operator, UpdateOperator::Set);
        assert_eq!(mutation.field, RAW_INSTITUTION_NAMES);
        assert_eq!(mutation.values, strings(&["Alpha", "Beta"]));
    }

    #[test]
    fn replace_is_order_sensitive() {
        let plan = plan_update(
            UpdateMode::Replace,
            &strings(&["Beta", "Alpha"]),
            &strings(&["Alpha", "Beta"]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.applied);
        assert!(plan.summary.added.is_empty());
        assert!(plan.summary.removed.is_empty());
    }

    #[test]
    fn append_unique_adds_only_new_values_once() {
        let plan = plan_update(
            UpdateMode::AppendUnique,
            &strings(&["Bank"]),
            &strings(&["Bank", "Trust", "Trust"]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.applied);
        assert_eq!(plan.update.mutations().len(), 1);
        assert_eq!(plan.update.mutations()[0].operator, UpdateOperator::AddToSet);
        assert_eq!(plan.update.mutations()[0].values, strings(&["Trust"]));
        assert_eq!(plan.resulting, strings(&["Bank", "Trust"]));
    }

    #[test]
    fn append_unique_without_new_values_is_noop() {
        let plan = plan_update(
            UpdateMode::AppendUnique,
            &strings(&["Bank", "Trust"]),
            &strings(&["Trust", " Bank "]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert!(!plan.applied);
    }

    #[test]
    fn element_update_replaces_matching_value() {
        let plan = plan_update(
            UpdateMode::ElementUpdate,
            &strings(&["MONZO", "Monzo Bank"]),
            &strings(&["Monzo Bank Ltd"]),
            &PlanOptions::default().matching("MONZO"),
        )
        .unwrap();
        assert!(plan.applied);
        assert_eq!(plan.resulting, strings(&["Monzo Bank Ltd", "Monzo Bank"]));
        let mutation = &plan.update.mutations()[0];
        assert_eq!(mutation.operator, UpdateOperator::SetElement);
        assert_eq!(mutation.match_value.as_deref(), Some("MONZO"));
    }

    #[test]
    fn element_update_requires_present_match_value() {
        let current = strings(&["Alpha"]);
        let candidates = strings(&["Beta"]);

        let missing = plan_update(
            UpdateMode::ElementUpdate,
            &current,
            &candidates,
            &PlanOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(missing, ReconcileError::MissingMatchValue { .. }));

        let absent = plan_update(
            UpdateMode::ElementUpdate,
            &current,
            &candidates,
            &PlanOptions::default().matching("Gamma"),
        )
        .unwrap_err();
        assert!(matches!(absent, ReconcileError::MatchValueNotFound { .. }));
    }

    #[test]
    fn element_update_rejects_multiple_or_duplicate_replacements() {
        let current = strings(&["Alpha", "Beta"]);
        let many = plan_update(
            UpdateMode::ElementUpdate,
            &current,
            &strings(&["Gamma", "Delta"]),
            &PlanOptions::default().matching("Alpha"),
        )
        .unwrap_err();
        assert_eq!(many, ReconcileError::InvalidReplacement { count: 2 });

        let duplicate = plan_update(
            UpdateMode::ElementUpdate,
            &current,
            &strings(&["Beta"]),
            &PlanOptions::default().matching("Alpha"),
        )
        .unwrap_err();
        assert!(matches!(duplicate, ReconcileError::DuplicateValue { .. }));
    }

    #[test]
    fn combining_replace_and_append_on_one_field_is_rejected() {
        let replace = plan_update(
            UpdateMode::Replace,
            &[],
            &strings(&["Alpha"]),
            &PlanOptions::default(),
        )
        .unwrap();
        let append = plan_update(
            UpdateMode::AppendUnique,
            &[],
            &strings(&["Beta"]),
            &PlanOptions::default(),
        )
        .unwrap();

        let mut combined = replace.update;
        combined.extend(append.update);
        let err = ensure_single_operator(&combined).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::ConflictingOperators {
                field: RAW_INSTITUTION_NAMES.to_string(),
                operators: strings(&["set", "add_to_set"]),
            }
        );
    }

    #[test]
    fn separate_fields_may_share_an_update() {
        let mut update = UpdateDocument::new();
        update.push(FieldMutation {
            operator: UpdateOperator::AddToSet,
            field: RAW_INSTITUTION_NAMES.into(),
            values: strings(&["Monzo"]),
            match_value: None,
        });
        update.push(FieldMutation {
            operator: UpdateOperator::AddToSet,
            field: FINGERPRINTS.into(),
            values: strings(&["abc"]),
            match_value: None,
        });
        assert!(ensure_single_operator(&update).is_ok());
    }

    #[test]
    fn normalize_input_flattens_supported_shapes() {
        assert_eq!(normalize_input(&json!("  Monzo ")), strings(&["Monzo"]));
        assert_eq!(
            normalize_input(&json!({ "b": "Second", "a": " First ", "c": "", "d": null })),
            strings(&["Second", "First"])
        );
        assert_eq!(normalize_input(&json!(["x", " ", "y"])), strings(&["x", "y"]));
        assert!(normalize_input(&Value::Null).is_empty());
        assert!(normalize_input(&json!(42)).is_empty());
    }
}
