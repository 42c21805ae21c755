//! Step input resolution.
//!
//! Pure functions shared by the scheduler (resolving a task's job from
//! upstream task outputs) and the in-process subworkflow runner. Resolution
//! runs once per task: sources, linkMerge, pickValue, defaults, then
//! valueFrom with `self` bound to the current value and `inputs` seeing the
//! other inputs pre-valueFrom.

use serde_json::{Map, Value};

use crate::cwl::{LinkMerge, PickValue, Process, Step};
use crate::error::TaskFailure;
use crate::expression::{self, ExprContext};

/// The outcome of resolving one step's inputs.
#[derive(Debug)]
pub struct ResolvedInputs {
    pub job: Map<String, Value>,
    /// Required process inputs that ended up null with no default — the
    /// caller decides whether that skips the step.
    pub missing_required: Vec<String>,
}

/// Look up one source value. Bare names are workflow inputs;
/// `<step>/<out>` reads an upstream step's output (null when the upstream
/// was skipped or produced nothing).
pub fn resolve_source(
    source: &str,
    workflow_inputs: &Map<String, Value>,
    upstream: &dyn Fn(&str, &str) -> Option<Value>,
) -> Value {
    if let Some((step_id, out_id)) = source.split_once('/') {
        upstream(step_id, out_id).unwrap_or(Value::Null)
    } else {
        workflow_inputs.get(source).cloned().unwrap_or(Value::Null)
    }
}

/// Merge multiple source values by the link-merge policy. The default for
/// multiple sources is merge_nested.
pub fn link_merge(values: Vec<Value>, policy: Option<LinkMerge>) -> Value {
    match policy.unwrap_or(LinkMerge::MergeNested) {
        LinkMerge::MergeNested => Value::Array(values),
        LinkMerge::MergeFlattened => {
            let mut flat = Vec::new();
            for value in values {
                match value {
                    Value::Array(items) => flat.extend(items),
                    Value::Null => {}
                    other => flat.push(other),
                }
            }
            Value::Array(flat)
        }
    }
}

/// Apply a pick-value policy to a (usually merged) value.
pub fn pick_value(value: Value, policy: PickValue, input_id: &str) -> Result<Value, TaskFailure> {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    let non_null: Vec<Value> = items.into_iter().filter(|v| !v.is_null()).collect();
    match policy {
        PickValue::FirstNonNull => {
            non_null
                .into_iter()
                .next()
                .ok_or_else(|| TaskFailure::Expression {
                    expr: format!("pickValue: first_non_null({})", input_id),
                    message: "every source produced null".to_string(),
                })
        }
        PickValue::TheOnlyNonNull => {
            if non_null.len() == 1 {
                Ok(non_null.into_iter().next().unwrap())
            } else {
                Err(TaskFailure::Expression {
                    expr: format!("pickValue: the_only_non_null({})", input_id),
                    message: format!("expected exactly one non-null source, found {}", non_null.len()),
                })
            }
        }
        PickValue::AllNonNull => Ok(Value::Array(non_null)),
    }
}

/// Pass 1: sources, merge, pickValue, defaults. Scatter expansion slots in
/// between this and [`apply_value_from`], so elements see per-element
/// `self`.
pub fn resolve_sources(
    step: &Step,
    workflow_inputs: &Map<String, Value>,
    upstream: &dyn Fn(&str, &str) -> Option<Value>,
) -> Result<Map<String, Value>, TaskFailure> {
    let mut pre: Map<String, Value> = Map::new();
    for input in &step.inputs {
        let mut value = match input.sources.len() {
            0 => Value::Null,
            1 => {
                let single = resolve_source(&input.sources[0], workflow_inputs, upstream);
                match input.link_merge {
                    // an explicit linkMerge treats even a single source as a list
                    Some(policy) => link_merge(vec![single], Some(policy)),
                    None => single,
                }
            }
            _ => {
                let values = input
                    .sources
                    .iter()
                    .map(|s| resolve_source(s, workflow_inputs, upstream))
                    .collect();
                link_merge(values, input.link_merge)
            }
        };
        if let Some(policy) = input.pick_value {
            value = pick_value(value, policy, &input.id)?;
        }
        if value.is_null() {
            if let Some(default) = &input.default {
                value = default.clone();
            }
        }
        pre.insert(input.id.clone(), value);
    }
    Ok(pre)
}

/// Pass 2: valueFrom, with `self` bound to the input's current value and
/// `inputs` seeing the other inputs pre-valueFrom.
pub fn apply_value_from(
    step: &Step,
    pre: &Map<String, Value>,
    inline_js: bool,
) -> Result<Map<String, Value>, TaskFailure> {
    let mut job = pre.clone();
    for input in &step.inputs {
        if let Some(expr) = &input.value_from {
            let current = pre.get(&input.id).cloned().unwrap_or(Value::Null);
            let ctx = ExprContext::new(Value::Object(pre.clone()), Value::Null, inline_js)
                .with_self(current);
            job.insert(input.id.clone(), expression::evaluate(expr, &ctx)?);
        }
    }
    Ok(job)
}

/// Required process inputs still null with no tool-level default.
pub fn missing_required(step: &Step, job: &Map<String, Value>) -> Vec<String> {
    let mut missing = Vec::new();
    for (id, r#type, default) in process_input_specs(&step.run) {
        let value = job.get(&id).cloned().unwrap_or(Value::Null);
        if value.is_null() && !r#type.is_optional() && default.is_none() {
            missing.push(id);
        }
    }
    missing
}

/// Resolve every input of a step into its job.
pub fn resolve_step_inputs(
    step: &Step,
    workflow_inputs: &Map<String, Value>,
    upstream: &dyn Fn(&str, &str) -> Option<Value>,
    inline_js: bool,
) -> Result<ResolvedInputs, TaskFailure> {
    let pre = resolve_sources(step, workflow_inputs, upstream)?;
    let job = apply_value_from(step, &pre, inline_js)?;
    let missing = missing_required(step, &job);
    Ok(ResolvedInputs {
        job,
        missing_required: missing,
    })
}

fn process_input_specs(process: &Process) -> Vec<(String, crate::cwl::CwlType, Option<Value>)> {
    match process {
        Process::Tool(t) => t
            .inputs
            .iter()
            .map(|i| (i.id.clone(), i.r#type.clone(), i.default.clone()))
            .collect(),
        Process::Expression(e) => e
            .inputs
            .iter()
            .map(|i| (i.id.clone(), i.r#type.clone(), i.default.clone()))
            .collect(),
        Process::Workflow(w) => w
            .inputs
            .iter()
            .map(|i| (i.id.clone(), i.r#type.clone(), i.default.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::StepInput;

    fn step_with(inputs: Vec<StepInput>) -> Step {
        let doc = "cwlVersion: v1.2\nclass: CommandLineTool\nbaseCommand: [true]\ninputs:\n  x: Any\noutputs: []\n";
        let spec = crate::cwl::parse_document(doc, None).unwrap();
        let mut step = spec.steps[0].clone();
        step.inputs = inputs;
        step
    }

    fn input(id: &str, sources: Vec<&str>) -> StepInput {
        StepInput {
            id: id.to_string(),
            sources: sources.into_iter().map(str::to_string).collect(),
            link_merge: None,
            pick_value: None,
            default: None,
            value_from: None,
        }
    }

    #[test]
    fn merge_flattened_concatenates_arrays() {
        let merged = link_merge(
            vec![serde_json::json!([1, 2]), serde_json::json!([3])],
            Some(LinkMerge::MergeFlattened),
        );
        assert_eq!(merged, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn pick_first_non_null_drops_leading_nulls() {
        let value = serde_json::json!([null, null, "x", "y"]);
        assert_eq!(
            pick_value(value, PickValue::FirstNonNull, "i").unwrap(),
            serde_json::json!("x")
        );
    }

    #[test]
    fn the_only_non_null_rejects_two_values() {
        let value = serde_json::json!(["x", "y"]);
        assert!(pick_value(value, PickValue::TheOnlyNonNull, "i").is_err());
    }

    #[test]
    fn default_applies_when_source_is_null() {
        let mut si = input("x", vec!["missing_input"]);
        si.default = Some(serde_json::json!("fallback"));
        let step = step_with(vec![si]);
        let resolved = resolve_step_inputs(&step, &Map::new(), &|_, _| None, false).unwrap();
        assert_eq!(resolved.job["x"], serde_json::json!("fallback"));
        assert!(resolved.missing_required.is_empty());
    }

    #[test]
    fn value_from_sees_self_and_other_inputs() {
        let mut scaled = input("x", vec![]);
        scaled.sources = vec!["n".to_string()];
        scaled.value_from = Some("${return self * inputs.factor;}".to_string());
        let mut factor = input("factor", vec![]);
        factor.default = Some(serde_json::json!(10));
        let step = step_with(vec![scaled, factor]);

        let mut wf_inputs = Map::new();
        wf_inputs.insert("n".to_string(), serde_json::json!(4));
        let resolved = resolve_step_inputs(&step, &wf_inputs, &|_, _| None, true).unwrap();
        assert_eq!(resolved.job["x"], serde_json::json!(40));
    }

    #[test]
    fn missing_required_is_reported_for_upstream_null() {
        let step = step_with(vec![input("x", vec!["gone/out"])]);
        let resolved = resolve_step_inputs(&step, &Map::new(), &|_, _| None, false).unwrap();
        assert_eq!(resolved.missing_required, vec!["x"]);
    }
}
