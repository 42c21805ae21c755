//! Collect-all structural and type validation over a normalized workflow.

use std::collections::HashMap;

use super::schema::*;

/// Validate a normalized workflow. Returns every problem found; an empty
/// list means the workflow is ready for DAG ordering. Subworkflow bodies
/// are validated recursively with prefixed paths.
pub fn validate(spec: &WorkflowSpec) -> Vec<String> {
    let mut errors = Vec::new();

    for step in &spec.steps {
        if let Process::Workflow(inner) = &step.run {
            for error in validate(inner) {
                errors.push(format!("steps.{}.run.{}", step.id, error));
            }
        }
    }

    // SchemaDef references resolve before any type comparison.
    let defs: HashMap<&str, &CwlType> = spec
        .requirements
        .schema_defs
        .iter()
        .map(|d| (d.name.as_str(), &d.r#type))
        .collect();

    // step id -> (out id -> type)
    let mut step_outputs: HashMap<&str, HashMap<&str, CwlType>> = HashMap::new();
    for step in &spec.steps {
        let outs = process_outputs(&step.run);
        let declared = step_outputs.entry(step.id.as_str()).or_default();
        for out in &step.outputs {
            match outs.get(out.as_str()) {
                Some(ty) => {
                    declared.insert(out.as_str(), (*ty).clone());
                }
                None => errors.push(format!(
                    "steps.{}.out: '{}' is not an output of the step's process",
                    step.id, out
                )),
            }
        }
    }

    for step in &spec.steps {
        let process_inputs = process_inputs(&step.run);

        for input in &step.inputs {
            let path = format!("steps.{}.in.{}", step.id, input.id);

            if input.sources.len() > 1 && !spec.requirements.multiple_input {
                errors.push(format!(
                    "{}: multiple sources require MultipleInputFeatureRequirement",
                    path
                ));
            }
            if input.value_from.is_some() && !spec.requirements.step_input_expression {
                errors.push(format!(
                    "{}: valueFrom requires StepInputExpressionRequirement",
                    path
                ));
            }

            for source in &input.sources {
                match resolve_source(spec, &step_outputs, source) {
                    Ok(source_type) => {
                        // Required input fed from an optional source needs a
                        // default to fall back on.
                        if let Some(target) = process_inputs.get(input.id.as_str()) {
                            let target_optional =
                                target.is_optional() || input.default.is_some();
                            if source_type.is_optional()
                                && !target_optional
                                && input.value_from.is_none()
                            {
                                errors.push(format!(
                                    "{}: required input sourced from optional '{}' with no default",
                                    path, source
                                ));
                            }
                            let source_resolved = resolve_named(&source_type, &defs);
                            let target_resolved = resolve_named(target, &defs);
                            // Scattered inputs consume one element of the
                            // source array.
                            let effective_target = if step.scatter.contains(&input.id) {
                                CwlType::Array(Box::new(target_resolved.clone()))
                            } else {
                                target_resolved
                            };
                            if !effective_target.accepts(&source_resolved)
                                && input.value_from.is_none()
                            {
                                errors.push(format!(
                                    "{}: source '{}' has incompatible type",
                                    path, source
                                ));
                            }
                        }
                    }
                    Err(e) => errors.push(format!("{}: {}", path, e)),
                }
            }

            if !process_inputs.contains_key(input.id.as_str()) {
                errors.push(format!(
                    "{}: step process declares no input '{}'",
                    path, input.id
                ));
            }
        }

        if !step.scatter.is_empty() {
            if !spec.requirements.scatter {
                errors.push(format!(
                    "steps.{}.scatter: requires ScatterFeatureRequirement",
                    step.id
                ));
            }
            if matches!(step.run, Process::Workflow(_)) {
                errors.push(format!(
                    "steps.{}.scatter: scattering a subworkflow step is not supported",
                    step.id
                ));
            }
            if step.scatter.len() > 1 && step.scatter_method.is_none() {
                errors.push(format!(
                    "steps.{}.scatterMethod: required when scattering more than one input",
                    step.id
                ));
            }
            for name in &step.scatter {
                if !step.inputs.iter().any(|i| &i.id == name) {
                    errors.push(format!(
                        "steps.{}.scatter: '{}' is not a step input",
                        step.id, name
                    ));
                }
            }
        }

        if matches!(step.run, Process::Workflow(_)) && !spec.requirements.subworkflow {
            errors.push(format!(
                "steps.{}.run: subworkflows require SubworkflowFeatureRequirement",
                step.id
            ));
        }
    }

    for output in &spec.outputs {
        let path = format!("outputs.{}", output.id);
        if output.output_source.is_empty() {
            errors.push(format!("{}: missing outputSource", path));
            continue;
        }
        for source in &output.output_source {
            if let Err(e) = resolve_source(spec, &step_outputs, source) {
                errors.push(format!("{}: {}", path, e));
            }
        }
    }

    errors
}

/// Resolve a source reference to the type it produces: either a workflow
/// input name or `<step>/<out>`.
fn resolve_source(
    spec: &WorkflowSpec,
    step_outputs: &HashMap<&str, HashMap<&str, CwlType>>,
    source: &str,
) -> Result<CwlType, String> {
    if let Some((step_id, out_id)) = source.split_once('/') {
        let outs = step_outputs
            .get(step_id)
            .ok_or_else(|| format!("source '{}' references unknown step '{}'", source, step_id))?;
        let ty = outs.get(out_id).ok_or_else(|| {
            format!(
                "source '{}' references unknown output '{}' of step '{}'",
                source, out_id, step_id
            )
        })?;
        // A conditional step may be skipped, leaving a null in place of its
        // output.
        let ty = ty.clone();
        if spec.step(step_id).map(|s| s.when.is_some()).unwrap_or(false) && !ty.is_optional() {
            Ok(CwlType::Optional(Box::new(ty)))
        } else {
            Ok(ty)
        }
    } else {
        spec.input(source)
            .map(|i| i.r#type.clone())
            .ok_or_else(|| format!("source '{}' is not a workflow input or step output", source))
    }
}

fn resolve_named(ty: &CwlType, defs: &HashMap<&str, &CwlType>) -> CwlType {
    match ty {
        CwlType::Named(name) => defs
            .get(name.as_str())
            .map(|t| resolve_named(t, defs))
            .unwrap_or_else(|| CwlType::Named(name.clone())),
        CwlType::Array(inner) => CwlType::Array(Box::new(resolve_named(inner, defs))),
        CwlType::Optional(inner) => CwlType::Optional(Box::new(resolve_named(inner, defs))),
        other => other.clone(),
    }
}

fn process_inputs(process: &Process) -> HashMap<&str, &CwlType> {
    match process {
        Process::Tool(t) => t.inputs.iter().map(|i| (i.id.as_str(), &i.r#type)).collect(),
        Process::Expression(e) => e.inputs.iter().map(|i| (i.id.as_str(), &i.r#type)).collect(),
        Process::Workflow(w) => w.inputs.iter().map(|i| (i.id.as_str(), &i.r#type)).collect(),
    }
}

fn process_outputs(process: &Process) -> HashMap<&str, &CwlType> {
    match process {
        Process::Tool(t) => t.outputs.iter().map(|o| (o.id.as_str(), &o.r#type)).collect(),
        Process::Expression(e) => e.outputs.iter().map(|o| (o.id.as_str(), &o.r#type)).collect(),
        Process::Workflow(w) => w.outputs.iter().map(|o| (o.id.as_str(), &o.r#type)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::normalize;

    fn spec_from(doc: &str) -> Result<WorkflowSpec, Vec<String>> {
        let value = normalize::load(doc).unwrap();
        normalize::normalize_document(&value)
    }

    #[test]
    fn optional_upstream_into_required_input_needs_default() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs:
  maybe: string?
outputs: []
steps:
  use:
    run:
      class: CommandLineTool
      baseCommand: [echo]
      inputs:
        text: string
      outputs: []
    in:
      text:
        source: maybe
    out: []
"#;
        let spec = spec_from(doc).unwrap();
        let errors = validate(&spec);
        assert!(
            errors.iter().any(|e| e.contains("steps.use.in.text") && e.contains("optional")),
            "{:?}",
            errors
        );
    }

    #[test]
    fn default_compensates_for_optional_source() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs:
  maybe: string?
outputs: []
steps:
  use:
    run:
      class: CommandLineTool
      baseCommand: [echo]
      inputs:
        text: string
      outputs: []
    in:
      text:
        source: maybe
        default: fallback
    out: []
"#;
        let spec = spec_from(doc).unwrap();
        assert!(validate(&spec).is_empty());
    }

    #[test]
    fn unknown_output_source_is_reported() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs: []
outputs:
  result:
    type: File
    outputSource: nope/out
steps:
  one:
    run:
      class: CommandLineTool
      baseCommand: [true]
      inputs: []
      outputs: []
    in: {}
    out: []
"#;
        let spec = spec_from(doc).unwrap();
        let errors = validate(&spec);
        assert!(errors.iter().any(|e| e.contains("outputs.result")), "{:?}", errors);
    }
}
