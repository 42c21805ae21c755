//! CWL v1.2 front-end: load, normalize, validate, and order.
//!
//! The pipeline turns a packed or modular CWL document (YAML or JSON) into a
//! [`WorkflowSpec`]: steps carry inline process bodies, every step has a
//! computed `depends_on` list, and the topological order is ready for the
//! scheduler. Validation is collect-all: the caller gets every
//! path-annotated problem in one list, not just the first.

pub mod dag;
pub mod normalize;
pub mod schema;
pub mod validate;

pub use schema::{
    Argument, CwlType, DockerRequirement, EngineHints, EnvDef, ExpressionTool, InputBinding,
    LinkMerge, OutputBinding, PickValue, Process, RecordField, Requirements, ResourceRequirement,
    ScatterMethod, SchemaDef, Step, StepInput, Tool, ToolInput, ToolOutput, WorkDirEntry,
    WorkflowInput, WorkflowOutput, WorkflowSpec,
};

use crate::error::ServerError;

/// Parse, normalize, and validate one CWL document into an execution plan.
///
/// `base_dir` is the directory `$import` paths resolve against; pass `None`
/// for fully packed documents.
pub fn parse_document(text: &str, base_dir: Option<&std::path::Path>) -> Result<WorkflowSpec, ServerError> {
    let value = normalize::load(text).map_err(|e| ServerError::Validation(vec![e]))?;
    let value = normalize::resolve_imports(value, base_dir).map_err(|e| ServerError::Validation(vec![e]))?;

    let mut spec = normalize::normalize_document(&value).map_err(ServerError::Validation)?;

    let mut errors = validate::validate(&spec);
    match dag::order(&mut spec) {
        Ok(()) => {}
        Err(e) => errors.push(e),
    }
    if !errors.is_empty() {
        return Err(ServerError::Validation(errors));
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO_TOOL: &str = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [echo]
inputs:
  message:
    type: string
    inputBinding:
      position: 1
outputs:
  out:
    type: stdout
stdout: output.txt
"#;

    #[test]
    fn bare_tool_wraps_into_single_step_workflow() {
        let spec = parse_document(ECHO_TOOL, None).unwrap();
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.steps[0].id, "main");
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.outputs[0].output_source, vec!["main/out"]);
        match &spec.steps[0].run {
            Process::Tool(tool) => assert_eq!(tool.base_command, vec!["echo"]),
            other => panic!("expected tool, got {:?}", other),
        }
    }

    #[test]
    fn unresolved_source_is_reported_with_path() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs: []
outputs: []
steps:
  count:
    run:
      class: CommandLineTool
      baseCommand: [wc]
      inputs: []
      outputs: []
    in:
      text:
        source: nosuch/out
    out: []
"#;
        let err = parse_document(doc, None).unwrap_err();
        match err {
            ServerError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.contains("steps.count.in.text")), "{:?}", errors);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
