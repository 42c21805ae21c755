//! Normalized CWL process representation.
//!
//! These are the shapes the rest of the engine works with: the normalizer
//! collapses CWL's map/list dualities, type shorthands, and `run:` references
//! into them, and they serialize into the store (`workflows.parsed_json`,
//! `tasks.tool_json`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical CWL type. Shorthands (`string?`, `File[]`, `string[]?`) and the
/// long form `{type: array, items: …}` all map here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CwlType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    File,
    Directory,
    Any,
    Stdout,
    Stderr,
    Array(Box<CwlType>),
    Optional(Box<CwlType>),
    Record { fields: Vec<RecordField> },
    Enum { symbols: Vec<String> },
    /// Reference to a SchemaDefRequirement entry, resolved during validation.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordField {
    pub name: String,
    pub r#type: CwlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<InputBinding>,
}

impl CwlType {
    pub fn is_optional(&self) -> bool {
        matches!(self, CwlType::Optional(_) | CwlType::Null | CwlType::Any)
    }

    /// The type with any optional marker removed.
    pub fn unwrap_optional(&self) -> &CwlType {
        match self {
            CwlType::Optional(inner) => inner.unwrap_optional(),
            other => other,
        }
    }

    /// Whether a value of `source` can feed a slot of this type. Optional
    /// markers are honored; `Any` accepts and feeds everything.
    pub fn accepts(&self, source: &CwlType) -> bool {
        let target = self.unwrap_optional();
        let source_inner = source.unwrap_optional();
        if matches!(target, CwlType::Any) || matches!(source_inner, CwlType::Any) {
            return true;
        }
        // stdout/stderr outputs produce Files
        let source_inner = match source_inner {
            CwlType::Stdout | CwlType::Stderr => &CwlType::File,
            other => other,
        };
        match (target, source_inner) {
            (CwlType::Array(a), CwlType::Array(b)) => a.accepts(b),
            // numeric widening is accepted
            (CwlType::Long, CwlType::Int)
            | (CwlType::Float, CwlType::Int)
            | (CwlType::Double, CwlType::Int)
            | (CwlType::Double, CwlType::Float)
            | (CwlType::Double, CwlType::Long) => true,
            (a, b) => a == b,
        }
    }
}

/// How one `arguments[i]` entry contributes to the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub separate: bool,
    pub shell_quote: bool,
    /// Literal text or an expression; evaluated with `self` = null.
    pub value_from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub separate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_separator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
    pub shell_quote: bool,
}

impl Default for InputBinding {
    fn default() -> Self {
        Self {
            position: None,
            prefix: None,
            separate: true,
            item_separator: None,
            value_from: None,
            shell_quote: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInput {
    pub id: String,
    pub r#type: CwlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<InputBinding>,
    #[serde(default)]
    pub load_contents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBinding {
    #[serde(default)]
    pub glob: Vec<String>,
    #[serde(default)]
    pub load_contents: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_eval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub id: String,
    pub r#type: CwlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<OutputBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRequirement {
    pub docker_pull: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvDef {
    pub name: String,
    /// May be an expression.
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    /// Int or expression over `inputs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores_min: Option<Value>,
    /// MiB; int or expression over `inputs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_min: Option<Value>,
}

/// One entry of `InitialWorkDirRequirement.listing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkDirEntry {
    /// Filename in the working directory; may be an expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entryname: Option<String>,
    /// String expression producing file contents, or a File/Directory value.
    pub entry: Value,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDef {
    pub name: String,
    pub r#type: CwlType,
}

/// The supported requirement set, flattened out of CWL's
/// `requirements`/`hints` lists. Unknown requirements fail validation before
/// this is built; unknown hints are dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Requirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerRequirement>,
    pub inline_javascript: bool,
    pub env: Vec<EnvDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRequirement>,
    pub initial_work_dir: Vec<WorkDirEntry>,
    pub shell_command: bool,
    /// Seconds; int or expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Value>,
    pub network_access: bool,
    pub schema_defs: Vec<SchemaDef>,
    pub subworkflow: bool,
    pub scatter: bool,
    pub multiple_input: bool,
    pub step_input_expression: bool,
}

/// Engine-specific routing carried in the private `roweHint` hint namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bvbrc_app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
}

/// A CommandLineTool, fully normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    #[serde(default)]
    pub base_command: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    pub inputs: Vec<ToolInput>,
    pub outputs: Vec<ToolOutput>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub hints: EngineHints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub success_codes: Vec<i32>,
    #[serde(default)]
    pub temporary_fail_codes: Vec<i32>,
    #[serde(default)]
    pub permanent_fail_codes: Vec<i32>,
}

/// An ExpressionTool: pure evaluation, no process spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionTool {
    pub id: String,
    pub inputs: Vec<ToolInput>,
    pub outputs: Vec<ToolOutput>,
    pub expression: String,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub hints: EngineHints,
}

/// Any runnable process body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Process {
    #[serde(rename = "CommandLineTool")]
    Tool(Tool),
    #[serde(rename = "Workflow")]
    Workflow(Box<WorkflowSpec>),
    #[serde(rename = "ExpressionTool")]
    Expression(ExpressionTool),
}

impl Process {
    pub fn id(&self) -> &str {
        match self {
            Process::Tool(t) => &t.id,
            Process::Workflow(w) => &w.id,
            Process::Expression(e) => &e.id,
        }
    }

    pub fn requirements(&self) -> &Requirements {
        match self {
            Process::Tool(t) => &t.requirements,
            Process::Workflow(w) => &w.requirements,
            Process::Expression(e) => &e.requirements,
        }
    }

    pub fn hints(&self) -> &EngineHints {
        match self {
            Process::Tool(t) => &t.hints,
            Process::Workflow(w) => &w.hints,
            Process::Expression(e) => &e.hints,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMerge {
    MergeNested,
    MergeFlattened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickValue {
    FirstNonNull,
    TheOnlyNonNull,
    AllNonNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterMethod {
    Dotproduct,
    NestedCrossproduct,
    FlatCrossproduct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    pub id: String,
    /// Zero or more `input-name` / `step/out` references.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_merge: Option<LinkMerge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pick_value: Option<PickValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub run: Process,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub scatter: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scatter_method: Option<ScatterMethod>,
    /// Conditional guard; the step is SKIPPED when it evaluates false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Upstream step ids, derived from cross-step sources.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub hints: EngineHints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    pub id: String,
    pub r#type: CwlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOutput {
    pub id: String,
    pub r#type: CwlType,
    #[serde(default)]
    pub output_source: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_merge: Option<LinkMerge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pick_value: Option<PickValue>,
}

/// A validated workflow execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub id: String,
    pub cwl_version: String,
    pub inputs: Vec<WorkflowInput>,
    pub outputs: Vec<WorkflowOutput>,
    pub steps: Vec<Step>,
    /// Step ids in dependency order, from Kahn's algorithm.
    #[serde(default)]
    pub topo_order: Vec<String>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub hints: EngineHints,
}

impl WorkflowSpec {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn input(&self, id: &str) -> Option<&WorkflowInput> {
        self.inputs.iter().find(|i| i.id == id)
    }
}
