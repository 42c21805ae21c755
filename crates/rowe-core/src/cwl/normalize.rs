//! Document loading and normalization.
//!
//! CWL allows a lot of syntactic freedom: YAML or JSON, `$graph` packs or
//! bare processes, map-form or list-form fields, type shorthands, and `run:`
//! references. Everything funnels through here into the canonical
//! [`WorkflowSpec`] shape. Errors are path-annotated and collected, so one
//! pass reports every problem it can see.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::schema::*;

/// Parse YAML or JSON text into a JSON value tree. YAML is a superset, so
/// one parser covers both.
pub fn load(text: &str) -> Result<Value, String> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| format!("document parse error: {}", e))?;
    serde_json::to_value(yaml).map_err(|e| format!("document conversion error: {}", e))
}

/// Resolve `$import` directives relative to `base_dir`. Cycles are errors.
/// Packed documents contain none, so `base_dir = None` skips file access.
pub fn resolve_imports(value: Value, base_dir: Option<&Path>) -> Result<Value, String> {
    let mut stack: Vec<PathBuf> = Vec::new();
    resolve_imports_inner(value, base_dir, &mut stack)
}

fn resolve_imports_inner(
    value: Value,
    base_dir: Option<&Path>,
    stack: &mut Vec<PathBuf>,
) -> Result<Value, String> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get("$import") {
                    let base = base_dir.ok_or_else(|| {
                        format!("$import '{}' found but no document base directory", target)
                    })?;
                    let path = base.join(target);
                    let canonical = path
                        .canonicalize()
                        .map_err(|e| format!("$import '{}': {}", target, e))?;
                    if stack.contains(&canonical) {
                        return Err(format!(
                            "$import cycle: {} -> {}",
                            stack
                                .iter()
                                .map(|p| p.display().to_string())
                                .collect::<Vec<_>>()
                                .join(" -> "),
                            canonical.display()
                        ));
                    }
                    let text = std::fs::read_to_string(&canonical)
                        .map_err(|e| format!("$import '{}': {}", target, e))?;
                    let imported = load(&text)?;
                    stack.push(canonical.clone());
                    let resolved =
                        resolve_imports_inner(imported, canonical.parent(), stack)?;
                    stack.pop();
                    return Ok(resolved);
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, resolve_imports_inner(v, base_dir, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_imports_inner(item, base_dir, stack)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other),
    }
}

/// Normalize one document into a [`WorkflowSpec`]. Bare tools become a
/// synthetic single-step workflow so the scheduler sees one uniform shape.
pub fn normalize_document(doc: &Value) -> Result<WorkflowSpec, Vec<String>> {
    let mut n = Normalizer::default();

    let root = match doc.as_object() {
        Some(map) => map,
        None => return Err(vec!["document root must be a mapping".to_string()]),
    };

    let cwl_version = root
        .get("cwlVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if cwl_version.is_empty() {
        n.errors.push("cwlVersion: missing required field".to_string());
    }

    // Collect the graph: either an explicit $graph pack or a synthetic
    // single-entry graph around a bare process.
    let mut graph: HashMap<String, Value> = HashMap::new();
    let main_id;
    if let Some(entries) = root.get("$graph").and_then(Value::as_array) {
        for (i, entry) in entries.iter().enumerate() {
            match entry.as_object().and_then(|m| m.get("id")).and_then(Value::as_str) {
                Some(id) => {
                    graph.insert(strip_fragment(id).to_string(), entry.clone());
                }
                None => n
                    .errors
                    .push(format!("$graph[{}].id: missing required field", i)),
            }
        }
        main_id = if graph.contains_key("main") {
            "main".to_string()
        } else {
            // fall back to the only Workflow in the pack
            let workflows: Vec<String> = graph
                .iter()
                .filter(|(_, v)| v.get("class").and_then(Value::as_str) == Some("Workflow"))
                .map(|(k, _)| k.clone())
                .collect();
            match workflows.as_slice() {
                [only] => only.clone(),
                [] if graph.len() == 1 => graph.keys().next().unwrap().clone(),
                _ => {
                    n.errors.push(
                        "$graph: no #main entry and no unique Workflow to use as entrypoint"
                            .to_string(),
                    );
                    String::new()
                }
            }
        };
    } else {
        let mut entry = doc.clone();
        if let Some(map) = entry.as_object_mut() {
            map.entry("id").or_insert_with(|| Value::String("main".into()));
        }
        main_id = "main".to_string();
        graph.insert(main_id.clone(), entry);
    }

    if !n.errors.is_empty() {
        return Err(n.errors);
    }

    n.graph = graph;
    let spec = n.normalize_entry(&main_id, &Map::new(), &cwl_version, "");
    if n.errors.is_empty() {
        Ok(spec.expect("normalizer produced no spec and no errors"))
    } else {
        Err(n.errors)
    }
}

fn strip_fragment(id: &str) -> &str {
    id.strip_prefix('#').unwrap_or(id)
}

#[derive(Default)]
struct Normalizer {
    errors: Vec<String>,
    graph: HashMap<String, Value>,
}

impl Normalizer {
    fn err(&mut self, path: &str, message: impl Into<String>) {
        let message = message.into();
        if path.is_empty() {
            self.errors.push(message);
        } else {
            self.errors.push(format!("{}: {}", path, message));
        }
    }

    /// Normalize a graph entry into a workflow spec, wrapping bare tools.
    fn normalize_entry(
        &mut self,
        id: &str,
        inherited: &Map<String, Value>,
        cwl_version: &str,
        path: &str,
    ) -> Option<WorkflowSpec> {
        let entry = match self.graph.get(id).cloned() {
            Some(e) => e,
            None => {
                self.err(path, format!("reference '#{}' not found in document graph", id));
                return None;
            }
        };
        let class = entry.get("class").and_then(Value::as_str).unwrap_or_default();
        match class {
            "Workflow" => self.normalize_workflow(id, &entry, inherited, cwl_version, path),
            "CommandLineTool" | "ExpressionTool" => {
                let process = self.normalize_process(&entry, inherited, path)?;
                Some(self.wrap_bare_process(process, cwl_version))
            }
            "" => {
                self.err(path, format!("#{}: missing required field 'class'", id));
                None
            }
            other => {
                self.err(path, format!("#{}: unsupported class '{}'", id, other));
                None
            }
        }
    }

    /// Synthesize a single-step workflow around a bare tool so standalone
    /// tool documents submit and schedule exactly like workflows.
    fn wrap_bare_process(&mut self, process: Process, cwl_version: &str) -> WorkflowSpec {
        let (tool_inputs, tool_outputs): (Vec<(String, CwlType, Option<Value>)>, Vec<(String, CwlType)>) =
            match &process {
                Process::Tool(t) => (
                    t.inputs
                        .iter()
                        .map(|i| (i.id.clone(), i.r#type.clone(), i.default.clone()))
                        .collect(),
                    t.outputs.iter().map(|o| (o.id.clone(), o.r#type.clone())).collect(),
                ),
                Process::Expression(e) => (
                    e.inputs
                        .iter()
                        .map(|i| (i.id.clone(), i.r#type.clone(), i.default.clone()))
                        .collect(),
                    e.outputs.iter().map(|o| (o.id.clone(), o.r#type.clone())).collect(),
                ),
                Process::Workflow(_) => unreachable!("workflows are not wrapped"),
            };

        let step = Step {
            id: "main".to_string(),
            inputs: tool_inputs
                .iter()
                .map(|(id, _, _)| StepInput {
                    id: id.clone(),
                    sources: vec![id.clone()],
                    link_merge: None,
                    pick_value: None,
                    default: None,
                    value_from: None,
                })
                .collect(),
            outputs: tool_outputs.iter().map(|(id, _)| id.clone()).collect(),
            scatter: Vec::new(),
            scatter_method: None,
            when: None,
            depends_on: Vec::new(),
            hints: process.hints().clone(),
            run: process,
        };

        WorkflowSpec {
            id: "main".to_string(),
            cwl_version: cwl_version.to_string(),
            inputs: tool_inputs
                .into_iter()
                .map(|(id, r#type, default)| WorkflowInput { id, r#type, default })
                .collect(),
            outputs: tool_outputs
                .into_iter()
                .map(|(id, r#type)| WorkflowOutput {
                    output_source: vec![format!("main/{}", id)],
                    id,
                    r#type,
                    link_merge: None,
                    pick_value: None,
                })
                .collect(),
            steps: vec![step],
            topo_order: Vec::new(),
            requirements: Requirements::default(),
            hints: EngineHints::default(),
        }
    }

    fn normalize_workflow(
        &mut self,
        id: &str,
        value: &Value,
        inherited: &Map<String, Value>,
        cwl_version: &str,
        path: &str,
    ) -> Option<WorkflowSpec> {
        let map = value.as_object()?;
        let own_reqs = self.raw_requirements(map, path);
        let merged = merge_requirements(inherited, &own_reqs);
        let requirements = self.build_requirements(&merged, path);
        let hints = self.engine_hints(map);

        for field in ["inputs", "outputs", "steps"] {
            if !map.contains_key(field) {
                self.err(path, format!("missing required field '{}'", field));
            }
        }

        let inputs = id_entries(map.get("inputs"), &join(path, "inputs"), "type", self)
            .into_iter()
            .filter_map(|(input_id, body, entry_path)| {
                let r#type = self.parse_type_field(&body, &entry_path)?;
                Some(WorkflowInput {
                    id: input_id,
                    r#type,
                    default: body.get("default").cloned(),
                })
            })
            .collect();

        let outputs = id_entries(map.get("outputs"), &join(path, "outputs"), "type", self)
            .into_iter()
            .filter_map(|(output_id, body, entry_path)| {
                let r#type = self.parse_type_field(&body, &entry_path)?;
                let output_source = string_or_list(body.get("outputSource"));
                Some(WorkflowOutput {
                    id: output_id,
                    r#type,
                    output_source,
                    link_merge: self.parse_link_merge(&body, &entry_path),
                    pick_value: self.parse_pick_value(&body, &entry_path),
                })
            })
            .collect();

        let mut steps = Vec::new();
        for (step_id, body, entry_path) in id_entries(map.get("steps"), &join(path, "steps"), "type", self) {
            if let Some(step) = self.normalize_step(&step_id, &body, &merged, cwl_version, &entry_path) {
                steps.push(step);
            }
        }

        Some(WorkflowSpec {
            id: id.to_string(),
            cwl_version: cwl_version.to_string(),
            inputs,
            outputs,
            steps,
            topo_order: Vec::new(),
            requirements,
            hints,
        })
    }

    fn normalize_step(
        &mut self,
        id: &str,
        body: &Value,
        inherited: &Map<String, Value>,
        cwl_version: &str,
        path: &str,
    ) -> Option<Step> {
        let map = body.as_object().or_else(|| {
            self.err(path, "step must be a mapping");
            None
        })?;

        // Step-level requirements/hints layer on top of the workflow's.
        let own_reqs = self.raw_requirements(map, path);
        let merged = merge_requirements(inherited, &own_reqs);

        let run = map.get("run").or_else(|| {
            self.err(path, "missing required field 'run'");
            None
        })?;
        let run = self.resolve_run(run, &merged, cwl_version, &join(path, "run"))?;

        let mut inputs = Vec::new();
        for (input_id, in_body, entry_path) in
            id_entries(map.get("in"), &join(path, "in"), "source", self)
        {
            let sources = string_or_list(in_body.get("source"));
            inputs.push(StepInput {
                id: input_id,
                sources,
                link_merge: self.parse_link_merge(&in_body, &entry_path),
                pick_value: self.parse_pick_value(&in_body, &entry_path),
                default: in_body.get("default").cloned(),
                value_from: in_body
                    .get("valueFrom")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let outputs = match map.get("out") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(strip_fragment(s).to_string()),
                    Value::Object(m) => m
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|s| strip_fragment(s).to_string()),
                    _ => None,
                })
                .collect(),
            Some(_) => {
                self.err(&join(path, "out"), "must be a list");
                Vec::new()
            }
            None => Vec::new(),
        };

        let scatter = string_or_list(map.get("scatter"))
            .into_iter()
            .map(|s| strip_fragment(&s).to_string())
            .collect();
        let scatter_method = match map.get("scatterMethod").and_then(Value::as_str) {
            None => None,
            Some("dotproduct") => Some(ScatterMethod::Dotproduct),
            Some("nested_crossproduct") => Some(ScatterMethod::NestedCrossproduct),
            Some("flat_crossproduct") => Some(ScatterMethod::FlatCrossproduct),
            Some(other) => {
                self.err(&join(path, "scatterMethod"), format!("unknown method '{}'", other));
                None
            }
        };

        let hints = {
            let step_hints = self.engine_hints(map);
            let run_hints = run.hints().clone();
            EngineHints {
                bvbrc_app_id: step_hints.bvbrc_app_id.or(run_hints.bvbrc_app_id),
                executor: step_hints.executor.or(run_hints.executor),
                worker_group: step_hints.worker_group.or(run_hints.worker_group),
            }
        };

        Some(Step {
            id: id.to_string(),
            run,
            inputs,
            outputs,
            scatter,
            scatter_method,
            when: map.get("when").and_then(Value::as_str).map(str::to_string),
            depends_on: Vec::new(),
            hints,
        })
    }

    /// Resolve `run:` to an inline process body. Fragment references must
    /// exist in the graph; bare paths mean the document was never bundled.
    fn resolve_run(
        &mut self,
        run: &Value,
        inherited: &Map<String, Value>,
        cwl_version: &str,
        path: &str,
    ) -> Option<Process> {
        match run {
            Value::String(reference) => {
                if let Some(fragment) = reference.strip_prefix('#') {
                    let entry = match self.graph.get(fragment).cloned() {
                        Some(e) => e,
                        None => {
                            self.err(path, format!("reference '{}' not found in document graph", reference));
                            return None;
                        }
                    };
                    self.normalize_run_body(&entry, inherited, cwl_version, path)
                } else {
                    self.err(
                        path,
                        format!(
                            "'{}' is a file path; documents must be packed before registration",
                            reference
                        ),
                    );
                    None
                }
            }
            Value::Object(_) => self.normalize_run_body(run, inherited, cwl_version, path),
            _ => {
                self.err(path, "must be a '#id' reference or an inline process");
                None
            }
        }
    }

    fn normalize_run_body(
        &mut self,
        body: &Value,
        inherited: &Map<String, Value>,
        cwl_version: &str,
        path: &str,
    ) -> Option<Process> {
        let class = body.get("class").and_then(Value::as_str).unwrap_or_default();
        match class {
            "CommandLineTool" | "ExpressionTool" => self.normalize_process(body, inherited, path),
            "Workflow" => {
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .map(strip_fragment)
                    .unwrap_or("subworkflow")
                    .to_string();
                let spec = self.normalize_workflow(&id, body, inherited, cwl_version, path)?;
                Some(Process::Workflow(Box::new(spec)))
            }
            "" => {
                self.err(path, "missing required field 'class'");
                None
            }
            other => {
                self.err(path, format!("unsupported class '{}'", other));
                None
            }
        }
    }

    /// Normalize a CommandLineTool or ExpressionTool body.
    fn normalize_process(
        &mut self,
        body: &Value,
        inherited: &Map<String, Value>,
        path: &str,
    ) -> Option<Process> {
        let map = body.as_object()?;
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .map(strip_fragment)
            .unwrap_or("tool")
            .to_string();

        let own_reqs = self.raw_requirements(map, path);
        let merged = merge_requirements(inherited, &own_reqs);
        let requirements = self.build_requirements(&merged, path);
        let hints = self.engine_hints(map);

        let inputs = id_entries(map.get("inputs"), &join(path, "inputs"), "type", self)
            .into_iter()
            .filter_map(|(input_id, in_body, entry_path)| {
                let r#type = self.parse_type_field(&in_body, &entry_path)?;
                let binding = in_body
                    .get("inputBinding")
                    .map(|b| self.parse_input_binding(b, &join(&entry_path, "inputBinding")));
                Some(ToolInput {
                    id: input_id,
                    r#type,
                    default: in_body.get("default").cloned(),
                    binding,
                    load_contents: in_body
                        .get("loadContents")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect();

        let outputs = id_entries(map.get("outputs"), &join(path, "outputs"), "type", self)
            .into_iter()
            .filter_map(|(output_id, out_body, entry_path)| {
                let r#type = self.parse_type_field(&out_body, &entry_path)?;
                let binding = out_body.get("outputBinding").map(|b| {
                    let bmap = b.as_object().cloned().unwrap_or_default();
                    OutputBinding {
                        glob: string_or_list(bmap.get("glob")),
                        load_contents: bmap
                            .get("loadContents")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                        output_eval: bmap
                            .get("outputEval")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }
                });
                Some(ToolOutput {
                    id: output_id,
                    r#type,
                    binding,
                })
            })
            .collect();

        let class = map.get("class").and_then(Value::as_str).unwrap_or_default();
        if class == "ExpressionTool" {
            let expression = match map.get("expression").and_then(Value::as_str) {
                Some(e) => e.to_string(),
                None => {
                    self.err(path, "missing required field 'expression'");
                    return None;
                }
            };
            return Some(Process::Expression(ExpressionTool {
                id,
                inputs,
                outputs,
                expression,
                requirements,
                hints,
            }));
        }

        let base_command = string_or_list(map.get("baseCommand"));

        let mut arguments = Vec::new();
        if let Some(items) = map.get("arguments").and_then(Value::as_array) {
            for (i, item) in items.iter().enumerate() {
                let entry_path = format!("{}[{}]", join(path, "arguments"), i);
                match item {
                    Value::String(s) => arguments.push(Argument {
                        position: 0,
                        prefix: None,
                        separate: true,
                        shell_quote: true,
                        value_from: s.clone(),
                    }),
                    Value::Object(m) => {
                        let value_from = match m.get("valueFrom").and_then(Value::as_str) {
                            Some(v) => v.to_string(),
                            None => {
                                self.err(&entry_path, "missing 'valueFrom'");
                                continue;
                            }
                        };
                        arguments.push(Argument {
                            position: m.get("position").and_then(Value::as_i64).unwrap_or(0),
                            prefix: m.get("prefix").and_then(Value::as_str).map(str::to_string),
                            separate: m.get("separate").and_then(Value::as_bool).unwrap_or(true),
                            shell_quote: m
                                .get("shellQuote")
                                .and_then(Value::as_bool)
                                .unwrap_or(true),
                            value_from,
                        });
                    }
                    _ => self.err(&entry_path, "must be a string or a binding"),
                }
            }
        }

        Some(Process::Tool(Tool {
            id,
            base_command,
            arguments,
            inputs,
            outputs,
            requirements,
            hints,
            stdin: map.get("stdin").and_then(Value::as_str).map(str::to_string),
            stdout: map.get("stdout").and_then(Value::as_str).map(str::to_string),
            stderr: map.get("stderr").and_then(Value::as_str).map(str::to_string),
            success_codes: int_list(map.get("successCodes")),
            temporary_fail_codes: int_list(map.get("temporaryFailCodes")),
            permanent_fail_codes: int_list(map.get("permanentFailCodes")),
        }))
    }

    fn parse_input_binding(&mut self, value: &Value, path: &str) -> InputBinding {
        let map = match value.as_object() {
            Some(m) => m.clone(),
            None => {
                self.err(path, "must be a mapping");
                return InputBinding::default();
            }
        };
        InputBinding {
            position: map.get("position").and_then(Value::as_i64),
            prefix: map.get("prefix").and_then(Value::as_str).map(str::to_string),
            separate: map.get("separate").and_then(Value::as_bool).unwrap_or(true),
            item_separator: map
                .get("itemSeparator")
                .and_then(Value::as_str)
                .map(str::to_string),
            value_from: map
                .get("valueFrom")
                .and_then(Value::as_str)
                .map(str::to_string),
            shell_quote: map.get("shellQuote").and_then(Value::as_bool).unwrap_or(true),
        }
    }

    fn parse_link_merge(&mut self, body: &Value, path: &str) -> Option<LinkMerge> {
        match body.get("linkMerge").and_then(Value::as_str) {
            None => None,
            Some("merge_nested") => Some(LinkMerge::MergeNested),
            Some("merge_flattened") => Some(LinkMerge::MergeFlattened),
            Some(other) => {
                self.err(&join(path, "linkMerge"), format!("unknown policy '{}'", other));
                None
            }
        }
    }

    fn parse_pick_value(&mut self, body: &Value, path: &str) -> Option<PickValue> {
        match body.get("pickValue").and_then(Value::as_str) {
            None => None,
            Some("first_non_null") => Some(PickValue::FirstNonNull),
            Some("the_only_non_null") => Some(PickValue::TheOnlyNonNull),
            Some("all_non_null") => Some(PickValue::AllNonNull),
            Some(other) => {
                self.err(&join(path, "pickValue"), format!("unknown policy '{}'", other));
                None
            }
        }
    }

    fn parse_type_field(&mut self, body: &Value, path: &str) -> Option<CwlType> {
        match body.get("type") {
            Some(t) => self.parse_type(t, &join(path, "type")),
            None => {
                self.err(path, "missing required field 'type'");
                None
            }
        }
    }

    /// Canonicalize every CWL type spelling into one representation.
    fn parse_type(&mut self, value: &Value, path: &str) -> Option<CwlType> {
        match value {
            Value::String(s) => Some(self.parse_type_name(s)),
            Value::Array(members) => {
                // Union syntax; the supported shape is the null-union
                // (optional marker). Wider unions degrade to Any.
                let mut nullable = false;
                let mut others = Vec::new();
                for member in members {
                    match self.parse_type(member, path) {
                        Some(CwlType::Null) => nullable = true,
                        Some(t) => others.push(t),
                        None => return None,
                    }
                }
                let inner = match others.len() {
                    0 => CwlType::Null,
                    1 => others.pop().unwrap(),
                    _ => CwlType::Any,
                };
                Some(if nullable {
                    CwlType::Optional(Box::new(inner))
                } else {
                    inner
                })
            }
            Value::Object(map) => {
                let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
                match kind {
                    "array" => {
                        let items = map.get("items").or_else(|| {
                            self.err(path, "array type missing 'items'");
                            None
                        })?;
                        let inner = self.parse_type(items, path)?;
                        Some(CwlType::Array(Box::new(inner)))
                    }
                    "record" => {
                        let mut fields = Vec::new();
                        for (name, field_body, entry_path) in
                            id_entries(map.get("fields"), &join(path, "fields"), "type", self)
                        {
                            let r#type = self.parse_type_field(&field_body, &entry_path)?;
                            let binding = field_body
                                .get("inputBinding")
                                .map(|b| self.parse_input_binding(b, &entry_path));
                            fields.push(RecordField { name, r#type, binding });
                        }
                        Some(CwlType::Record { fields })
                    }
                    "enum" => {
                        let symbols = string_or_list(map.get("symbols"))
                            .into_iter()
                            .map(|s| strip_fragment(&s).rsplit('/').next().unwrap_or(&s).to_string())
                            .collect();
                        Some(CwlType::Enum { symbols })
                    }
                    other => {
                        self.err(path, format!("unsupported type '{}'", other));
                        None
                    }
                }
            }
            _ => {
                self.err(path, "unrecognized type syntax");
                None
            }
        }
    }

    fn parse_type_name(&mut self, name: &str) -> CwlType {
        if let Some(base) = name.strip_suffix('?') {
            return CwlType::Optional(Box::new(self.parse_type_name(base)));
        }
        if let Some(base) = name.strip_suffix("[]") {
            return CwlType::Array(Box::new(self.parse_type_name(base)));
        }
        match name {
            "null" => CwlType::Null,
            "boolean" => CwlType::Boolean,
            "int" => CwlType::Int,
            "long" => CwlType::Long,
            "float" => CwlType::Float,
            "double" => CwlType::Double,
            "string" => CwlType::String,
            "File" => CwlType::File,
            "Directory" => CwlType::Directory,
            "Any" => CwlType::Any,
            "stdout" => CwlType::Stdout,
            "stderr" => CwlType::Stderr,
            other => CwlType::Named(strip_fragment(other).to_string()),
        }
    }

    /// Collect raw requirement entries keyed by class, from both list and
    /// map syntax. Unknown requirement classes are hard errors; hints pass
    /// through the same shapes but unknown ones are ignored.
    fn raw_requirements(&mut self, map: &Map<String, Value>, path: &str) -> Map<String, Value> {
        let mut merged = Map::new();
        for (field, strict) in [("requirements", true), ("hints", false)] {
            let Some(value) = map.get(field) else { continue };
            let entries: Vec<(String, Value)> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| {
                        let class = item.get("class").and_then(Value::as_str)?;
                        Some((class.to_string(), item.clone()))
                    })
                    .collect(),
                Value::Object(m) => m
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                _ => {
                    self.err(&join(path, field), "must be a list or a mapping");
                    Vec::new()
                }
            };
            for (class, body) in entries {
                if KNOWN_REQUIREMENTS.contains(&class.as_str()) || class == ENGINE_HINT_CLASS {
                    merged.insert(class, body);
                } else if strict {
                    self.err(
                        &join(path, field),
                        format!("unsupported requirement '{}'", class),
                    );
                }
                // unknown hints are ignored
            }
        }
        merged
    }

    /// Build the typed requirement set from merged raw entries.
    fn build_requirements(&mut self, raw: &Map<String, Value>, path: &str) -> Requirements {
        let mut reqs = Requirements::default();
        for (class, body) in raw {
            match class.as_str() {
                "DockerRequirement" => {
                    let image = body
                        .get("dockerPull")
                        .or_else(|| body.get("dockerImageId"))
                        .and_then(Value::as_str);
                    match image {
                        Some(image) => {
                            reqs.docker = Some(DockerRequirement {
                                docker_pull: image.to_string(),
                            })
                        }
                        None => self.err(path, "DockerRequirement: missing dockerPull"),
                    }
                }
                "InlineJavascriptRequirement" => reqs.inline_javascript = true,
                "EnvVarRequirement" => match body.get("envDef") {
                    Some(Value::Object(defs)) => {
                        for (name, v) in defs {
                            reqs.env.push(EnvDef {
                                name: name.clone(),
                                value: v.as_str().unwrap_or_default().to_string(),
                            });
                        }
                    }
                    Some(Value::Array(items)) => {
                        for item in items {
                            let name = item
                                .get("envName")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            if name.is_empty() {
                                self.err(&join(path, "envDef"), "entry missing 'envName'");
                                continue;
                            }
                            let value = item
                                .get("envValue")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            reqs.env.push(EnvDef { name, value });
                        }
                    }
                    _ => self.err(path, "EnvVarRequirement: missing envDef"),
                },
                "ResourceRequirement" => {
                    reqs.resource = Some(ResourceRequirement {
                        cores_min: body.get("coresMin").cloned(),
                        ram_min: body.get("ramMin").cloned(),
                    });
                }
                "InitialWorkDirRequirement" => {
                    if let Some(listing) = body.get("listing").and_then(Value::as_array) {
                        for item in listing {
                            match item {
                                Value::Object(m) if m.contains_key("entry") => {
                                    reqs.initial_work_dir.push(WorkDirEntry {
                                        entryname: m
                                            .get("entryname")
                                            .and_then(Value::as_str)
                                            .map(str::to_string),
                                        entry: m.get("entry").cloned().unwrap_or(Value::Null),
                                        writable: m
                                            .get("writable")
                                            .and_then(Value::as_bool)
                                            .unwrap_or(false),
                                    });
                                }
                                other => reqs.initial_work_dir.push(WorkDirEntry {
                                    entryname: None,
                                    entry: other.clone(),
                                    writable: false,
                                }),
                            }
                        }
                    }
                }
                "ShellCommandRequirement" => reqs.shell_command = true,
                "ToolTimeLimit" => reqs.time_limit = body.get("timelimit").cloned(),
                "NetworkAccess" => {
                    reqs.network_access = body
                        .get("networkAccess")
                        .and_then(Value::as_bool)
                        .unwrap_or(true)
                }
                "SchemaDefRequirement" => {
                    if let Some(types) = body.get("types").and_then(Value::as_array) {
                        for (i, t) in types.iter().enumerate() {
                            let entry_path = format!("{}[{}]", join(path, "types"), i);
                            let name = t
                                .get("name")
                                .and_then(Value::as_str)
                                .map(strip_fragment)
                                .unwrap_or_default()
                                .to_string();
                            if name.is_empty() {
                                self.err(&entry_path, "schema def missing 'name'");
                                continue;
                            }
                            if let Some(r#type) = self.parse_type(t, &entry_path) {
                                reqs.schema_defs.push(SchemaDef { name, r#type });
                            }
                        }
                    }
                }
                "SubworkflowFeatureRequirement" => reqs.subworkflow = true,
                "ScatterFeatureRequirement" => reqs.scatter = true,
                "MultipleInputFeatureRequirement" => reqs.multiple_input = true,
                "StepInputExpressionRequirement" => reqs.step_input_expression = true,
                // Accepted but carrying no engine behavior.
                "LoadListingRequirement" | "WorkReuse" => {}
                ENGINE_HINT_CLASS => {}
                other => self.err(path, format!("unsupported requirement '{}'", other)),
            }
        }
        reqs
    }

    /// Extract the engine's private hint namespace from a process or step.
    fn engine_hints(&mut self, map: &Map<String, Value>) -> EngineHints {
        let mut hints = EngineHints::default();
        let Some(value) = map.get("hints") else {
            return hints;
        };
        let body = match value {
            Value::Array(items) => items
                .iter()
                .find(|i| i.get("class").and_then(Value::as_str) == Some(ENGINE_HINT_CLASS))
                .cloned(),
            Value::Object(m) => m.get(ENGINE_HINT_CLASS).cloned(),
            _ => None,
        };
        if let Some(Value::Object(m)) = body {
            hints.bvbrc_app_id = get_either(&m, "bvbrc_app_id", "bvbrcAppId");
            hints.executor = m.get("executor").and_then(Value::as_str).map(str::to_string);
            hints.worker_group = get_either(&m, "worker_group", "workerGroup");
        }
        hints
    }
}

const ENGINE_HINT_CLASS: &str = "roweHint";

const KNOWN_REQUIREMENTS: &[&str] = &[
    "DockerRequirement",
    "InlineJavascriptRequirement",
    "InitialWorkDirRequirement",
    "EnvVarRequirement",
    "ResourceRequirement",
    "SubworkflowFeatureRequirement",
    "ScatterFeatureRequirement",
    "MultipleInputFeatureRequirement",
    "StepInputExpressionRequirement",
    "SchemaDefRequirement",
    "ShellCommandRequirement",
    "ToolTimeLimit",
    "NetworkAccess",
    "LoadListingRequirement",
    "WorkReuse",
];

fn merge_requirements(
    inherited: &Map<String, Value>,
    own: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = inherited.clone();
    for (k, v) in own {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn get_either(map: &Map<String, Value>, a: &str, b: &str) -> Option<String> {
    map.get(a)
        .or_else(|| map.get(b))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

/// A field that may be one string or a list of strings.
fn string_or_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn int_list(value: Option<&Value>) -> Vec<i32> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_i64)
            .map(|i| i as i32)
            .collect(),
        Some(Value::Number(n)) => n.as_i64().map(|i| vec![i as i32]).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Iterate an id-keyed field in either of CWL's two spellings: a map from id
/// to body, or a list of bodies each carrying an `id`. A map value that is
/// not itself an object is shorthand for `{<shorthand_key>: <value>}` —
/// `inputs: {message: string}` means `{type: string}`, while
/// `in: {file: text}` means `{source: text}`. Returns `(id, body, path)`
/// triples.
fn id_entries(
    value: Option<&Value>,
    path: &str,
    shorthand_key: &str,
    n: &mut Normalizer,
) -> Vec<(String, Value, String)> {
    let mut out = Vec::new();
    match value {
        None => {}
        Some(Value::Object(map)) => {
            for (id, body) in map {
                let body = match body {
                    Value::Object(_) => body.clone(),
                    other => {
                        let mut m = Map::new();
                        m.insert(shorthand_key.to_string(), other.clone());
                        Value::Object(m)
                    }
                };
                out.push((
                    strip_fragment(id).to_string(),
                    body,
                    format!("{}.{}", path, strip_fragment(id)),
                ));
            }
        }
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                match item.as_object().and_then(|m| m.get("id")).and_then(Value::as_str) {
                    Some(id) => {
                        let id = strip_fragment(id).rsplit('/').next().unwrap_or(id).to_string();
                        out.push((id.clone(), item.clone(), format!("{}.{}", path, id)));
                    }
                    None => n.err(&format!("{}[{}]", path, i), "entry missing 'id'"),
                }
            }
        }
        Some(_) => n.err(path, "must be a list or a mapping"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_shorthands_canonicalize() {
        let mut n = Normalizer::default();
        assert_eq!(
            n.parse_type(&Value::String("string?".into()), "t"),
            Some(CwlType::Optional(Box::new(CwlType::String)))
        );
        assert_eq!(
            n.parse_type(&Value::String("File[]".into()), "t"),
            Some(CwlType::Array(Box::new(CwlType::File)))
        );
        assert_eq!(
            n.parse_type(&Value::String("string[]?".into()), "t"),
            Some(CwlType::Optional(Box::new(CwlType::Array(Box::new(
                CwlType::String
            )))))
        );
        let long_form = serde_json::json!({"type": "array", "items": "int"});
        assert_eq!(
            n.parse_type(&long_form, "t"),
            Some(CwlType::Array(Box::new(CwlType::Int)))
        );
        let null_union = serde_json::json!(["null", "File"]);
        assert_eq!(
            n.parse_type(&null_union, "t"),
            Some(CwlType::Optional(Box::new(CwlType::File)))
        );
        assert!(n.errors.is_empty());
    }

    #[test]
    fn unknown_requirement_is_an_error_but_unknown_hint_is_not() {
        let doc = serde_json::json!({
            "requirements": [{"class": "FrobnicateRequirement"}],
            "hints": [{"class": "SomeVendorHint"}],
        });
        let mut n = Normalizer::default();
        n.raw_requirements(doc.as_object().unwrap(), "tool");
        assert_eq!(n.errors.len(), 1);
        assert!(n.errors[0].contains("FrobnicateRequirement"));
    }

    #[test]
    fn run_path_reference_is_a_bundling_defect() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs: []
outputs: []
steps:
  fetch:
    run: tools/fetch.cwl
    in: {}
    out: []
"#;
        let value = load(doc).unwrap();
        let errors = normalize_document(&value).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("packed")), "{:?}", errors);
    }

    #[test]
    fn workflow_requirements_inherit_into_steps() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
requirements:
  EnvVarRequirement:
    envDef:
      LANG: C
inputs: []
outputs: []
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
        let value = load(doc).unwrap();
        let spec = normalize_document(&value).unwrap();
        match &spec.steps[0].run {
            Process::Tool(tool) => {
                assert_eq!(tool.requirements.env.len(), 1);
                assert_eq!(tool.requirements.env[0].name, "LANG");
                assert_eq!(tool.requirements.env[0].value, "C");
            }
            other => panic!("expected tool, got {:?}", other),
        }
    }
}
