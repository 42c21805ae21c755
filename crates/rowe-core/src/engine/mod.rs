//! The CWL execution engine.
//!
//! One call runs one tool invocation end-to-end in an isolated working
//! directory: build the runtime, stage inputs, materialize the initial work
//! dir, build the command line, run it (directly or in a container),
//! classify the exit, collect outputs, and stage them out. The in-process
//! executors and remote workers share this engine, so a tool behaves
//! identically wherever it lands.

pub mod outputs;
pub mod runtime;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::cwl::{Process, Requirements, Tool};
use crate::error::TaskFailure;
use crate::expression::{self, ExprContext};
use crate::stager::Stager;

use runtime::{ContainerSpec, ExecRequest};

/// How much of each captured stream is kept on the task record.
const LOG_TAIL_LIMIT: u64 = 64 * 1024;

/// Capture filenames used when the tool does not name its own. Hidden so
/// output globs cannot pick them up by accident.
const DEFAULT_STDOUT: &str = ".rowe.stdout";
const DEFAULT_STDERR: &str = ".rowe.stderr";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-task working directories are created under here.
    pub work_base: PathBuf,
    pub container_binary: String,
    pub gpus: bool,
    pub default_cores: i64,
    pub default_ram_mb: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            work_base: std::env::temp_dir().join("rowe-work"),
            container_binary: "docker".to_string(),
            gpus: false,
            default_cores: 1,
            default_ram_mb: 1024,
        }
    }
}

/// Which runtime actually executes the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Local,
    Container,
}

/// The result of one finished attempt. `failure` is set when the attempt
/// reached the point of producing logs but did not succeed; earlier
/// failures (staging, expressions) surface as `Err` from [`ToolRunner::run`].
#[derive(Debug)]
pub struct ToolOutcome {
    pub outputs: Map<String, Value>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<TaskFailure>,
}

pub struct ToolRunner {
    stager: Arc<dyn Stager>,
    config: RunnerConfig,
}

impl ToolRunner {
    pub fn new(stager: Arc<dyn Stager>, config: RunnerConfig) -> Self {
        Self { stager, config }
    }

    /// Run one process invocation in `<work_base>/<task_id>`.
    pub async fn run(
        &self,
        process: &Process,
        job: &Map<String, Value>,
        task_id: &str,
        kind: RuntimeKind,
        stage_out_to: Option<&str>,
    ) -> Result<ToolOutcome, TaskFailure> {
        match process {
            Process::Tool(tool) => self.run_tool(tool, job, task_id, kind, stage_out_to).await,
            Process::Expression(expr_tool) => {
                let work_dir = self.prepare_work_dir(task_id)?;
                let mut staged = job.clone();
                self.stage_job(&mut staged, &work_dir.inputs).await?;
                let ctx = ExprContext::new(Value::Object(staged), Value::Null, true);
                let result = expression::evaluate(&expr_tool.expression, &ctx)?;
                let outputs = match result {
                    Value::Object(map) => map,
                    other => {
                        return Err(TaskFailure::Expression {
                            expr: expr_tool.expression.clone(),
                            message: format!("expression tool returned non-object: {}", other),
                        })
                    }
                };
                Ok(ToolOutcome {
                    outputs,
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    failure: None,
                })
            }
            Process::Workflow(spec) => {
                self.run_subworkflow(spec, job, task_id, kind, stage_out_to).await
            }
        }
    }

    async fn run_tool(
        &self,
        tool: &Tool,
        job: &Map<String, Value>,
        task_id: &str,
        kind: RuntimeKind,
        stage_out_to: Option<&str>,
    ) -> Result<ToolOutcome, TaskFailure> {
        let reqs = &tool.requirements;
        let work_dir = self.prepare_work_dir(task_id)?;

        // 1. Stage inputs; every File gets path/basename/size/checksum
        //    before any expression can see it.
        let mut staged = job.clone();
        self.stage_job(&mut staged, &work_dir.inputs).await?;
        for input in &tool.inputs {
            if input.load_contents {
                if let Some(Value::Object(file)) = staged.get_mut(&input.id) {
                    outputs::load_contents(file)?;
                }
            }
        }

        // 2. Runtime scope. Resource expressions see inputs only.
        let inputs_value = Value::Object(staged.clone());
        let resource_ctx =
            ExprContext::new(inputs_value.clone(), Value::Null, reqs.inline_javascript);
        let cores = self.eval_resource(
            reqs.resource.as_ref().and_then(|r| r.cores_min.as_ref()),
            &resource_ctx,
            self.config.default_cores,
        )?;
        let ram = self.eval_resource(
            reqs.resource.as_ref().and_then(|r| r.ram_min.as_ref()),
            &resource_ctx,
            self.config.default_ram_mb,
        )?;
        let runtime_scope = serde_json::json!({
            "cores": cores,
            "ram": ram,
            "outdir": work_dir.outdir.display().to_string(),
            "tmpdir": work_dir.tmpdir.display().to_string(),
            "outdirSize": 4096,
            "tmpdirSize": 4096,
        });
        let ctx = ExprContext::new(inputs_value, runtime_scope.clone(), reqs.inline_javascript);

        // 3. Initial working directory entries materialize into outdir.
        self.apply_initial_work_dir(reqs, &work_dir.outdir, &ctx).await?;

        // 4. Command line.
        let parts = crate::cmdline::build(tool, &ctx)?;

        // 5. Execution request.
        let env = self.build_env(reqs, &work_dir, &ctx)?;
        let stdin = match &tool.stdin {
            Some(expr) => {
                let path = expression::evaluate(expr, &ctx)?;
                match path {
                    Value::Null => None,
                    other => Some(resolve_in_dir(
                        &expression::coerce_string(&other),
                        &work_dir.outdir,
                    )),
                }
            }
            None => None,
        };
        let stdout_name = self.capture_name(&tool.stdout, DEFAULT_STDOUT, &ctx)?;
        let stderr_name = self.capture_name(&tool.stderr, DEFAULT_STDERR, &ctx)?;

        let timeout_secs = match &reqs.time_limit {
            Some(limit) => {
                let value = expression::evaluate_value(limit, &ctx)?;
                value.as_i64().filter(|v| *v > 0).map(|v| v as u64)
            }
            None => None,
        };

        let container = match kind {
            RuntimeKind::Container => {
                let image = reqs
                    .docker
                    .as_ref()
                    .map(|d| d.docker_pull.clone())
                    .ok_or_else(|| TaskFailure::Exec {
                        message: "container runtime selected but no DockerRequirement image"
                            .to_string(),
                        transient: false,
                    })?;
                Some(ContainerSpec {
                    binary: self.config.container_binary.clone(),
                    image,
                    gpus: self.config.gpus,
                    network: reqs.network_access,
                })
            }
            RuntimeKind::Local => None,
        };

        let request = ExecRequest {
            parts,
            shell: reqs.shell_command,
            env,
            work_dir: work_dir.root.clone(),
            cwd: work_dir.outdir.clone(),
            stdin,
            stdout: work_dir.outdir.join(&stdout_name),
            stderr: work_dir.outdir.join(&stderr_name),
            timeout_secs,
            container: container.clone(),
        };

        // 6. Run. Post-spawn failures keep their logs.
        let exit_code = match runtime::execute(&request).await {
            Ok(code) => code,
            Err(failure @ TaskFailure::Timeout { .. }) => {
                return Ok(ToolOutcome {
                    outputs: Map::new(),
                    exit_code: -1,
                    stdout: read_tail(&request.stdout),
                    stderr: read_tail(&request.stderr),
                    failure: Some(failure),
                });
            }
            Err(failure) => return Err(failure),
        };

        let stdout_tail = read_tail(&request.stdout);
        let stderr_tail = read_tail(&request.stderr);

        if let Some(failure) = classify_exit(tool, exit_code, container.is_some(), &stderr_tail) {
            return Ok(ToolOutcome {
                outputs: Map::new(),
                exit_code,
                stdout: stdout_tail,
                stderr: stderr_tail,
                failure: Some(failure),
            });
        }

        // 7. Collect outputs; exitCode joins the runtime scope here.
        let mut collect_runtime = runtime_scope;
        collect_runtime["exitCode"] = Value::Number(exit_code.into());
        let collect_ctx = ExprContext::new(
            Value::Object(staged),
            collect_runtime,
            reqs.inline_javascript,
        );
        let mut collected = match outputs::collect(
            tool,
            &work_dir.outdir,
            &stdout_name,
            &stderr_name,
            &collect_ctx,
        ) {
            Ok(map) => map,
            Err(failure) => {
                return Ok(ToolOutcome {
                    outputs: Map::new(),
                    exit_code,
                    stdout: stdout_tail,
                    stderr: stderr_tail,
                    failure: Some(failure),
                })
            }
        };

        // 8. Stage out.
        if let Some(dest) = stage_out_to {
            for value in collected.values_mut() {
                if let Err(failure) = self.stage_out_value(value, dest).await {
                    return Ok(ToolOutcome {
                        outputs: Map::new(),
                        exit_code,
                        stdout: stdout_tail,
                        stderr: stderr_tail,
                        failure: Some(failure),
                    });
                }
            }
        }

        Ok(ToolOutcome {
            outputs: collected,
            exit_code,
            stdout: stdout_tail,
            stderr: stderr_tail,
            failure: None,
        })
    }

    /// Drive a subworkflow in place: its steps run through this same engine
    /// in topological order, one at a time, under derived task ids.
    fn run_subworkflow<'a>(
        &'a self,
        spec: &'a crate::cwl::WorkflowSpec,
        job: &'a serde_json::Map<String, Value>,
        task_id: &'a str,
        kind: RuntimeKind,
        stage_out_to: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutcome, TaskFailure>> + Send + 'a>> {
        use crate::scheduler::inputs;

        Box::pin(async move {
            let inline_js = spec.requirements.inline_javascript;
            let wf_inputs = crate::scheduler::apply_input_defaults(spec, job);
            let mut step_outputs: std::collections::HashMap<String, serde_json::Map<String, Value>> =
                std::collections::HashMap::new();
            // steps whose `when` guard evaluated false propagate nulls
            let mut skipped: std::collections::HashSet<String> = std::collections::HashSet::new();

            for step_id in &spec.topo_order {
                let step = spec.step(step_id).ok_or_else(|| TaskFailure::Exec {
                    message: format!("subworkflow step '{}' missing from spec", step_id),
                    transient: false,
                })?;
                let step_inline =
                    inline_js || step.run.requirements().inline_javascript;

                let upstream = |from: &str, out: &str| -> Option<Value> {
                    step_outputs.get(from).and_then(|o| o.get(out).cloned())
                };

                let pre = inputs::resolve_sources(step, &wf_inputs, &upstream)?;

                if let Some(when) = &step.when {
                    let ctx =
                        ExprContext::new(Value::Object(pre.clone()), Value::Null, step_inline);
                    let value = expression::evaluate(when, &ctx)?;
                    if matches!(value, Value::Null | Value::Bool(false)) {
                        skipped.insert(step.id.clone());
                        continue;
                    }
                }

                let step_kind = if step.run.requirements().docker.is_some() {
                    RuntimeKind::Container
                } else {
                    kind
                };

                // run one element, or every scatter element in order
                let run_one = |element_job: serde_json::Map<String, Value>, suffix: String| {
                    let child_id = format!("{}/{}{}", task_id, step.id, suffix);
                    async move {
                        let outcome = self
                            .run(&step.run, &element_job, &child_id, step_kind, None)
                            .await?;
                        match outcome.failure {
                            Some(failure) => Err(failure),
                            None => Ok(outcome.outputs),
                        }
                    }
                };

                if step.scatter.is_empty() {
                    let job = inputs::apply_value_from(step, &pre, step_inline)?;
                    if !inputs::missing_required(step, &job).is_empty() {
                        skipped.insert(step.id.clone());
                        continue;
                    }
                    let outputs = run_one(job, String::new()).await?;
                    step_outputs.insert(step.id.clone(), outputs);
                } else {
                    let mut lists: Vec<(String, Vec<Value>)> = Vec::new();
                    for name in &step.scatter {
                        let items = pre
                            .get(name)
                            .and_then(Value::as_array)
                            .cloned()
                            .ok_or_else(|| TaskFailure::Expression {
                                expr: format!("scatter({})", name),
                                message: "scattered input did not resolve to an array".to_string(),
                            })?;
                        lists.push((name.clone(), items));
                    }
                    let method = step
                        .scatter_method
                        .unwrap_or(crate::cwl::ScatterMethod::Dotproduct);
                    let elements = crate::scheduler::scatter::expand(method, &lists)?;
                    let dims: Vec<usize> = lists.iter().map(|(_, v)| v.len()).collect();

                    let mut per_output: std::collections::HashMap<String, Vec<Value>> =
                        std::collections::HashMap::new();
                    for (index, overrides) in elements.into_iter().enumerate() {
                        let mut merged = pre.clone();
                        for (key, value) in overrides {
                            merged.insert(key, value);
                        }
                        let job = inputs::apply_value_from(step, &merged, step_inline)?;
                        let outputs = run_one(job, format!("_{}", index)).await?;
                        for out in &step.outputs {
                            per_output
                                .entry(out.clone())
                                .or_default()
                                .push(outputs.get(out).cloned().unwrap_or(Value::Null));
                        }
                    }
                    let mut gathered = serde_json::Map::new();
                    for out in &step.outputs {
                        let values = per_output.remove(out).unwrap_or_default();
                        gathered.insert(
                            out.clone(),
                            crate::scheduler::scatter::gather(method, &dims, values),
                        );
                    }
                    step_outputs.insert(step.id.clone(), gathered);
                }
            }

            // workflow outputs from outputSource
            let mut outputs = serde_json::Map::new();
            for out in &spec.outputs {
                let upstream = |from: &str, out_id: &str| -> Option<Value> {
                    step_outputs.get(from).and_then(|o| o.get(out_id).cloned())
                };
                let values: Vec<Value> = out
                    .output_source
                    .iter()
                    .map(|s| inputs::resolve_source(s, &wf_inputs, &upstream))
                    .collect();
                let mut value = if out.output_source.len() == 1 && out.link_merge.is_none() {
                    values.into_iter().next().unwrap_or(Value::Null)
                } else {
                    inputs::link_merge(values, out.link_merge)
                };
                if let Some(policy) = out.pick_value {
                    value = inputs::pick_value(value, policy, &out.id)?;
                }
                outputs.insert(out.id.clone(), value);
            }

            if !skipped.is_empty() {
                tracing::debug!(
                    "subworkflow {} skipped step(s): {:?}",
                    spec.id,
                    skipped
                );
            }

            let mut outcome = ToolOutcome {
                outputs,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                failure: None,
            };
            if let Some(dest) = stage_out_to {
                for value in outcome.outputs.values_mut() {
                    self.stage_out_value(value, dest).await?;
                }
            }
            Ok(outcome)
        })
    }

    fn prepare_work_dir(&self, task_id: &str) -> Result<WorkDirs, TaskFailure> {
        let root = self.config.work_base.join(task_id);
        let dirs = WorkDirs {
            outdir: root.join("outdir"),
            tmpdir: root.join("tmpdir"),
            inputs: root.join("inputs"),
            root,
        };
        for dir in [&dirs.outdir, &dirs.tmpdir, &dirs.inputs] {
            std::fs::create_dir_all(dir).map_err(|e| TaskFailure::Exec {
                message: format!("create '{}': {}", dir.display(), e),
                transient: true,
            })?;
        }
        Ok(dirs)
    }

    fn eval_resource(
        &self,
        value: Option<&Value>,
        ctx: &ExprContext,
        default: i64,
    ) -> Result<i64, TaskFailure> {
        match value {
            None => Ok(default),
            Some(v) => {
                let evaluated = expression::evaluate_value(v, ctx)?;
                Ok(evaluated
                    .as_i64()
                    .or_else(|| evaluated.as_f64().map(|f| f.ceil() as i64))
                    .unwrap_or(default))
            }
        }
    }

    fn capture_name(
        &self,
        declared: &Option<String>,
        fallback: &str,
        ctx: &ExprContext,
    ) -> Result<String, TaskFailure> {
        match declared {
            Some(expr) => {
                let value = expression::evaluate(expr, ctx)?;
                Ok(expression::coerce_string(&value))
            }
            None => Ok(fallback.to_string()),
        }
    }

    fn build_env(
        &self,
        reqs: &Requirements,
        work_dir: &WorkDirs,
        ctx: &ExprContext,
    ) -> Result<Vec<(String, String)>, TaskFailure> {
        let mut env = vec![
            ("HOME".to_string(), work_dir.outdir.display().to_string()),
            ("TMPDIR".to_string(), work_dir.tmpdir.display().to_string()),
        ];
        for def in &reqs.env {
            let value = expression::evaluate(&def.value, ctx)?;
            env.push((def.name.clone(), expression::coerce_string(&value)));
        }
        Ok(env)
    }

    async fn apply_initial_work_dir(
        &self,
        reqs: &Requirements,
        outdir: &Path,
        ctx: &ExprContext,
    ) -> Result<(), TaskFailure> {
        for entry in &reqs.initial_work_dir {
            let name = match &entry.entryname {
                Some(expr) => {
                    let value = expression::evaluate(expr, ctx)?;
                    Some(expression::coerce_string(&value))
                }
                None => None,
            };
            let resolved = match &entry.entry {
                Value::String(expr) => expression::evaluate(expr, ctx)?,
                other => other.clone(),
            };
            match resolved {
                Value::Object(map)
                    if matches!(
                        map.get("class").and_then(Value::as_str),
                        Some("File") | Some("Directory")
                    ) =>
                {
                    let source = map
                        .get("path")
                        .and_then(Value::as_str)
                        .ok_or_else(|| TaskFailure::Staging {
                            message: "initial work dir entry references an unstaged file"
                                .to_string(),
                            transient: false,
                        })?;
                    let source = PathBuf::from(source);
                    let target_name = name.unwrap_or_else(|| {
                        map.get("basename")
                            .and_then(Value::as_str)
                            .unwrap_or("entry")
                            .to_string()
                    });
                    let target = outdir.join(target_name);
                    place_file(&source, &target, entry.writable).map_err(|e| {
                        TaskFailure::Staging {
                            message: format!("initial work dir '{}': {}", target.display(), e),
                            transient: false,
                        }
                    })?;
                }
                other => {
                    let name = name.ok_or_else(|| TaskFailure::Exec {
                        message: "initial work dir literal entry requires an entryname"
                            .to_string(),
                        transient: false,
                    })?;
                    let text = match other {
                        Value::String(s) => s,
                        value => value.to_string(),
                    };
                    std::fs::write(outdir.join(&name), text).map_err(|e| TaskFailure::Exec {
                        message: format!("initial work dir '{}': {}", name, e),
                        transient: false,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Stage every File/Directory in the job in place: the staged path and
    /// metadata replace what the submission carried.
    fn stage_job<'a>(
        &'a self,
        job: &'a mut Map<String, Value>,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send + 'a>> {
        Box::pin(async move {
            for value in job.values_mut() {
                self.stage_value(value, dest).await?;
            }
            Ok(())
        })
    }

    fn stage_value<'a>(
        &'a self,
        value: &'a mut Value,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    for item in items {
                        self.stage_value(item, dest).await?;
                    }
                }
                Value::Object(map) => {
                    match map.get("class").and_then(Value::as_str) {
                        Some("File") => self.stage_file(map, dest).await?,
                        Some("Directory") => {
                            let location = map
                                .get("location")
                                .or_else(|| map.get("path"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .ok_or_else(|| TaskFailure::Staging {
                                    message: "Directory value has no location".to_string(),
                                    transient: false,
                                })?;
                            let staged = self.stager.stage_in(&location, dest).await?;
                            let staged_value = outputs::directory_value(&staged);
                            for key in ["path", "basename"] {
                                map.insert(key.to_string(), staged_value[key].clone());
                            }
                        }
                        _ => {
                            for nested in map.values_mut() {
                                self.stage_value(nested, dest).await?;
                            }
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn stage_file(
        &self,
        map: &mut Map<String, Value>,
        dest: &Path,
    ) -> Result<(), TaskFailure> {
        let location = map
            .get("location")
            .or_else(|| map.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let staged = match location {
            Some(location) => self.stager.stage_in(&location, dest).await?,
            None => {
                // literal file: contents with no location
                let contents = map
                    .get("contents")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TaskFailure::Staging {
                        message: "File value has neither location nor contents".to_string(),
                        transient: false,
                    })?;
                let name = map
                    .get("basename")
                    .and_then(Value::as_str)
                    .unwrap_or("literal")
                    .to_string();
                let path = dest.join(name);
                std::fs::write(&path, contents).map_err(|e| TaskFailure::Staging {
                    message: format!("write '{}': {}", path.display(), e),
                    transient: false,
                })?;
                path
            }
        };

        let staged_value = outputs::file_value(&staged)?;
        for key in ["path", "basename", "nameroot", "nameext", "size", "checksum"] {
            map.insert(key.to_string(), staged_value[key].clone());
        }
        map.entry("location".to_string())
            .or_insert_with(|| staged_value["location"].clone());
        Ok(())
    }

    fn stage_out_value<'a>(
        &'a self,
        value: &'a mut Value,
        dest: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    for item in items {
                        self.stage_out_value(item, dest).await?;
                    }
                }
                Value::Object(map) => {
                    if map.get("class").and_then(Value::as_str) == Some("File") {
                        let (path, basename) = match (
                            map.get("path").and_then(Value::as_str),
                            map.get("basename").and_then(Value::as_str),
                        ) {
                            (Some(p), Some(b)) => (PathBuf::from(p), b.to_string()),
                            _ => return Ok(()),
                        };
                        let uri = format!("{}/{}", dest.trim_end_matches('/'), basename);
                        let final_uri = self.stager.stage_out(&path, &uri).await?;
                        map.insert("location".to_string(), Value::String(final_uri));
                    } else {
                        for nested in map.values_mut() {
                            self.stage_out_value(nested, dest).await?;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }
}

struct WorkDirs {
    root: PathBuf,
    outdir: PathBuf,
    tmpdir: PathBuf,
    inputs: PathBuf,
}

/// Hard link into place when possible; copy when not, and always copy for
/// writable entries.
fn place_file(source: &Path, target: &Path, writable: bool) -> std::io::Result<()> {
    if target.exists() {
        std::fs::remove_file(target).ok();
    }
    if !writable && std::fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, target).map(|_| ())
}

/// A stdin/glob reference may be absolute or relative to the output dir.
fn resolve_in_dir(reference: &str, dir: &Path) -> PathBuf {
    let path = Path::new(reference);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

/// Tail of a capture file, capped so task rows stay bounded.
fn read_tail(path: &Path) -> String {
    use std::io::{Read, Seek, SeekFrom};

    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > LOG_TAIL_LIMIT {
        file.seek(SeekFrom::End(-(LOG_TAIL_LIMIT as i64))).ok();
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Map the exit code through the tool's code lists. None means success.
fn classify_exit(
    tool: &Tool,
    exit_code: i32,
    in_container: bool,
    stderr_tail: &str,
) -> Option<TaskFailure> {
    if tool.success_codes.contains(&exit_code) {
        return None;
    }
    if tool.temporary_fail_codes.contains(&exit_code) {
        return Some(TaskFailure::ExitCode {
            code: exit_code,
            transient: true,
        });
    }
    if tool.permanent_fail_codes.contains(&exit_code) {
        return Some(TaskFailure::ExitCode {
            code: exit_code,
            transient: false,
        });
    }
    if exit_code == 0 {
        return None;
    }
    // Container runtimes reserve 125 for "could not create the container".
    // A missing image will not heal on retry; infrastructure hiccups might.
    if in_container && exit_code == 125 {
        let permanent = stderr_tail.contains("not found")
            || stderr_tail.contains("pull access denied")
            || stderr_tail.contains("manifest unknown");
        return Some(TaskFailure::Exec {
            message: format!("container could not be created (exit {})", exit_code),
            transient: !permanent,
        });
    }
    Some(TaskFailure::ExitCode {
        code: exit_code,
        transient: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stager::{SchemeStager, StagingCredentials};

    fn runner(base: &Path) -> ToolRunner {
        ToolRunner::new(
            Arc::new(SchemeStager::new(StagingCredentials::default(), None)),
            RunnerConfig {
                work_base: base.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn echo_tool() -> Tool {
        Tool {
            id: "echo".to_string(),
            base_command: vec!["echo".to_string()],
            arguments: Vec::new(),
            inputs: vec![crate::cwl::ToolInput {
                id: "message".to_string(),
                r#type: crate::cwl::CwlType::String,
                default: None,
                binding: Some(crate::cwl::InputBinding {
                    position: Some(1),
                    ..Default::default()
                }),
                load_contents: false,
            }],
            outputs: vec![crate::cwl::ToolOutput {
                id: "out".to_string(),
                r#type: crate::cwl::CwlType::Stdout,
                binding: None,
            }],
            requirements: Default::default(),
            hints: Default::default(),
            stdin: None,
            stdout: Some("output.txt".to_string()),
            stderr: None,
            success_codes: Vec::new(),
            temporary_fail_codes: Vec::new(),
            permanent_fail_codes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn echo_produces_checked_stdout_file() {
        let base = tempfile::tempdir().unwrap();
        let runner = runner(base.path());
        let mut job = Map::new();
        job.insert("message".to_string(), Value::String("hello".to_string()));

        let outcome = runner
            .run(
                &Process::Tool(echo_tool()),
                &job,
                "t-echo",
                RuntimeKind::Local,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.failure.is_none());
        let out = &outcome.outputs["out"];
        assert_eq!(out["basename"], "output.txt");
        assert_eq!(
            out["checksum"],
            "sha1$f572d396fae9206628714fb2ce00f72e94f2258f"
        );
        assert_eq!(out["size"], 6);
    }

    #[tokio::test]
    async fn nonzero_exit_is_classified_and_keeps_logs() {
        let base = tempfile::tempdir().unwrap();
        let runner = runner(base.path());
        let mut tool = echo_tool();
        tool.base_command = vec!["sh".to_string()];
        tool.arguments = vec![crate::cwl::Argument {
            position: 0,
            prefix: Some("-c".to_string()),
            separate: true,
            shell_quote: true,
            value_from: "echo oops >&2; exit 3".to_string(),
        }];
        tool.inputs.clear();
        tool.outputs.clear();
        tool.stdout = None;

        let outcome = runner
            .run(
                &Process::Tool(tool),
                &Map::new(),
                "t-fail",
                RuntimeKind::Local,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.stderr.contains("oops"));
        match outcome.failure {
            Some(TaskFailure::ExitCode { code: 3, transient }) => assert!(!transient),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn temporary_fail_codes_mark_retryable() {
        let base = tempfile::tempdir().unwrap();
        let runner = runner(base.path());
        let mut tool = echo_tool();
        tool.base_command = vec!["sh".to_string(), "-c".to_string(), "exit 75".to_string()];
        tool.inputs.clear();
        tool.outputs.clear();
        tool.stdout = None;
        tool.temporary_fail_codes = vec![75];

        let outcome = runner
            .run(
                &Process::Tool(tool),
                &Map::new(),
                "t-retry",
                RuntimeKind::Local,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.failure.as_ref().unwrap().retryable());
    }

    #[tokio::test]
    async fn initial_work_dir_literal_is_visible_to_the_tool() {
        let base = tempfile::tempdir().unwrap();
        let runner = runner(base.path());
        let mut tool = echo_tool();
        tool.base_command = vec!["cat".to_string(), "config.ini".to_string()];
        tool.inputs.clear();
        tool.requirements.initial_work_dir = vec![crate::cwl::WorkDirEntry {
            entryname: Some("config.ini".to_string()),
            entry: Value::String("key=value".to_string()),
            writable: false,
        }];

        let outcome = runner
            .run(
                &Process::Tool(tool),
                &Map::new(),
                "t-iwdr",
                RuntimeKind::Local,
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.outputs["out"]["size"], 9);
    }
}
