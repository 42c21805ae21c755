//! End-to-end scheduler scenarios against the real local executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rowe_core::config::RoweConfig;
use rowe_core::cwl;
use rowe_core::db::Database;
use rowe_core::models::{Submission, SubmissionState, TaskState, Workflow};
use rowe_core::state::{AppState, AppStateInner};

fn test_state(work: &std::path::Path) -> AppState {
    let config = RoweConfig {
        work_dir: work.join("work").to_string_lossy().to_string(),
        default_max_retries: 2,
        tick_interval_ms: 20,
        ..Default::default()
    };
    let db = Database::open_in_memory().unwrap();
    Arc::new(AppStateInner::new(config, db).unwrap())
}

async fn register_and_submit(
    state: &AppState,
    cwl_text: &str,
    inputs: serde_json::Map<String, serde_json::Value>,
) -> (Workflow, Submission) {
    let parsed = cwl::parse_document(cwl_text, None).unwrap();
    let workflow = Workflow::new("test".to_string(), String::new(), cwl_text.to_string(), parsed);
    state.workflow_store.save(&workflow).await.unwrap();

    let submission = Submission::new(workflow.id.clone(), inputs, HashMap::new());
    state.submission_store.save(&submission).await.unwrap();
    state
        .scheduler
        .materialize_submission(&workflow, &submission)
        .await
        .unwrap();
    (workflow, submission)
}

async fn drive(state: &AppState, submission_id: &str, max_ticks: usize) -> Submission {
    for _ in 0..max_ticks {
        state.scheduler.tick().await.unwrap();
        let submission = state
            .submission_store
            .get(submission_id)
            .await
            .unwrap()
            .unwrap();
        if submission.state.is_terminal() {
            return submission;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("submission {} never settled", submission_id);
}

#[tokio::test]
async fn echo_single_step_completes_with_checked_output() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
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
    type: File
    outputBinding:
      glob: output.txt
      loadContents: true
stdout: output.txt
"#;
    let mut inputs = serde_json::Map::new();
    inputs.insert("message".to_string(), serde_json::json!("hello"));
    let (_, submission) = register_and_submit(&state, cwl_text, inputs).await;

    let done = drive(&state, &submission.id, 100).await;
    assert_eq!(done.state, SubmissionState::Completed);

    let outputs = done.outputs.unwrap();
    assert_eq!(outputs["out"]["contents"], "hello\n");
    assert_eq!(
        outputs["out"]["checksum"],
        "sha1$f572d396fae9206628714fb2ce00f72e94f2258f"
    );
}

#[tokio::test]
async fn pipeline_orders_count_before_report() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let data = dir.path().join("three-lines.txt");
    std::fs::write(&data, "a\nb\nc\n").unwrap();

    let cwl_text = r#"
cwlVersion: v1.2
class: Workflow
inputs:
  text: File
outputs:
  report:
    type: File
    outputSource: report/out
steps:
  count:
    run:
      class: CommandLineTool
      baseCommand: [wc, -l]
      inputs:
        file: File
      stdin: $(inputs.file.path)
      stdout: count.txt
      outputs:
        line_count:
          type: File
          outputBinding:
            glob: count.txt
    in:
      file:
        source: text
    out: [line_count]
  report:
    run:
      class: CommandLineTool
      baseCommand: [cat]
      inputs:
        counts:
          type: File
          inputBinding:
            position: 1
      stdout: report.txt
      outputs:
        out:
          type: File
          outputBinding:
            glob: report.txt
            loadContents: true
    in:
      counts:
        source: count/line_count
    out: [out]
"#;
    let mut inputs = serde_json::Map::new();
    inputs.insert(
        "text".to_string(),
        serde_json::json!({"class": "File", "location": format!("file://{}", data.display())}),
    );
    let (_, submission) = register_and_submit(&state, cwl_text, inputs).await;

    let done = drive(&state, &submission.id, 200).await;
    assert_eq!(done.state, SubmissionState::Completed, "{:?}", done.error);

    let outputs = done.outputs.unwrap();
    let contents = outputs["report"]["contents"].as_str().unwrap();
    assert_eq!(contents.trim(), "3");

    // the downstream task depends on the upstream task id and ran after it
    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    let count = tasks.iter().find(|t| t.step_id == "count").unwrap();
    let report = tasks.iter().find(|t| t.step_id == "report").unwrap();
    assert!(report.depends_on.contains(&count.id));
    assert!(report.started_at.unwrap() >= count.completed_at.unwrap() - chrono::Duration::milliseconds(5));
    assert_eq!(count.state, TaskState::Success);
    assert_eq!(report.state, TaskState::Success);
}

#[tokio::test]
async fn scatter_dotproduct_pairs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: Workflow
requirements:
  ScatterFeatureRequirement: {}
inputs:
  xs: int[]
  ys: int[]
outputs:
  pairs:
    type: File[]
    outputSource: combine/out
steps:
  combine:
    run:
      class: CommandLineTool
      baseCommand: [echo]
      arguments:
        - valueFrom: $(inputs.a)-$(inputs.b)
      inputs:
        a: int
        b: int
      stdout: pair.txt
      outputs:
        out:
          type: File
          outputBinding:
            glob: pair.txt
            loadContents: true
    scatter: [a, b]
    scatterMethod: dotproduct
    in:
      a:
        source: xs
      b:
        source: ys
    out: [out]
"#;
    let mut inputs = serde_json::Map::new();
    inputs.insert("xs".to_string(), serde_json::json!([1, 2, 3]));
    inputs.insert("ys".to_string(), serde_json::json!([10, 20, 30]));
    let (_, submission) = register_and_submit(&state, cwl_text, inputs).await;

    let done = drive(&state, &submission.id, 200).await;
    assert_eq!(done.state, SubmissionState::Completed, "{:?}", done.error);

    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    let children: Vec<_> = tasks.iter().filter(|t| t.scatter_index.is_some()).collect();
    assert_eq!(children.len(), 3, "dotproduct must pair, not cross");

    let outputs = done.outputs.unwrap();
    let pairs = outputs["pairs"].as_array().unwrap();
    assert_eq!(pairs.len(), 3);
    let contents: Vec<&str> = pairs
        .iter()
        .map(|p| p["contents"].as_str().unwrap().trim())
        .collect();
    assert_eq!(contents, vec!["1-10", "2-20", "3-30"]);
}

#[tokio::test]
async fn conditional_false_skips_step_and_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: Workflow
inputs:
  flag: boolean
outputs:
  result:
    type: File?
    outputSource: after/out
steps:
  maybe:
    run:
      class: CommandLineTool
      baseCommand: [echo, maybe-ran]
      inputs:
        flag: boolean
      stdout: maybe.txt
      outputs:
        out:
          type: File
          outputBinding:
            glob: maybe.txt
    when: $(inputs.flag)
    in:
      flag:
        source: flag
    out: [out]
  after:
    run:
      class: CommandLineTool
      baseCommand: [cat]
      inputs:
        upstream:
          type: File?
          inputBinding:
            position: 1
      stdout: after.txt
      outputs:
        out:
          type: File
          outputBinding:
            glob: after.txt
    in:
      upstream:
        source: maybe/out
    out: [out]
"#;
    let mut inputs = serde_json::Map::new();
    inputs.insert("flag".to_string(), serde_json::json!(false));
    let (_, submission) = register_and_submit(&state, cwl_text, inputs).await;

    let done = drive(&state, &submission.id, 100).await;
    assert_eq!(done.state, SubmissionState::Completed, "{:?}", done.error);

    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    let maybe = tasks.iter().find(|t| t.step_id == "maybe").unwrap();
    let after = tasks.iter().find(|t| t.step_id == "after").unwrap();
    assert_eq!(maybe.state, TaskState::Skipped);
    assert_eq!(after.state, TaskState::Skipped);
}

#[tokio::test]
async fn retry_budget_is_spent_before_final_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [sh, -c, "exit 75"]
inputs: []
outputs: []
temporaryFailCodes: [75]
"#;
    let (_, submission) = register_and_submit(&state, cwl_text, serde_json::Map::new()).await;

    let done = drive(&state, &submission.id, 300).await;
    assert_eq!(done.state, SubmissionState::Failed);
    assert!(done.error.is_some());

    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Failed);
    // default budget is two retries: three attempts total
    assert_eq!(tasks[0].retry_count, 2);
    assert_eq!(tasks[0].exit_code, Some(75));
}

#[tokio::test]
async fn subworkflow_step_runs_as_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: Workflow
requirements:
  SubworkflowFeatureRequirement: {}
inputs:
  word: string
outputs:
  shouted:
    type: File
    outputSource: inner/loud
steps:
  inner:
    run:
      class: Workflow
      inputs:
        text: string
      outputs:
        loud:
          type: File
          outputSource: shout/out
      steps:
        shout:
          run:
            class: CommandLineTool
            baseCommand: [echo]
            inputs:
              text:
                type: string
                inputBinding:
                  position: 1
            stdout: loud.txt
            outputs:
              out:
                type: File
                outputBinding:
                  glob: loud.txt
                  loadContents: true
          in:
            text:
              source: text
          out: [out]
    in:
      text:
        source: word
    out: [loud]
"#;
    let mut inputs = serde_json::Map::new();
    inputs.insert("word".to_string(), serde_json::json!("sub"));
    let (_, submission) = register_and_submit(&state, cwl_text, inputs).await;

    let done = drive(&state, &submission.id, 200).await;
    assert_eq!(done.state, SubmissionState::Completed, "{:?}", done.error);

    // the subworkflow step is one schedulable unit
    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_id, "inner");
    assert_eq!(tasks[0].state, TaskState::Success);

    let outputs = done.outputs.unwrap();
    assert_eq!(outputs["shouted"]["contents"], "sub\n");
}

#[tokio::test]
async fn terminal_submission_is_monotone() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [true]
inputs: []
outputs: []
"#;
    let (_, submission) = register_and_submit(&state, cwl_text, serde_json::Map::new()).await;
    let done = drive(&state, &submission.id, 100).await;
    assert_eq!(done.state, SubmissionState::Completed);
    let outputs_before = done.outputs.clone();
    let completed_before = done.completed_at;

    for _ in 0..5 {
        state.scheduler.tick().await.unwrap();
    }
    let after = state
        .submission_store
        .get(&submission.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.state, SubmissionState::Completed);
    assert_eq!(after.outputs, outputs_before);
    assert_eq!(after.completed_at, completed_before);
}

#[tokio::test]
async fn cancel_skips_undispatched_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let cwl_text = r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [true]
inputs: []
outputs: []
"#;
    let (_, submission) = register_and_submit(&state, cwl_text, serde_json::Map::new()).await;

    // cancel before any tick dispatches
    let cancelled = state.scheduler.cancel_submission(&submission.id).await.unwrap();
    assert_eq!(cancelled.state, SubmissionState::Cancelled);

    let tasks = state.task_store.list_by_submission(&submission.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Skipped));

    // later ticks change nothing
    state.scheduler.tick().await.unwrap();
    let after = state
        .submission_store
        .get(&submission.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.state, SubmissionState::Cancelled);
}
