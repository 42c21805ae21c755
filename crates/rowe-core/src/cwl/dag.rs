//! Dependency graph construction and topological ordering.
//!
//! Nodes are step ids; edges come from walking `step.in.*.source` for
//! cross-step references. Kahn's algorithm produces the execution order and
//! detects cycles, which are reported with the full cycle path.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::schema::{Process, WorkflowSpec};

/// Compute `depends_on` for every step and the workflow's topological order.
/// Subworkflow bodies are ordered recursively. Fails with the cycle path
/// when a graph is cyclic.
pub fn order(spec: &mut WorkflowSpec) -> Result<(), String> {
    for step in &mut spec.steps {
        if let Process::Workflow(inner) = &mut step.run {
            order(inner).map_err(|e| format!("steps.{}: {}", step.id, e))?;
        }
    }

    let step_ids: BTreeSet<String> = spec.steps.iter().map(|s| s.id.clone()).collect();

    // edges[from] = set of downstream steps
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for step in &mut spec.steps {
        let mut upstream = BTreeSet::new();
        for input in &step.inputs {
            for source in &input.sources {
                if let Some((from, _)) = source.split_once('/') {
                    if step_ids.contains(from) {
                        upstream.insert(from.to_string());
                    }
                }
            }
        }
        step.depends_on = upstream.iter().cloned().collect();
        for from in upstream {
            edges.entry(from).or_default().insert(step.id.clone());
        }
    }

    // Kahn's algorithm. BTree containers keep the order deterministic for a
    // given document.
    let mut in_degree: BTreeMap<&str, usize> =
        step_ids.iter().map(|id| (id.as_str(), 0)).collect();
    for targets in edges.values() {
        for target in targets {
            *in_degree.get_mut(target.as_str()).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut topo = Vec::with_capacity(step_ids.len());
    while let Some(id) = queue.pop_front() {
        topo.push(id.to_string());
        if let Some(targets) = edges.get(id) {
            for target in targets {
                let d = in_degree.get_mut(target.as_str()).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(target.as_str());
                }
            }
        }
    }

    if topo.len() != step_ids.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(format!("dependency cycle: {}", cycle_path(&edges, &remaining)));
    }

    spec.topo_order = topo;
    Ok(())
}

/// Walk forward from any node left with in-degree > 0 until a node repeats,
/// then format the loop, e.g. `[a, b, a]`.
fn cycle_path(edges: &BTreeMap<String, BTreeSet<String>>, remaining: &BTreeSet<&str>) -> String {
    let start = match remaining.iter().next() {
        Some(s) => *s,
        None => return "[]".to_string(),
    };

    let mut path: Vec<&str> = vec![start];
    let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let next = edges
            .get(current)
            .and_then(|targets| targets.iter().find(|t| remaining.contains(t.as_str())));
        let next = match next {
            Some(n) => n.as_str(),
            None => break,
        };
        if let Some(&at) = seen.get(next) {
            let mut cycle: Vec<&str> = path[at..].to_vec();
            cycle.push(next);
            return format!("[{}]", cycle.join(", "));
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
    format!("[{}]", path.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::normalize;

    fn spec_from(doc: &str) -> WorkflowSpec {
        let value = normalize::load(doc).unwrap();
        normalize::normalize_document(&value).unwrap()
    }

    #[test]
    fn linear_pipeline_orders_upstream_first() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs:
  text: File
outputs: []
steps:
  report:
    run:
      class: CommandLineTool
      baseCommand: [echo]
      inputs:
        n: int
      outputs: []
    in:
      n:
        source: count/line_count
    out: []
  count:
    run:
      class: CommandLineTool
      baseCommand: [wc, -l]
      inputs:
        file: File
      outputs:
        line_count: int
    in:
      file:
        source: text
    out: [line_count]
"#;
        let mut spec = spec_from(doc);
        order(&mut spec).unwrap();
        assert_eq!(spec.topo_order, vec!["count", "report"]);
        let report = spec.step("report").unwrap();
        assert_eq!(report.depends_on, vec!["count"]);
    }

    #[test]
    fn two_step_cycle_is_rejected_with_path() {
        let doc = r#"
cwlVersion: v1.2
class: Workflow
inputs: []
outputs: []
steps:
  a:
    run:
      class: CommandLineTool
      baseCommand: [true]
      inputs:
        x: Any
      outputs:
        out: Any
    in:
      x:
        source: b/out
    out: [out]
  b:
    run:
      class: CommandLineTool
      baseCommand: [true]
      inputs:
        x: Any
      outputs:
        out: Any
    in:
      x:
        source: a/out
    out: [out]
"#;
        let mut spec = spec_from(doc);
        let err = order(&mut spec).unwrap_err();
        assert!(err.contains("[a, b, a]") || err.contains("[b, a, b]"), "{}", err);
    }
}
