//! Scatter expansion and result gathering.

use serde_json::{Map, Value};

use crate::cwl::ScatterMethod;
use crate::error::TaskFailure;

/// One scatter element: the per-child overrides for the scattered inputs.
pub type ScatterElement = Map<String, Value>;

/// Expand scattered input arrays into per-child element maps, in output
/// order. `lists` pairs each scattered input name with its resolved array,
/// in declaration order.
pub fn expand(
    method: ScatterMethod,
    lists: &[(String, Vec<Value>)],
) -> Result<Vec<ScatterElement>, TaskFailure> {
    if lists.is_empty() {
        return Ok(Vec::new());
    }
    match method {
        ScatterMethod::Dotproduct => {
            let len = lists[0].1.len();
            if lists.iter().any(|(_, items)| items.len() != len) {
                return Err(TaskFailure::Expression {
                    expr: "scatterMethod: dotproduct".to_string(),
                    message: format!(
                        "scattered arrays must have equal lengths, got {:?}",
                        lists.iter().map(|(_, v)| v.len()).collect::<Vec<_>>()
                    ),
                });
            }
            Ok((0..len)
                .map(|i| {
                    lists
                        .iter()
                        .map(|(name, items)| (name.clone(), items[i].clone()))
                        .collect()
                })
                .collect())
        }
        ScatterMethod::FlatCrossproduct | ScatterMethod::NestedCrossproduct => {
            // row-major cartesian product in declaration order
            let mut elements: Vec<ScatterElement> = vec![Map::new()];
            for (name, items) in lists {
                let mut next = Vec::with_capacity(elements.len() * items.len());
                for element in &elements {
                    for item in items {
                        let mut child = element.clone();
                        child.insert(name.clone(), item.clone());
                        next.push(child);
                    }
                }
                elements = next;
            }
            Ok(elements)
        }
    }
}

/// Gather per-child output values back into the step's output shape:
/// a flat array in element order, re-nested for nested_crossproduct.
pub fn gather(method: ScatterMethod, dims: &[usize], values: Vec<Value>) -> Value {
    match method {
        ScatterMethod::NestedCrossproduct if dims.len() > 1 => nest(&values, dims),
        _ => Value::Array(values),
    }
}

fn nest(values: &[Value], dims: &[usize]) -> Value {
    if dims.len() <= 1 {
        return Value::Array(values.to_vec());
    }
    let chunk = values.len() / dims[0].max(1);
    Value::Array(
        values
            .chunks(chunk.max(1))
            .map(|c| nest(c, &dims[1..]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> Vec<(String, Vec<Value>)> {
        vec![
            (
                "a".to_string(),
                vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)],
            ),
            (
                "b".to_string(),
                vec![
                    serde_json::json!(10),
                    serde_json::json!(20),
                    serde_json::json!(30),
                ],
            ),
        ]
    }

    #[test]
    fn dotproduct_pairs_elements_not_cross() {
        let elements = expand(ScatterMethod::Dotproduct, &lists()).unwrap();
        assert_eq!(elements.len(), 3);
        let pairs: Vec<(i64, i64)> = elements
            .iter()
            .map(|e| (e["a"].as_i64().unwrap(), e["b"].as_i64().unwrap()))
            .collect();
        assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn dotproduct_rejects_ragged_arrays() {
        let mut ragged = lists();
        ragged[1].1.pop();
        assert!(expand(ScatterMethod::Dotproduct, &ragged).is_err());
    }

    #[test]
    fn flat_crossproduct_is_row_major() {
        let elements = expand(ScatterMethod::FlatCrossproduct, &lists()).unwrap();
        assert_eq!(elements.len(), 9);
        assert_eq!(elements[0]["a"], serde_json::json!(1));
        assert_eq!(elements[0]["b"], serde_json::json!(10));
        assert_eq!(elements[1]["b"], serde_json::json!(20));
        assert_eq!(elements[3]["a"], serde_json::json!(2));
    }

    #[test]
    fn nested_crossproduct_gathers_into_nested_arrays() {
        let values: Vec<Value> = (0..6).map(|i| serde_json::json!(i)).collect();
        let gathered = gather(ScatterMethod::NestedCrossproduct, &[2, 3], values);
        assert_eq!(gathered, serde_json::json!([[0, 1, 2], [3, 4, 5]]));
    }
}
