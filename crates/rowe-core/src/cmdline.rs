//! Command-line construction for CommandLineTool invocations.
//!
//! Elements carry a composite sort key: position first, then kind
//! (arguments before input bindings), then declaration order. The sort is
//! stable and every tie-breaker is deterministic, so identical inputs always
//! yield byte-identical argument vectors.

use serde_json::Value;

use crate::cwl::{CwlType, InputBinding, RecordField, Tool, ToolInput};
use crate::error::TaskFailure;
use crate::expression::{self, ExprContext};

/// One argv token plus its shell-quoting flag (only consulted under
/// ShellCommandRequirement).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPart {
    pub token: String,
    pub shell_quote: bool,
}

/// Build the full argument vector for a tool invocation.
pub fn build(tool: &Tool, ctx: &ExprContext) -> Result<Vec<CommandPart>, TaskFailure> {
    #[derive(Debug)]
    struct Element {
        position: i64,
        kind: u8,
        insertion: usize,
        parts: Vec<CommandPart>,
    }

    let mut elements: Vec<Element> = Vec::new();

    // arguments first in kind order, then bound inputs
    for (i, arg) in tool.arguments.iter().enumerate() {
        let value = expression::evaluate(&arg.value_from, ctx)?;
        if value.is_null() {
            continue;
        }
        let mut parts = Vec::new();
        push_prefixed(
            &mut parts,
            arg.prefix.as_deref(),
            arg.separate,
            &expression::coerce_string(&value),
            arg.shell_quote,
        );
        elements.push(Element {
            position: arg.position,
            kind: 0,
            insertion: i,
            parts,
        });
    }

    for (i, input) in tool.inputs.iter().enumerate() {
        let Some(binding) = &input.binding else {
            continue;
        };
        let value = effective_value(input, ctx);
        let value = match &binding.value_from {
            Some(expr) => {
                let scoped = ctx.clone().with_self(value.clone());
                expression::evaluate(expr, &scoped)?
            }
            None => value,
        };
        let parts = bind_value(&input.r#type, binding, &value, ctx)?;
        if parts.is_empty() {
            continue;
        }
        elements.push(Element {
            position: binding.position.unwrap_or(0),
            kind: 1,
            insertion: i,
            parts,
        });
    }

    elements.sort_by(|a, b| {
        (a.position, a.kind, a.insertion).cmp(&(b.position, b.kind, b.insertion))
    });

    let mut argv: Vec<CommandPart> = tool
        .base_command
        .iter()
        .map(|c| CommandPart {
            token: c.clone(),
            shell_quote: true,
        })
        .collect();
    for element in elements {
        argv.extend(element.parts);
    }
    Ok(argv)
}

/// Join argv into one shell line, honoring per-part `shellQuote`.
pub fn shell_join(parts: &[CommandPart]) -> String {
    parts
        .iter()
        .map(|p| {
            if p.shell_quote {
                shell_quote(&p.token)
            } else {
                p.token.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// The bound value: explicit from the job, else the declared default, else
/// null (which binds to nothing).
fn effective_value(input: &ToolInput, ctx: &ExprContext) -> Value {
    let explicit = ctx.inputs.get(&input.id).cloned().unwrap_or(Value::Null);
    if explicit.is_null() {
        input.default.clone().unwrap_or(Value::Null)
    } else {
        explicit
    }
}

fn bind_value(
    r#type: &CwlType,
    binding: &InputBinding,
    value: &Value,
    ctx: &ExprContext,
) -> Result<Vec<CommandPart>, TaskFailure> {
    let mut parts = Vec::new();
    match value {
        Value::Null => {}
        Value::Bool(flag) => {
            if *flag {
                if let Some(prefix) = &binding.prefix {
                    parts.push(CommandPart {
                        token: prefix.clone(),
                        shell_quote: binding.shell_quote,
                    });
                }
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Ok(parts);
            }
            if let Some(separator) = &binding.item_separator {
                let joined = items
                    .iter()
                    .map(|item| item_token(item))
                    .collect::<Vec<_>>()
                    .join(separator);
                push_prefixed(
                    &mut parts,
                    binding.prefix.as_deref(),
                    binding.separate,
                    &joined,
                    binding.shell_quote,
                );
            } else {
                for item in items {
                    push_prefixed(
                        &mut parts,
                        binding.prefix.as_deref(),
                        binding.separate,
                        &item_token(item),
                        binding.shell_quote,
                    );
                }
            }
        }
        Value::Object(map) => {
            if map.get("class").and_then(Value::as_str) == Some("File")
                || map.get("class").and_then(Value::as_str) == Some("Directory")
            {
                let path = map
                    .get("path")
                    .or_else(|| map.get("location"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                push_prefixed(
                    &mut parts,
                    binding.prefix.as_deref(),
                    binding.separate,
                    path,
                    binding.shell_quote,
                );
            } else if let CwlType::Record { fields } = r#type.unwrap_optional() {
                parts.extend(bind_record(fields, map, ctx)?);
            } else {
                push_prefixed(
                    &mut parts,
                    binding.prefix.as_deref(),
                    binding.separate,
                    &value.to_string(),
                    binding.shell_quote,
                );
            }
        }
        scalar => {
            push_prefixed(
                &mut parts,
                binding.prefix.as_deref(),
                binding.separate,
                &expression::coerce_string(scalar),
                binding.shell_quote,
            );
        }
    }
    Ok(parts)
}

/// Record values recurse: each field binds with its own binding, ordered by
/// the fields' own positions then declaration order.
fn bind_record(
    fields: &[RecordField],
    map: &serde_json::Map<String, Value>,
    ctx: &ExprContext,
) -> Result<Vec<CommandPart>, TaskFailure> {
    let mut bound: Vec<(i64, usize, Vec<CommandPart>)> = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let Some(binding) = &field.binding else {
            continue;
        };
        let value = map.get(&field.name).cloned().unwrap_or(Value::Null);
        let parts = bind_value(&field.r#type, binding, &value, ctx)?;
        if !parts.is_empty() {
            bound.push((binding.position.unwrap_or(0), i, parts));
        }
    }
    bound.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    Ok(bound.into_iter().flat_map(|(_, _, p)| p).collect())
}

fn item_token(item: &Value) -> String {
    match item {
        Value::Object(map)
            if matches!(
                map.get("class").and_then(Value::as_str),
                Some("File") | Some("Directory")
            ) =>
        {
            map.get("path")
                .or_else(|| map.get("location"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }
        other => expression::coerce_string(other),
    }
}

fn push_prefixed(
    parts: &mut Vec<CommandPart>,
    prefix: Option<&str>,
    separate: bool,
    token: &str,
    shell_quote: bool,
) {
    match prefix {
        Some(prefix) if !separate => parts.push(CommandPart {
            token: format!("{}{}", prefix, token),
            shell_quote,
        }),
        Some(prefix) => {
            parts.push(CommandPart {
                token: prefix.to_string(),
                shell_quote,
            });
            parts.push(CommandPart {
                token: token.to_string(),
                shell_quote,
            });
        }
        None => parts.push(CommandPart {
            token: token.to_string(),
            shell_quote,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwl::Argument;

    fn tool_with(inputs: Vec<ToolInput>, arguments: Vec<Argument>) -> Tool {
        Tool {
            id: "t".to_string(),
            base_command: vec!["prog".to_string()],
            arguments,
            inputs,
            outputs: Vec::new(),
            requirements: Default::default(),
            hints: Default::default(),
            stdin: None,
            stdout: None,
            stderr: None,
            success_codes: Vec::new(),
            temporary_fail_codes: Vec::new(),
            permanent_fail_codes: Vec::new(),
        }
    }

    fn input(id: &str, r#type: CwlType, binding: InputBinding) -> ToolInput {
        ToolInput {
            id: id.to_string(),
            r#type,
            default: None,
            binding: Some(binding),
            load_contents: false,
        }
    }

    fn argv(tool: &Tool, inputs: Value) -> Vec<String> {
        let ctx = ExprContext::new(inputs, Value::Null, false);
        build(tool, &ctx).unwrap().into_iter().map(|p| p.token).collect()
    }

    #[test]
    fn input_at_lower_position_precedes_argument() {
        let tool = tool_with(
            vec![input(
                "x",
                CwlType::String,
                InputBinding {
                    position: Some(1),
                    ..Default::default()
                },
            )],
            vec![Argument {
                position: 5,
                prefix: None,
                separate: true,
                shell_quote: true,
                value_from: "--flag".to_string(),
            }],
        );
        assert_eq!(
            argv(&tool, serde_json::json!({"x": "val"})),
            vec!["prog", "val", "--flag"]
        );
    }

    #[test]
    fn boolean_emits_prefix_only_when_true() {
        let binding = InputBinding {
            prefix: Some("--verbose".to_string()),
            ..Default::default()
        };
        let tool = tool_with(vec![input("v", CwlType::Boolean, binding)], Vec::new());
        assert_eq!(argv(&tool, serde_json::json!({"v": true})), vec!["prog", "--verbose"]);
        assert_eq!(argv(&tool, serde_json::json!({"v": false})), vec!["prog"]);
    }

    #[test]
    fn array_with_item_separator_joins_into_one_token() {
        let binding = InputBinding {
            prefix: Some("-l".to_string()),
            item_separator: Some(",".to_string()),
            ..Default::default()
        };
        let tool = tool_with(
            vec![input("xs", CwlType::Array(Box::new(CwlType::Int)), binding)],
            Vec::new(),
        );
        assert_eq!(
            argv(&tool, serde_json::json!({"xs": [1, 2, 3]})),
            vec!["prog", "-l", "1,2,3"]
        );
    }

    #[test]
    fn array_without_separator_repeats_prefix_per_item() {
        let binding = InputBinding {
            prefix: Some("-f".to_string()),
            ..Default::default()
        };
        let tool = tool_with(
            vec![input("xs", CwlType::Array(Box::new(CwlType::String)), binding)],
            Vec::new(),
        );
        assert_eq!(
            argv(&tool, serde_json::json!({"xs": ["a", "b"]})),
            vec!["prog", "-f", "a", "-f", "b"]
        );
    }

    #[test]
    fn separate_false_fuses_prefix_and_value() {
        let binding = InputBinding {
            prefix: Some("-o".to_string()),
            separate: false,
            ..Default::default()
        };
        let tool = tool_with(vec![input("out", CwlType::String, binding)], Vec::new());
        assert_eq!(argv(&tool, serde_json::json!({"out": "res.txt"})), vec!["prog", "-ores.txt"]);
    }

    #[test]
    fn file_binds_its_staged_path() {
        let binding = InputBinding::default();
        let tool = tool_with(vec![input("f", CwlType::File, binding)], Vec::new());
        let inputs = serde_json::json!({
            "f": {"class": "File", "location": "file:///data/in.txt", "path": "/stage/in.txt"}
        });
        assert_eq!(argv(&tool, inputs), vec!["prog", "/stage/in.txt"]);
    }

    #[test]
    fn null_optional_input_is_omitted() {
        let binding = InputBinding {
            prefix: Some("--opt".to_string()),
            ..Default::default()
        };
        let tool = tool_with(
            vec![input("o", CwlType::Optional(Box::new(CwlType::String)), binding)],
            Vec::new(),
        );
        assert_eq!(argv(&tool, serde_json::json!({})), vec!["prog"]);
    }

    #[test]
    fn build_is_deterministic() {
        let tool = tool_with(
            vec![
                input("a", CwlType::String, InputBinding { position: Some(2), ..Default::default() }),
                input("b", CwlType::String, InputBinding { position: Some(2), ..Default::default() }),
            ],
            vec![Argument {
                position: 2,
                prefix: None,
                separate: true,
                shell_quote: true,
                value_from: "mid".to_string(),
            }],
        );
        let inputs = serde_json::json!({"a": "one", "b": "two"});
        let first = argv(&tool, inputs.clone());
        for _ in 0..10 {
            assert_eq!(argv(&tool, inputs.clone()), first);
        }
        // same position: the argument sorts before both input bindings,
        // inputs keep declaration order
        assert_eq!(first, vec!["prog", "mid", "one", "two"]);
    }

    #[test]
    fn shell_join_respects_quote_flags() {
        let parts = vec![
            CommandPart { token: "echo".to_string(), shell_quote: true },
            CommandPart { token: "a b".to_string(), shell_quote: true },
            CommandPart { token: "&&".to_string(), shell_quote: false },
            CommandPart { token: "true".to_string(), shell_quote: true },
        ];
        assert_eq!(shell_join(&parts), "echo 'a b' && true");
    }
}
