//! Embedded JavaScript evaluation for `${…}` code blocks.
//!
//! Each evaluation gets a fresh boa context with `inputs`, `self`, and
//! `runtime` registered as read-only globals, so no state leaks between
//! evaluations.

use boa_engine::{property::Attribute, Context, JsString, JsValue, Source};
use serde_json::Value;

use super::ExprContext;

/// Evaluate a JS function body (`${ … }` content). `return` statements work
/// as expected; falling off the end yields null.
pub fn eval_function_body(body: &str, ctx: &ExprContext) -> Result<Value, String> {
    let source = format!("(function() {{ {} }})()", body);
    eval_source(&source, ctx)
}

/// Evaluate a bare JS expression (`$( … )` content under
/// InlineJavascriptRequirement).
pub fn eval_expression(expr: &str, ctx: &ExprContext) -> Result<Value, String> {
    let source = format!("({})", expr);
    eval_source(&source, ctx)
}

fn eval_source(source: &str, ctx: &ExprContext) -> Result<Value, String> {
    let mut context = Context::default();

    for (name, value) in [
        ("inputs", &ctx.inputs),
        ("self", &ctx.self_value),
        ("runtime", &ctx.runtime),
    ] {
        let js_value =
            JsValue::from_json(value, &mut context).map_err(|e| e.to_string())?;
        context
            .register_global_property(JsString::from(name), js_value, Attribute::READONLY)
            .map_err(|e| e.to_string())?;
    }

    let result = context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| e.to_string())?;

    if result.is_undefined() || result.is_null() {
        return Ok(Value::Null);
    }
    result.to_json(&mut context).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(inputs: Value) -> ExprContext {
        ExprContext {
            inputs,
            self_value: Value::Null,
            runtime: Value::Null,
            inline_js: true,
        }
    }

    #[test]
    fn function_body_returns_sum() {
        let result = eval_function_body(
            "return inputs.a + inputs.b;",
            &ctx(serde_json::json!({"a": 2, "b": 3})),
        )
        .unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[test]
    fn throwing_body_surfaces_the_message() {
        let err = eval_function_body("throw new Error('boom');", &ctx(Value::Null)).unwrap_err();
        assert!(err.contains("boom"), "{}", err);
    }

    #[test]
    fn body_without_return_yields_null() {
        let result = eval_function_body("var x = 1;", &ctx(Value::Null)).unwrap();
        assert_eq!(result, Value::Null);
    }
}
