//! The CWL expression sublanguage.
//!
//! Three forms appear in documents:
//! - parameter references `$(inputs.x.path)` — a restricted path grammar
//!   over `inputs`, `self`, and `runtime`, handled natively;
//! - code blocks `${ return …; }` — JavaScript function bodies, handed to
//!   the embedded JS engine (requires `InlineJavascriptRequirement`);
//! - interpolation — either form embedded in a longer string splices its
//!   string-coerced result in place.
//!
//! A parameter reference to a missing key evaluates to null. A code block
//! that throws fails the evaluation with the expression text attached.

pub mod js;

use serde_json::Value;

use crate::error::TaskFailure;

/// The variables in scope for one evaluation.
#[derive(Debug, Clone)]
pub struct ExprContext {
    pub inputs: Value,
    pub self_value: Value,
    pub runtime: Value,
    /// Whether `InlineJavascriptRequirement` is in force.
    pub inline_js: bool,
}

impl ExprContext {
    pub fn new(inputs: Value, runtime: Value, inline_js: bool) -> Self {
        Self {
            inputs,
            self_value: Value::Null,
            runtime,
            inline_js,
        }
    }

    pub fn with_self(mut self, self_value: Value) -> Self {
        self.self_value = self_value;
        self
    }
}

/// Evaluate a string that may be a literal, a single expression, or an
/// interpolated mix. A single expression keeps its value's type; anything
/// interpolated becomes a string.
pub fn evaluate(text: &str, ctx: &ExprContext) -> Result<Value, TaskFailure> {
    let segments = scan(text).map_err(|message| TaskFailure::Expression {
        expr: text.to_string(),
        message,
    })?;

    // Whole-string single expression keeps its type.
    if segments.len() == 1 {
        if let Segment::Expr(kind, body) = &segments[0] {
            return eval_one(*kind, body, ctx).map_err(|message| TaskFailure::Expression {
                expr: text.to_string(),
                message,
            });
        }
    }

    if segments.iter().all(|s| matches!(s, Segment::Literal(_))) {
        // No expressions at all; avoid re-allocating unchanged text when
        // there were no escapes either.
        let joined: String = segments
            .into_iter()
            .map(|s| match s {
                Segment::Literal(t) => t,
                Segment::Expr(..) => unreachable!(),
            })
            .collect();
        return Ok(Value::String(joined));
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(t) => out.push_str(&t),
            Segment::Expr(kind, body) => {
                let value = eval_one(kind, &body, ctx).map_err(|message| {
                    TaskFailure::Expression {
                        expr: text.to_string(),
                        message,
                    }
                })?;
                out.push_str(&coerce_string(&value));
            }
        }
    }
    Ok(Value::String(out))
}

/// Evaluate a value that may itself be an expression string (e.g.
/// `ResourceRequirement.coresMin`). Non-strings pass through.
pub fn evaluate_value(value: &Value, ctx: &ExprContext) -> Result<Value, TaskFailure> {
    match value {
        Value::String(s) => evaluate(s, ctx),
        other => Ok(other.clone()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ExprKind {
    /// `$(…)` — parameter reference (or JS expression when enabled).
    Paren,
    /// `${…}` — JS function body.
    Brace,
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Expr(ExprKind, String),
}

/// Split text into literal and expression segments. `\$(` and `\${` escape
/// the marker.
fn scan(text: &str) -> Result<Vec<Segment>, String> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 2 < bytes.len()
            && bytes[i + 1] == b'$'
            && (bytes[i + 2] == b'(' || bytes[i + 2] == b'{')
        {
            literal.push('$');
            i += 2;
            continue;
        }
        if bytes[i] == b'$' && i + 1 < bytes.len() && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{')
        {
            let kind = if bytes[i + 1] == b'(' {
                ExprKind::Paren
            } else {
                ExprKind::Brace
            };
            let (open, close) = match kind {
                ExprKind::Paren => (b'(', b')'),
                ExprKind::Brace => (b'{', b'}'),
            };
            let start = i + 2;
            let mut depth = 1usize;
            let mut j = start;
            let mut quote: Option<u8> = None;
            while j < bytes.len() {
                let c = bytes[j];
                match quote {
                    Some(q) => {
                        if c == b'\\' {
                            j += 1;
                        } else if c == q {
                            quote = None;
                        }
                    }
                    None => {
                        if c == b'\'' || c == b'"' {
                            quote = Some(c);
                        } else if c == open {
                            depth += 1;
                        } else if c == close {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                    }
                }
                j += 1;
            }
            if depth != 0 {
                return Err(format!("unterminated expression starting at byte {}", i));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Expr(kind, text[start..j].to_string()));
            i = j + 1;
            continue;
        }
        let ch = text[i..].chars().next().unwrap();
        literal.push(ch);
        i += ch.len_utf8();
    }
    if !literal.is_empty() || segments.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn eval_one(kind: ExprKind, body: &str, ctx: &ExprContext) -> Result<Value, String> {
    match kind {
        ExprKind::Brace => {
            if !ctx.inline_js {
                return Err("${…} blocks require InlineJavascriptRequirement".to_string());
            }
            js::eval_function_body(body, ctx)
        }
        ExprKind::Paren => {
            match parse_param_ref(body) {
                Some(path) => Ok(walk_path(&path, ctx)),
                None if ctx.inline_js => js::eval_expression(body, ctx),
                None => Err(format!(
                    "'{}' is not a parameter reference and InlineJavascriptRequirement is not in force",
                    body
                )),
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

/// Parse the restricted parameter-reference grammar: a root variable
/// followed by dotted fields, bracketed numeric indexes, or bracketed
/// quoted keys. Returns None when the text is something richer (JS).
fn parse_param_ref(body: &str) -> Option<Vec<PathSeg>> {
    let body = body.trim();
    let mut chars = body.char_indices().peekable();
    let mut segs = Vec::new();

    // leading identifier
    let mut root_end = 0;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            root_end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    if root_end == 0 {
        return None;
    }
    let root = &body[..root_end];
    if !matches!(root, "inputs" | "self" | "runtime") {
        return None;
    }
    segs.push(PathSeg::Key(root.to_string()));

    while let Some(&(i, c)) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || c2 == '_' {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end == start {
                    return None;
                }
                segs.push(PathSeg::Key(body[start..end].to_string()));
            }
            '[' => {
                chars.next();
                let rest = &body[i + 1..];
                if let Some(stripped) = rest.strip_prefix('\'').or_else(|| rest.strip_prefix('"')) {
                    let quote = rest.chars().next().unwrap();
                    let close = stripped.find(quote)?;
                    segs.push(PathSeg::Key(stripped[..close].to_string()));
                    // consume up to and including "']"
                    let consumed = 1 + close + 1;
                    for _ in 0..consumed {
                        chars.next();
                    }
                    match chars.next() {
                        Some((_, ']')) => {}
                        _ => return None,
                    }
                } else {
                    let close_off = rest.find(']')?;
                    let digits = &rest[..close_off];
                    let index: usize = digits.trim().parse().ok()?;
                    segs.push(PathSeg::Index(index));
                    for _ in 0..=close_off {
                        chars.next();
                    }
                }
            }
            _ => return None,
        }
    }
    Some(segs)
}

/// Resolve a parsed path against the context. Missing keys yield null.
fn walk_path(path: &[PathSeg], ctx: &ExprContext) -> Value {
    let mut current = match &path[0] {
        PathSeg::Key(root) => match root.as_str() {
            "inputs" => &ctx.inputs,
            "self" => &ctx.self_value,
            "runtime" => &ctx.runtime,
            _ => return Value::Null,
        },
        PathSeg::Index(_) => return Value::Null,
    };
    for seg in &path[1..] {
        current = match seg {
            PathSeg::Key(key) => match current.get(key) {
                Some(v) => v,
                None => return Value::Null,
            },
            PathSeg::Index(i) => match current.get(i) {
                Some(v) => v,
                None => return Value::Null,
            },
        };
    }
    current.clone()
}

/// String coercion used when splicing expression results into literals.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(inputs: Value) -> ExprContext {
        ExprContext::new(inputs, serde_json::json!({"cores": 2, "outdir": "/tmp/out"}), false)
    }

    #[test]
    fn missing_key_is_null() {
        let result = evaluate("$(inputs.nope)", &ctx(serde_json::json!({}))).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn dotted_and_indexed_access() {
        let inputs = serde_json::json!({
            "reads": [{"basename": "a.fq"}, {"basename": "b.fq"}],
        });
        let result = evaluate("$(inputs.reads[1].basename)", &ctx(inputs)).unwrap();
        assert_eq!(result, Value::String("b.fq".to_string()));
    }

    #[test]
    fn bracketed_string_key() {
        let inputs = serde_json::json!({"odd-name": 7});
        let result = evaluate("$(inputs['odd-name'])", &ctx(inputs)).unwrap();
        assert_eq!(result, serde_json::json!(7));
    }

    #[test]
    fn interpolation_splices_string_coerced_values() {
        let inputs = serde_json::json!({"n": 3, "name": "sample"});
        let result = evaluate("file-$(inputs.name)-$(inputs.n).txt", &ctx(inputs)).unwrap();
        assert_eq!(result, Value::String("file-sample-3.txt".to_string()));
    }

    #[test]
    fn whole_expression_preserves_type() {
        let result = evaluate("$(runtime.cores)", &ctx(Value::Null)).unwrap();
        assert_eq!(result, serde_json::json!(2));
    }

    #[test]
    fn escaped_marker_is_literal() {
        let result = evaluate(r"\$(inputs.x)", &ctx(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(result, Value::String("$(inputs.x)".to_string()));
    }

    #[test]
    fn js_block_without_requirement_fails() {
        let err = evaluate("${return 1;}", &ctx(Value::Null)).unwrap_err();
        match err {
            TaskFailure::Expression { expr, .. } => assert_eq!(expr, "${return 1;}"),
            other => panic!("unexpected failure {:?}", other),
        }
    }

    #[test]
    fn js_sum_with_requirement() {
        let mut context = ctx(serde_json::json!({"a": 2, "b": 3}));
        context.inline_js = true;
        let result = evaluate("${return inputs.a + inputs.b;}", &context).unwrap();
        assert_eq!(result, serde_json::json!(5));
    }
}
