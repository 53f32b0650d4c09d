use rhai::{Dynamic, Engine, Scope};

const RESERVED: &[&str] = &[
    "true", "false", "if", "else", "switch", "in", "let", "const", "fn", "return", "this",
];

/// Evaluates the body of a `#{...}` marker.
///
/// Free variables are dotted names such as `hub.stackName` or `db.port`;
/// each one is resolved through the caller's lookup and bound as a typed
/// value (integer, float, boolean, or string) before evaluation.
pub struct Evaluator {
    engine: Engine,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(50_000);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(1 << 20);
        Self { engine }
    }

    /// Evaluate `expr`, resolving free variables through `lookup`.
    ///
    /// Returns `Err` with the unresolved variable name via `Unresolved`, or
    /// with the evaluator's message via `Failed`.
    pub fn eval(
        &self,
        expr: &str,
        lookup: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<String, EvalFailure> {
        let (rewritten, vars) = bind_variables(expr);
        let mut scope = Scope::new();
        for (slot, name) in vars.iter().enumerate() {
            let value = lookup(name.as_str()).ok_or_else(|| EvalFailure::Unresolved(name.clone()))?;
            scope.push_constant(format!("__v{slot}"), typed(&value));
        }
        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, &rewritten)
            .map_err(|e| EvalFailure::Failed(e.to_string()))?;
        Ok(render(&result))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalFailure {
    Unresolved(String),
    Failed(String),
}

fn typed(value: &str) -> Dynamic {
    if let Ok(i) = value.parse::<i64>() {
        return Dynamic::from(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        if f.is_finite() {
            return Dynamic::from(f);
        }
    }
    match value {
        "true" => Dynamic::from(true),
        "false" => Dynamic::from(false),
        _ => Dynamic::from(value.to_owned()),
    }
}

fn render(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else {
        value.to_string()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace every free dotted name outside string literals with a scope slot.
///
/// A trailing segment directly followed by `(` is kept as a method or
/// function call. Numeric literals and keywords are left alone.
fn bind_variables(expr: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut vars: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            out.extend(&chars[start..i]);
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }
        if !is_ident_start(c) {
            out.push(c);
            i += 1;
            continue;
        }
        // A name directly after `.` is a property of the preceding expression.
        if out.trim_end().ends_with('.') {
            while i < chars.len() && is_ident_char(chars[i]) {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }

        let mut segments: Vec<String> = Vec::new();
        loop {
            let seg_start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            segments.push(chars[seg_start..i].iter().collect());
            if i + 1 < chars.len() && chars[i] == '.' && is_ident_start(chars[i + 1]) {
                i += 1;
            } else {
                break;
            }
        }
        let is_call = chars[i..].iter().find(|c| !c.is_whitespace()) == Some(&'(');
        let method = if is_call { segments.pop() } else { None };

        if !segments.is_empty() {
            let name = segments.join(".");
            if segments.len() == 1 && RESERVED.contains(&name.as_str()) {
                out.push_str(&name);
            } else {
                let slot = match vars.iter().position(|v| *v == name) {
                    Some(slot) => slot,
                    None => {
                        vars.push(name);
                        vars.len() - 1
                    }
                };
                out.push_str(&format!("__v{slot}"));
            }
            if method.is_some() {
                out.push('.');
            }
        }
        if let Some(m) = method {
            out.push_str(&m);
        }
    }
    (out, vars)
}
