//! Edge predicates evaluated against a source node's result.
//!
//! Grammar:
//!
//! ```text
//! expr := and ('||' and)*
//! and  := atom ('&&' atom)*
//! atom := 'true' | 'false' | path | path op literal
//! op   := '==' | '!=' | '>=' | '<=' | '>' | '<'
//! ```
//!
//! `path` is a dotted path into the result (`$` is the whole result, numeric
//! segments index arrays). Numbers compare numerically when both sides parse,
//! otherwise as strings. A missing or null path never matches.

use serde_json::Value;

use crate::error::{EngineError, Result};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CompareOp {
    const TWO_CHAR: [(&'static str, CompareOp); 4] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
    ];

    /// Locate the first operator in an atom
    fn find(atom: &str) -> Option<(usize, usize, CompareOp)> {
        for (idx, _) in atom.char_indices() {
            let rest = &atom[idx..];
            for (token, op) in Self::TWO_CHAR {
                if rest.starts_with(token) {
                    return Some((idx, token.len(), op));
                }
            }
            if rest.starts_with('>') {
                return Some((idx, 1, CompareOp::Gt));
            }
            if rest.starts_with('<') {
                return Some((idx, 1, CompareOp::Lt));
            }
        }
        None
    }

    fn apply_num(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Ge => left >= right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Lt => left < right,
        }
    }

    fn apply_str(self, left: &str, right: &str) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Ge => left >= right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Lt => left < right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Const(bool),
    Exists(Vec<String>),
    Compare {
        path: Vec<String>,
        op: CompareOp,
        literal: String,
    },
}

/// Parsed edge predicate (disjunction of conjunctions)
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    any: Vec<Vec<Atom>>,
}

impl Predicate {
    pub fn parse(expr: &str) -> Result<Self> {
        let mut any = Vec::new();

        for clause in expr.split("||") {
            let mut all = Vec::new();
            for atom in clause.split("&&") {
                all.push(parse_atom(atom.trim(), expr)?);
            }
            any.push(all);
        }

        Ok(Self { any })
    }

    pub fn evaluate(&self, result: &Value) -> bool {
        self.any
            .iter()
            .any(|all| all.iter().all(|atom| evaluate_atom(atom, result)))
    }
}

fn parse_atom(atom: &str, expr: &str) -> Result<Atom> {
    if atom.is_empty() {
        return Err(EngineError::InvalidFlow(format!(
            "empty term in condition '{}'",
            expr
        )));
    }

    match atom {
        "true" => return Ok(Atom::Const(true)),
        "false" => return Ok(Atom::Const(false)),
        _ => {}
    }

    let Some((pos, len, op)) = CompareOp::find(atom) else {
        return Ok(Atom::Exists(parse_path(atom, expr)?));
    };

    let path = parse_path(atom[..pos].trim(), expr)?;
    let literal = unquote(atom[pos + len..].trim());
    if literal.is_empty() {
        return Err(EngineError::InvalidFlow(format!(
            "missing right-hand side in condition '{}'",
            expr
        )));
    }

    Ok(Atom::Compare {
        path,
        op,
        literal: literal.to_string(),
    })
}

fn parse_path(path: &str, expr: &str) -> Result<Vec<String>> {
    if path.is_empty() || path.contains(char::is_whitespace) {
        return Err(EngineError::InvalidFlow(format!(
            "invalid path '{}' in condition '{}'",
            path, expr
        )));
    }

    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Ok(Vec::new());
    }

    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(EngineError::InvalidFlow(format!(
            "empty path segment in condition '{}'",
            expr
        )));
    }
    Ok(segments)
}

fn unquote(literal: &str) -> &str {
    for quote in ['"', '\''] {
        if literal.len() >= 2 && literal.starts_with(quote) && literal.ends_with(quote) {
            return &literal[1..literal.len() - 1];
        }
    }
    literal
}

/// Follow a path of object keys and array indexes
pub(crate) fn lookup<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn evaluate_atom(atom: &Atom, result: &Value) -> bool {
    match atom {
        Atom::Const(value) => *value,
        Atom::Exists(path) => lookup(result, path.as_slice()).map_or(false, |v| !v.is_null()),
        Atom::Compare { path, op, literal } => {
            let Some(found) = lookup(result, path.as_slice()).filter(|v| !v.is_null()) else {
                return false;
            };

            let left = match found {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            match (left.parse::<f64>(), literal.parse::<f64>()) {
                (Ok(l), Ok(r)) => op.apply_num(l, r),
                _ => op.apply_str(&left, literal),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, value: Value) -> bool {
        Predicate::parse(expr).unwrap().evaluate(&value)
    }

    #[test]
    fn test_constants_and_existence() {
        assert!(eval("true", json!(null)));
        assert!(!eval("false", json!({})));
        assert!(eval("user.email", json!({ "user": { "email": "a@b.c" } })));
        assert!(!eval("user.email", json!({ "user": { "email": null } })));
        assert!(!eval("user.phone", json!({ "user": {} })));
        assert!(eval("$", json!(5)));
    }

    #[test]
    fn test_comparisons() {
        let result = json!({ "status": "ok", "count": 12, "items": [{ "id": "x" }] });
        assert!(eval("status == ok", result.clone()));
        assert!(eval("status == \"ok\"", result.clone()));
        assert!(eval("status != 'error'", result.clone()));
        assert!(eval("count >= 12", result.clone()));
        assert!(eval("count > 9", result.clone()));
        assert!(!eval("count < 9", result.clone()));
        assert!(eval("items.0.id == x", result.clone()));
        assert!(eval("$ == 3", json!(3)));
    }

    #[test]
    fn test_numeric_vs_string_ordering() {
        // 10 > 9 numerically, "10" < "9" lexically
        assert!(eval("n > 9", json!({ "n": 10 })));
        assert!(eval("name > abc", json!({ "name": "abd" })));
    }

    #[test]
    fn test_missing_path_is_false() {
        assert!(!eval("missing == 1", json!({})));
        assert!(!eval("missing != 1", json!({})));
    }

    #[test]
    fn test_boolean_composition() {
        let result = json!({ "a": 1, "b": 2 });
        assert!(eval("a == 1 && b == 2", result.clone()));
        assert!(!eval("a == 1 && b == 3", result.clone()));
        assert!(eval("a == 5 || b == 2", result.clone()));
        assert!(eval("false || a == 5 || true", result));
    }

    #[test]
    fn test_invalid_predicates() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("a == ").is_err());
        assert!(Predicate::parse("a &&").is_err());
        assert!(Predicate::parse("== 3").is_err());
        assert!(Predicate::parse("a b == 3").is_err());
    }
}
