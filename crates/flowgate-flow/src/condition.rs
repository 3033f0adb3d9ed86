//! Comparison operators for `logic:condition` and `logic:switch`.
//!
//! Operands arrive already template-resolved, so a condition is a plain
//! comparison between two JSON values.

use std::str::FromStr;

use regex::Regex;
use serde_json::Value;

use flowgate_core::flow::ConfigMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    IsEmpty,
    IsNotEmpty,
    Regex,
}

impl Operator {
    /// Unary operators ignore the right operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_lowercase().replace('-', "_").as_str() {
            "equals" | "eq" | "==" => Self::Equals,
            "not_equals" | "ne" | "!=" => Self::NotEquals,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "greater_than" | "gt" | ">" => Self::GreaterThan,
            "less_than" | "lt" | "<" => Self::LessThan,
            "greater_or_equal" | "gte" | ">=" => Self::GreaterOrEqual,
            "less_or_equal" | "lte" | "<=" => Self::LessOrEqual,
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            "regex" | "matches" => Self::Regex,
            other => return Err(format!("unknown operator '{}'", other)),
        };
        Ok(op)
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Loose equality: numbers compare numerically, everything else by text.
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        if !matches!((left, right), (Value::Bool(_), _) | (_, Value::Bool(_))) {
            return a == b;
        }
    }
    as_text(left) == as_text(right)
}

/// Compare two resolved operands.
pub fn compare(left: &Value, op: Operator, right: &Value) -> Result<bool, String> {
    let result = match op {
        Operator::Equals => loosely_equal(left, right),
        Operator::NotEquals => !loosely_equal(left, right),
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::StartsWith => as_text(left).starts_with(&as_text(right)),
        Operator::EndsWith => as_text(left).ends_with(&as_text(right)),
        Operator::GreaterThan
        | Operator::LessThan
        | Operator::GreaterOrEqual
        | Operator::LessOrEqual => {
            let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
                return Ok(false);
            };
            match op {
                Operator::GreaterThan => a > b,
                Operator::LessThan => a < b,
                Operator::GreaterOrEqual => a >= b,
                _ => a <= b,
            }
        }
        Operator::IsEmpty => is_empty(left),
        Operator::IsNotEmpty => !is_empty(left),
        Operator::Regex => {
            let re = Regex::new(&as_text(right)).map_err(|e| format!("invalid regex: {}", e))?;
            re.is_match(&as_text(left))
        }
    };
    Ok(result)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|i| loosely_equal(i, needle)),
        Value::Object(map) => map.contains_key(&as_text(needle)),
        other => as_text(other).contains(&as_text(needle)),
    }
}

/// Evaluate `left OP "right"` expressions, e.g. `ok == "ok"` or `5 > 3`.
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_expression(expr: &str) -> bool {
    let expr = expr.trim();
    if expr.eq_ignore_ascii_case("true") {
        return true;
    }

    const OPS: [(&str, Operator); 8] = [
        (" not_contains ", Operator::NotContains),
        (" contains ", Operator::Contains),
        ("!=", Operator::NotEquals),
        ("==", Operator::Equals),
        (">=", Operator::GreaterOrEqual),
        ("<=", Operator::LessOrEqual),
        (">", Operator::GreaterThan),
        ("<", Operator::LessThan),
    ];

    for (token, op) in OPS {
        if let Some((left, right)) = parse_operator(expr, token) {
            let left = Value::String(left.to_string());
            let right = Value::String(right.to_string());
            return compare(&left, op, &right).unwrap_or(false);
        }
    }
    false
}

/// Parse `left OP "right"` expressions, returning (left, right).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (left, right) = expr.split_once(op)?;
    let left = left.trim().trim_matches('"');
    let right = right.trim().trim_matches('"');
    Some((left, right))
}

fn single(config: &ConfigMap) -> Result<bool, String> {
    let op: Operator = config
        .get("operator")
        .and_then(|v| v.as_str())
        .unwrap_or("equals")
        .parse()?;
    let left = config.get("left").unwrap_or(&Value::Null);
    let right = config.get("right").unwrap_or(&Value::Null);
    compare(left, op, right)
}

/// Evaluate a condition node's resolved config.
///
/// Accepted shapes: `left`/`operator`/`right`; a `conditions` list joined by
/// `combinator` (`and` default, or `or`); or an `expression` string.
pub fn evaluate_config(config: &ConfigMap) -> Result<bool, String> {
    if let Some(list) = config.get("conditions").and_then(|v| v.as_array()) {
        let any = config
            .get("combinator")
            .and_then(|v| v.as_str())
            .is_some_and(|c| c.eq_ignore_ascii_case("or"));
        let mut outcomes = Vec::with_capacity(list.len());
        for item in list {
            let map = item
                .as_object()
                .ok_or_else(|| "each condition must be an object".to_string())?;
            outcomes.push(single(map)?);
        }
        return Ok(if any {
            outcomes.iter().any(|b| *b)
        } else {
            outcomes.iter().all(|b| *b)
        });
    }

    if let Some(expr) = config.get("expression") {
        return Ok(match expr {
            Value::Bool(b) => *b,
            Value::String(s) => evaluate_expression(s),
            other => !is_empty(other),
        });
    }

    single(config)
}

/// Static shape check used by validation.
pub fn validate_config(config: &ConfigMap) -> Vec<String> {
    let mut errors = vec![];
    let check_op = |map: &ConfigMap, errors: &mut Vec<String>| {
        if let Some(op) = map.get("operator") {
            match op.as_str() {
                Some(s) => {
                    if let Err(e) = s.parse::<Operator>() {
                        errors.push(e);
                    }
                }
                None => errors.push("operator must be a string".into()),
            }
        }
    };

    if let Some(list) = config.get("conditions") {
        match list.as_array() {
            Some(items) => {
                for item in items {
                    match item.as_object() {
                        Some(map) => check_op(map, &mut errors),
                        None => errors.push("each condition must be an object".into()),
                    }
                }
            }
            None => errors.push("conditions must be a list".into()),
        }
    } else if !config.contains_key("expression") && !config.contains_key("left") {
        errors.push("condition needs 'left', 'conditions', or 'expression'".into());
    } else {
        check_op(config, &mut errors);
    }
    errors
}
