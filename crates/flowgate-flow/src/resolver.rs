//! Template resolution for `{{category.path}}` references.
//!
//! Categories: `input`, `node`, `var`, `env`, `time`, `trigger`. Path segments
//! accept bracketed indices (`results[0]`). Anything that cannot be resolved
//! is left in place verbatim.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use flowgate_core::flow::ConfigMap;

use crate::context::ExecutionContext;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid template regex"))
}

fn single_template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\{\{\s*([^{}]+?)\s*\}\}\s*$").expect("valid template regex"))
}

/// Categories whose results may be cached within a run.
const CACHEABLE: [&str; 3] = ["node", "input", "var"];

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Split `a.b[0].c` into segments. Returns `None` for malformed brackets.
fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            if !rest.starts_with('[') {
                return None;
            }
            let index: usize = rest[1..close].trim().parse().ok()?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn walk<'v>(mut value: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    for seg in segments {
        value = match (seg, value) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(value)
}

/// `length` on arrays and strings, when no such key exists.
fn walk_owned(value: &Value, segments: &[Segment]) -> Option<Value> {
    if let Some(found) = walk(value, segments) {
        return Some(found.clone());
    }
    let (last, head) = segments.split_last()?;
    if *last != Segment::Key("length".into()) {
        return None;
    }
    match walk(value, head)? {
        Value::Array(items) => Some(Value::from(items.len())),
        Value::String(s) => Some(Value::from(s.chars().count())),
        _ => None,
    }
}

/// Render a resolved value into template text.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Resolves templates against an `ExecutionContext`.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    env: HashMap<String, String>,
}

impl VariableResolver {
    /// Snapshot the allow-listed environment variables. Nothing else is visible.
    pub fn new(env_allowlist: &[String]) -> Self {
        let env = env_allowlist
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        Self { env }
    }

    /// Resolver with an explicit environment map.
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env }
    }

    /// Replace every resolvable `{{...}}` reference in `template`.
    pub fn resolve(&self, template: &str, ctx: &ExecutionContext) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }

        let cacheable = template_re().captures_iter(template).all(|cap| {
            let category = cap[1].split(['.', '[']).next().unwrap_or_default();
            CACHEABLE.contains(&category)
        });
        if cacheable {
            if let Some(hit) = ctx.cached(template) {
                return hit;
            }
        }

        let rendered = template_re()
            .replace_all(template, |cap: &regex::Captures<'_>| {
                match self.resolve_path(&cap[1], ctx) {
                    Some(value) => render(&value),
                    None => cap[0].to_string(),
                }
            })
            .into_owned();

        if cacheable {
            ctx.cache_put(template, &rendered);
        }
        rendered
    }

    /// Resolve a bare path such as `node.fetch.body.items[2]`.
    pub fn resolve_path(&self, path: &str, ctx: &ExecutionContext) -> Option<Value> {
        let segments = parse_path(path.trim())?;
        let (category, rest) = segments.split_first()?;
        let Segment::Key(category) = category else {
            return None;
        };

        match category.as_str() {
            "input" => walk_owned(&ctx.input, rest),
            "node" => {
                let (Segment::Key(id), rest) = rest.split_first()? else {
                    return None;
                };
                let base = if id == "previous" {
                    ctx.previous_output()?
                } else {
                    ctx.node_output(id)?
                };
                walk_owned(base, rest)
            }
            "var" => {
                let (Segment::Key(name), rest) = rest.split_first()? else {
                    return None;
                };
                walk_owned(ctx.variable(name)?, rest)
            }
            "env" => match rest {
                [Segment::Key(name)] => self.env.get(name).map(|v| Value::String(v.clone())),
                _ => None,
            },
            "time" => {
                let now = Utc::now();
                match rest {
                    [Segment::Key(k)] => match k.as_str() {
                        "now" => Some(Value::String(now.to_rfc3339())),
                        "date" => Some(Value::String(now.format("%Y-%m-%d").to_string())),
                        "time" => Some(Value::String(now.format("%H:%M:%S").to_string())),
                        "unix" => Some(Value::from(now.timestamp())),
                        _ => None,
                    },
                    _ => None,
                }
            }
            "trigger" => walk_owned(&ctx.trigger.to_value(), rest),
            _ => None,
        }
    }

    /// Resolve templates throughout a JSON value.
    ///
    /// A string holding exactly one template keeps the referenced value's type.
    pub fn resolve_value(&self, value: &Value, ctx: &ExecutionContext) -> Value {
        match value {
            Value::String(s) => {
                if let Some(cap) = single_template_re().captures(s) {
                    if let Some(resolved) = self.resolve_path(&cap[1], ctx) {
                        return resolved;
                    }
                    return value.clone();
                }
                Value::String(self.resolve(s, ctx))
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v, ctx)).collect())
            }
            Value::Object(map) => Value::Object(self.resolve_config(map, ctx)),
            other => other.clone(),
        }
    }

    pub fn resolve_config(&self, config: &ConfigMap, ctx: &ExecutionContext) -> ConfigMap {
        config
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v, ctx)))
            .collect()
    }
}

/// Every template reference in `text`, without braces.
pub fn extract_references(text: &str) -> Vec<String> {
    template_re()
        .captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::{ExecutionId, TriggerInfo};
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::from_str("exec-1"),
            "flow-1",
            json!({"text": "HELP, server down", "user": {"name": "Ada", "tags": ["ops", "oncall"]}}),
        )
        .with_trigger(TriggerInfo {
            source: "message".into(),
            channel: Some("slack".into()),
            ..Default::default()
        })
        .with_variable("count", json!(3))
        .with_output("a", json!({"x": [10, 20, 30]}))
    }

    #[test]
    fn test_indexed_node_path() {
        let r = VariableResolver::default();
        assert_eq!(r.resolve("{{node.a.x[1]}}", &ctx()), "20");
    }

    #[test]
    fn test_unresolved_reference_left_verbatim() {
        let r = VariableResolver::default();
        let ctx = ctx();
        for t in [
            "{{node.missing.value}}",
            "{{input.nope}}",
            "{{unknown.path}}",
            "{{node.a.x[9]}}",
            "{{node.a.x[}}",
            "{{env.HOME}}",
            "{{time.century}}",
        ] {
            assert_eq!(r.resolve(t, &ctx), t, "template {} should stay verbatim", t);
        }
    }

    #[test]
    fn test_mixed_template() {
        let r = VariableResolver::default();
        let out = r.resolve(
            "Hi {{input.user.name}} ({{ input.user.tags[1] }}), count={{var.count}} via {{trigger.channel}}",
            &ctx(),
        );
        assert_eq!(out, "Hi Ada (oncall), count=3 via slack");
    }

    #[test]
    fn test_previous_sentinel() {
        let r = VariableResolver::default();
        let mut ctx = ctx();
        ctx.record_output("b", json!({"status": "ok"})).unwrap();
        assert_eq!(r.resolve("{{node.previous.status}}", &ctx), "ok");
    }

    #[test]
    fn test_env_only_from_allowlist() {
        let mut env = HashMap::new();
        env.insert("APP_NAME".to_string(), "flowgate".to_string());
        let r = VariableResolver::with_env(env);
        assert_eq!(r.resolve("{{env.APP_NAME}}", &ctx()), "flowgate");
        assert_eq!(r.resolve("{{env.PATH}}", &ctx()), "{{env.PATH}}");
    }

    #[test]
    fn test_allowlist_snapshot_ignores_unlisted_vars() {
        std::env::set_var("FLOWGATE_RESOLVER_ALLOWED", "yes");
        std::env::set_var("FLOWGATE_RESOLVER_HIDDEN", "no");
        let r = VariableResolver::new(&["FLOWGATE_RESOLVER_ALLOWED".to_string()]);
        let ctx = ctx();
        assert_eq!(r.resolve("{{env.FLOWGATE_RESOLVER_ALLOWED}}", &ctx), "yes");
        assert_eq!(
            r.resolve("{{env.FLOWGATE_RESOLVER_HIDDEN}}", &ctx),
            "{{env.FLOWGATE_RESOLVER_HIDDEN}}"
        );
    }

    #[test]
    fn test_time_is_not_cached() {
        let r = VariableResolver::default();
        let ctx = ctx();
        let unix = r.resolve("{{time.unix}}", &ctx);
        assert!(unix.parse::<i64>().is_ok());
        assert_eq!(ctx.cache_len(), 0);
        assert_eq!(r.resolve("{{time.date}}", &ctx).len(), 10);
    }

    #[test]
    fn test_cache_hit_and_invalidation() {
        let r = VariableResolver::default();
        let mut ctx = ctx();
        assert_eq!(r.resolve("n={{var.count}}", &ctx), "n=3");
        assert_eq!(ctx.cache_len(), 1);

        ctx.set_variable("count", json!(4));
        assert_eq!(r.resolve("n={{var.count}}", &ctx), "n=4");
    }

    #[test]
    fn test_resolve_value_keeps_types() {
        let r = VariableResolver::default();
        let ctx = ctx();
        assert_eq!(r.resolve_value(&json!("{{node.a.x}}"), &ctx), json!([10, 20, 30]));
        assert_eq!(r.resolve_value(&json!("{{var.count}}"), &ctx), json!(3));
        assert_eq!(r.resolve_value(&json!("n={{var.count}}"), &ctx), json!("n=3"));
        assert_eq!(r.resolve_value(&json!("{{var.absent}}"), &ctx), json!("{{var.absent}}"));

        let config = json!({"nested": {"list": ["{{input.user.name}}", 7]}});
        assert_eq!(
            r.resolve_value(&config, &ctx),
            json!({"nested": {"list": ["Ada", 7]}})
        );
    }

    #[test]
    fn test_length_pseudo_key() {
        let r = VariableResolver::default();
        assert_eq!(r.resolve("{{node.a.x.length}}", &ctx()), "3");
        assert_eq!(r.resolve("{{input.user.name.length}}", &ctx()), "3");
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("node.a.x[1][2]").unwrap(),
            vec![
                Segment::Key("node".into()),
                Segment::Key("a".into()),
                Segment::Key("x".into()),
                Segment::Index(1),
                Segment::Index(2),
            ]
        );
        assert!(parse_path("node..a").is_none());
        assert!(parse_path("node.a[x]").is_none());
    }

    #[test]
    fn test_extract_references() {
        assert_eq!(
            extract_references("{{input.a}} and {{ node.b.c }}"),
            vec!["input.a", "node.b.c"]
        );
    }
}
