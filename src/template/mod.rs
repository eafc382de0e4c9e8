//! Template evaluator
//!
//! Resolves `${...}` expressions in scalars, lists, and maps against a
//! [`ConfigContext`]. Two modes:
//!
//! - `Strict`: any unresolved reference fails with a template-string error
//!   naming the expression and the context branches attempted.
//! - `Partial`: unresolved expressions are re-rendered verbatim for a later
//!   pass (used before the plugin `configure` handler).

mod context;
mod parse;

pub use context::{actions_branch, ConfigContext, LayeredContext, Lookup, MapContext};
pub use parse::{parse_expression, tokenize, Expr, Segment};

use serde_json::Value;

use crate::error::{Result, TrellisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Strict,
    Partial,
}

/// Result of evaluating one expression
enum Evaluated {
    Value(Value),
    Unresolved {
        expression: String,
        attempted: Vec<String>,
    },
}

/// Resolve a whole value tree. Maps and lists are walked once; strings are
/// parsed and re-rendered.
pub fn resolve_value(value: &Value, ctx: &dyn ConfigContext, mode: ResolveMode) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, ctx, mode),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, ctx, mode)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(item, ctx, mode)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve a single string. A string that is exactly one expression yields
/// the expression's typed value; anything else interpolates into a string.
pub fn resolve_string(template: &str, ctx: &dyn ConfigContext, mode: ResolveMode) -> Result<Value> {
    let segments = tokenize(template)?;

    // Whole-string expression keeps its type (number, object, ...)
    if let [Segment::Expression { expr, raw }] = segments.as_slice() {
        if raw.start == 0 && raw.end == template.len() {
            return match evaluate(expr, ctx)? {
                Evaluated::Value(value) => Ok(value),
                Evaluated::Unresolved {
                    expression,
                    attempted,
                } => match mode {
                    ResolveMode::Strict => {
                        Err(TrellisError::TemplateUnresolved {
                            expression,
                            attempted,
                        })
                    }
                    ResolveMode::Partial => Ok(Value::String(template.to_string())),
                },
            };
        }
    }

    let mut out = String::with_capacity(template.len());
    for segment in &segments {
        match segment {
            Segment::Literal(range) => out.push_str(&template[range.clone()]),
            Segment::Escaped(range) => out.push_str(&template[range.clone()]),
            Segment::Expression { expr, raw } => match evaluate(expr, ctx)? {
                Evaluated::Value(value) => out.push_str(&render_scalar(&value)),
                Evaluated::Unresolved {
                    expression,
                    attempted,
                } => match mode {
                    ResolveMode::Strict => {
                        return Err(TrellisError::TemplateUnresolved {
                            expression,
                            attempted,
                        })
                    }
                    ResolveMode::Partial => out.push_str(&template[raw.clone()]),
                },
            },
        }
    }
    Ok(Value::String(out))
}

/// Collect every `${...}` reference path found anywhere in a value tree.
pub fn find_references(value: &Value) -> Vec<Vec<String>> {
    let mut refs = Vec::new();
    collect_refs(value, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut Vec<Vec<String>>) {
    match value {
        Value::String(s) => {
            // Unparseable strings contribute no references; they fail
            // later during actual resolution.
            if let Ok(segments) = tokenize(s) {
                for segment in &segments {
                    if let Segment::Expression { expr, .. } = segment {
                        let mut paths = Vec::new();
                        expr.collect_references(&mut paths);
                        refs.extend(paths.into_iter().map(|p| p.to_vec()));
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, refs);
            }
        }
        _ => {}
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate(expr: &Expr, ctx: &dyn ConfigContext) -> Result<Evaluated> {
    match expr {
        Expr::Literal(value) => Ok(Evaluated::Value(value.clone())),
        Expr::Reference(path) => match ctx.lookup(path) {
            Lookup::Found(value) => Ok(Evaluated::Value(value)),
            Lookup::NotFound { attempted } => Ok(Evaluated::Unresolved {
                expression: path.join("."),
                attempted,
            }),
        },
        Expr::Alt(alternatives) => {
            let mut attempted_all = Vec::new();
            let mut expressions = Vec::new();
            for alt in alternatives {
                match evaluate(alt, ctx)? {
                    Evaluated::Value(Value::Null) => continue,
                    Evaluated::Value(value) => return Ok(Evaluated::Value(value)),
                    Evaluated::Unresolved {
                        expression,
                        attempted,
                    } => {
                        expressions.push(expression);
                        attempted_all.extend(attempted);
                    }
                }
            }
            if expressions.is_empty() {
                // Every alternative resolved to null
                return Ok(Evaluated::Value(Value::Null));
            }
            Ok(Evaluated::Unresolved {
                expression: expressions.join(" || "),
                attempted: attempted_all,
            })
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                match evaluate(arg, ctx)? {
                    Evaluated::Value(value) => values.push(value),
                    unresolved @ Evaluated::Unresolved { .. } => return Ok(unresolved),
                }
            }
            apply_function(name, &values).map(Evaluated::Value)
        }
    }
}

fn apply_function(name: &str, args: &[Value]) -> Result<Value> {
    let arity_error = |expected: usize| TrellisError::TemplateParse {
        position: 0,
        details: format!("{name}() expects {expected} argument(s), got {}", args.len()),
    };

    match name {
        "upper" => {
            let [s] = args else { return Err(arity_error(1)) };
            Ok(Value::String(string_arg(name, s)?.to_uppercase()))
        }
        "lower" => {
            let [s] = args else { return Err(arity_error(1)) };
            Ok(Value::String(string_arg(name, s)?.to_lowercase()))
        }
        "trim" => {
            let [s] = args else { return Err(arity_error(1)) };
            Ok(Value::String(string_arg(name, s)?.trim().to_string()))
        }
        "replace" => {
            let [s, from, to] = args else { return Err(arity_error(3)) };
            Ok(Value::String(string_arg(name, s)?.replace(
                string_arg(name, from)?,
                string_arg(name, to)?,
            )))
        }
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&render_scalar(arg));
            }
            Ok(Value::String(out))
        }
        "if" => {
            let [cond, then_value, else_value] = args else {
                return Err(arity_error(3));
            };
            let truthy = match cond {
                Value::Bool(b) => *b,
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Number(n) => n.as_f64() != Some(0.0),
                _ => true,
            };
            Ok(if truthy {
                then_value.clone()
            } else {
                else_value.clone()
            })
        }
        other => Err(TrellisError::TemplateParse {
            position: 0,
            details: format!("unknown template function '{other}'"),
        }),
    }
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| TrellisError::TemplateParse {
        position: 0,
        details: format!("{name}() expects a string argument, got {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn ctx() -> MapContext {
        MapContext::new(
            "test",
            json!({
                "var": {"region": "eu-west-1", "replicas": 3, "empty": null},
                "environment": {"name": "staging"},
                "actions": {"build": {"api": {"outputs": {"image-id": "sha256:abc"}}}},
            }),
        )
    }

    #[test]
    fn interpolates_into_string() {
        let out = resolve_string(
            "deploying to ${environment.name} in ${var.region}",
            &ctx(),
            ResolveMode::Strict,
        )
        .unwrap();
        assert_eq!(out, json!("deploying to staging in eu-west-1"));
    }

    #[test]
    fn whole_string_expression_keeps_type() {
        let out = resolve_string("${var.replicas}", &ctx(), ResolveMode::Strict).unwrap();
        assert_eq!(out, json!(3));
    }

    #[test]
    fn action_output_reference() {
        let out = resolve_string(
            "${actions.build.api.outputs.image-id}",
            &ctx(),
            ResolveMode::Strict,
        )
        .unwrap();
        assert_eq!(out, json!("sha256:abc"));
    }

    #[test]
    fn strict_unresolved_names_attempted_branches() {
        let err = resolve_string("${var.missing}", &ctx(), ResolveMode::Strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateString);
        assert!(err.to_string().contains("var.missing"));
        assert!(err.to_string().contains("test"));
    }

    #[test]
    fn partial_leaves_unresolved_verbatim() {
        let out = resolve_string(
            "tag: ${runtime.later}",
            &ctx(),
            ResolveMode::Partial,
        )
        .unwrap();
        assert_eq!(out, json!("tag: ${runtime.later}"));
    }

    #[test]
    fn partial_still_resolves_what_it_can() {
        let out = resolve_string(
            "${var.region}/${runtime.later}",
            &ctx(),
            ResolveMode::Partial,
        )
        .unwrap();
        assert_eq!(out, json!("eu-west-1/${runtime.later}"));
    }

    #[test]
    fn fallback_takes_first_non_null() {
        let out =
            resolve_string("${var.empty || var.region || 'x'}", &ctx(), ResolveMode::Strict)
                .unwrap();
        assert_eq!(out, json!("eu-west-1"));

        let out =
            resolve_string("${var.nope || 'fallback'}", &ctx(), ResolveMode::Strict).unwrap();
        assert_eq!(out, json!("fallback"));
    }

    #[test]
    fn functions_apply() {
        assert_eq!(
            resolve_string("${upper(environment.name)}", &ctx(), ResolveMode::Strict).unwrap(),
            json!("STAGING")
        );
        assert_eq!(
            resolve_string(
                "${replace(var.region, '-', '_')}",
                &ctx(),
                ResolveMode::Strict
            )
            .unwrap(),
            json!("eu_west_1")
        );
        assert_eq!(
            resolve_string(
                "${if(true, 'yes', 'no')}-${if(false, 'yes', 'no')}",
                &ctx(),
                ResolveMode::Strict
            )
            .unwrap(),
            json!("yes-no")
        );
    }

    #[test]
    fn unknown_function_fails() {
        let err =
            resolve_string("${frobnicate(var.region)}", &ctx(), ResolveMode::Strict).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn resolve_value_walks_maps_and_lists() {
        let input = json!({
            "image": "${actions.build.api.outputs.image-id}",
            "env": [{"name": "REGION", "value": "${var.region}"}],
            "count": 2,
        });
        let out = resolve_value(&input, &ctx(), ResolveMode::Strict).unwrap();
        assert_eq!(out["image"], "sha256:abc");
        assert_eq!(out["env"][0]["value"], "eu-west-1");
        assert_eq!(out["count"], 2);
    }

    #[test]
    fn find_references_collects_all_paths() {
        let input = json!({
            "image": "${actions.build.api.outputs.image-id}",
            "region": "${var.region || environment.region}",
        });
        let refs = find_references(&input);
        assert_eq!(refs.len(), 3);
        assert!(refs.iter().any(|r| r[0] == "actions"));
        assert!(refs.iter().any(|r| r == &vec!["var".to_string(), "region".to_string()]));
    }

    #[test]
    fn resolving_twice_is_idempotent_on_resolved_output() {
        let input = json!({"region": "${var.region}"});
        let once = resolve_value(&input, &ctx(), ResolveMode::Strict).unwrap();
        let twice = resolve_value(&once, &ctx(), ResolveMode::Strict).unwrap();
        assert_eq!(once, twice);
    }
}
