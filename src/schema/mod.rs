//! Config schema language
//!
//! Expressive enough for the action/workflow config surface:
//! required/optional keys, unknown-key rejection, unions, per-key custom
//! metadata (template context tags, `no_template`), regex-keyed pattern
//! maps, arrays, and POSIX-path constraints.
//!
//! Validation produces precise paths (`a.b[2].c`) and, when the source
//! YAML text is available, attaches a caret-marked snippet.

mod snippet;

use std::fmt;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, TrellisError};

/// One segment of a config path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Path rendering: `a.b[2].c`
pub fn render_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(index) => {
                out.push_str(&format!("[{index}]"));
            }
        }
    }
    out
}

/// A single validation failure
#[derive(Debug, Clone)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Per-key metadata carried alongside the type
#[derive(Debug, Clone, Default)]
pub struct KeyMeta {
    /// Name of the only context this key's templates resolve against
    pub template_context: Option<String>,
    /// Value must not change between pre- and post-configure resolution
    pub no_template: bool,
}

#[derive(Debug, Clone)]
pub struct KeySchema {
    pub name: String,
    pub required: bool,
    pub schema: Schema,
}

#[derive(Debug, Clone)]
pub enum SchemaKind {
    Any,
    Bool,
    Number,
    String {
        pattern: Option<Regex>,
        posix_path: bool,
    },
    Array(Box<Schema>),
    Object {
        keys: Vec<KeySchema>,
        /// Regex-keyed entries for pattern maps
        pattern_keys: Vec<(Regex, Schema)>,
        allow_unknown: bool,
    },
    Union(Vec<Schema>),
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub kind: SchemaKind,
    pub meta: KeyMeta,
}

impl Schema {
    pub fn any() -> Self {
        Self {
            kind: SchemaKind::Any,
            meta: KeyMeta::default(),
        }
    }

    pub fn bool() -> Self {
        Self {
            kind: SchemaKind::Bool,
            meta: KeyMeta::default(),
        }
    }

    pub fn number() -> Self {
        Self {
            kind: SchemaKind::Number,
            meta: KeyMeta::default(),
        }
    }

    pub fn string() -> Self {
        Self {
            kind: SchemaKind::String {
                pattern: None,
                posix_path: false,
            },
            meta: KeyMeta::default(),
        }
    }

    pub fn posix_path() -> Self {
        Self {
            kind: SchemaKind::String {
                pattern: None,
                posix_path: true,
            },
            meta: KeyMeta::default(),
        }
    }

    pub fn pattern(expr: &str) -> Self {
        Self {
            kind: SchemaKind::String {
                pattern: Some(Regex::new(expr).expect("invalid schema regex")),
                posix_path: false,
            },
            meta: KeyMeta::default(),
        }
    }

    pub fn array(item: Schema) -> Self {
        Self {
            kind: SchemaKind::Array(Box::new(item)),
            meta: KeyMeta::default(),
        }
    }

    pub fn object(keys: Vec<KeySchema>) -> Self {
        Self {
            kind: SchemaKind::Object {
                keys,
                pattern_keys: Vec::new(),
                allow_unknown: false,
            },
            meta: KeyMeta::default(),
        }
    }

    pub fn union(options: Vec<Schema>) -> Self {
        Self {
            kind: SchemaKind::Union(options),
            meta: KeyMeta::default(),
        }
    }

    pub fn allow_unknown(mut self) -> Self {
        if let SchemaKind::Object { allow_unknown, .. } = &mut self.kind {
            *allow_unknown = true;
        }
        self
    }

    pub fn with_pattern_key(mut self, expr: &str, value: Schema) -> Self {
        if let SchemaKind::Object { pattern_keys, .. } = &mut self.kind {
            pattern_keys.push((Regex::new(expr).expect("invalid schema regex"), value));
        }
        self
    }

    pub fn no_template(mut self) -> Self {
        self.meta.no_template = true;
        self
    }

    pub fn template_context(mut self, name: &str) -> Self {
        self.meta.template_context = Some(name.to_string());
        self
    }

    /// Validate a value, collecting every violation.
    pub fn validate(&self, value: &Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        let mut path = Vec::new();
        self.check(value, &mut path, &mut violations);
        violations
    }

    /// Validate and convert the first violation into a `Validation` error,
    /// attaching a caret snippet when the YAML source is supplied.
    pub fn ensure_valid(&self, value: &Value, source: Option<&str>) -> Result<()> {
        let violations = self.validate(value);
        let Some(first) = violations.into_iter().next() else {
            return Ok(());
        };

        let snippet = source.and_then(|text| {
            let segments = parse_path(&first.path);
            snippet::locate(text, &segments)
                .map(|(line, col)| snippet::render(text, line, col))
        });

        Err(TrellisError::Validation {
            path: first.path,
            message: first.message,
            snippet,
        })
    }

    /// Dotted paths of every key flagged `no_template`, relative to this
    /// schema's root. Arrays and pattern keys are not flagged this way.
    pub fn no_template_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_no_template(&mut path, &mut out);
        out
    }

    fn collect_no_template(&self, path: &mut Vec<PathSegment>, out: &mut Vec<String>) {
        if self.meta.no_template && !path.is_empty() {
            out.push(render_path(path));
        }
        if let SchemaKind::Object { keys, .. } = &self.kind {
            for key in keys {
                path.push(PathSegment::Key(key.name.clone()));
                key.schema.collect_no_template(path, out);
                path.pop();
            }
        }
    }

    fn check(&self, value: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<SchemaViolation>) {
        match &self.kind {
            SchemaKind::Any => {}
            SchemaKind::Bool => {
                if !value.is_boolean() {
                    out.push(violation(path, format!("expected boolean, got {}", type_of(value))));
                }
            }
            SchemaKind::Number => {
                if !value.is_number() {
                    out.push(violation(path, format!("expected number, got {}", type_of(value))));
                }
            }
            SchemaKind::String {
                pattern,
                posix_path,
            } => {
                let Some(text) = value.as_str() else {
                    out.push(violation(path, format!("expected string, got {}", type_of(value))));
                    return;
                };
                if let Some(re) = pattern {
                    if !re.is_match(text) {
                        out.push(violation(
                            path,
                            format!("'{text}' does not match pattern {re}"),
                        ));
                    }
                }
                if *posix_path && (text.contains('\\') || text.contains("//")) {
                    out.push(violation(
                        path,
                        format!("'{text}' must be a POSIX-style path"),
                    ));
                }
            }
            SchemaKind::Array(item) => {
                let Some(items) = value.as_array() else {
                    out.push(violation(path, format!("expected array, got {}", type_of(value))));
                    return;
                };
                for (index, entry) in items.iter().enumerate() {
                    path.push(PathSegment::Index(index));
                    item.check(entry, path, out);
                    path.pop();
                }
            }
            SchemaKind::Object {
                keys,
                pattern_keys,
                allow_unknown,
            } => {
                let Some(map) = value.as_object() else {
                    out.push(violation(path, format!("expected object, got {}", type_of(value))));
                    return;
                };
                for key in keys {
                    match map.get(&key.name) {
                        // An explicit null on an optional key counts as absent
                        Some(Value::Null) if !key.required => {}
                        Some(entry) => {
                            path.push(PathSegment::Key(key.name.clone()));
                            key.schema.check(entry, path, out);
                            path.pop();
                        }
                        None if key.required => {
                            out.push(violation(
                                path,
                                format!("missing required key '{}'", key.name),
                            ));
                        }
                        None => {}
                    }
                }
                for (name, entry) in map {
                    if keys.iter().any(|k| &k.name == name) {
                        continue;
                    }
                    if let Some((_, value_schema)) =
                        pattern_keys.iter().find(|(re, _)| re.is_match(name))
                    {
                        path.push(PathSegment::Key(name.clone()));
                        value_schema.check(entry, path, out);
                        path.pop();
                    } else if !allow_unknown {
                        out.push(violation(path, format!("unknown key '{name}'")));
                    }
                }
            }
            SchemaKind::Union(options) => {
                let matches = options.iter().any(|option| option.validate(value).is_empty());
                if !matches {
                    out.push(violation(
                        path,
                        format!(
                            "value matches none of the {} allowed forms",
                            options.len()
                        ),
                    ));
                }
            }
        }
    }
}

/// Required key helper
pub fn required(name: &str, schema: Schema) -> KeySchema {
    KeySchema {
        name: name.to_string(),
        required: true,
        schema,
    }
}

/// Optional key helper
pub fn optional(name: &str, schema: Schema) -> KeySchema {
    KeySchema {
        name: name.to_string(),
        required: false,
        schema,
    }
}

fn violation(path: &[PathSegment], message: String) -> SchemaViolation {
    SchemaViolation {
        path: render_path(path),
        message,
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        while let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(rest[..bracket].to_string()));
            }
            let close = rest.find(']').unwrap_or(rest.len());
            if let Ok(index) = rest[bracket + 1..close].parse::<usize>() {
                segments.push(PathSegment::Index(index));
            }
            rest = rest.get(close + 1..).unwrap_or("");
        }
        if !rest.is_empty() {
            segments.push(PathSegment::Key(rest.to_string()));
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn port_schema() -> Schema {
        Schema::object(vec![
            required("name", Schema::pattern("^[a-z][a-z0-9-]*$")),
            required("number", Schema::number()),
        ])
    }

    #[test]
    fn valid_value_passes() {
        let schema = Schema::object(vec![
            required("name", Schema::string()),
            optional("ports", Schema::array(port_schema())),
        ]);
        let value = json!({"name": "api", "ports": [{"name": "http", "number": 80}]});
        assert!(schema.validate(&value).is_empty());
    }

    #[test]
    fn missing_required_key_reported() {
        let schema = Schema::object(vec![required("name", Schema::string())]);
        let violations = schema.validate(&json!({}));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("missing required key 'name'"));
    }

    #[test]
    fn unknown_key_rejected() {
        let schema = Schema::object(vec![required("name", Schema::string())]);
        let violations = schema.validate(&json!({"name": "x", "tyop": 1}));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("unknown key 'tyop'"));
    }

    #[test]
    fn unknown_key_allowed_when_opted_in() {
        let schema = Schema::object(vec![required("name", Schema::string())]).allow_unknown();
        assert!(schema.validate(&json!({"name": "x", "extra": 1})).is_empty());
    }

    #[test]
    fn violation_path_is_precise() {
        let schema = Schema::object(vec![optional("ports", Schema::array(port_schema()))]);
        let value = json!({"ports": [{"name": "http", "number": 80}, {"name": "grpc", "number": "nope"}]});
        let violations = schema.validate(&value);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "ports[1].number");
    }

    #[test]
    fn pattern_keys_validate_values() {
        let schema = Schema::object(vec![])
            .with_pattern_key("^env-", Schema::string());
        assert!(schema.validate(&json!({"env-region": "eu"})).is_empty());

        let violations = schema.validate(&json!({"env-region": 42}));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "env-region");
    }

    #[test]
    fn union_accepts_any_matching_form() {
        let schema = Schema::union(vec![Schema::string(), Schema::number()]);
        assert!(schema.validate(&json!("text")).is_empty());
        assert!(schema.validate(&json!(3)).is_empty());
        assert_eq!(schema.validate(&json!(true)).len(), 1);
    }

    #[test]
    fn posix_path_constraint() {
        let schema = Schema::posix_path();
        assert!(schema.validate(&json!("src/app/main.go")).is_empty());
        assert_eq!(schema.validate(&json!("src\\app")).len(), 1);
    }

    #[test]
    fn no_template_paths_collected() {
        let schema = Schema::object(vec![
            required("type", Schema::string().no_template()),
            optional(
                "spec",
                Schema::object(vec![optional("image", Schema::string())]).allow_unknown(),
            ),
        ]);
        assert_eq!(schema.no_template_paths(), vec!["type".to_string()]);
    }

    #[test]
    fn ensure_valid_attaches_snippet() {
        let source = "name: api\nports:\n  - name: http\n    number: nope\n";
        let schema = Schema::object(vec![
            required("name", Schema::string()),
            optional("ports", Schema::array(port_schema())),
        ]);
        let value: Value = serde_yaml::from_str(source).unwrap();

        let err = schema.ensure_valid(&value, Some(source)).unwrap_err();
        let TrellisError::Validation { path, snippet, .. } = &err else {
            panic!("expected Validation error, got {err:?}");
        };
        assert_eq!(path, "ports[0].number");
        let snippet = snippet.as_ref().expect("snippet should be attached");
        assert!(snippet.contains("number: nope"));
        assert!(snippet.contains('^'));
    }

    #[test]
    fn parse_path_round_trips() {
        let segments = parse_path("a.b[2].c");
        assert_eq!(render_path(&segments), "a.b[2].c");
    }
}
