//! Template string parser
//!
//! Single-pass tokenization of `${...}` expressions embedded in strings,
//! plus a recursive-descent parser for the expression grammar:
//!
//! ```text
//! expr      := alt
//! alt       := primary ( "||" primary )*
//! primary   := call | reference | literal
//! reference := ident ( "." ident | "." integer )*
//! call      := ident "(" expr ( "," expr )* ")"
//! literal   := "..." | '...' | number | true | false | null
//! ```
//!
//! `$${` escapes a literal `${`.

use std::ops::Range;

use serde_json::Value;

use crate::error::{Result, TrellisError};

/// A parsed fragment of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text (range in the original string)
    Literal(Range<usize>),
    /// Escaped `$${` - renders as `${`
    Escaped(Range<usize>),
    /// A `${...}` expression with its full source range (braces included)
    Expression { expr: Expr, raw: Range<usize> },
}

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted reference: `actions.build.api.outputs.image`
    Reference(Vec<String>),
    /// JSON literal
    Literal(Value),
    /// Function call: `replace(var.name, "-", "_")`
    Call { name: String, args: Vec<Expr> },
    /// Fallback chain: `a || b || "default"`
    Alt(Vec<Expr>),
}

impl Expr {
    /// Collect every reference path in this expression (including inside
    /// calls and fallback chains). Used for dependency inference.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a [String]>) {
        match self {
            Expr::Reference(path) => out.push(path),
            Expr::Literal(_) => {}
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_references(out);
                }
            }
            Expr::Alt(alternatives) => {
                for alt in alternatives {
                    alt.collect_references(out);
                }
            }
        }
    }
}

/// Tokenize a template string into segments (single pass)
pub fn tokenize(template: &str) -> Result<Vec<Segment>> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 2 < bytes.len() && bytes[i + 1] == b'$' && bytes[i + 2] == b'{'
        {
            if i > literal_start {
                segments.push(Segment::Literal(literal_start..i));
            }
            // consume up to the closing brace, emit as escaped text
            let close = find_closing_brace(template, i + 3)?;
            segments.push(Segment::Escaped(i + 1..close + 1));
            literal_start = close + 1;
            i = close + 1;
        } else if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if i > literal_start {
                segments.push(Segment::Literal(literal_start..i));
            }
            let close = find_closing_brace(template, i + 2)?;
            let inner = &template[i + 2..close];
            let expr = parse_expression(inner, i + 2)?;
            segments.push(Segment::Expression {
                expr,
                raw: i..close + 1,
            });
            literal_start = close + 1;
            i = close + 1;
        } else {
            i += 1;
        }
    }

    if literal_start < template.len() {
        segments.push(Segment::Literal(literal_start..template.len()));
    }

    Ok(segments)
}

/// Find the `}` closing an expression, skipping over quoted strings
fn find_closing_brace(template: &str, from: usize) -> Result<usize> {
    let bytes = template.as_bytes();
    let mut i = from;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        match (quote, bytes[i]) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(bytes[i]),
            (None, b'}') => return Ok(i),
            _ => {}
        }
        i += 1;
    }

    Err(TrellisError::TemplateParse {
        position: from,
        details: "unterminated ${...} expression".into(),
    })
}

/// Parse a full expression; errors report positions in the original string
pub fn parse_expression(src: &str, offset: usize) -> Result<Expr> {
    let mut cursor = Cursor { src, pos: 0, offset };
    let expr = cursor.parse_alt()?;
    cursor.skip_ws();
    if cursor.pos < cursor.src.len() {
        return Err(cursor.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn error(&self, details: &str) -> TrellisError {
        TrellisError::TemplateParse {
            position: self.offset + self.pos,
            details: details.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(|c: char| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_alt(&mut self) -> Result<Expr> {
        let first = self.parse_primary()?;
        let mut alternatives = vec![first];
        while self.eat("||") {
            alternatives.push(self.parse_primary()?);
        }
        if alternatives.len() == 1 {
            Ok(alternatives.pop().expect("len checked"))
        } else {
            Ok(Expr::Alt(alternatives))
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        self.skip_ws();
        let rest = self.rest();

        if rest.starts_with('"') || rest.starts_with('\'') {
            return self.parse_string_literal();
        }
        if rest.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
            return self.parse_number();
        }
        if rest.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return self.parse_ident_expr();
        }

        Err(self.error("expected reference, literal, or function call"))
    }

    fn parse_string_literal(&mut self) -> Result<Expr> {
        let quote = self.rest().chars().next().expect("caller checked");
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.src.len() {
            if self.src[self.pos..].starts_with(quote) {
                let text = self.src[start..self.pos].to_string();
                self.pos += 1;
                return Ok(Expr::Literal(Value::String(text)));
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let start = self.pos;
        if self.rest().starts_with('-') {
            self.pos += 1;
        }
        while self
            .rest()
            .starts_with(|c: char| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        let number: serde_json::Number = text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .ok_or_else(|| self.error("invalid number literal"))?;
        // Integers stay integers
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Expr::Literal(Value::Number(int.into())));
        }
        Ok(Expr::Literal(Value::Number(number)))
    }

    fn parse_ident(&mut self) -> String {
        let start = self.pos;
        while self
            .rest()
            .starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_ident_expr(&mut self) -> Result<Expr> {
        let first = self.parse_ident();

        match first.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        // Function call
        if self.eat("(") {
            let mut args = Vec::new();
            if !self.eat(")") {
                loop {
                    args.push(self.parse_alt()?);
                    if self.eat(")") {
                        break;
                    }
                    if !self.eat(",") {
                        return Err(self.error("expected ',' or ')' in argument list"));
                    }
                }
            }
            return Ok(Expr::Call { name: first, args });
        }

        // Dotted reference
        let mut path = vec![first];
        while self.eat(".") {
            self.skip_ws();
            if !self
                .rest()
                .starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(self.error("expected identifier after '.'"));
            }
            path.push(self.parse_ident());
        }
        Ok(Expr::Reference(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(src: &str) -> Expr {
        parse_expression(src, 0).unwrap()
    }

    #[test]
    fn tokenize_plain_literal() {
        let segments = tokenize("no expressions here").unwrap();
        assert_eq!(segments.len(), 1);
        assert!(matches!(&segments[0], Segment::Literal(r) if r.start == 0 && r.end == 19));
    }

    #[test]
    fn tokenize_mixed() {
        let segments = tokenize("image: ${actions.build.api.outputs.id}, tag ${var.tag}").unwrap();
        assert_eq!(segments.len(), 4);
        assert!(matches!(&segments[1], Segment::Expression { .. }));
        assert!(matches!(&segments[3], Segment::Expression { .. }));
    }

    #[test]
    fn tokenize_escaped_dollar_brace() {
        let segments = tokenize("literal $${not.a.ref} here").unwrap();
        assert!(segments
            .iter()
            .any(|s| matches!(s, Segment::Escaped(_))));
    }

    #[test]
    fn tokenize_unterminated_fails() {
        let err = tokenize("${var.x").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn parse_reference() {
        assert_eq!(
            parse("actions.build.api.outputs.image-id"),
            Expr::Reference(vec![
                "actions".into(),
                "build".into(),
                "api".into(),
                "outputs".into(),
                "image-id".into()
            ])
        );
    }

    #[test]
    fn parse_literals() {
        assert_eq!(parse("\"hello\""), Expr::Literal(json!("hello")));
        assert_eq!(parse("'single'"), Expr::Literal(json!("single")));
        assert_eq!(parse("42"), Expr::Literal(json!(42)));
        assert_eq!(parse("-7"), Expr::Literal(json!(-7)));
        assert_eq!(parse("true"), Expr::Literal(json!(true)));
        assert_eq!(parse("null"), Expr::Literal(Value::Null));
    }

    #[test]
    fn parse_fallback_chain() {
        let expr = parse("var.replicas || environment.replicas || 1");
        match expr {
            Expr::Alt(alternatives) => assert_eq!(alternatives.len(), 3),
            other => panic!("expected Alt, got {other:?}"),
        }
    }

    #[test]
    fn parse_call_with_args() {
        let expr = parse("replace(var.name, \"-\", \"_\")");
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "replace");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn parse_nested_call() {
        let expr = parse("if(var.debug, upper(var.name), var.name)");
        let mut refs = Vec::new();
        expr.collect_references(&mut refs);
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn parse_trailing_garbage_fails() {
        assert!(parse_expression("var.x ???", 0).is_err());
    }

    #[test]
    fn brace_inside_quotes_is_skipped() {
        let segments = tokenize("${replace(var.x, \"}\", \"_\")}").unwrap();
        assert_eq!(segments.len(), 1);
        assert!(matches!(&segments[0], Segment::Expression { .. }));
    }
}
