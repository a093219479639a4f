// src/gcode/template.rs - `{ path | filter }` substitution for user macros
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unclosed '{{' at offset {0}")]
    Unclosed(usize),
    #[error("invalid expression '{0}'")]
    InvalidExpression(String),
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    #[error("'{0}' is undefined")]
    Undefined(String),
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

#[derive(Debug, Clone, PartialEq)]
enum PathStep {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Default(Value),
    Int,
    Float,
    Upper,
    Lower,
}

#[derive(Debug, Clone, PartialEq)]
struct Expression {
    source: String,
    path: Vec<PathStep>,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expression),
}

/// A macro body parsed once at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let close = find_close(&rest[open + 1..]).ok_or(TemplateError::Unclosed(offset + open))?;
            let body = &rest[open + 1..open + 1 + close];
            segments.push(Segment::Expr(parse_expression(body)?));
            let consumed = open + close + 2;
            rest = &rest[consumed..];
            offset += consumed;
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn render(&self, context: &Value) -> Result<String, TemplateError> {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Expr(expr) => output.push_str(&stringify(&evaluate(expr, context)?)),
            }
        }
        Ok(output)
    }
}

/// Finds the closing brace, skipping braces inside quotes.
fn find_close(text: &str) -> Option<usize> {
    let mut quote = None;
    for (idx, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '}') => return Some(idx),
            _ => {}
        }
    }
    None
}

fn split_filters(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (idx, c) in body.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '|') => {
                parts.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn parse_expression(body: &str) -> Result<Expression, TemplateError> {
    let invalid = || TemplateError::InvalidExpression(body.trim().to_string());
    let mut parts = split_filters(body).into_iter();
    let path = parse_path(parts.next().unwrap_or_default().trim()).ok_or_else(invalid)?;
    let filters = parts.map(|f| parse_filter(f.trim())).collect::<Result<Vec<_>, _>>()?;
    Ok(Expression { source: body.trim().to_string(), path, filters })
}

fn parse_path(text: &str) -> Option<Vec<PathStep>> {
    let mut steps = Vec::new();
    let mut rest = text;
    let (ident, tail) = take_ident(rest)?;
    steps.push(PathStep::Key(ident.to_string()));
    rest = tail;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let (ident, tail) = take_ident(tail)?;
            steps.push(PathStep::Key(ident.to_string()));
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']')?;
            let inner = tail[..end].trim();
            let step = match unquote(inner) {
                Some(key) => PathStep::Key(key),
                None => PathStep::Index(inner.parse().ok()?),
            };
            steps.push(step);
            rest = &tail[end + 1..];
        } else {
            return None;
        }
    }
    Some(steps)
}

fn take_ident(text: &str) -> Option<(&str, &str)> {
    let end = text
        .char_indices()
        .find(|(idx, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*idx == 0 && c.is_ascii_digit()))
        .map_or(text.len(), |(idx, _)| idx);
    if end == 0 { None } else { Some((&text[..end], &text[end..])) }
}

fn unquote(text: &str) -> Option<String> {
    let quoted = (text.starts_with('"') && text.ends_with('"')) || (text.starts_with('\'') && text.ends_with('\''));
    (quoted && text.len() >= 2).then(|| text[1..text.len() - 1].to_string())
}

fn parse_filter(text: &str) -> Result<Filter, TemplateError> {
    let (name, argument) = match text.find('(') {
        Some(open) if text.ends_with(')') => (text[..open].trim(), Some(text[open + 1..text.len() - 1].trim())),
        Some(_) => return Err(TemplateError::InvalidExpression(text.to_string())),
        None => (text, None),
    };
    match (name, argument) {
        ("default", Some(arg)) => Ok(Filter::Default(parse_literal(arg)?)),
        ("int", None) => Ok(Filter::Int),
        ("float", None) => Ok(Filter::Float),
        ("upper", None) => Ok(Filter::Upper),
        ("lower", None) => Ok(Filter::Lower),
        _ => Err(TemplateError::UnknownFilter(name.to_string())),
    }
}

fn parse_literal(text: &str) -> Result<Value, TemplateError> {
    if let Some(single) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::String(single.to_string()));
    }
    match text {
        "True" => return Ok(Value::Bool(true)),
        "False" => return Ok(Value::Bool(false)),
        "None" => return Ok(Value::Null),
        _ => {}
    }
    serde_json::from_str(text).map_err(|_| TemplateError::InvalidExpression(text.to_string()))
}

fn lookup<'a>(value: &'a Value, step: &PathStep) -> Option<&'a Value> {
    match (value, step) {
        (Value::Object(map), PathStep::Key(key)) => {
            map.get(key).or_else(|| map.get(&key.to_ascii_lowercase()))
        }
        (Value::Array(items), PathStep::Index(idx)) => items.get(*idx),
        (Value::Object(map), PathStep::Index(idx)) => map.get(&idx.to_string()),
        _ => None,
    }
}

fn evaluate(expr: &Expression, context: &Value) -> Result<Value, TemplateError> {
    let mut current = Some(context);
    for step in &expr.path {
        current = current.and_then(|value| lookup(value, step));
    }
    let mut value = current.filter(|v| !v.is_null()).cloned();

    for filter in &expr.filters {
        value = match (filter, value) {
            (Filter::Default(fallback), None) => Some(fallback.clone()),
            (Filter::Default(_), present) => present,
            (_, None) => return Err(TemplateError::Undefined(expr.source.clone())),
            (Filter::Int, Some(v)) => Some(Value::from(as_number(&v, &expr.source)?.trunc() as i64)),
            (Filter::Float, Some(v)) => Some(Value::from(as_number(&v, &expr.source)?)),
            (Filter::Upper, Some(v)) => Some(Value::String(stringify(&v).to_uppercase())),
            (Filter::Lower, Some(v)) => Some(Value::String(stringify(&v).to_lowercase())),
        };
    }
    value.ok_or_else(|| TemplateError::Undefined(expr.source.clone()))
}

fn as_number(value: &Value, source: &str) -> Result<f64, TemplateError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    number.ok_or_else(|| TemplateError::NotANumber(source.to_string()))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.1}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}
