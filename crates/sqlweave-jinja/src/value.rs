//! Dynamic runtime values
//!
//! Every value carries an explicit discriminant; a `Number(0.0)` or an empty
//! `String` is a fully formed value, never "unset".

use crate::ast::{Body, MacroSyntax};
use crate::context::ExecutionContext;
use crate::functions::Builtin;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    List,
    Map,
    Function,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
            Self::Function => "function",
        };
        f.write_str(name)
    }
}

/// A value produced while interpreting a template
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(Function),
}

/// Something a template can call
#[derive(Clone)]
pub enum Function {
    Builtin(Builtin),
    /// A user macro; the defining scope is held weakly so a scope storing its
    /// own macros does not keep itself alive
    Macro(Arc<MacroSyntax>, Weak<ExecutionContext>),
    /// The body of a `{% call %}` block, re-entered through `caller()`
    Caller(Arc<Body>, Arc<ExecutionContext>),
    /// A method looked up on a string or map, e.g. `name.upper`
    Method(Box<Value>, String),
    /// `return(value)`: ends the enclosing macro
    Return,
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(builtin) => builtin.name,
            Self::Macro(syntax, _) => &syntax.name,
            Self::Caller(..) => "caller",
            Self::Method(_, name) => name,
            Self::Return => "return",
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name())
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Builtin(a), Self::Builtin(b)) => a.name == b.name,
            (Self::Macro(a, _), Self::Macro(b, _)) => Arc::ptr_eq(a, b),
            (Self::Caller(a, _), Self::Caller(b, _)) => Arc::ptr_eq(a, b),
            (Self::Method(a, n), Self::Method(b, m)) => n == m && a.equals(b),
            (Self::Return, Self::Return) => true,
            _ => false,
        }
    }
}

/// A value that cannot be converted to a number
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot convert {kind} value {text:?} to a number")]
pub struct NumberConversionError {
    pub kind: ValueKind,
    pub text: String,
}

/// Render a number the shortest way that round-trips (`14`, `0.5`, `-3`)
pub fn format_number(n: f64) -> String {
    if n == 0.0 {
        // avoids "-0"
        "0".to_string()
    } else {
        format!("{}", n)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Undefined => ValueKind::Undefined,
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Function(_) => ValueKind::Function,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Text rendering used when a value is interpolated into SQL
    pub fn as_string(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Boolean(true) => "TRUE".to_string(),
            Value::Boolean(false) => "FALSE".to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Map(_) => self.repr(),
            Value::Function(function) => format!("<function {}>", function.name()),
        }
    }

    /// Python-style rendering used for values nested in lists and maps
    pub fn repr(&self) -> String {
        match self {
            Value::String(s) => format!("'{}'", s),
            Value::Undefined | Value::Null => "None".to_string(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            other => other.as_string(),
        }
    }

    pub fn as_number(&self) -> Result<f64, NumberConversionError> {
        match self {
            Value::Undefined | Value::Null => Ok(0.0),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Ok(*n),
            Value::String(s) => s.trim().parse::<f64>().map_err(|_| NumberConversionError {
                kind: ValueKind::String,
                text: s.clone(),
            }),
            other => Err(NumberConversionError {
                kind: other.kind(),
                text: other.as_string(),
            }),
        }
    }

    /// Check if the value is truthy (for conditions)
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Number(_) | Value::Function(_) => true,
        }
    }

    /// Deep structural equality; values of different kinds are never equal
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.equals(other)))
            }
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for `<`-style comparisons and sorting; `None` when the
    /// kinds cannot be compared
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        unequal => return Some(unequal),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// Element count for strings, lists and maps
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::List(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    /// `needle in self`
    pub fn contains(&self, needle: &Value) -> Option<bool> {
        match self {
            Value::String(s) => Some(s.contains(&needle.as_string())),
            Value::List(items) => Some(items.iter().any(|item| item.equals(needle))),
            Value::Map(entries) => Some(entries.contains_key(&needle.as_string())),
            Value::Undefined | Value::Null => Some(false),
            _ => None,
        }
    }

    /// Index a list (negative counts from the end), map or string.
    /// Missing entries yield `Undefined`.
    pub fn get_item(&self, index: &Value) -> Option<Value> {
        match self {
            Value::List(items) => {
                let i = resolve_index(index, items.len())?;
                Some(items.get(i).cloned().unwrap_or(Value::Undefined))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = resolve_index(index, chars.len())?;
                Some(
                    chars
                        .get(i)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Undefined),
                )
            }
            Value::Map(entries) => Some(
                entries
                    .get(&index.as_string())
                    .cloned()
                    .unwrap_or(Value::Undefined),
            ),
            _ => None,
        }
    }

    /// Items a `for` loop visits: list elements, map keys, string characters
    pub fn iter_values(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.clone()),
            Value::Map(entries) => Some(entries.keys().cloned().map(Value::String).collect()),
            Value::String(s) => Some(s.chars().map(|c| Value::String(c.to_string())).collect()),
            Value::Undefined | Value::Null => Some(Vec::new()),
            _ => None,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON form; functions and undefined become `null`
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn resolve_index(index: &Value, len: usize) -> Option<usize> {
    let Value::Number(n) = index else {
        return None;
    };
    if n.fract() != 0.0 {
        return None;
    }
    let i = *n as i64;
    if i < 0 {
        let from_end = len as i64 + i;
        // out of range maps past the end, which yields Undefined
        Some(if from_end < 0 { len } else { from_end as usize })
    } else {
        Some(i as usize)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

/// Result of executing a node or body: the produced value plus whether a
/// `return(...)` was hit and the enclosing macro must stop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub value: Value,
    pub is_return: bool,
}

impl Output {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            is_return: false,
        }
    }

    pub fn returned(value: Value) -> Self {
        Self {
            value,
            is_return: true,
        }
    }

    pub fn empty() -> Self {
        Self::value(Value::Undefined)
    }
}
