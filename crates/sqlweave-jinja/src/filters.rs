//! Filters (`value | name(args)`) and methods on strings and maps
//!
//! A filter receives the filtered value as its first positional argument.

use crate::error::Result;
use crate::functions::{Args, Builtin, Call};
use crate::value::{Function, Value};
use std::cmp::Ordering;

const FILTERS: &[Builtin] = &[
    Builtin::new("upper", upper),
    Builtin::new("lower", lower),
    Builtin::new("trim", trim),
    Builtin::new("title", title),
    Builtin::new("capitalize", capitalize),
    Builtin::new("length", length),
    Builtin::new("count", length),
    Builtin::new("default", default),
    Builtin::new("d", default),
    Builtin::new("join", join),
    Builtin::new("replace", replace),
    Builtin::new("first", first),
    Builtin::new("last", last),
    Builtin::new("list", list),
    Builtin::new("string", string),
    Builtin::new("as_text", string),
    Builtin::new("int", int),
    Builtin::new("float", float),
    Builtin::new("as_number", float),
    Builtin::new("abs", abs),
    Builtin::new("round", round),
    Builtin::new("sort", sort),
    Builtin::new("reverse", reverse),
    Builtin::new("unique", unique),
    Builtin::new("tojson", tojson),
    Builtin::new("as_bool", as_bool),
];

pub fn filter(name: &str) -> Option<Builtin> {
    FILTERS.iter().find(|f| f.name == name).copied()
}

const STRING_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "replace",
    "startswith",
    "endswith",
    "title",
];

const MAP_METHODS: &[&str] = &["keys", "values", "items", "get"];

/// `receiver.name` as a bound method, when the receiver's kind has one
pub fn method(receiver: &Value, name: &str) -> Option<Function> {
    let known = match receiver {
        Value::String(_) => STRING_METHODS.contains(&name),
        Value::Map(_) => MAP_METHODS.contains(&name),
        _ => false,
    };
    known.then(|| Function::Method(Box::new(receiver.clone()), name.to_string()))
}

pub fn call_method(call: &Call<'_>, receiver: &Value, args: Args) -> Result<Value> {
    match receiver {
        Value::String(s) => string_method(call, s, args),
        Value::Map(entries) => match call.name {
            "keys" => Ok(Value::List(entries.keys().cloned().map(Value::String).collect())),
            "values" => Ok(Value::List(entries.values().cloned().collect())),
            "items" => Ok(Value::List(
                entries
                    .iter()
                    .map(|(k, v)| Value::List(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            )),
            "get" => {
                let key = args.require(call, 0, "key")?.as_string();
                Ok(entries
                    .get(&key)
                    .cloned()
                    .or_else(|| args.get(1, "default").cloned())
                    .unwrap_or(Value::Null))
            }
            other => Err(call.error(format!("maps have no method `{}`", other))),
        },
        other => Err(call.error(format!("{} values have no methods", other.kind()))),
    }
}

fn string_method(call: &Call<'_>, s: &str, args: Args) -> Result<Value> {
    let value = match call.name {
        "upper" => Value::String(s.to_uppercase()),
        "lower" => Value::String(s.to_lowercase()),
        "title" => Value::String(title_case(s)),
        "strip" => Value::String(strip(s, &args, Side::Both)),
        "lstrip" => Value::String(strip(s, &args, Side::Start)),
        "rstrip" => Value::String(strip(s, &args, Side::End)),
        "split" => {
            let parts: Vec<Value> = match args.get(0, "sep") {
                Some(Value::String(sep)) if !sep.is_empty() => {
                    s.split(sep.as_str()).map(Value::from).collect()
                }
                Some(Value::String(_)) => return Err(call.error("empty separator")),
                _ => s.split_whitespace().map(Value::from).collect(),
            };
            Value::List(parts)
        }
        "replace" => {
            let from = args.string(call, 0, "old")?;
            let to = args.string(call, 1, "new")?;
            Value::String(s.replace(&from, &to))
        }
        "startswith" => Value::Boolean(s.starts_with(&args.string(call, 0, "prefix")?)),
        "endswith" => Value::Boolean(s.ends_with(&args.string(call, 0, "suffix")?)),
        other => return Err(call.error(format!("strings have no method `{}`", other))),
    };
    Ok(value)
}

enum Side {
    Both,
    Start,
    End,
}

/// Strip whitespace, or any of the characters given as the first argument
fn strip(s: &str, args: &Args, side: Side) -> String {
    let chars: Option<Vec<char>> = match args.get(0, "chars") {
        Some(Value::String(chars)) => Some(chars.chars().collect()),
        _ => None,
    };
    let matches = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };

    match side {
        Side::Both => s.trim_matches(matches),
        Side::Start => s.trim_start_matches(matches),
        Side::End => s.trim_end_matches(matches),
    }
    .to_string()
}

fn title_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut start_of_word = true;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if start_of_word {
                result.extend(ch.to_uppercase());
            } else {
                result.extend(ch.to_lowercase());
            }
            start_of_word = false;
        } else {
            result.push(ch);
            start_of_word = true;
        }
    }
    result
}

fn subject<'a>(call: &Call<'_>, args: &'a Args) -> Result<&'a Value> {
    args.positional
        .first()
        .ok_or_else(|| call.error("missing value to filter"))
}

fn upper(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::String(subject(call, &args)?.as_string().to_uppercase()))
}

fn lower(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::String(subject(call, &args)?.as_string().to_lowercase()))
}

fn trim(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::String(subject(call, &args)?.as_string().trim().to_string()))
}

fn title(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::String(title_case(&subject(call, &args)?.as_string())))
}

fn capitalize(call: &Call<'_>, args: Args) -> Result<Value> {
    let text = subject(call, &args)?.as_string();
    let mut chars = text.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(Value::String(capitalized))
}

fn length(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    value
        .len()
        .map(Value::from)
        .ok_or_else(|| call.error(format!("{} values have no length", value.kind())))
}

/// `value | default(fallback, boolean=false)`: the fallback replaces
/// undefined values, or any falsy value when `boolean` is set
fn default(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    let fallback = args.get(1, "default_value").cloned().unwrap_or_default();
    let boolean = args.get(2, "boolean").is_some_and(Value::is_truthy);

    let replace = value.is_undefined() || (boolean && !value.is_truthy());
    Ok(if replace { fallback } else { value.clone() })
}

fn join(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    let separator = args.get(1, "d").map(Value::as_string).unwrap_or_default();
    let items = value
        .iter_values()
        .ok_or_else(|| call.error(format!("cannot join {} value", value.kind())))?;
    let parts: Vec<String> = items.iter().map(Value::as_string).collect();
    Ok(Value::String(parts.join(&separator)))
}

fn replace(call: &Call<'_>, args: Args) -> Result<Value> {
    let text = subject(call, &args)?.as_string();
    let from = args.require(call, 1, "old")?.as_string();
    let to = args.require(call, 2, "new")?.as_string();
    Ok(Value::String(text.replace(&from, &to)))
}

fn items(call: &Call<'_>, args: &Args) -> Result<Vec<Value>> {
    let value = subject(call, args)?;
    value
        .iter_values()
        .ok_or_else(|| call.error(format!("{} value is not iterable", value.kind())))
}

fn first(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(items(call, &args)?.into_iter().next().unwrap_or_default())
}

fn last(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(items(call, &args)?.into_iter().last().unwrap_or_default())
}

fn list(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::List(items(call, &args)?))
}

fn string(call: &Call<'_>, args: Args) -> Result<Value> {
    Ok(Value::String(subject(call, &args)?.as_string()))
}

fn int(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    let n = value.as_number().map_err(|e| call.error(e))?;
    Ok(Value::Number(n.trunc()))
}

fn float(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    value
        .as_number()
        .map(Value::Number)
        .map_err(|e| call.error(e))
}

fn abs(call: &Call<'_>, args: Args) -> Result<Value> {
    let n = args.number(call, 0, "value")?;
    Ok(Value::Number(n.abs()))
}

fn round(call: &Call<'_>, args: Args) -> Result<Value> {
    let n = args.number(call, 0, "value")?;
    let precision = match args.get(1, "precision") {
        Some(p) => p.as_number().map_err(|e| call.error(e))?,
        None => 0.0,
    };
    let scale = 10f64.powi(precision as i32);
    Ok(Value::Number((n * scale).round() / scale))
}

fn sort(call: &Call<'_>, args: Args) -> Result<Value> {
    let mut values = items(call, &args)?;
    let reverse = args.get(1, "reverse").is_some_and(Value::is_truthy);

    let mut incomparable = None;
    values.sort_by(|a, b| {
        a.compare(b).unwrap_or_else(|| {
            incomparable.get_or_insert((a.kind(), b.kind()));
            Ordering::Equal
        })
    });
    if let Some((a, b)) = incomparable {
        return Err(call.error(format!("cannot compare {} with {}", a, b)));
    }

    if reverse {
        values.reverse();
    }
    Ok(Value::List(values))
}

fn reverse(call: &Call<'_>, args: Args) -> Result<Value> {
    match subject(call, &args)? {
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        _ => {
            let mut values = items(call, &args)?;
            values.reverse();
            Ok(Value::List(values))
        }
    }
}

fn unique(call: &Call<'_>, args: Args) -> Result<Value> {
    let mut seen: Vec<Value> = Vec::new();
    for value in items(call, &args)? {
        if !seen.iter().any(|s| s.equals(&value)) {
            seen.push(value);
        }
    }
    Ok(Value::List(seen))
}

fn tojson(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    serde_json::to_string(&value.to_json())
        .map(Value::String)
        .map_err(|e| call.error(e))
}

fn as_bool(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = subject(call, &args)?;
    Ok(match value {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => value.clone(),
        },
        Value::Number(n) => Value::Boolean(*n != 0.0),
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BuildOptions, ExecutionContext, GlobalContext};
    use crate::error::Position;
    use crate::fs::FileSystem;
    use sqlweave_core::Config;
    use std::sync::Arc;

    fn apply(name: &str, positional: Vec<Value>) -> Result<Value> {
        let global = GlobalContext::new(
            Arc::new(FileSystem::default()),
            Config::default(),
            BuildOptions::default(),
        );
        let ctx = ExecutionContext::root(global, None, true);
        filter(name)
            .unwrap()
            .call(&ctx, &Position::builtin(), Args::new(positional))
    }

    fn strings(items: &[&str]) -> Value {
        Value::List(items.iter().copied().map(Value::from).collect())
    }

    #[test]
    fn text_filters() {
        assert_eq!(apply("upper", vec![Value::from("abc")]).unwrap(), Value::from("ABC"));
        assert_eq!(
            apply("title", vec![Value::from("hello wORLD")]).unwrap(),
            Value::from("Hello World")
        );
        assert_eq!(apply("capitalize", vec![Value::from("hELLO")]).unwrap(), Value::from("Hello"));
        assert_eq!(apply("trim", vec![Value::from("  x ")]).unwrap(), Value::from("x"));
    }

    #[test]
    fn default_replaces_undefined_only() {
        assert_eq!(
            apply("default", vec![Value::Undefined, Value::from("x")]).unwrap(),
            Value::from("x")
        );
        assert_eq!(
            apply("default", vec![Value::from(""), Value::from("x")]).unwrap(),
            Value::from("")
        );
        assert_eq!(
            apply("default", vec![Value::from(""), Value::from("x"), Value::Boolean(true)])
                .unwrap(),
            Value::from("x")
        );
    }

    #[test]
    fn join_and_sort() {
        assert_eq!(
            apply("join", vec![strings(&["a", "b"]), Value::from(", ")]).unwrap(),
            Value::from("a, b")
        );
        assert_eq!(
            apply("sort", vec![strings(&["b", "c", "a"])]).unwrap(),
            strings(&["a", "b", "c"])
        );
        let mixed = Value::List(vec![Value::from("a"), Value::from(1.0)]);
        assert!(apply("sort", vec![mixed]).is_err());
    }

    #[test]
    fn unique_keeps_first_occurrence() {
        assert_eq!(apply("unique", vec![strings(&["a", "b", "a"])]).unwrap(), strings(&["a", "b"]));
    }

    #[test]
    fn length_of_unsized_value_is_an_error() {
        assert_eq!(apply("length", vec![strings(&["a", "b"])]).unwrap(), Value::from(2usize));
        assert!(apply("length", vec![Value::from(3.0)]).is_err());
    }

    #[test]
    fn round_with_precision() {
        assert_eq!(
            apply("round", vec![Value::from(2.346), Value::from(2.0)]).unwrap(),
            Value::from(2.35)
        );
        assert_eq!(apply("int", vec![Value::from("7.9")]).unwrap(), Value::from(7.0));
    }

    #[test]
    fn methods_exist_per_kind() {
        assert!(method(&Value::from("a"), "upper").is_some());
        assert!(method(&Value::from("a"), "keys").is_none());
        assert!(method(&Value::Map(Default::default()), "items").is_some());
        assert!(method(&Value::from(1.0), "upper").is_none());
    }
}
