//! Built-in tests: `value is name(args)`

use crate::error::Result;
use crate::functions::{Args, Call};
use crate::value::Value;

pub type TestFn = fn(&Call<'_>, &Value, &Args) -> Result<bool>;

const TESTS: &[(&str, TestFn)] = &[
    ("defined", |_, v, _| Ok(!v.is_undefined())),
    ("undefined", |_, v, _| Ok(v.is_undefined())),
    ("none", |_, v, _| Ok(matches!(v, Value::Null))),
    ("string", |_, v, _| Ok(matches!(v, Value::String(_)))),
    ("number", |_, v, _| Ok(matches!(v, Value::Number(_)))),
    ("boolean", |_, v, _| Ok(matches!(v, Value::Boolean(_)))),
    ("true", |_, v, _| Ok(matches!(v, Value::Boolean(true)))),
    ("false", |_, v, _| Ok(matches!(v, Value::Boolean(false)))),
    ("mapping", |_, v, _| Ok(matches!(v, Value::Map(_)))),
    ("sequence", |_, v, _| {
        Ok(matches!(v, Value::List(_) | Value::String(_)))
    }),
    ("iterable", |_, v, _| {
        Ok(matches!(v, Value::List(_) | Value::Map(_) | Value::String(_)))
    }),
    ("callable", |_, v, _| Ok(matches!(v, Value::Function(_)))),
    ("lower", |_, v, _| {
        Ok(matches!(v, Value::String(s) if s.to_lowercase() == *s))
    }),
    ("upper", |_, v, _| {
        Ok(matches!(v, Value::String(s) if s.to_uppercase() == *s))
    }),
    ("even", even),
    ("odd", |call, v, args| even(call, v, args).map(|even| !even)),
    ("divisibleby", divisible_by),
    ("eq", equal_to),
    ("equalto", equal_to),
    ("in", contained_in),
];

pub fn test(name: &str) -> Option<TestFn> {
    TESTS.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

fn integer(call: &Call<'_>, value: &Value) -> Result<i64> {
    let n = value.as_number().map_err(|e| call.error(e))?;
    if n.fract() != 0.0 {
        return Err(call.error(format!("{} is not an integer", value.repr())));
    }
    Ok(n as i64)
}

fn even(call: &Call<'_>, value: &Value, _: &Args) -> Result<bool> {
    Ok(integer(call, value)? % 2 == 0)
}

fn divisible_by(call: &Call<'_>, value: &Value, args: &Args) -> Result<bool> {
    let divisor = integer(call, args.require(call, 0, "num")?)?;
    if divisor == 0 {
        return Err(call.error("division by zero"));
    }
    Ok(integer(call, value)? % divisor == 0)
}

fn equal_to(call: &Call<'_>, value: &Value, args: &Args) -> Result<bool> {
    Ok(value.equals(args.require(call, 0, "other")?))
}

fn contained_in(call: &Call<'_>, value: &Value, args: &Args) -> Result<bool> {
    let haystack = args.require(call, 0, "seq")?;
    haystack
        .contains(value)
        .ok_or_else(|| call.error(format!("cannot search a {} value", haystack.kind())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BuildOptions, ExecutionContext, GlobalContext};
    use crate::error::Position;
    use crate::fs::FileSystem;
    use sqlweave_core::Config;
    use std::sync::Arc;

    fn check(name: &str, value: Value, args: Vec<Value>) -> Result<bool> {
        let global = GlobalContext::new(
            Arc::new(FileSystem::default()),
            Config::default(),
            BuildOptions::default(),
        );
        let ctx = ExecutionContext::root(global, None, true);
        let position = Position::builtin();
        let call = Call {
            ctx: &ctx,
            position: &position,
            name,
        };
        test(name).unwrap()(&call, &value, &Args::new(args))
    }

    #[test]
    fn kind_tests() {
        assert!(check("defined", Value::from(0.0), vec![]).unwrap());
        assert!(check("undefined", Value::Undefined, vec![]).unwrap());
        assert!(check("none", Value::Null, vec![]).unwrap());
        assert!(!check("none", Value::Undefined, vec![]).unwrap());
        assert!(check("mapping", Value::Map(Default::default()), vec![]).unwrap());
        assert!(check("sequence", Value::List(vec![]), vec![]).unwrap());
    }

    #[test]
    fn number_tests() {
        assert!(check("even", Value::from(4.0), vec![]).unwrap());
        assert!(check("odd", Value::from(3.0), vec![]).unwrap());
        assert!(check("divisibleby", Value::from(9.0), vec![Value::from(3.0)]).unwrap());
        assert!(check("divisibleby", Value::from(9.0), vec![Value::from(0.0)]).is_err());
        assert!(check("even", Value::from(1.5), vec![]).is_err());
    }

    #[test]
    fn comparison_tests() {
        assert!(check("eq", Value::from("a"), vec![Value::from("a")]).unwrap());
        assert!(check("in", Value::from("a"), vec![Value::from("cat")]).unwrap());
        assert!(check("in", Value::from(1.0), vec![Value::from(2.0)]).is_err());
    }

    #[test]
    fn unknown_test_is_absent() {
        assert!(test("prime").is_none());
    }
}
