//! Built-in template functions and global variables

use crate::compiler;
use crate::context::ExecutionContext;
use crate::error::{Position, Result, TemplateError};
use crate::value::{Function, Value};
use sqlweave_core::{Config, Materialization};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Upper bound on the number of items `range()` may produce
const MAX_RANGE: usize = 100_000;

pub type BuiltinFn = fn(&Call<'_>, Args) -> Result<Value>;

/// A native function callable from templates
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl Builtin {
    pub const fn new(name: &'static str, func: BuiltinFn) -> Self {
        Self { name, func }
    }

    pub fn call(
        &self,
        ctx: &Arc<ExecutionContext>,
        position: &Position,
        args: Args,
    ) -> Result<Value> {
        let call = Call {
            ctx,
            position,
            name: self.name,
        };
        (self.func)(&call, args)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// The site of a built-in invocation
pub struct Call<'a> {
    pub ctx: &'a Arc<ExecutionContext>,
    pub position: &'a Position,
    pub name: &'a str,
}

impl Call<'_> {
    pub fn error(&self, message: impl fmt::Display) -> TemplateError {
        TemplateError::eval(self.position, format!("{}(): {}", self.name, message))
    }
}

/// Evaluated call arguments
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Argument by position, or by keyword when not given positionally
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.named(name))
    }

    pub fn require(&self, call: &Call<'_>, index: usize, name: &str) -> Result<&Value> {
        self.get(index, name)
            .ok_or_else(|| call.error(format!("missing argument `{}`", name)))
    }

    pub fn string(&self, call: &Call<'_>, index: usize, name: &str) -> Result<String> {
        match self.require(call, index, name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(call.error(format!(
                "argument `{}` must be a string, got {}",
                name,
                other.kind()
            ))),
        }
    }

    pub fn number(&self, call: &Call<'_>, index: usize, name: &str) -> Result<f64> {
        self.require(call, index, name)?
            .as_number()
            .map_err(|e| call.error(e))
    }

    pub fn at_most(&self, call: &Call<'_>, count: usize) -> Result<()> {
        if self.positional.len() > count {
            return Err(call.error(format!(
                "expected at most {} arguments, got {}",
                count,
                self.positional.len()
            )));
        }
        Ok(())
    }
}

const FUNCTIONS: &[Builtin] = &[
    Builtin::new("ref", ref_),
    Builtin::new("source", source),
    Builtin::new("var", var),
    Builtin::new("env_var", env_var),
    Builtin::new("config", config),
    Builtin::new("is_incremental", is_incremental),
    Builtin::new("log", log),
    Builtin::new("range", range),
    Builtin::new("zip", zip),
    Builtin::new("fromjson", fromjson),
    Builtin::new("tojson", tojson),
];

const EXCEPTIONS: &[Builtin] = &[
    Builtin::new("raise_compiler_error", raise_compiler_error),
    Builtin::new("warn", warn),
];

/// Read-only globals visible from every scope
pub fn constants(config: &Config) -> HashMap<String, Value> {
    let mut constants: HashMap<String, Value> = FUNCTIONS
        .iter()
        .map(|b| (b.name.to_string(), Value::Function(Function::Builtin(*b))))
        .collect();

    constants.insert("return".to_string(), Value::Function(Function::Return));

    let exceptions: BTreeMap<String, Value> = EXCEPTIONS
        .iter()
        .map(|b| (b.name.to_string(), Value::Function(Function::Builtin(*b))))
        .collect();
    constants.insert("exceptions".to_string(), Value::Map(exceptions));

    let mut target = BTreeMap::new();
    target.insert("name".to_string(), Value::from(config.name.as_str()));
    target.insert("project".to_string(), Value::from(config.target.project.as_str()));
    target.insert("database".to_string(), Value::from(config.target.project.as_str()));
    target.insert("dataset".to_string(), Value::from(config.target.dataset.as_str()));
    target.insert("schema".to_string(), Value::from(config.target.dataset.as_str()));
    target.insert("threads".to_string(), Value::from(config.threads));
    constants.insert("target".to_string(), Value::Map(target));

    constants.insert("project_name".to_string(), Value::from(config.name.as_str()));
    constants
}

/// Globals whose value depends on the compiling unit
pub(crate) fn dynamic_variable(ctx: &ExecutionContext, name: &str) -> Option<Value> {
    match name {
        "this" => ctx
            .file()
            .map(|file| Value::String(ctx.global().relation_name(file))),
        "execute" => {
            // the dry pass cannot know what an executing compile would render
            if !ctx.is_executing() {
                if let Some(file) = ctx.file() {
                    file.mark_needs_recompile();
                }
            }
            Some(Value::Boolean(ctx.is_executing()))
        }
        _ => None,
    }
}

/// `ref('model')` or `ref('package', 'model')`
fn ref_(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 2)?;
    let index = args.positional.len().saturating_sub(1);
    let name = args.string(call, index, "name")?;
    compiler::resolve_reference(call.ctx, &name, call.position)
}

/// `source('source_name', 'table')`: a raw table in the target project
fn source(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 2)?;
    let source = args.string(call, 0, "source_name")?;
    let table = args.string(call, 1, "table_name")?;
    let project = &call.ctx.global().config().target.project;
    Ok(Value::String(format!("{}.{}.{}", project, source, table)))
}

fn var(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 2)?;
    let name = args.string(call, 0, "name")?;

    if let Some(value) = call.ctx.global().config().vars.get(&name) {
        return Ok(Value::from_json(value));
    }

    args.get(1, "default")
        .cloned()
        .ok_or_else(|| call.error(format!("required variable `{}` is not defined", name)))
}

fn env_var(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 2)?;
    let name = args.string(call, 0, "name")?;

    match std::env::var(&name) {
        Ok(value) => Ok(Value::String(value)),
        Err(_) => args.get(1, "default").cloned().ok_or_else(|| {
            call.error(format!("environment variable `{}` is not set", name))
        }),
    }
}

/// `config(materialized='table', tags=[...])`: stored on the compiling unit
fn config(call: &Call<'_>, args: Args) -> Result<Value> {
    let Some(file) = call.ctx.file() else {
        return Ok(Value::Undefined);
    };

    for value in &args.positional {
        match value {
            Value::Map(entries) => {
                for (key, value) in entries {
                    file.set_config(key.clone(), value.clone());
                }
            }
            other => {
                return Err(call.error(format!(
                    "expected keyword arguments or a map, got {}",
                    other.kind()
                )))
            }
        }
    }

    for (key, value) in args.named {
        if key == "materialized" {
            let text = value.as_string();
            text.parse::<Materialization>().map_err(|e| call.error(e))?;
        }
        file.set_config(key, value);
    }

    Ok(Value::Undefined)
}

fn is_incremental(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 0)?;
    let global = call.ctx.global();

    let incremental = match call.ctx.file() {
        // the answer depends on the final config, known after this pass
        Some(file) if !call.ctx.is_executing() => {
            file.mark_needs_recompile();
            false
        }
        Some(file) => {
            !global.options().full_refresh
                && global.files().materialization(file) == Materialization::Incremental
        }
        None => false,
    };

    Ok(Value::Boolean(incremental))
}

fn log(call: &Call<'_>, args: Args) -> Result<Value> {
    let message = args.require(call, 0, "msg")?.as_string();
    if emits_now(call.ctx) {
        tracing::info!(unit = call.ctx.unit_name(), "{}", message);
    }
    Ok(Value::String(String::new()))
}

/// Messages are emitted once per unit. A unit in its dry pass is flagged
/// for the executing pass and emits from there.
fn emits_now(ctx: &ExecutionContext) -> bool {
    match ctx.file() {
        Some(file) if !ctx.is_executing() => {
            file.mark_needs_recompile();
            false
        }
        _ => true,
    }
}

fn range(call: &Call<'_>, args: Args) -> Result<Value> {
    args.at_most(call, 3)?;
    let (start, stop) = if args.positional.len() >= 2 {
        (args.number(call, 0, "start")?, args.number(call, 1, "stop")?)
    } else {
        (0.0, args.number(call, 0, "stop")?)
    };
    let step = match args.positional.get(2) {
        Some(step) => step.as_number().map_err(|e| call.error(e))?,
        None => 1.0,
    };

    if step == 0.0 {
        return Err(call.error("step must not be zero"));
    }

    let mut items = Vec::new();
    let mut current = start;
    while (step > 0.0 && current < stop) || (step < 0.0 && current > stop) {
        if items.len() >= MAX_RANGE {
            return Err(call.error(format!("more than {} items", MAX_RANGE)));
        }
        items.push(Value::Number(current));
        current += step;
    }

    Ok(Value::List(items))
}

fn zip(call: &Call<'_>, args: Args) -> Result<Value> {
    let mut lists = Vec::new();
    for value in &args.positional {
        match value {
            Value::List(items) => lists.push(items),
            other => return Err(call.error(format!("expected lists, got {}", other.kind()))),
        }
    }

    let len = lists.iter().map(|l| l.len()).min().unwrap_or(0);
    let zipped = (0..len)
        .map(|i| Value::List(lists.iter().map(|l| l[i].clone()).collect()))
        .collect();

    Ok(Value::List(zipped))
}

fn fromjson(call: &Call<'_>, args: Args) -> Result<Value> {
    let text = args.string(call, 0, "string")?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Ok(Value::from_json(&json)),
        Err(e) => match args.get(1, "default") {
            Some(default) => Ok(default.clone()),
            None => Err(call.error(format!("invalid JSON: {}", e))),
        },
    }
}

fn tojson(call: &Call<'_>, args: Args) -> Result<Value> {
    let value = args.require(call, 0, "value")?;
    serde_json::to_string(&value.to_json())
        .map(Value::String)
        .map_err(|e| call.error(e))
}

fn raise_compiler_error(call: &Call<'_>, args: Args) -> Result<Value> {
    let message = args
        .get(0, "msg")
        .map(Value::as_string)
        .unwrap_or_else(|| "compilation error".to_string());

    Err(TemplateError::Compiler {
        position: call.position.clone(),
        message,
    })
}

fn warn(call: &Call<'_>, args: Args) -> Result<Value> {
    let message = args.require(call, 0, "msg")?.as_string();
    if emits_now(call.ctx) {
        tracing::warn!(unit = call.ctx.unit_name(), "{}", message);
    }
    Ok(Value::String(String::new()))
}
