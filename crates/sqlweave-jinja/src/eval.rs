//! Tree-walking interpreter
//!
//! Statements produce an [`Output`]; a body concatenates the text of its
//! nodes and stops at the first output flagged `is_return`, which is passed
//! up unchanged until a macro boundary unwraps it.

use crate::ast::{Argument, BinaryOp, Body, MacroSyntax, Node, NodeKind, UnaryOp};
use crate::context::{ExecutionContext, MAX_CALL_DEPTH};
use crate::error::{Position, Result, TemplateError};
use crate::filters;
use crate::fs::FileKind;
use crate::functions::{Args, Call};
use crate::predicates;
use crate::value::{Function, Output, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Upper bound in bytes on the result of repeating a string with `*`
const MAX_REPEAT_LEN: usize = 16 * 1024 * 1024;

/// Execute a body and render its output as text
pub fn render(body: &Body, ctx: &Arc<ExecutionContext>) -> Result<String> {
    Ok(execute_body(body, ctx)?.value.as_string())
}

pub fn execute_body(body: &Body, ctx: &Arc<ExecutionContext>) -> Result<Output> {
    let mut text = String::new();

    for node in &body.nodes {
        let output = execute_node(node, ctx)?;
        if output.is_return {
            return Ok(output);
        }
        text.push_str(&output.value.as_string());
    }

    Ok(Output::value(text))
}

fn execute_node(node: &Node, ctx: &Arc<ExecutionContext>) -> Result<Output> {
    match &node.kind {
        NodeKind::Text(text) => Ok(Output::value(text.as_str())),

        NodeKind::Macro(syntax) => {
            define_macro(syntax, ctx);
            Ok(Output::empty())
        }

        NodeKind::CallBlock { call, body } => {
            let scope = ctx.push_scope();
            scope.set_variable(
                "caller",
                Value::Function(Function::Caller(body.clone(), ctx.clone())),
            );
            let output = evaluate_output(call, &scope)?;
            Ok(Output::value(output.value))
        }

        NodeKind::If { branches, otherwise } => {
            for branch in branches {
                if evaluate(&branch.condition, ctx)?.is_truthy() {
                    return execute_body(&branch.body, ctx);
                }
            }
            match otherwise {
                Some(body) => execute_body(body, ctx),
                None => Ok(Output::empty()),
            }
        }

        NodeKind::For {
            key,
            value,
            source,
            body,
            otherwise,
        } => execute_for(key.as_deref(), value, source, body, otherwise.as_ref(), ctx),

        NodeKind::Set { name, value } => {
            let value = evaluate(value, ctx)?;
            ctx.set_variable(name.clone(), value);
            Ok(Output::empty())
        }

        NodeKind::SetBlock { name, body } => {
            let output = execute_body(body, &ctx.push_scope())?;
            ctx.set_variable(name.clone(), Value::String(output.value.as_string()));
            Ok(Output::empty())
        }

        NodeKind::Do(expr) => {
            let output = evaluate_output(expr, ctx)?;
            if output.is_return {
                return Ok(output);
            }
            Ok(Output::empty())
        }

        NodeKind::Unsupported { keyword, .. } => Err(TemplateError::eval(
            &node.position,
            format!("unsupported block `{{% {} %}}`", keyword),
        )),

        NodeKind::EndOfFile => Ok(Output::empty()),

        _ => evaluate_output(node, ctx),
    }
}

/// Macros defined at the top of a macro file are registered globally;
/// anywhere else they are ordinary variables of the enclosing scope
fn define_macro(syntax: &Arc<MacroSyntax>, ctx: &Arc<ExecutionContext>) {
    let is_library = ctx.is_root() && ctx.file().is_some_and(|f| f.kind() == FileKind::Macro);

    if is_library {
        ctx.global().register_macro(syntax, ctx);
    } else {
        ctx.set_variable(
            syntax.name.clone(),
            Value::Function(Function::Macro(syntax.clone(), Arc::downgrade(ctx))),
        );
    }
}

fn execute_for(
    key: Option<&str>,
    value: &str,
    source: &Node,
    body: &Body,
    otherwise: Option<&Body>,
    ctx: &Arc<ExecutionContext>,
) -> Result<Output> {
    let collection = evaluate(source, ctx)?;

    let items: Vec<(Value, Value)> = match (&collection, key) {
        (Value::Map(entries), Some(_)) => entries
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect(),
        (_, _) => collection
            .iter_values()
            .ok_or_else(|| {
                TemplateError::eval(
                    &source.position,
                    format!("cannot iterate over {} value", collection.kind()),
                )
            })?
            .into_iter()
            .enumerate()
            .map(|(i, item)| (Value::from(i), item))
            .collect(),
    };

    if items.is_empty() {
        return match otherwise {
            Some(body) => execute_body(body, ctx),
            None => Ok(Output::empty()),
        };
    }

    let length = items.len();
    let mut text = String::new();

    for (i, (k, v)) in items.into_iter().enumerate() {
        let scope = ctx.push_scope();
        scope.set_variable("loop", loop_variable(i, length));
        if let Some(key) = key {
            scope.set_variable(key, k);
        }
        scope.set_variable(value, v);

        let output = execute_body(body, &scope)?;
        if output.is_return {
            return Ok(output);
        }
        text.push_str(&output.value.as_string());
    }

    Ok(Output::value(text))
}

fn loop_variable(index: usize, length: usize) -> Value {
    let mut entries = BTreeMap::new();
    entries.insert("index".to_string(), Value::from(index + 1));
    entries.insert("index0".to_string(), Value::from(index));
    entries.insert("revindex".to_string(), Value::from(length - index));
    entries.insert("revindex0".to_string(), Value::from(length - index - 1));
    entries.insert("first".to_string(), Value::Boolean(index == 0));
    entries.insert("last".to_string(), Value::Boolean(index + 1 == length));
    entries.insert("length".to_string(), Value::from(length));
    Value::Map(entries)
}

/// Evaluate an expression, keeping a `return(...)` flag raised by a call
fn evaluate_output(node: &Node, ctx: &Arc<ExecutionContext>) -> Result<Output> {
    match &node.kind {
        NodeKind::Call { target, args } => evaluate_call(node, target, args, ctx),
        _ => evaluate(node, ctx).map(Output::value),
    }
}

/// Evaluate an expression to a value
pub fn evaluate(node: &Node, ctx: &Arc<ExecutionContext>) -> Result<Value> {
    let value = match &node.kind {
        NodeKind::Variable(name) => ctx.lookup(name).unwrap_or_default(),

        NodeKind::Attribute { target, name } => {
            let target = evaluate(target, ctx)?;
            attribute(&target, name, &node.position)?
        }

        NodeKind::Index { target, index } => {
            let target = evaluate(target, ctx)?;
            let index = evaluate(index, ctx)?;
            target.get_item(&index).ok_or_else(|| {
                TemplateError::eval(
                    &node.position,
                    format!("cannot index {} value with {}", target.kind(), index.repr()),
                )
            })?
        }

        NodeKind::Call { target, args } => evaluate_call(node, target, args, ctx)?.value,

        NodeKind::Filter { target, name, args } => {
            let filter = filters::filter(name).ok_or_else(|| {
                TemplateError::eval(&node.position, format!("unknown filter `{}`", name))
            })?;
            let subject = evaluate(target, ctx)?;
            let mut args = evaluate_args(args, ctx)?;
            args.positional.insert(0, subject);
            filter.call(ctx, &node.position, args)?
        }

        NodeKind::List(items) => Value::List(
            items
                .iter()
                .map(|item| evaluate(item, ctx))
                .collect::<Result<_>>()?,
        ),

        NodeKind::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(evaluate(key, ctx)?.as_string(), evaluate(value, ctx)?);
            }
            Value::Map(map)
        }

        NodeKind::Str(s) => Value::String(s.clone()),
        NodeKind::Number(n) => Value::Number(*n),
        NodeKind::Bool(b) => Value::Boolean(*b),
        NodeKind::Null => Value::Null,

        NodeKind::Unary { op, operand } => {
            let operand = evaluate(operand, ctx)?;
            match op {
                UnaryOp::Not => Value::Boolean(!operand.is_truthy()),
                UnaryOp::Neg => Value::Number(-number(&operand, &node.position)?),
                UnaryOp::Pos => Value::Number(number(&operand, &node.position)?),
            }
        }

        NodeKind::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => Value::Boolean(evaluate(lhs, ctx)?.is_truthy() && evaluate(rhs, ctx)?.is_truthy()),

        NodeKind::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        } => Value::Boolean(evaluate(lhs, ctx)?.is_truthy() || evaluate(rhs, ctx)?.is_truthy()),

        NodeKind::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, ctx)?;
            let rhs = evaluate(rhs, ctx)?;
            binary(*op, &lhs, &rhs, &node.position)?
        }

        NodeKind::Conditional {
            then,
            condition,
            otherwise,
        } => {
            if evaluate(condition, ctx)?.is_truthy() {
                evaluate(then, ctx)?
            } else if let Some(otherwise) = otherwise {
                evaluate(otherwise, ctx)?
            } else {
                Value::Undefined
            }
        }

        NodeKind::Membership {
            needle,
            haystack,
            negated,
        } => {
            let needle = evaluate(needle, ctx)?;
            let haystack = evaluate(haystack, ctx)?;
            let found = haystack.contains(&needle).ok_or_else(|| {
                TemplateError::eval(
                    &node.position,
                    format!("cannot search a {} value", haystack.kind()),
                )
            })?;
            Value::Boolean(found != *negated)
        }

        NodeKind::Test {
            value,
            name,
            args,
            negated,
        } => {
            let test = predicates::test(name).ok_or_else(|| {
                TemplateError::eval(&node.position, format!("unknown test `{}`", name))
            })?;
            let value = evaluate(value, ctx)?;
            let args = evaluate_args(args, ctx)?;
            let call = Call {
                ctx,
                position: &node.position,
                name,
            };
            Value::Boolean(test(&call, &value, &args)? != *negated)
        }

        NodeKind::Text(_)
        | NodeKind::Macro(_)
        | NodeKind::CallBlock { .. }
        | NodeKind::If { .. }
        | NodeKind::For { .. }
        | NodeKind::Set { .. }
        | NodeKind::SetBlock { .. }
        | NodeKind::Do(_)
        | NodeKind::Unsupported { .. }
        | NodeKind::EndOfFile => {
            return Err(TemplateError::eval(
                &node.position,
                "statement used where a value was expected",
            ))
        }
    };

    Ok(value)
}

fn number(value: &Value, position: &Position) -> Result<f64> {
    value
        .as_number()
        .map_err(|e| TemplateError::eval(position, e.to_string()))
}

fn repeat(s: &str, count: f64, position: &Position) -> Result<String> {
    let count = count.max(0.0);
    if s.is_empty() {
        return Ok(String::new());
    }
    if s.len() as f64 * count > MAX_REPEAT_LEN as f64 {
        return Err(TemplateError::eval(
            position,
            format!("repeated string would exceed {} bytes", MAX_REPEAT_LEN),
        ));
    }
    Ok(s.repeat(count as usize))
}

fn attribute(target: &Value, name: &str, position: &Position) -> Result<Value> {
    if let Value::Map(entries) = target {
        if let Some(value) = entries.get(name) {
            return Ok(value.clone());
        }
    }

    if let Some(method) = filters::method(target, name) {
        return Ok(Value::Function(method));
    }

    match target {
        Value::Map(_) => Ok(Value::Undefined),
        other => Err(TemplateError::eval(
            position,
            format!("{} value has no attribute `{}`", other.kind(), name),
        )),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value, position: &Position) -> Result<Value> {
    let value = match op {
        BinaryOp::Eq => Value::Boolean(lhs.equals(rhs)),
        BinaryOp::NotEq => Value::Boolean(!lhs.equals(rhs)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = lhs.compare(rhs).ok_or_else(|| {
                TemplateError::eval(
                    position,
                    format!("cannot compare {} with {}", lhs.kind(), rhs.kind()),
                )
            })?;
            Value::Boolean(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::LtEq => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Concat => Value::String(format!("{}{}", lhs.as_string(), rhs.as_string())),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Value::String(format!("{}{}", a, b)),
            (Value::List(a), Value::List(b)) => Value::List(a.iter().chain(b).cloned().collect()),
            _ => Value::Number(number(lhs, position)? + number(rhs, position)?),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
                Value::String(repeat(s, *n, position)?)
            }
            _ => Value::Number(number(lhs, position)? * number(rhs, position)?),
        },
        BinaryOp::Sub => Value::Number(number(lhs, position)? - number(rhs, position)?),
        BinaryOp::Pow => Value::Number(number(lhs, position)?.powf(number(rhs, position)?)),
        BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => {
            let a = number(lhs, position)?;
            let b = number(rhs, position)?;
            if b == 0.0 {
                return Err(TemplateError::eval(position, "division by zero"));
            }
            Value::Number(match op {
                BinaryOp::Div => a / b,
                BinaryOp::FloorDiv => (a / b).floor(),
                // sign follows the divisor
                _ => a - b * (a / b).floor(),
            })
        }
        BinaryOp::And | BinaryOp::Or => {
            Value::Boolean(match op {
                BinaryOp::And => lhs.is_truthy() && rhs.is_truthy(),
                _ => lhs.is_truthy() || rhs.is_truthy(),
            })
        }
    };

    Ok(value)
}

fn evaluate_args(args: &[Argument], ctx: &Arc<ExecutionContext>) -> Result<Args> {
    let mut evaluated = Args::default();
    for arg in args {
        let value = evaluate(&arg.value, ctx)?;
        match &arg.name {
            Some(name) => evaluated.named.push((name.clone(), value)),
            None => evaluated.positional.push(value),
        }
    }
    Ok(evaluated)
}

fn evaluate_call(
    node: &Node,
    target: &Node,
    args: &[Argument],
    ctx: &Arc<ExecutionContext>,
) -> Result<Output> {
    let callee = match &target.kind {
        NodeKind::Variable(name) => match ctx.lookup(name) {
            Some(value) => value,
            None => match ctx.global().resolve_macro(name)? {
                Some(function) => Value::Function(function),
                None => {
                    return Err(TemplateError::eval(
                        &node.position,
                        format!("unknown function `{}`", name),
                    ))
                }
            },
        },
        _ => evaluate(target, ctx)?,
    };

    let Value::Function(function) = callee else {
        return Err(TemplateError::eval(
            &node.position,
            format!("`{}` is a {} value, not a function", target, callee.kind()),
        ));
    };

    let args = evaluate_args(args, ctx)?;
    call_function(&function, args, ctx, &node.position)
}

/// Invoke a callable value
pub fn call_function(
    function: &Function,
    args: Args,
    ctx: &Arc<ExecutionContext>,
    position: &Position,
) -> Result<Output> {
    match function {
        Function::Builtin(builtin) => builtin.call(ctx, position, args).map(Output::value),

        Function::Macro(syntax, scope) => invoke_macro(syntax, scope, args, ctx, position),

        Function::Caller(body, scope) => {
            let output = execute_body(body, &scope.push_scope())?;
            Ok(Output::value(output.value.as_string()))
        }

        Function::Method(receiver, name) => {
            let call = Call {
                ctx,
                position,
                name,
            };
            filters::call_method(&call, receiver, args).map(Output::value)
        }

        Function::Return => {
            let value = args.positional.into_iter().next().unwrap_or_default();
            Ok(Output::returned(value))
        }
    }
}

fn invoke_macro(
    syntax: &Arc<MacroSyntax>,
    defining: &Weak<ExecutionContext>,
    args: Args,
    ctx: &Arc<ExecutionContext>,
    position: &Position,
) -> Result<Output> {
    let defining = defining.upgrade().ok_or_else(|| {
        TemplateError::eval(
            position,
            format!("macro `{}` outlived the scope it was defined in", syntax.name),
        )
    })?;

    if ctx.depth() >= MAX_CALL_DEPTH {
        return Err(TemplateError::eval(
            position,
            format!(
                "maximum macro call depth ({}) exceeded calling `{}`",
                MAX_CALL_DEPTH, syntax.name
            ),
        ));
    }

    if args.positional.len() > syntax.params.len() {
        return Err(TemplateError::eval(
            position,
            format!(
                "macro `{}` takes {} arguments, {} given",
                syntax.name,
                syntax.params.len(),
                args.positional.len()
            ),
        ));
    }

    let scope = ExecutionContext::macro_scope(&defining, ctx);
    ctx.copy_variables_into(&scope);

    let mut positional = args.positional.into_iter();
    let mut named = args.named;

    for param in &syntax.params {
        let value = match positional.next() {
            Some(value) => value,
            None => match named.iter().position(|(name, _)| *name == param.name) {
                Some(i) => named.remove(i).1,
                None => match &param.default {
                    Some(default) => evaluate(default, &scope)?,
                    None => Value::Undefined,
                },
            },
        };
        scope.set_variable(param.name.clone(), value);
    }

    if let Some((name, _)) = named.first() {
        return Err(TemplateError::eval(
            position,
            format!("macro `{}` has no parameter `{}`", syntax.name, name),
        ));
    }

    let output = execute_body(&syntax.body, &scope)?;
    Ok(Output::value(output.value))
}
