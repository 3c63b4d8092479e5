//! Execution scopes and the per-build global context
//!
//! Every template runs against a chain of `ExecutionContext`s rooted at one
//! `GlobalContext`. Scopes are cheap to push (`Arc` parent links) and vanish
//! once nothing references them; macros hold their defining scope weakly,
//! the global macro registry keeps those scopes alive for the whole build.

use crate::ast::MacroSyntax;
use crate::error::{Position, Result, TemplateError};
use crate::fs::{File, FileSystem};
use crate::functions;
use crate::value::{Function, Value};
use sqlweave_core::{Config, TargetConfig};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

/// Maximum nesting of macro invocations before evaluation is aborted
pub const MAX_CALL_DEPTH: usize = 64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One lexical scope
pub struct ExecutionContext {
    variables: Mutex<HashMap<String, Value>>,
    file: Option<Arc<File>>,
    is_executing: bool,
    depth: usize,
    parent: Option<Arc<ExecutionContext>>,
    global: Arc<GlobalContext>,
}

impl ExecutionContext {
    /// A root scope for compiling `file`. `is_executing == false` is the
    /// dry structural pass.
    pub fn root(
        global: Arc<GlobalContext>,
        file: Option<Arc<File>>,
        is_executing: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            variables: Mutex::new(HashMap::new()),
            file,
            is_executing,
            depth: 0,
            parent: None,
            global,
        })
    }

    /// A child scope of `self` for a loop iteration, call-block or `caller()`
    pub fn push_scope(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            variables: Mutex::new(HashMap::new()),
            file: self.file.clone(),
            is_executing: self.is_executing,
            depth: self.depth,
            parent: Some(self.clone()),
            global: self.global.clone(),
        })
    }

    /// The scope a macro body runs in: a child of the macro's defining
    /// scope that compiles on behalf of the caller's unit
    pub fn macro_scope(defining: &Arc<Self>, caller: &ExecutionContext) -> Arc<Self> {
        Arc::new(Self {
            variables: Mutex::new(HashMap::new()),
            file: caller.file.clone(),
            is_executing: caller.is_executing,
            depth: caller.depth + 1,
            parent: Some(defining.clone()),
            global: caller.global.clone(),
        })
    }

    pub fn file(&self) -> Option<&Arc<File>> {
        self.file.as_ref()
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing
    }

    /// Macro call nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    /// Bind `name` in this scope
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        lock(&self.variables).insert(name.into(), value);
    }

    /// Look `name` up through the scope chain, then the built-in dynamic
    /// variables, constants and the macro registry
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = lock(&current.variables).get(name) {
                return Some(value.clone());
            }
            scope = current.parent.as_deref();
        }

        functions::dynamic_variable(self, name)
            .or_else(|| self.global.constant(name).cloned())
            .or_else(|| self.global.find_macro(name).map(Value::Function))
    }

    /// Flatten the whole chain into `target`; the innermost binding of a
    /// name wins
    pub fn copy_variables_into(&self, target: &ExecutionContext) {
        let mut chain = Vec::new();
        let mut scope = Some(self);
        while let Some(current) = scope {
            chain.push(current);
            scope = current.parent.as_deref();
        }

        let mut flattened = HashMap::new();
        for current in chain.into_iter().rev() {
            for (name, value) in lock(&current.variables).iter() {
                flattened.insert(name.clone(), value.clone());
            }
        }

        lock(&target.variables).extend(flattened);
    }

    /// Name used in log fields and errors for the unit this scope compiles
    pub fn unit_name(&self) -> &str {
        self.file.as_ref().map(|f| f.name()).unwrap_or("<template>")
    }
}

/// Options fixed for the lifetime of one build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Rebuild incremental models from scratch (`is_incremental()` is false)
    pub full_refresh: bool,
}

struct RegisteredMacro {
    function: Function,
    // keeps the weakly captured defining scope alive
    _scope: Arc<ExecutionContext>,
}

/// The root of every scope chain. Exactly one per build.
pub struct GlobalContext {
    constants: HashMap<String, Value>,
    macros: Mutex<HashMap<String, RegisteredMacro>>,
    resolutions: ResolutionTable,
    files: Arc<FileSystem>,
    config: Config,
    options: BuildOptions,
    selection: RwLock<Option<BTreeSet<String>>>,
}

impl GlobalContext {
    pub fn new(files: Arc<FileSystem>, config: Config, options: BuildOptions) -> Arc<Self> {
        Arc::new(Self {
            constants: functions::constants(&config),
            macros: Mutex::new(HashMap::new()),
            resolutions: ResolutionTable::default(),
            files,
            config,
            options,
            selection: RwLock::new(None),
        })
    }

    /// The global scope is read-only
    pub fn set_variable(&self, name: &str, _value: Value) -> Result<()> {
        Err(TemplateError::eval(
            &Position::builtin(),
            format!("cannot set `{}` on the global context", name),
        ))
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn files(&self) -> &Arc<FileSystem> {
        &self.files
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Restrict the build to `names`; references to units outside it read
    /// from the `[upstream]` target when one is configured
    pub fn set_selection(&self, names: Option<BTreeSet<String>>) {
        let mut selection = self.selection.write().unwrap_or_else(PoisonError::into_inner);
        *selection = names;
    }

    pub fn is_selected(&self, name: &str) -> bool {
        let selection = self.selection.read().unwrap_or_else(PoisonError::into_inner);
        selection.as_ref().map_or(true, |names| names.contains(name))
    }

    /// The dataset a unit's relation lives in: the project target, the
    /// upstream target for unselected units, and a `dataset` config
    /// override on top of either
    pub fn target_for(&self, file: &File) -> TargetConfig {
        let base = match &self.config.upstream {
            Some(upstream) if !self.is_selected(file.name()) => upstream,
            _ => &self.config.target,
        };

        match file.config_value("dataset") {
            Some(Value::String(dataset)) => TargetConfig::new(base.project.clone(), dataset),
            _ => base.clone(),
        }
    }

    /// Fully qualified relation name for a unit
    pub fn relation_name(&self, file: &File) -> String {
        self.target_for(file).qualify(file.name())
    }

    pub fn register_macro(&self, syntax: &Arc<MacroSyntax>, scope: &Arc<ExecutionContext>) {
        let function = Function::Macro(syntax.clone(), Arc::downgrade(scope));
        tracing::debug!(name = %syntax.name, unit = scope.unit_name(), "registered macro");
        lock(&self.macros).insert(
            syntax.name.clone(),
            RegisteredMacro {
                function,
                _scope: scope.clone(),
            },
        );
    }

    /// Drop every registered macro and the scopes they captured
    pub fn clear_macros(&self) {
        lock(&self.macros).clear();
        self.resolutions.forget("macro:");
    }

    pub fn find_macro(&self, name: &str) -> Option<Function> {
        lock(&self.macros).get(name).map(|m| m.function.clone())
    }

    /// Find a macro by name, interpreting the macro file that defines it
    /// the first time it is needed
    pub fn resolve_macro(self: &Arc<Self>, name: &str) -> Result<Option<Function>> {
        if let Some(function) = self.find_macro(name) {
            return Ok(Some(function));
        }

        let Some(file) = self.files.macro_file_defining(name)? else {
            return Ok(None);
        };

        let key = format!("macro:{}", file.name());
        self.resolutions.resolve_once(&key, name, || {
            crate::compiler::load_macro_file(self, &file)
        })?;

        Ok(self.find_macro(name))
    }

    /// Run `resolve` at most once per key per build. See [`ResolutionTable`].
    pub fn resolve_once<F>(&self, key: &str, unit: &str, resolve: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.resolutions.resolve_once(key, unit, resolve)
    }

    /// Allow keys starting with `prefix` to be resolved again
    pub fn forget_resolutions(&self, prefix: &str) {
        self.resolutions.forget(prefix);
    }
}

#[derive(Default)]
struct ResolutionState {
    done: HashSet<String>,
    in_progress: HashMap<String, ThreadId>,
    /// key each blocked thread is waiting on
    waiting: HashMap<ThreadId, String>,
}

impl ResolutionState {
    /// Whether `me` waiting on a key owned by `owner` closes a wait cycle
    fn closes_cycle(&self, mut owner: ThreadId, me: ThreadId) -> bool {
        for _ in 0..=self.waiting.len() {
            if owner == me {
                return true;
            }
            let Some(key) = self.waiting.get(&owner) else {
                return false;
            };
            let Some(next) = self.in_progress.get(key) else {
                return false;
            };
            owner = *next;
        }
        false
    }
}

/// Memoised one-shot resolution shared by all workers.
///
/// A key is resolved by exactly one thread; others asking for it block until
/// it is done. Asking for a key the current thread is already resolving, or
/// blocking in a way that closes a wait cycle between threads, fails with
/// `TemplateError::Cycle` instead of hanging.
#[derive(Default)]
struct ResolutionTable {
    state: Mutex<ResolutionState>,
    changed: Condvar,
}

impl ResolutionTable {
    fn resolve_once<F>(&self, key: &str, unit: &str, resolve: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let me = thread::current().id();
        let mut state = lock(&self.state);

        loop {
            if state.done.contains(key) {
                return Ok(());
            }
            match state.in_progress.get(key).copied() {
                None => break,
                Some(owner) if owner == me => return Err(TemplateError::cycle(unit)),
                Some(owner) => {
                    if state.closes_cycle(owner, me) {
                        return Err(TemplateError::cycle(unit));
                    }
                    state.waiting.insert(me, key.to_string());
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    state.waiting.remove(&me);
                }
            }
        }

        state.in_progress.insert(key.to_string(), me);
        drop(state);

        let result = resolve();

        let mut state = lock(&self.state);
        state.in_progress.remove(key);
        if result.is_ok() {
            state.done.insert(key.to_string());
        }
        drop(state);
        self.changed.notify_all();

        result
    }

    fn forget(&self, prefix: &str) {
        lock(&self.state).done.retain(|key| !key.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn global() -> Arc<GlobalContext> {
        let config = Config::from_toml(
            r#"
            name = "shop"
            [target]
            project = "acme"
            dataset = "analytics"
            "#,
        )
        .unwrap();
        GlobalContext::new(Arc::new(FileSystem::default()), config, BuildOptions::default())
    }

    #[test]
    fn lookup_walks_parent_chain() {
        let root = ExecutionContext::root(global(), None, true);
        root.set_variable("a", Value::from("outer"));
        let child = root.push_scope();
        child.set_variable("b", Value::from(1.0));

        assert_eq!(child.lookup("a"), Some(Value::from("outer")));
        assert_eq!(child.lookup("b"), Some(Value::from(1.0)));
        assert_eq!(root.lookup("b"), None);
    }

    #[test]
    fn child_bindings_shadow_and_vanish() {
        let root = ExecutionContext::root(global(), None, true);
        root.set_variable("x", Value::from("root"));
        {
            let child = root.push_scope();
            child.set_variable("x", Value::from("child"));
            assert_eq!(child.lookup("x"), Some(Value::from("child")));
        }
        assert_eq!(root.lookup("x"), Some(Value::from("root")));
    }

    #[test]
    fn copy_variables_innermost_wins() {
        let root = ExecutionContext::root(global(), None, true);
        root.set_variable("x", Value::from("root"));
        root.set_variable("y", Value::from("root"));
        let child = root.push_scope();
        child.set_variable("x", Value::from("child"));

        let target = ExecutionContext::root(root.global().clone(), None, true);
        child.copy_variables_into(&target);

        assert_eq!(target.lookup("x"), Some(Value::from("child")));
        assert_eq!(target.lookup("y"), Some(Value::from("root")));
    }

    #[test]
    fn global_set_variable_is_an_error() {
        let global = global();
        let err = global.set_variable("x", Value::Null).unwrap_err();
        assert!(matches!(err, TemplateError::Eval { .. }));
    }

    #[test]
    fn constants_are_visible_from_every_scope() {
        let root = ExecutionContext::root(global(), None, true);
        let child = root.push_scope();
        assert_eq!(child.lookup("project_name"), Some(Value::from("shop")));
        assert!(matches!(child.lookup("ref"), Some(Value::Function(_))));
    }

    #[test]
    fn resolve_once_runs_once() {
        let table = ResolutionTable::default();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            table
                .resolve_once("k", "unit", || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        table.forget("k");
        table.resolve_once("k", "unit", || Ok(())).unwrap();
    }

    #[test]
    fn reentrant_resolution_is_a_cycle() {
        let table = ResolutionTable::default();
        let err = table
            .resolve_once("k", "outer", || table.resolve_once("k", "inner", || Ok(())))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Cycle { unit } if unit == "inner"));
    }

    #[test]
    fn failed_resolution_can_be_retried() {
        let table = ResolutionTable::default();
        let err = table.resolve_once("k", "unit", || {
            Err(TemplateError::eval(&Position::builtin(), "boom"))
        });
        assert!(err.is_err());
        table.resolve_once("k", "unit", || Ok(())).unwrap();
    }

    #[test]
    fn concurrent_waiters_share_one_resolution() {
        let table = ResolutionTable::default();
        let runs = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    table
                        .resolve_once("k", "unit", || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_thread_wait_cycle_is_detected() {
        let table = ResolutionTable::default();
        let both_started = Barrier::new(2);

        let resolve = |own: &str, other: &str| {
            table.resolve_once(own, own, || {
                both_started.wait();
                table.resolve_once(other, own, || Ok(()))
            })
        };

        let results = thread::scope(|scope| {
            let a = scope.spawn(|| resolve("a", "b"));
            let b = scope.spawn(|| resolve("b", "a"));
            [a.join().unwrap(), b.join().unwrap()]
        });

        let cycles = results
            .iter()
            .filter(|r| matches!(r, Err(TemplateError::Cycle { .. })))
            .count();
        assert_eq!(cycles, 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    }
}
