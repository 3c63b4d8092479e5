//! Bounded parallel execution of a graph
//!
//! Workers share one ready list behind a mutex and sleep on a condition
//! variable while it is empty. A worker that finishes a node releases the
//! node's downstreams itself, so readiness cascades without a coordinator.
//! A panicking action is caught, stops new work like an error does, and is
//! resumed on the calling thread once every worker has exited.

use crate::graph::{Graph, Node};
use sqlweave_jinja::File;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Runs a caller-supplied action over a [`Graph`] in dependency order
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    threads: usize,
}

struct RunState<'g, E> {
    ready: VecDeque<&'g Node>,
    running: usize,
    executed: usize,
    error: Option<E>,
    panic: Option<Box<dyn Any + Send>>,
}

impl<E> RunState<'_, E> {
    fn stopped(&self) -> bool {
        self.error.is_some() || self.panic.is_some()
    }
}

impl Scheduler {
    /// A scheduler with `threads` workers (at least one)
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Invoke `action` once for every node of `graph` not yet done, each
    /// only after all of its upstream nodes succeeded. Nodes already done
    /// are skipped.
    ///
    /// The first failing action's error is returned. Once a failure is
    /// recorded no further nodes start; actions already running finish.
    /// Returns the number of nodes executed.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of `action`, after all workers have stopped.
    pub fn execute<F, E>(&self, graph: &Graph, action: F) -> Result<usize, E>
    where
        F: Fn(&Arc<File>) -> Result<(), E> + Sync,
        E: Send,
    {
        graph.release_unrun();
        let remaining = graph.remaining();
        if remaining == 0 {
            return Ok(0);
        }

        let ready: VecDeque<&Node> = graph
            .nodes()
            .filter(|node| graph.is_ready(node) && node.try_queue())
            .collect();

        let workers = self.threads.min(remaining);
        tracing::info!(nodes = remaining, workers, "executing graph");

        let state = Mutex::new(RunState {
            ready,
            running: 0,
            executed: 0,
            error: None,
            panic: None,
        });
        let wake = Condvar::new();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| work(graph, &action, &state, &wake));
            }
        });

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = state.panic {
            panic::resume_unwind(payload);
        }
        match state.error {
            Some(err) => Err(err),
            None => {
                tracing::info!(executed = state.executed, "graph complete");
                Ok(state.executed)
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(sqlweave_core::DEFAULT_THREADS)
    }
}

fn lock<'a, 'g, E>(state: &'a Mutex<RunState<'g, E>>) -> MutexGuard<'a, RunState<'g, E>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One worker: pull a ready node, run it, release its downstreams
fn work<'g, F, E>(
    graph: &'g Graph,
    action: &F,
    state: &Mutex<RunState<'g, E>>,
    wake: &Condvar,
) where
    F: Fn(&Arc<File>) -> Result<(), E>,
{
    loop {
        let node = {
            let mut guard = lock(state);
            loop {
                if guard.stopped() {
                    return;
                }
                if let Some(node) = guard.ready.pop_front() {
                    guard.running += 1;
                    break node;
                }
                if guard.running == 0 {
                    // nothing queued and nothing in flight to queue more
                    return;
                }
                guard = wake.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
        };

        tracing::debug!(unit = node.name(), "executing");
        let result = panic::catch_unwind(AssertUnwindSafe(|| action(node.file())));

        let mut guard = lock(state);
        guard.running -= 1;
        match result {
            Ok(Ok(())) => {
                node.mark_done();
                guard.executed += 1;
                for name in node.downstreams() {
                    if let Some(down) = graph.node(name) {
                        if graph.is_ready(down) && down.try_queue() {
                            guard.ready.push_back(down);
                        }
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(unit = node.name(), "execution failed, stopping the run");
                if !guard.stopped() {
                    guard.error = Some(err);
                }
            }
            Err(payload) => {
                tracing::error!(unit = node.name(), "execution panicked, stopping the run");
                if guard.panic.is_none() {
                    guard.panic = Some(payload);
                }
            }
        }
        drop(guard);
        wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlweave_core::ModelDefaults;
    use sqlweave_jinja::{FileKind, FileSystem};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph(models: &[&str], refs: &[(&str, &str)]) -> Graph {
        let mut fs = FileSystem::new(ModelDefaults::default());
        for name in models {
            fs.add(File::new(*name, format!("models/{}.sql", name), FileKind::Model, ""))
                .unwrap();
        }
        for (down, up) in refs {
            fs.model(down).unwrap().add_upstream(*up);
            fs.model(up).unwrap().add_downstream(*down);
        }
        let mut graph = Graph::new(Arc::new(fs));
        graph.add_all(FileKind::Model).unwrap();
        graph
    }

    #[test]
    fn chain_runs_in_order() {
        let graph = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        let order = Mutex::new(Vec::new());

        let executed = Scheduler::new(4)
            .execute(&graph, |file| {
                order.lock().unwrap().push(file.name().to_string());
                Ok::<_, String>(())
            })
            .unwrap();

        assert_eq!(executed, 3);
        assert_eq!(order.into_inner().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(graph.remaining(), 0);
    }

    #[test]
    fn diamond_waits_for_both_branches() {
        let graph = graph(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        );
        let order = Mutex::new(Vec::new());

        Scheduler::new(3)
            .execute(&graph, |file| {
                order.lock().unwrap().push(file.name().to_string());
                Ok::<_, String>(())
            })
            .unwrap();

        let order = order.into_inner().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
    }

    #[test]
    fn first_error_stops_new_work() {
        let graph = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        let calls = AtomicUsize::new(0);

        let err = Scheduler::new(2)
            .execute(&graph, |file| {
                calls.fetch_add(1, Ordering::SeqCst);
                match file.name() {
                    "a" => Err(format!("{} failed", file.name())),
                    _ => Ok(()),
                }
            })
            .unwrap_err();

        assert_eq!(err, "a failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(graph.remaining(), 3);
    }

    #[test]
    fn only_one_error_is_returned() {
        let graph = graph(&["a", "b"], &[]);
        let err = Scheduler::new(1)
            .execute(&graph, |file| Err::<(), _>(file.name().to_string()))
            .unwrap_err();

        // one worker: the first node fails and nothing else starts
        assert_eq!(err, "a");
        assert_eq!(graph.remaining(), 2);
    }

    #[test]
    fn done_nodes_are_skipped() {
        let graph = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        graph.mark_all_done();
        graph.reset("c").unwrap();

        let order = Mutex::new(Vec::new());
        let executed = Scheduler::new(2)
            .execute(&graph, |file| {
                order.lock().unwrap().push(file.name().to_string());
                Ok::<_, String>(())
            })
            .unwrap();

        assert_eq!(executed, 1);
        assert_eq!(order.into_inner().unwrap(), vec!["c"]);
    }

    #[test]
    fn rerun_after_failure_picks_up_abandoned_nodes() {
        let graph = graph(&["a", "b"], &[("b", "a")]);
        let fail = std::sync::atomic::AtomicBool::new(true);

        let scheduler = Scheduler::new(2);
        let action = |file: &Arc<File>| {
            if file.name() == "a" && fail.swap(false, Ordering::SeqCst) {
                return Err("transient".to_string());
            }
            Ok(())
        };

        assert!(scheduler.execute(&graph, &action).is_err());
        assert_eq!(scheduler.execute(&graph, &action).unwrap(), 2);
    }

    #[test]
    fn panicking_action_releases_workers() {
        let graph = graph(&["a", "b"], &[]);
        let scheduler = Scheduler::new(2);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            scheduler.execute(&graph, |file| {
                if file.name() == "a" {
                    panic!("a exploded");
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok::<_, String>(())
            })
        }));

        let payload = outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"a exploded"));
        assert!(!graph.node("a").unwrap().is_done());
    }

    #[test]
    fn panic_in_upstream_does_not_start_downstream() {
        let graph = graph(&["a", "b"], &[("b", "a")]);
        let started = AtomicUsize::new(0);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            Scheduler::new(4).execute(&graph, |file| {
                started.fetch_add(1, Ordering::SeqCst);
                if file.name() == "a" {
                    panic!("a exploded");
                }
                Ok::<_, String>(())
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_graph_runs_nothing() {
        let graph = graph(&[], &[]);
        let executed = Scheduler::default()
            .execute(&graph, |_| Ok::<_, String>(()))
            .unwrap();
        assert_eq!(executed, 0);
    }
}
