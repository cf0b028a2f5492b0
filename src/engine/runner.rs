#[cfg(feature = "server")]
mod http;
mod watch;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Instant;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Edge, Scheduler};
use crate::error::TaskError;

#[cfg(feature = "server")]
pub(crate) use http::serve;
pub(crate) use watch::watch;
pub use watch::WatchBinding;

/// Runs `f`, turning a panic into [`TaskError::Panicked`].
pub(crate) fn catch(
    name: &str,
    f: impl FnOnce() -> Result<(), TaskError>,
) -> Result<(), TaskError> {
    // The closure only touches shared state through locks and channels, so a
    // panic halfway through leaves nothing half-updated for other tasks.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(TaskError::Panicked(name.to_string(), msg))
        }
    }
}

/// Executes `pending` in dependency order.
///
/// Each task starts on its own thread as soon as every dependency inside
/// `pending` has finished:
/// 1. Tasks with no pending dependencies are spawned right away.
/// 2. The calling thread waits for results on a channel.
/// 3. When a task completes, the dependency counts of its dependents are
///    decremented, and those reaching zero are spawned.
/// 4. The first failure stops scheduling and is returned once the running
///    tasks have finished.
pub(crate) fn run_tasks_parallel(
    scheduler: &Scheduler,
    pending: &HashSet<NodeIndex>,
) -> Result<(), TaskError> {
    if pending.is_empty() {
        return Ok(());
    }

    let graph = scheduler.graph();

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut dependency_counts: HashMap<NodeIndex, usize> = HashMap::new();

    for &index in pending {
        let deps = graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| *edge.weight() == Edge::Dependency)
            .map(|edge| edge.source())
            .filter(|dep| pending.contains(dep));

        let mut count = 0;
        for dep in deps {
            dependents.entry(dep).or_default().push(index);
            count += 1;
        }
        dependency_counts.insert(index, count);
    }

    let total = pending.len();
    let s = Instant::now();

    let root_span = tracing::span!(Level::INFO, "dependencies");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(&crate::utils::style_bar());
    let _enter = root_span.enter();

    let pb_style = crate::utils::style_task();

    thread::scope(|scope| {
        let (tx, rx) = channel::<(NodeIndex, Result<(), TaskError>)>();

        let spawn = |index: NodeIndex| {
            let tx = tx.clone();
            let pb_style = pb_style.clone();
            let name = graph[index].name.as_str();

            scope.spawn(move || {
                let span = tracing::span!(Level::INFO, "task", name);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {name}"));
                let _enter = span.enter();

                let result = catch(name, || scheduler.execute(index));
                tx.send((index, result)).ok();
            });
        };

        let mut running = 0;
        for (&index, &count) in &dependency_counts {
            if count == 0 {
                spawn(index);
                running += 1;
            }
        }

        let mut failure = None;
        while running > 0 {
            let Ok((index, result)) = rx.recv() else {
                break;
            };
            running -= 1;
            root_span.pb_inc(1);

            if let Err(e) = result {
                failure.get_or_insert(e);
                continue;
            }

            if failure.is_some() {
                continue;
            }

            for &dependent in dependents.get(&index).into_iter().flatten() {
                if let Some(count) = dependency_counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        spawn(dependent);
                        running += 1;
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                tracing::debug!(
                    "ran {total} dependencies {}",
                    crate::utils::as_overhead(s)
                );
                Ok(())
            }
        }
    })
}

/// Runs every member concurrently, each with its own dependencies.
///
/// Returns as soon as any member fails; the others are left running.
pub(crate) fn run_parallel(scheduler: &Scheduler, members: &[String]) -> Result<(), TaskError> {
    let (tx, rx) = channel();

    for member in members {
        let scheduler = scheduler.clone();
        let member = member.clone();
        let tx = tx.clone();
        let name = member.clone();

        thread::Builder::new()
            .name(member.clone())
            .spawn(move || {
                let result = catch(&member, || scheduler.run(&member));
                tx.send(result).ok();
            })
            .map_err(|e| TaskError::Failed(name, e.into()))?;
    }
    drop(tx);

    for result in rx.iter().take(members.len()) {
        result?;
    }

    Ok(())
}
