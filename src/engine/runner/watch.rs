//! Watch mode.
//!
//! Every [`WatchBinding`] maps a set of globs onto tasks to re-run. The static
//! root of each glob is watched recursively through a single debounced
//! `notify` watcher, and every event is matched against the absolute
//! patterns of each binding.
//!
//! A matching binding pulls its [`Trigger`]: a worker thread fed by a
//! one-slot queue. The worker reacts to one request at a time, and requests
//! arriving while it is busy collapse into a single pending re-run, so
//! reactions never overlap and never pile up.

use std::collections::HashSet;
use std::sync::mpsc::{SyncSender, TrySendError, channel, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use glob::Pattern;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;

use crate::engine::Scheduler;
use crate::engine::runner::catch;
use crate::error::{TaskError, WatchError};
use crate::pipeline::source::split_glob;

/// Binds file changes to task re-runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBinding {
    pub globs: Vec<String>,
    /// Run in order on every qualifying change.
    pub tasks: Vec<String>,
    /// Reload connected browsers after the tasks succeed.
    pub reload: bool,
}

impl WatchBinding {
    pub fn new<S: Into<String>>(globs: impl IntoIterator<Item = S>) -> Self {
        Self {
            globs: globs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn run(mut self, task: impl Into<String>) -> Self {
        self.tasks.push(task.into());
        self
    }

    pub fn reload(mut self) -> Self {
        self.reload = true;
        self
    }
}

/// Serializes reactions to change events.
pub(crate) struct Trigger {
    tx: SyncSender<()>,
    _thread: JoinHandle<()>,
}

impl Trigger {
    pub(crate) fn new(react: impl Fn() + Send + 'static) -> Self {
        let (tx, rx) = sync_channel::<()>(1);

        let thread = thread::spawn(move || {
            while rx.recv().is_ok() {
                react();
            }
        });

        Self {
            tx,
            _thread: thread,
        }
    }

    /// Requests a reaction. Returns `false` when one is already pending.
    pub(crate) fn pull(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

/// The work done when a binding fires: its tasks in order, then a reload.
pub(crate) fn reaction(scheduler: Scheduler, binding: WatchBinding) -> impl Fn() + Send + 'static {
    move || {
        let env = scheduler.env();

        for task in &binding.tasks {
            if let Err(e) = catch(task, || scheduler.run(task)) {
                env.notifier.failure(&e);
                return;
            }
        }

        if binding.reload {
            env.reload.reload();
        }
    }
}

struct Watched {
    roots: Vec<Utf8PathBuf>,
    patterns: Vec<Pattern>,
    trigger: Trigger,
}

impl Watched {
    fn matches(&self, path: &std::path::Path) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches_path(path))
    }
}

fn qualifies(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Watches every binding until the process ends.
///
/// A binding whose paths cannot be resolved or watched is reported and
/// disabled; the others keep working.
pub(crate) fn watch(
    scheduler: &Scheduler,
    name: &str,
    bindings: &[WatchBinding],
) -> Result<(), TaskError> {
    let env = scheduler.env();
    let fail = |e: WatchError| TaskError::Watch(name.to_string(), e);

    let (tx, rx) = channel();
    let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)
        .map_err(|e| fail(e.into()))?;

    let mut active = Vec::new();
    for binding in bindings {
        match resolve_binding(binding) {
            Ok((roots, patterns)) => active.push(Watched {
                roots,
                patterns,
                trigger: Trigger::new(reaction(scheduler.clone(), binding.clone())),
            }),
            Err(e) => env.notifier.failure(&e),
        }
    }

    // Collapse watched paths to reduce the number of watches
    let roots = collapse_watch_paths(active.iter().flat_map(|w| w.roots.iter().cloned()).collect());

    for path in roots {
        match debouncer.watch(&path, RecursiveMode::Recursive) {
            Ok(()) => tracing::info!("watching {}", path),
            Err(e) => {
                env.notifier.failure(&WatchError::Setup {
                    path: path.to_string(),
                    source: Box::new(e.into()),
                });
                active.retain(|w| !w.roots.iter().any(|root| root.starts_with(&path)));
            }
        }
    }

    if active.is_empty() {
        tracing::warn!("nothing to watch");
        return Ok(());
    }

    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                let paths: Vec<_> = events
                    .iter()
                    .filter(|de| qualifies(&de.event.kind))
                    .flat_map(|de| de.event.paths.iter())
                    .collect();

                if paths.is_empty() {
                    continue;
                }

                tracing::debug!("{} paths changed", paths.len());

                for watched in &active {
                    if paths.iter().any(|path| watched.matches(path)) && !watched.trigger.pull() {
                        tracing::debug!("re-run already pending");
                    }
                }
            }
            Ok(Err(errors)) => {
                for e in errors {
                    env.notifier.failure(&WatchError::from(e));
                }
            }
            Err(e) => return Err(fail(e.into())),
        }
    }
}

fn resolve_binding(binding: &WatchBinding) -> Result<(Vec<Utf8PathBuf>, Vec<Pattern>), WatchError> {
    let mut roots = Vec::new();
    let mut patterns = Vec::new();

    for glob in &binding.globs {
        let (root, pattern) = resolve_watch_path(glob).map_err(|e| WatchError::Setup {
            path: glob.clone(),
            source: Box::new(e),
        })?;
        roots.push(root);
        patterns.push(pattern);
    }

    Ok((roots, patterns))
}

/// Splits a glob string into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(glob_str: impl AsRef<str>) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let (root_part, suffix_part) = split_glob(glob_str.as_ref());

    let root_part = if root_part.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        root_part
    };

    // Canonicalize the static root (must exist on disk)
    let absolute_root = root_part.canonicalize_utf8()?;

    // A concrete file is matched exactly, but its parent is watched so that
    // atomic writes are caught.
    let (watch_root, matched) = match absolute_root.parent() {
        Some(parent) if suffix_part.as_str().is_empty() && absolute_root.is_file() => {
            (parent.to_path_buf(), absolute_root.clone())
        }
        _ => (absolute_root.clone(), absolute_root.join(&suffix_part)),
    };

    let pattern = Pattern::new(matched.as_str())?;

    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Environment;
    use crate::config::{Config, Settings};
    use crate::engine::Blueprint;
    use crate::engine::reload::{Reloader, Signal};

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    #[test]
    fn test_concrete_file() {
        let (watch, pattern) = resolve_watch_path("README.md").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        assert_eq!(watch.as_str(), cwd);
        assert_eq!(pattern.as_str(), cwd.join("README.md"));
    }

    #[test]
    fn test_concrete_directory() {
        let (watch, pattern) = resolve_watch_path("src").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        assert_eq!(watch.as_str(), cwd.join("src"));
        assert_eq!(pattern.as_str(), cwd.join("src"));
    }

    #[test]
    fn test_directory_wildcard() {
        let (watch, pattern) = resolve_watch_path("./src/**/*.rs").expect("Should resolve");

        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();

        assert_eq!(watch.as_str(), cwd.join("src/"));
        assert_eq!(pattern.as_str(), cwd.join("src/**/*.rs"));
    }

    #[test]
    fn test_missing_root() {
        assert!(resolve_watch_path("does/not/exist/**/*.scss").is_err());
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/a/b/c"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/c/d"));

        let collapsed = collapse_watch_paths(paths);

        assert_eq!(
            collapsed,
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        let collapsed = collapse_watch_paths(paths);

        assert_eq!(
            collapsed,
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }

    #[test]
    fn one_pull_one_run() {
        let (done_tx, done_rx) = channel();
        let trigger = Trigger::new(move || {
            done_tx.send(()).unwrap();
        });

        assert!(trigger.pull());
        done_rx.recv_timeout(WAIT).unwrap();
        assert!(done_rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn pulls_during_a_run_collapse() {
        let (started_tx, started_rx) = channel();
        let (gate_tx, gate_rx) = channel::<()>();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let trigger = {
            let active = active.clone();
            let overlap = overlap.clone();
            Trigger::new(move || {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                started_tx.send(()).unwrap();
                gate_rx.recv().unwrap();
                active.fetch_sub(1, Ordering::SeqCst);
            })
        };

        assert!(trigger.pull());
        started_rx.recv_timeout(WAIT).unwrap();

        // first run is in flight: one request queues, the rest collapse
        assert!(trigger.pull());
        assert!(!trigger.pull());
        assert!(!trigger.pull());

        gate_tx.send(()).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        gate_tx.send(()).unwrap();

        assert!(started_rx.recv_timeout(QUIET).is_err());
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reaction_runs_tasks_then_reloads() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (reload, signals) = Reloader::channel(true);
        let settings = Settings::from_config(&Config::builtin()).unwrap();
        let env = Environment::offline(settings).with_reloader(reload);

        let mut blueprint = Blueprint::new();
        {
            let runs = runs.clone();
            blueprint.task("images").run(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        blueprint.task("broken").run(|_| anyhow::bail!("nope"));
        let scheduler = blueprint.finish(env).unwrap();

        let react = reaction(scheduler.clone(), WatchBinding::new(["x"]).run("images").reload());
        react();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(signals.try_recv().unwrap(), Signal::Reload);
        assert!(signals.try_recv().is_err());

        let react = reaction(scheduler, WatchBinding::new(["x"]).run("broken").reload());
        react();
        assert!(signals.try_recv().is_err());
    }
}
