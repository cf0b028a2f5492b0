pub mod reload;
mod runner;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::Environment;
use crate::error::{BlueprintError, DependencyCycleError, TaskError};
use crate::pipeline::Pipeline;

pub use crate::engine::runner::WatchBinding;
#[cfg(feature = "server")]
pub(crate) use crate::engine::runner::serve;

pub type RunFn = dyn Fn(&Environment) -> anyhow::Result<()> + Send + Sync;

/// What a task does when it runs.
#[derive(Clone)]
pub enum Action {
    /// Run an asset pipeline.
    Pipeline(Arc<Pipeline>),
    /// Run arbitrary code.
    Run(Arc<RunFn>),
    /// Run the named tasks concurrently.
    Parallel(Vec<String>),
    /// Run the named tasks one after another.
    Series(Vec<String>),
    /// Re-run tasks whenever matching files change. Never completes.
    Watch(Vec<WatchBinding>),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Pipeline(_) => "pipeline",
            Action::Run(_) => "run",
            Action::Parallel(_) => "parallel",
            Action::Series(_) => "series",
            Action::Watch(_) => "watch",
        }
    }

    /// Tasks this action invokes, with the kind of edge they get.
    fn members(&self) -> Vec<(&str, Edge)> {
        match self {
            Action::Pipeline(_) | Action::Run(_) => vec![],
            Action::Parallel(names) | Action::Series(names) => {
                names.iter().map(|name| (name.as_str(), Edge::Member)).collect()
            }
            Action::Watch(bindings) => bindings
                .iter()
                .flat_map(|binding| binding.tasks.iter())
                .map(|name| (name.as_str(), Edge::Watch))
                .collect(),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pipeline(pipeline) => f.debug_tuple("Pipeline").field(&pipeline.name()).finish(),
            Action::Run(_) => f.write_str("Run"),
            Action::Parallel(names) => f.debug_tuple("Parallel").field(names).finish(),
            Action::Series(names) => f.debug_tuple("Series").field(names).finish(),
            Action::Watch(bindings) => f.debug_tuple("Watch").field(bindings).finish(),
        }
    }
}

/// A named, independently invocable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    /// Tasks that must complete before this one starts.
    pub deps: Vec<String>,
    pub action: Action,
}

/// Relation between two tasks in the graph. Every edge points from the task
/// that has to finish first to the task waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Dependency,
    Member,
    Watch,
}

/// Collects task definitions before they are validated.
///
/// ```rust,no_run
/// use nagare::{Blueprint, Environment, config::{Config, Settings}};
///
/// let settings = Settings::from_config(&Config::builtin())?;
/// let mut blueprint = Blueprint::new();
///
/// blueprint
///     .task("hello")
///     .run(|_| {
///         tracing::info!("hello");
///         Ok(())
///     });
/// blueprint.series("default", ["hello"]);
///
/// let scheduler = blueprint.finish(Environment::offline(settings))?;
/// scheduler.run("default")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct Blueprint {
    tasks: Vec<Task>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fully built task.
    pub fn add(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Starts defining a task named `name`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            deps: Vec::new(),
        }
    }

    /// Registers a pipeline as a task of the same name.
    pub fn pipeline(&mut self, pipeline: Pipeline) -> &mut Self {
        let name = pipeline.name().to_string();
        self.task(name).pipeline(pipeline)
    }

    pub fn parallel<S: Into<String>>(
        &mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let members = members.into_iter().map(Into::into).collect();
        self.task(name).action(Action::Parallel(members))
    }

    pub fn series<S: Into<String>>(
        &mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let members = members.into_iter().map(Into::into).collect();
        self.task(name).action(Action::Series(members))
    }

    pub fn watch(&mut self, name: impl Into<String>, bindings: Vec<WatchBinding>) -> &mut Self {
        self.task(name).action(Action::Watch(bindings))
    }

    /// Validates the task graph and binds it to `env`.
    ///
    /// Fails on duplicate names, references to unknown tasks and cycles, so
    /// nothing runs on a broken definition.
    pub fn finish(self, env: Environment) -> Result<Scheduler, BlueprintError> {
        let mut graph = Graph::new();
        let mut names = HashMap::new();

        for task in self.tasks {
            if names.contains_key(&task.name) {
                return Err(BlueprintError::Duplicate(task.name));
            }
            let name = task.name.clone();
            let index = graph.add_node(task);
            names.insert(name, index);
        }

        let lookup = |task: &str, missing: &str| {
            names
                .get(missing)
                .copied()
                .ok_or_else(|| BlueprintError::Unknown {
                    task: task.to_string(),
                    missing: missing.to_string(),
                })
        };

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task: &Task = &graph[index];

            for dep in &task.deps {
                edges.push((lookup(&task.name, dep)?, index, Edge::Dependency));
            }

            for (member, edge) in task.action.members() {
                edges.push((lookup(&task.name, member)?, index, edge));
            }
        }

        for (source, target, edge) in edges {
            graph.add_edge(source, target, edge);
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(DependencyCycleError {
                task: graph[cycle.node_id()].name.clone(),
            }
            .into());
        }

        Ok(Scheduler {
            inner: Arc::new(Inner { graph, names, env }),
        })
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: String,
    deps: Vec<String>,
}

impl<'a> TaskDef<'a> {
    /// Adds a task that must complete before this one starts.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.deps.push(name.into());
        self
    }

    pub fn run<F>(self, f: F) -> &'a mut Blueprint
    where
        F: Fn(&Environment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action(Action::Run(Arc::new(f)))
    }

    pub fn pipeline(self, pipeline: Pipeline) -> &'a mut Blueprint {
        self.action(Action::Pipeline(Arc::new(pipeline)))
    }

    pub fn action(self, action: Action) -> &'a mut Blueprint {
        self.blueprint.add(Task {
            name: self.name,
            deps: self.deps,
            action,
        })
    }
}

struct Inner {
    graph: Graph<Task, Edge>,
    names: HashMap<String, NodeIndex>,
    env: Environment,
}

/// A validated task graph, ready to run.
///
/// Cheap to clone; clones share the graph and the environment.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn env(&self) -> &Environment {
        &self.inner.env
    }

    /// Every task in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.inner.graph.node_weights()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.names.contains_key(name)
    }

    /// Runs a task after its whole dependency closure.
    ///
    /// Dependencies run as soon as their own dependencies finish, independent
    /// ones concurrently.
    pub fn run(&self, name: &str) -> Result<(), TaskError> {
        let index = self.index(name)?;

        let pending = self.dependency_closure(index);
        runner::run_tasks_parallel(self, &pending)?;

        runner::catch(name, || self.execute(index))
    }

    fn index(&self, name: &str) -> Result<NodeIndex, TaskError> {
        self.inner
            .names
            .get(name)
            .copied()
            .ok_or_else(|| TaskError::Unknown(name.to_string()))
    }

    pub(crate) fn graph(&self) -> &Graph<Task, Edge> {
        &self.inner.graph
    }

    /// Every task `index` transitively depends on, excluding itself.
    fn dependency_closure(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let graph = &self.inner.graph;
        let mut closure = HashSet::new();
        let mut stack = vec![index];

        while let Some(current) = stack.pop() {
            for edge in graph.edges_directed(current, Direction::Incoming) {
                if *edge.weight() == Edge::Dependency && closure.insert(edge.source()) {
                    stack.push(edge.source());
                }
            }
        }

        closure
    }

    /// Runs a single task, ignoring its dependencies.
    pub(crate) fn execute(&self, index: NodeIndex) -> Result<(), TaskError> {
        let env = &self.inner.env;
        let task = &self.inner.graph[index];

        tracing::debug!(task = %task.name, kind = task.action.kind(), "starting");

        match &task.action {
            Action::Pipeline(pipeline) => {
                let report = pipeline.run(env);
                if report.failed == 0 {
                    env.notifier.success(&task.name);
                }
                Ok(())
            }
            Action::Run(f) => f(env).map_err(|e| TaskError::Failed(task.name.clone(), e)),
            Action::Parallel(members) => runner::run_parallel(self, members),
            Action::Series(members) => {
                for member in members {
                    self.run(member)?;
                }
                Ok(())
            }
            Action::Watch(bindings) => runner::watch(self, &task.name, bindings),
        }
    }
}

impl fmt::Display for Scheduler {
    /// Renders the task graph as a mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = &self.inner.graph;
        writeln!(f, "graph LR")?;

        for index in graph.node_indices() {
            let task = &graph[index];
            let name = task.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{} ({})\"]", index.index(), name, task.action.kind())?;
        }

        for edge in graph.edge_references() {
            let label = match edge.weight() {
                Edge::Dependency => "before",
                Edge::Member => "member",
                Edge::Watch => "watched by",
            };
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                label,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
