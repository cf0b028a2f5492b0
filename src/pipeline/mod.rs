//! Declarative asset pipelines.
//!
//! A [`Pipeline`] reads the files matched by its source globs and pushes them
//! through an ordered list of [`Stage`]s. Every stage reads either the
//! pipeline source or the output of an earlier stage, which makes fan-out
//! possible: an unminified and a minified chain can both start from the same
//! stage.
//!
//! ```rust,no_run
//! use nagare::pipeline::{Effect, Op, Pipeline};
//! use nagare::transform::{LineEndings, Minify, Rename};
//!
//! let pipeline = Pipeline::builder("styles")
//!     .source("assets/css/*.css")
//!     .stage("copy", Op::Filter("*.css".into()))
//!     .write("dist/css")
//!     .stage("rename", Op::map(Rename::suffix(".min")))
//!     .stage("minify", Op::map(Minify::default()))
//!     .stage("line-endings", Op::map(LineEndings::default()))
//!     .write("dist/css")
//!     .emit(Effect::Inject)
//!     .build()?;
//! # Ok::<(), nagare::PipelineError>(())
//! ```

mod cache;
pub(crate) mod source;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

pub use crate::pipeline::cache::{Cache, CacheStats, Entry};

use crate::Environment;
use crate::error::{PipelineError, TransformError};

/// A file travelling through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Path relative to the source glob's base. Written outputs land at
    /// `<dest>/<path>`.
    pub path: Utf8PathBuf,
    /// The file this asset was originally read from.
    pub origin: Utf8PathBuf,
    /// Current contents.
    pub data: Vec<u8>,
}

impl Asset {
    /// An asset that did not come from disk; `origin` equals `path`.
    pub fn new(path: impl Into<Utf8PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        Self {
            origin: path.clone(),
            path,
            data: data.into(),
        }
    }

    pub fn text(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| anyhow::anyhow!("'{}' is not valid UTF-8: {e}", self.path))
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_data(text.into().into_bytes())
    }

    pub fn with_data(self, data: Vec<u8>) -> Self {
        Self { data, ..self }
    }

    pub fn with_path(self, path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self
        }
    }
}

/// A per-file transformation.
///
/// Implementations should be pure: the same asset and the same parameters
/// always give the same output.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Everything that influences the output besides the input file.
    /// Becomes part of the cache key.
    fn params(&self) -> String {
        String::new()
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset>;
}

/// Merges every asset reaching a stage into a single one.
pub trait Combine: Send + Sync {
    fn name(&self) -> &'static str;

    fn combine(&self, assets: Vec<Asset>) -> anyhow::Result<Asset>;
}

/// The operation a stage performs.
pub enum Op {
    /// Apply a transform to every file.
    Map(Box<dyn Transform>),
    /// Like `Map`, but results are looked up in and stored to the cache.
    Cached(Box<dyn Transform>),
    /// Keep only the files whose path matches the glob.
    Filter(String),
    /// Merge all files into one.
    Combine(Box<dyn Combine>),
}

impl Op {
    pub fn map(transform: impl Transform + 'static) -> Self {
        Op::Map(Box::new(transform))
    }

    pub fn cached(transform: impl Transform + 'static) -> Self {
        Op::Cached(Box::new(transform))
    }

    pub fn combine(combine: impl Combine + 'static) -> Self {
        Op::Combine(Box::new(combine))
    }

    fn describe(&self) -> String {
        match self {
            Op::Map(t) => t.name().to_string(),
            Op::Cached(t) => format!("cached {}", t.name()),
            Op::Filter(glob) => format!("filter {glob}"),
            Op::Combine(c) => c.name().to_string(),
        }
    }
}

/// Optional side effect of a stage that writes files.
///
/// Effects are gathered over the whole run and sent as a single signal once
/// the last stage finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Inject the written files into connected browsers.
    Inject,
    /// Reload connected browsers.
    Reload,
}

/// Where a stage reads its files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Source,
    Stage(String),
}

/// One named step of a pipeline.
pub struct Stage {
    pub name: String,
    pub input: Input,
    pub op: Op,
    pub dest: Option<Utf8PathBuf>,
    pub effects: Vec<Effect>,
}

impl Stage {
    pub fn new(name: impl Into<String>, input: Input, op: Op) -> Self {
        Self {
            name: name.into(),
            input,
            op,
            dest: None,
            effects: Vec::new(),
        }
    }
}

enum Compiled {
    Op,
    Filter(Pattern),
}

/// An ordered chain of stages sharing one source.
pub struct Pipeline {
    name: String,
    sources: Vec<String>,
    stages: Vec<(Stage, Compiled)>,
}

/// Outcome of a single pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    /// Files written to disk, in stage order.
    pub written: Vec<Utf8PathBuf>,
    /// Files that failed a stage.
    pub failed: usize,
}

impl Pipeline {
    /// Validates and assembles a pipeline.
    ///
    /// Rejects invalid globs, duplicate stage names, and stages that read
    /// from a stage declared later or not at all.
    pub fn new(
        name: impl Into<String>,
        sources: Vec<String>,
        stages: Vec<Stage>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();

        if stages.is_empty() {
            return Err(PipelineError::Empty(name));
        }

        for glob in &sources {
            Pattern::new(glob).map_err(|e| PipelineError::Pattern(glob.clone(), e))?;
        }

        let mut declared = HashSet::new();
        let mut compiled = Vec::with_capacity(stages.len());

        for stage in stages {
            if let Input::Stage(input) = &stage.input
                && !declared.contains(input)
            {
                return Err(PipelineError::ForwardReference {
                    stage: stage.name.clone(),
                    input: input.clone(),
                });
            }

            if !declared.insert(stage.name.clone()) {
                return Err(PipelineError::DuplicateStage(stage.name));
            }

            let op = match &stage.op {
                Op::Filter(glob) => Compiled::Filter(
                    Pattern::new(glob).map_err(|e| PipelineError::Pattern(glob.clone(), e))?,
                ),
                _ => Compiled::Op,
            };

            compiled.push((stage, op));
        }

        Ok(Self {
            name,
            sources,
            stages: compiled,
        })
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            sources: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().map(|(stage, _)| stage)
    }

    /// Runs every stage in order.
    ///
    /// A failure on one file is reported through the environment's notifier
    /// and removes only that file from the rest of the run.
    pub fn run(&self, env: &Environment) -> Report {
        let s = Instant::now();
        let failed = AtomicUsize::new(0);

        let report_error = |error: TransformError| {
            failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(pipeline = %self.name, "{error}");
            env.notifier.failure(&error);
        };

        let source = source::read(&self.sources, &report_error);
        tracing::debug!(pipeline = %self.name, "read {} source files", source.len());

        let mut outputs: HashMap<&str, Vec<Asset>> = HashMap::new();
        let mut written = Vec::new();
        let mut inject = Vec::new();
        let mut reload = false;

        for (stage, compiled) in &self.stages {
            let input = match &stage.input {
                Input::Source => source.clone(),
                Input::Stage(name) => outputs.get(name.as_str()).cloned().unwrap_or_default(),
            };

            let output = run_stage(env, stage, compiled, input, &report_error);

            if let Some(dest) = &stage.dest {
                let files = write_outputs(dest, stage, &output, &report_error);

                if !files.is_empty() {
                    for effect in &stage.effects {
                        match effect {
                            Effect::Inject => inject.extend(files.iter().cloned()),
                            Effect::Reload => reload = true,
                        }
                    }
                }

                written.extend(files);
            }

            outputs.insert(stage.name.as_str(), output);
        }

        // one signal per run, a reload covers any injection
        if reload {
            env.reload.reload();
        } else {
            env.reload.inject(inject.iter().map(Utf8PathBuf::as_path));
        }

        let failed = failed.into_inner();
        tracing::info!(
            "pipeline {} wrote {} files, {} failed {}",
            self.name,
            written.len(),
            failed,
            crate::utils::as_overhead(s)
        );

        Report { written, failed }
    }
}

fn run_stage(
    env: &Environment,
    stage: &Stage,
    compiled: &Compiled,
    input: Vec<Asset>,
    report_error: &(dyn Fn(TransformError) + Sync),
) -> Vec<Asset> {
    let fail = |file: Utf8PathBuf, source: anyhow::Error| {
        report_error(TransformError {
            stage: stage.name.clone(),
            file,
            source,
        })
    };

    tracing::trace!(stage = %stage.name, op = %stage.op.describe(), files = input.len());

    match (&stage.op, compiled) {
        (Op::Map(transform), _) => input
            .into_par_iter()
            .filter_map(|asset| {
                let file = asset.origin.clone();
                transform.apply(asset).map_err(|e| fail(file, e)).ok()
            })
            .collect(),
        (Op::Cached(transform), _) => input
            .into_par_iter()
            .filter_map(|asset| {
                let file = asset.origin.clone();
                env.cache
                    .apply(transform.as_ref(), asset)
                    .map_err(|e| fail(file, e))
                    .ok()
            })
            .collect(),
        (Op::Filter(_), Compiled::Filter(pattern)) => input
            .into_iter()
            .filter(|asset| pattern.matches(asset.path.as_str()))
            .collect(),
        (Op::Filter(_), Compiled::Op) => input,
        (Op::Combine(combine), _) => {
            if input.is_empty() {
                return input;
            }

            let file = Utf8PathBuf::from(stage.name.as_str());
            match combine.combine(input) {
                Ok(asset) => vec![asset],
                Err(e) => {
                    fail(file, e);
                    Vec::new()
                }
            }
        }
    }
}

fn write_outputs(
    dest: &Utf8Path,
    stage: &Stage,
    assets: &[Asset],
    report_error: &(dyn Fn(TransformError) + Sync),
) -> Vec<Utf8PathBuf> {
    let mut written = Vec::with_capacity(assets.len());

    for asset in assets {
        let target = dest.join(&asset.path);

        let result = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&target, &asset.data));

        match result {
            Ok(()) => written.push(target),
            Err(e) => report_error(TransformError {
                stage: stage.name.clone(),
                file: target,
                source: e.into(),
            }),
        }
    }

    written
}

/// Incrementally declares a [`Pipeline`].
///
/// Each `stage` reads from the stage declared just before it (or from the
/// source for the first one); `branch` reads from a named earlier stage.
/// `write` and `emit` apply to the most recently declared stage.
pub struct PipelineBuilder {
    name: String,
    sources: Vec<String>,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn source(mut self, glob: impl Into<String>) -> Self {
        self.sources.push(glob.into());
        self
    }

    pub fn sources(mut self, globs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sources.extend(globs.into_iter().map(Into::into));
        self
    }

    pub fn stage(mut self, name: impl Into<String>, op: Op) -> Self {
        let input = match self.stages.last() {
            Some(previous) => Input::Stage(previous.name.clone()),
            None => Input::Source,
        };

        self.stages.push(Stage::new(name, input, op));
        self
    }

    pub fn branch(mut self, name: impl Into<String>, from: impl Into<String>, op: Op) -> Self {
        self.stages
            .push(Stage::new(name, Input::Stage(from.into()), op));
        self
    }

    pub fn write(mut self, dest: impl Into<Utf8PathBuf>) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.dest = Some(dest.into());
        }
        self
    }

    pub fn emit(mut self, effect: Effect) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.effects.push(effect);
        }
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        Pipeline::new(self.name, self.sources, self.stages)
    }
}
