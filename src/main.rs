use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use nagare::{Config, Environment, Settings};

const CONFIG_FILE: &str = "nagare.toml";

#[derive(Debug, Parser)]
#[command(name = "nagare", version, about = "Front-end asset pipeline with live reload")]
struct Args {
    /// Task to run.
    #[arg(default_value = "default")]
    task: String,

    /// Configuration file. Defaults to `nagare.toml` when present, otherwise
    /// the built-in settings.
    #[arg(long, short, value_name = "FILE")]
    config: Option<Utf8PathBuf>,

    /// List the tasks and print the task graph as a mermaid flowchart.
    #[arg(long)]
    list: bool,

    /// Empty the transformation cache before running.
    #[arg(long)]
    clear_cache: bool,
}

fn main() -> ExitCode {
    #[cfg(feature = "logging")]
    nagare::init_logging();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None if Utf8PathBuf::from(CONFIG_FILE).is_file() => Config::load(CONFIG_FILE)?,
        None => Config::builtin(),
    };
    let settings = Settings::from_config(&config)?;

    let blueprint = nagare::tasks::blueprint(&settings)?;
    let env = Environment::new(settings);

    if args.clear_cache {
        env.cache.clear()?;
        tracing::info!("cleared the transformation cache");
    }

    let scheduler = blueprint.finish(env)?;

    if args.list {
        for task in scheduler.tasks() {
            println!("{} ({})", task.name, task.action.kind());
        }
        println!();
        println!("{scheduler}");
        return Ok(());
    }

    if let Err(e) = scheduler.run(&args.task) {
        scheduler.env().notifier.failure(&e);
        anyhow::bail!("task '{}' failed", args.task);
    }

    Ok(())
}
