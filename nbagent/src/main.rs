//! Autonomous notebook agent CLI.
//!
//! Sessions live under `<artifact_dir>/<task_id>/`; `solve` creates or resumes
//! one and runs the agent loop until the model stops or the caps run out.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nbagent::core::content::blocks_to_text;
use nbagent::core::render::{RenderOptions, render_document};
use nbagent::exit_codes;
use nbagent::io::completion::backend_from_config;
use nbagent::io::config::{AgentConfig, CONFIG_FILE, load_config, write_config};
use nbagent::io::interrupt::{InterruptToken, Interrupted, install_signal_handlers};
use nbagent::io::kernel::PythonKernel;
use nbagent::io::session_store::SessionStore;
use nbagent::logging;
use nbagent::looping::AgentLoop;
use nbagent::seed::{SessionRequest, open_session};
use nbagent::step::AgentContext;

#[derive(Parser)]
#[command(name = "nbagent", version, about = "Autonomous notebook agent")]
struct Cli {
    /// Path to the TOML config. Missing file means defaults.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with default values.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create or resume a session and run the agent loop.
    Solve {
        /// Task statement. Required unless resuming an existing task id.
        #[arg(long)]
        task: Option<String>,
        /// Session id. Defaults to the current UTC time.
        #[arg(long)]
        task_id: Option<String>,
        /// Initial feedback folded into the goal.
        #[arg(long)]
        feedback: Option<String>,
        /// Override `agent.max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Override `agent.max_goal_iterations`.
        #[arg(long)]
        max_goal_iterations: Option<u32>,
    },
    /// Print a saved session's notebook the way the model sees it.
    Render {
        #[arg(long)]
        task_id: String,
        /// Omit cell outputs.
        #[arg(long)]
        no_outputs: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) if err.downcast_ref::<Interrupted>().is_some() => {
            eprintln!("interrupted; session saved");
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Solve {
            task,
            task_id,
            feedback,
            max_iterations,
            max_goal_iterations,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(max) = max_iterations {
                config.agent.max_iterations = max;
            }
            if let Some(max) = max_goal_iterations {
                config.agent.max_goal_iterations = max;
            }
            config.validate()?;
            let request = SessionRequest {
                task,
                task_id,
                feedback,
                setup_code: config.prompt.setup_code.clone(),
            };
            cmd_solve(config, &request)
        }
        Command::Render {
            task_id,
            no_outputs,
        } => cmd_render(&cli.config, &task_id, !no_outputs),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &AgentConfig::default())?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_solve(config: AgentConfig, request: &SessionRequest) -> Result<()> {
    let interrupt = InterruptToken::new();
    let _signals = install_signal_handlers(interrupt.clone())?;

    let ctx = AgentContext::from_config(config, interrupt)?;
    let backend = backend_from_config(&ctx.config.llm)?;
    let mut engine = PythonKernel::new(&ctx.config.kernel);
    let mut session = open_session(&ctx.store, &mut engine, request)?;
    let notebook = ctx.store.last_path(&session.task_id);

    let mut agent = AgentLoop::new(ctx, backend, engine);
    let outcome = agent.solve(&mut session)?;
    println!(
        "{} stop={:?} goal_iterations={} steps={} total_iterations={}",
        session.task_id,
        outcome.stop,
        outcome.goal_iterations,
        outcome.steps_executed,
        outcome.total_iterations
    );
    println!("{}", notebook.display());
    Ok(())
}

fn cmd_render(config_path: &Path, task_id: &str, include_outputs: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let store = SessionStore::new(config.agent.artifact_dir.clone());
    let session = store
        .load(task_id)?
        .with_context(|| format!("no saved session for task id {task_id:?}"))?;
    let options = RenderOptions {
        include_outputs,
        max_output_chars: config.agent.max_cell_output_chars,
    };
    print!("{}", blocks_to_text(&render_document(&session.document, &options)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["nbagent", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn parse_solve_with_overrides() {
        let cli = Cli::parse_from([
            "nbagent",
            "solve",
            "--task",
            "plot sleep",
            "--task-id",
            "t1",
            "--max-iterations",
            "4",
            "--config",
            "custom.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Command::Solve {
                task,
                task_id,
                feedback,
                max_iterations,
                max_goal_iterations,
            } => {
                assert_eq!(task.as_deref(), Some("plot sleep"));
                assert_eq!(task_id.as_deref(), Some("t1"));
                assert_eq!(feedback, None);
                assert_eq!(max_iterations, Some(4));
                assert_eq!(max_goal_iterations, None);
            }
            _ => panic!("expected solve"),
        }
    }

    #[test]
    fn parse_render_requires_task_id() {
        assert!(Cli::try_parse_from(["nbagent", "render"]).is_err());
        let cli = Cli::parse_from(["nbagent", "render", "--task-id", "t1", "--no-outputs"]);
        assert!(matches!(
            cli.command,
            Command::Render { no_outputs: true, .. }
        ));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        cmd_init(&path, false).expect("first init");
        assert!(cmd_init(&path, false).is_err());
        cmd_init(&path, true).expect("forced init");
    }
}
