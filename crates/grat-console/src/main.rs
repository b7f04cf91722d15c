mod config;
mod logging;
mod render;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{ConsoleConfig, GlobalArgs};
use grat_core::{BulkResult, TaskKind, TaskOutcome, TaskSubmission, TaskTemplate};
use grat_dispatch::{BulkCoordinator, HttpTransport, TaskDispatcher, TaskTransport};
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "grat", about = "Operator console for the remote task service")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List agents known to the server
    Agents {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List queued tasks, optionally for one agent
    Tasks {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show server version, uptime and connected agent count
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run a shell command on one agent and wait for its output
    Exec {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Submit any task kind to one agent and wait for the outcome
    Run {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        kind: TaskKind,
        #[arg(long)]
        command: Option<String>,
        #[arg(long = "arg", value_parser = render::parse_key_value)]
        args: Vec<(String, String)>,
        /// Return once the task is queued instead of polling for its result
        #[arg(long, default_value_t = false)]
        no_wait: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Terminate one or more agents
    Terminate {
        #[arg(required = true)]
        agents: Vec<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the stored result of a task without waiting
    Result {
        task_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Agents { .. } => "agents",
            Command::Tasks { .. } => "tasks",
            Command::Status { .. } => "status",
            Command::Exec { .. } => "exec",
            Command::Run { .. } => "run",
            Command::Terminate { .. } => "terminate",
            Command::Result { .. } => "result",
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config::load(&cli.global) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            return ExitCode::from(2);
        }
    };
    let _log_guard = logging::init_logging(&config, cli.command.name());

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(event = "command_failed", error = %err);
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &ConsoleConfig) -> Result<ExitCode> {
    let transport = Arc::new(
        HttpTransport::new(&config.server_url, config.request_timeout)
            .context("invalid server configuration")?,
    );
    info!(event = "console_start", server = %transport.base_url());
    let dispatcher = TaskDispatcher::new(transport.clone(), config.poll);

    match command {
        Command::Agents { json } => {
            let agents = transport
                .list_agents()
                .await
                .context("failed to load agents")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
            } else if agents.is_empty() {
                println!("No agents connected");
            } else {
                print!("{}", render::agent_table(&agents, Utc::now()));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Tasks { agent, json } => {
            let tasks = transport
                .list_tasks(agent.as_deref())
                .await
                .context("failed to load tasks")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks found");
            } else {
                print!("{}", render::task_table(&tasks, Utc::now()));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { json } => {
            let status = transport
                .server_status()
                .await
                .context("failed to load server status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", render::server_status(&status));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            agent,
            json,
            command,
        } => {
            let submission = TaskSubmission::shell(agent, command.join(" "));
            track_one(&dispatcher, &submission, json).await
        }
        Command::Run {
            agent,
            kind,
            command,
            args,
            no_wait,
            json,
        } => {
            let mut payload: BTreeMap<String, String> = args.into_iter().collect();
            if let Some(command) = command {
                payload.insert("command".to_string(), command);
            }
            let submission = TaskSubmission::new(agent, kind, payload);
            if !no_wait {
                return track_one(&dispatcher, &submission, json).await;
            }
            let handle = dispatcher.submit(&submission).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&handle)?);
            } else {
                println!("Task created successfully (ID: {})", handle.task_id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Terminate { agents, json } => {
            let coordinator = BulkCoordinator::new(dispatcher);
            let result = dispatch_bulk(&coordinator, agents, &TaskTemplate::terminate()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", render::bulk_summary("Termination", &result));
            }
            Ok(exit_code(result.all_succeeded()))
        }
        Command::Result { task_id, json } => {
            let payload = transport
                .get_task_result(&task_id)
                .await
                .with_context(|| format!("failed to load result for task {task_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("{}", render::result_message(&payload));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn track_one(
    dispatcher: &TaskDispatcher,
    submission: &TaskSubmission,
    json: bool,
) -> Result<ExitCode> {
    let (tx, mut rx) = oneshot::channel();
    let tracking = dispatcher
        .track(submission, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;
    eprintln!(
        "Executing {} on {} (task {})...",
        submission.kind(),
        submission.target_id(),
        tracking.task_id()
    );

    let early = tokio::select! {
        outcome = &mut rx => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match early {
        Some(outcome) => outcome,
        None => {
            warn!(event = "interrupted", task_id = %tracking.task_id());
            tracking.cancel();
            rx.await
        }
    }
    .context("polling stopped without an outcome")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.is_success() {
        println!("{}", render::outcome_message(&outcome));
    } else {
        eprintln!("{}", render::outcome_message(&outcome));
    }
    Ok(exit_code(matches!(outcome, TaskOutcome::Completed { .. })))
}

async fn dispatch_bulk(
    coordinator: &BulkCoordinator,
    targets: Vec<String>,
    template: &TaskTemplate,
) -> Result<BulkResult> {
    let (tx, mut rx) = oneshot::channel();
    let handle = coordinator.dispatch_all(targets, template, move |result| {
        let _ = tx.send(result);
    })?;
    eprintln!(
        "Sending {} to {} agent(s) (operation {})...",
        template.kind(),
        handle.total(),
        handle.operation_id()
    );

    let early = tokio::select! {
        result = &mut rx => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match early {
        Some(result) => result,
        None => {
            warn!(event = "interrupted", operation_id = %handle.operation_id());
            handle.cancel();
            rx.await
        }
    }
    .context("bulk operation stopped without a result")?;
    Ok(result)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
