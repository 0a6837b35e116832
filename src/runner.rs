use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::{Cli, Commands, TopologyKind, command_label};
use crate::config::{RuntimeConfig, WorkflowFile, load_workflow};
use crate::model::{EchoModel, LanguageModel, ScriptedModel, load_reply_script};
use crate::observer::{ObserverSet, ResponseObserver, TracingObserver};
use crate::persistence::{load_csv_flat, load_text, save_artifact};
use crate::runtime::Runtime;
use crate::state::RunReport;
use crate::transcript::{TranscriptSink, run_transcript_report};
use crate::workflow::{build_agents, build_topology};

/// Reply script when given, otherwise every agent echoes its input. Scripted
/// agents without replies also fall back to echoing.
pub fn build_model(script: Option<&Path>) -> Result<Arc<dyn LanguageModel>> {
    match script {
        Some(path) => {
            let script = load_reply_script(path)?;
            tracing::info!(path = %path.display(), agents = script.replies.len(), "using reply script");
            Ok(Arc::new(ScriptedModel::from_script(script).with_echo_fallback()))
        }
        None => {
            tracing::info!("no reply script given; agents echo their input");
            Ok(Arc::new(EchoModel))
        }
    }
}

/// Joins the task words and appends the contents of `task_file`, flattened
/// when it is a CSV file.
pub fn compose_task(words: &[String], task_file: Option<&Path>) -> Result<String> {
    let mut task = words.join(" ").trim().to_string();
    if let Some(path) = task_file {
        append_task_file(&mut task, path)?;
    }
    if task.is_empty() {
        return Err(anyhow::anyhow!(
            "task is empty; pass task text or a non-empty --task-file"
        ));
    }
    Ok(task)
}

fn append_task_file(task: &mut String, path: &Path) -> Result<()> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let data = if is_csv {
        load_csv_flat(path)?
    } else {
        load_text(path)?
    };
    if data.trim().is_empty() {
        tracing::warn!(path = %path.display(), "task file is missing or empty");
    } else {
        if !task.is_empty() {
            task.push_str("\n\n");
        }
        task.push_str(data.trim());
    }
    Ok(())
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    tracing::debug!(command = %command_label(&cli.command), "dispatching command");
    match &cli.command {
        Commands::Run {
            topology,
            task,
            task_file,
            script,
            output,
            max_iterations,
        } => {
            let file = load_workflow(Path::new(&cli.workflow))?;
            let cfg = RuntimeConfig::resolve(&cli, &file);
            let task = compose_task(task, task_file.as_deref().map(Path::new))?;
            let report = run_workflow(
                &cfg,
                &file,
                *topology,
                script.as_deref().map(Path::new),
                *max_iterations,
                &task,
            )
            .await?;

            println!("{}", report.format_summary());
            println!("{}", report.artifact);
            if let Some(path) = output {
                save_artifact(Path::new(path), &report.artifact)?;
                println!("\nArtifact saved to {path}");
            }
        }
        Commands::Validate => {
            let file = load_workflow(Path::new(&cli.workflow))?;
            print_validation(&cli.workflow, &file);
        }
        Commands::Transcript { path, limit } => {
            let path = match path {
                Some(path) => PathBuf::from(path),
                None => transcript_path_for(&cli)?,
            };
            run_transcript_report(&path, *limit)?;
        }
    }
    Ok(())
}

fn transcript_path_for(cli: &Cli) -> Result<PathBuf> {
    let workflow = Path::new(&cli.workflow);
    let file = if workflow.exists() {
        load_workflow(workflow)?
    } else {
        WorkflowFile::default()
    };
    Ok(PathBuf::from(RuntimeConfig::resolve(cli, &file).transcript_path))
}

fn print_validation(path: &str, file: &WorkflowFile) {
    println!("Workflow '{path}' is valid.");
    println!("Agents: {}", file.agent_names().join(", "));
    let topologies = file
        .configured_topologies()
        .into_iter()
        .map(TopologyKind::label)
        .collect::<Vec<_>>();
    if topologies.is_empty() {
        println!("Topologies: none configured");
    } else {
        println!("Topologies: {}", topologies.join(", "));
    }
}

/// Builds and runs one topology, recording every response to the transcript.
/// Ctrl+C stops the run before its next agent invocation.
pub async fn run_workflow(
    cfg: &RuntimeConfig,
    file: &WorkflowFile,
    kind: TopologyKind,
    script: Option<&Path>,
    max_iterations: Option<u32>,
    task: &str,
) -> Result<RunReport> {
    let model = build_model(script)?;
    let agents = build_agents(file, model)?;
    let topology = build_topology(kind, file, &agents, max_iterations)?;

    let runtime = Runtime::new(cfg.retry_policy());
    let transcript = Arc::new(TranscriptSink::new(&cfg.transcript_path, kind.label()));
    let observers = ObserverSet::new()
        .with(Arc::new(TracingObserver))
        .with(Arc::clone(&transcript) as Arc<dyn ResponseObserver>);

    let stopper = runtime.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, stopping after the in-flight invocation...");
            stopper.stop_when_idle();
        }
    });

    let result = topology.run(&runtime, &observers, task).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            transcript.record_run(&report);
            Ok(report)
        }
        Err(err) => {
            transcript.record_run(&err.report);
            Err(err).context(format!("{} run failed", kind.label()))
        }
    }
}
