use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TopologyKind {
    Chain,
    Router,
    Parallel,
    Evaluator,
    Orchestrator,
    GroupChat,
}

impl TopologyKind {
    pub fn label(self) -> &'static str {
        match self {
            TopologyKind::Chain => "chain",
            TopologyKind::Router => "router",
            TopologyKind::Parallel => "parallel",
            TopologyKind::Evaluator => "evaluator",
            TopologyKind::Orchestrator => "orchestrator",
            TopologyKind::GroupChat => "group-chat",
        }
    }
}

const CLI_EXAMPLES: &str = "Examples:\n\
  ensemble validate --workflow ensemble.toml\n\
  ensemble run chain --workflow ensemble.toml \"Summarize the quarterly report\"\n\
  ensemble run router --script replies.toml \"Inspect the engine vibration data\"\n\
  ensemble run orchestrator --max-iterations 4 --output artifacts/report.md \"Compare the Q3 figures\"\n\
  ensemble run parallel --task-file data/engines.csv \"Analyze these readings\"\n\
  ensemble transcript --limit 200\n\
\n\
Without --script every agent echoes its input, which is enough to dry-run a workflow.";

#[derive(Debug, Parser)]
#[command(name = "ensemble")]
#[command(about = "Run multi-agent orchestration workflows from a TOML definition")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, global = true, env = "ENSEMBLE_WORKFLOW", default_value = "ensemble.toml")]
    pub workflow: String,

    #[arg(long, global = true, env = "ENSEMBLE_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, global = true, env = "ENSEMBLE_RETRY_DELAY_MS")]
    pub retry_delay_ms: Option<u64>,

    #[arg(long, global = true, env = "ENSEMBLE_TRANSCRIPT")]
    pub transcript: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run one topology from the workflow file on a task")]
    Run {
        #[arg(value_enum)]
        topology: TopologyKind,
        #[arg(required_unless_present = "task_file")]
        task: Vec<String>,
        #[arg(long, help = "Append the flattened contents of a text or CSV file to the task")]
        task_file: Option<String>,
        #[arg(long, help = "TOML reply script replayed instead of a live model")]
        script: Option<String>,
        #[arg(long, help = "Write the final artifact to this path")]
        output: Option<String>,
        #[arg(long, help = "Override the topology's iteration cap")]
        max_iterations: Option<u32>,
    },
    #[command(about = "Parse the workflow file and check every agent reference")]
    Validate,
    #[command(about = "Summarize a JSONL transcript written by earlier runs")]
    Transcript {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { topology, .. } => format!("run.{}", topology.label()),
        Commands::Validate => "validate".to_string(),
        Commands::Transcript { .. } => "transcript".to_string(),
    }
}
