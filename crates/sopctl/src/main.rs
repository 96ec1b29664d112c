mod runner;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sop_engine::procedure::parse_definition_file;
use sop_engine::{
    EngineConfig, ExecutionId, ExecutionRecorder, ExecutionStateMachine, ExecutionView,
    InMemoryDefinitionStore, JournalRecorder, LogFormat, Outcome, ProcedureExecution,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::runner::{ProcedureRunner, Responses};

#[derive(Parser)]
#[command(name = "sopctl")]
#[command(version, about = "SOP Execution Engine Command Line Tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Journal directory for durable executions (overrides SOP_JOURNAL_DIR)
    #[arg(long, global = true)]
    journal_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a procedure definition
    Validate {
        /// Procedure file (YAML, or JSON by extension)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the parsed definition as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Run a procedure locally from scripted responses
    ///
    /// Examples:
    ///     sopctl run ./procedures/tank.yaml -r ./responses.yaml
    ///     sopctl run ./tank.yaml -r ./responses.yaml --outcome conditional
    ///     sopctl run ./tank.yaml -r ./responses.yaml --journal-dir ./journal
    #[command(verbatim_doc_comment)]
    Run {
        /// Procedure file (YAML, or JSON by extension)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Responses file with per-step values and skips
        #[arg(short, long)]
        responses: PathBuf,

        /// Operator id (overrides the responses file)
        #[arg(short, long)]
        operator: Option<String>,

        /// Outcome to declare at finalize
        #[arg(long, value_enum, default_value = "success")]
        outcome: OutcomeArg,

        /// Emit the finalized execution as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show a journaled execution with its pending step
    Status {
        /// Execution id
        #[arg(value_name = "ID")]
        execution_id: String,

        /// Emit JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List journaled executions
    List,

    /// Abandon an in-progress journaled execution
    Abandon {
        /// Execution id
        #[arg(value_name = "ID")]
        execution_id: String,

        /// Why the execution is being abandoned
        #[arg(long)]
        reason: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    Conditional,
    Failure,
}

impl From<OutcomeArg> for Outcome {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Success => Outcome::Success,
            OutcomeArg::Conditional => Outcome::Conditional,
            OutcomeArg::Failure => Outcome::Failure,
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;
    if let Some(dir) = cli.journal_dir {
        config = config.with_journal_dir(dir);
    }

    init_tracing(config.log_format);

    match cli.command {
        Commands::Validate { file, json } => {
            let definition = parse_definition_file(&file)
                .with_context(|| format!("Invalid procedure: {}", file.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&definition)?);
            } else {
                println!(
                    "{} v{} ({}): {} steps, {} critical",
                    definition.id,
                    definition.version,
                    definition.status,
                    definition.steps.len(),
                    definition.critical_steps().count()
                );
                for step in &definition.steps {
                    let mut flags = Vec::new();
                    if step.is_critical {
                        flags.push("critical");
                    }
                    if step.is_optional {
                        flags.push("optional");
                    }
                    if !step.skip_conditions.is_empty() {
                        flags.push("conditional");
                    }
                    if !step.conditional_logic.is_empty() {
                        flags.push("branches");
                    }
                    if step.quality_check_required {
                        flags.push("quality-check");
                    }
                    println!(
                        "  {:>3}. {:<13} {}{}",
                        step.step_number,
                        step.step_type.to_string(),
                        step.title,
                        if flags.is_empty() {
                            String::new()
                        } else {
                            format!("  [{}]", flags.join(", "))
                        }
                    );
                }
            }
        }
        Commands::Run {
            file,
            responses,
            operator,
            outcome,
            json,
        } => {
            let responses = Responses::from_file(&responses)?;
            let mut runner = ProcedureRunner::new(file, responses)
                .with_operator(operator)
                .with_outcome(outcome.into());
            if config.journal_dir.is_some() {
                runner = runner.with_recorder(open_journal(&config)?);
            }

            let execution = runner.run()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&execution)?);
            } else {
                print_execution(&execution);
            }
        }
        Commands::Status { execution_id, json } => {
            let engine = journal_engine(&config)?;
            let view = engine.view(&parse_id(&execution_id)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
        }
        Commands::List => {
            let recorder = open_journal(&config)?;
            let engine = ExecutionStateMachine::new(
                Arc::new(InMemoryDefinitionStore::new()),
                recorder.clone(),
            );
            for id in recorder.execution_ids()? {
                let execution = engine.execution(&id)?;
                println!(
                    "{}  {:<12} {} (operator {})",
                    id,
                    execution.status.to_string(),
                    execution.procedure_id,
                    execution.operator_id
                );
            }
        }
        Commands::Abandon {
            execution_id,
            reason,
        } => {
            let engine = journal_engine(&config)?;
            let execution = engine.abandon(&parse_id(&execution_id)?, &reason)?;
            println!("{} abandoned", execution.id);
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sop_engine=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn open_journal(config: &EngineConfig) -> Result<Arc<dyn ExecutionRecorder>> {
    let Some(dir) = &config.journal_dir else {
        bail!("No journal directory: pass --journal-dir or set SOP_JOURNAL_DIR");
    };
    let recorder = JournalRecorder::open(dir.clone(), config)
        .with_context(|| format!("Failed to open journal: {}", dir.display()))?;
    Ok(Arc::new(recorder))
}

/// Engine over the journal alone. Executions carry their definition
/// snapshot, so reads and abandon need no definitions.
fn journal_engine(config: &EngineConfig) -> Result<ExecutionStateMachine> {
    Ok(ExecutionStateMachine::new(
        Arc::new(InMemoryDefinitionStore::new()),
        open_journal(config)?,
    ))
}

fn parse_id(raw: &str) -> Result<ExecutionId> {
    raw.parse()
        .with_context(|| format!("Invalid execution id: {}", raw))
}

fn print_execution(execution: &ProcedureExecution) {
    println!("Execution: {}", execution.id);
    println!(
        "Procedure: {} v{}",
        execution.procedure_id, execution.procedure_version
    );
    println!("Operator:  {}", execution.operator_id);
    println!("Status:    {}", execution.status);
    if let Some(outcome) = execution.outcome {
        match execution.declared_outcome {
            Some(declared) if declared != outcome => {
                println!("Outcome:   {} (declared {})", outcome, declared)
            }
            _ => println!("Outcome:   {}", outcome),
        }
    }
    if let Some(reason) = &execution.abandon_reason {
        println!("Reason:    {}", reason);
    }

    println!();
    for completion in &execution.completions {
        let title = execution
            .definition
            .step(completion.step_number)
            .map(|s| s.title.as_str())
            .unwrap_or("?");
        let value = completion
            .submitted_value
            .as_ref()
            .map(|v| format!(" = {}", v))
            .unwrap_or_default();
        let flag = if completion.is_deviation {
            "  [DEVIATION]"
        } else if completion.automatic {
            "  [auto]"
        } else {
            ""
        };
        println!(
            "  {:>3}. {:<9} {}{}{}",
            completion.step_number,
            completion.action.to_string(),
            title,
            value,
            flag
        );
    }

    for reason in &execution.failure_reasons {
        println!("  ! {}", reason);
    }
}

fn print_view(view: &ExecutionView) {
    print_execution(&view.execution);
    println!();
    println!(
        "Progress: {}/{} completed, {} skipped, {} deviations",
        view.progress.completed,
        view.progress.total_steps,
        view.progress.skipped,
        view.progress.deviations
    );
    if let Some(step) = &view.pending_step {
        println!("Next:     step {} - {} ({})", step.step_number, step.title, step.step_type);
    }
    if let Some(preconditions) = &view.preconditions {
        if !preconditions.required_equipment.is_empty() {
            println!("Equipment: {}", preconditions.required_equipment.join(", "));
        }
        if !preconditions.required_materials.is_empty() {
            println!("Materials: {}", preconditions.required_materials.join(", "));
        }
    }
}
