use clap::{Parser, Subcommand, ValueEnum};
use qr_engine::datatypes::ValueChoice;
use qr_engine::{
    AnswerValue, EngineConfig, FormEngine, Questionnaire, QuestionnaireResponse, ValidationReport,
    build_render_payload, render_json_ui, render_text,
};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Questionnaire response CLI",
    long_about = "Populates, validates, evaluates and renders questionnaire responses stored on disk"
)]
struct Cli {
    /// JSON file with engine settings.
    #[arg(long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Open a response, apply answers and print the settled document.
    Populate {
        /// Path to the Questionnaire JSON.
        #[arg(long, value_name = "QUESTIONNAIRE")]
        questionnaire: PathBuf,
        /// Existing QuestionnaireResponse to start from.
        #[arg(long, value_name = "RESPONSE")]
        response: Option<PathBuf>,
        /// Answer assignment `linkId=<answer JSON>`; the answer is an object such as
        /// `{"valueString":"x"}` or an array of them.
        #[arg(long = "set", value_name = "ASSIGNMENT")]
        assignments: Vec<String>,
        /// Print the submission copy (disabled items stripped) instead of the live document.
        #[arg(long)]
        submission: bool,
        /// Write the document here instead of stdout.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Validate a response and report its issues.
    Validate {
        #[arg(long, value_name = "QUESTIONNAIRE")]
        questionnaire: PathBuf,
        #[arg(long, value_name = "RESPONSE")]
        response: Option<PathBuf>,
        /// `json` prints an OperationOutcome.
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Evaluate a FHIRPath expression against a response.
    Evaluate {
        #[arg(long, value_name = "QUESTIONNAIRE")]
        questionnaire: PathBuf,
        #[arg(long, value_name = "RESPONSE")]
        response: Option<PathBuf>,
        /// Evaluate in the context of the first instance of this item.
        #[arg(long, value_name = "LINK_ID")]
        at: Option<String>,
        expression: String,
    },
    /// Render the visible form.
    Render {
        #[arg(long, value_name = "QUESTIONNAIRE")]
        questionnaire: PathBuf,
        #[arg(long, value_name = "RESPONSE")]
        response: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn main() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Populate {
            questionnaire,
            response,
            assignments,
            submission,
            out,
        } => run_populate(
            config,
            &questionnaire,
            response.as_deref(),
            &assignments,
            submission,
            out,
        ),
        Command::Validate {
            questionnaire,
            response,
            format,
        } => run_validate(config, &questionnaire, response.as_deref(), format),
        Command::Evaluate {
            questionnaire,
            response,
            at,
            expression,
        } => run_evaluate(
            config,
            &questionnaire,
            response.as_deref(),
            at.as_deref(),
            &expression,
        ),
        Command::Render {
            questionnaire,
            response,
            format,
        } => run_render(config, &questionnaire, response.as_deref(), format),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    match path {
        Some(path) => {
            let contents = fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn open_form(
    config: EngineConfig,
    questionnaire_path: &Path,
    response_path: Option<&Path>,
) -> CliResult<FormEngine> {
    let definition_json = fs::read_to_string(questionnaire_path)?;
    let definition: Questionnaire = serde_json::from_str(&definition_json)?;
    let response = match response_path {
        Some(path) => {
            let contents = fs::read_to_string(path)?;
            Some(serde_json::from_str::<QuestionnaireResponse>(&contents)?)
        }
        None => None,
    };
    Ok(FormEngine::open(definition, response, config))
}

fn parse_assignment(assignment: &str) -> CliResult<(String, Vec<AnswerValue>)> {
    let (link_id, answer_json) = assignment
        .split_once('=')
        .ok_or_else(|| format!("assignment '{assignment}' must look like linkId=<answer JSON>"))?;
    let link_id = link_id.trim();
    if link_id.is_empty() {
        return Err(format!("assignment '{assignment}' names no item").into());
    }
    let answer: Value = serde_json::from_str(answer_json)?;
    let entries = match answer {
        Value::Array(entries) => entries,
        other => vec![other],
    };
    let mut values = Vec::with_capacity(entries.len());
    for entry in entries {
        let choice: ValueChoice = serde_json::from_value(entry)?;
        let value = choice
            .into_value()
            .ok_or_else(|| format!("answer for '{link_id}' carries no value"))?;
        values.push(value);
    }
    Ok((link_id.to_string(), values))
}

fn run_populate(
    config: EngineConfig,
    questionnaire: &Path,
    response: Option<&Path>,
    assignments: &[String],
    submission: bool,
    out: Option<PathBuf>,
) -> CliResult<()> {
    let mut form = open_form(config, questionnaire, response)?;
    for assignment in assignments {
        let (link_id, values) = parse_assignment(assignment)?;
        let node = form
            .find(&link_id)
            .ok_or_else(|| format!("item '{link_id}' is not part of the questionnaire"))?;
        debug!(%link_id, count = values.len(), "applying assignment");
        form.set_answers(node, values)?;
    }

    let document = if submission {
        form.submission()
    } else {
        form.response().clone()
    };
    let rendered = serde_json::to_string_pretty(&document)?;
    match out {
        Some(path) => {
            fs::write(&path, format!("{rendered}\n"))?;
            println!("Response written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn run_validate(
    config: EngineConfig,
    questionnaire: &Path,
    response: Option<&Path>,
    format: OutputFormat,
) -> CliResult<()> {
    let form = open_form(config, questionnaire, response)?;
    let report = form.issues();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report.to_operation_outcome())?
        ),
        OutputFormat::Text => {
            println!(
                "Validation result: {}",
                if report.is_valid() { "valid" } else { "invalid" }
            );
            describe_report(report);
        }
    }

    if report.is_valid() {
        Ok(())
    } else {
        Err("validation failed".into())
    }
}

fn describe_report(report: &ValidationReport) {
    if report.issues().is_empty() {
        return;
    }
    println!("Issues:");
    for issue in report.issues() {
        let severity = serde_json::to_value(issue.severity)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "  [{severity}] {} {} - {}",
            issue.code.as_str(),
            issue.location.as_deref().unwrap_or("<form>"),
            issue.diagnostics
        );
    }
}

fn run_evaluate(
    config: EngineConfig,
    questionnaire: &Path,
    response: Option<&Path>,
    at: Option<&str>,
    expression: &str,
) -> CliResult<()> {
    let form = open_form(config, questionnaire, response)?;
    let node = match at {
        Some(link_id) => Some(
            form.find(link_id)
                .ok_or_else(|| format!("item '{link_id}' is not part of the questionnaire"))?,
        ),
        None => None,
    };
    let collection = form.evaluate(node, expression)?;
    let values: Vec<Value> = collection.iter().map(|value| value.to_json()).collect();
    println!("{}", serde_json::to_string(&values)?);
    Ok(())
}

fn run_render(
    config: EngineConfig,
    questionnaire: &Path,
    response: Option<&Path>,
    format: OutputFormat,
) -> CliResult<()> {
    let form = open_form(config, questionnaire, response)?;
    let payload = build_render_payload(&form);
    match format {
        OutputFormat::Text => println!("{}", render_text(&payload)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&render_json_ui(&payload))?),
    }
    Ok(())
}
