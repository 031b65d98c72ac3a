use crate::api::{ApiClient, DownloadOutcome};
use crate::history::RunHistory;
use crate::model::{CausalQuestion, CheckStatus, JobEvent, RuntimeStatus, Settings, StatusKind};
use crate::nodes::{build_estimate_node, build_significance_test_node};
use crate::orchestrator::Orchestrator;
use crate::{runs, storage, text_summary};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "showwhy-run",
    version,
    about = "Drive causal-effect estimation runs against a remote compute backend"
)]
pub struct Cli {
    /// Path to a JSON settings file (base URL, function keys)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL for the compute backend (overrides the settings file)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Delay between status polls (overrides the settings file)
    #[arg(long)]
    pub poll_interval: Option<humantime::Duration>,

    /// Print JSON instead of text summaries
    #[arg(long)]
    pub json: bool,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Export the final state as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Upload a dataset and run effect estimation for a causal question
    Run {
        /// Dataset file to upload (CSV)
        dataset: PathBuf,
        /// JSON file describing the causal question
        #[arg(long)]
        question: PathBuf,
    },
    /// Run significance tests over the default run's estimates
    Significance {
        /// Specification task ids to test
        #[arg(long = "spec-id", required = true)]
        spec_ids: Vec<String>,
        /// Outcome the tested specifications share
        #[arg(long)]
        outcome: Option<String>,
    },
    /// Ask the backend how many specifications a question expands to
    Count {
        /// JSON file describing the causal question
        #[arg(long)]
        question: PathBuf,
        /// Name of the already-uploaded dataframe
        #[arg(long)]
        dataframe: String,
    },
    /// Upload dataset files without starting a run
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download a result file from the backend
    Download {
        /// Remote file name
        file_name: String,
        /// Local path to write to (defaults to the remote name)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show stored run history and significance tests
    History {
        /// Mark this run id as the default run
        #[arg(long)]
        set_default: Option<String>,
    },
}

pub async fn run(args: Cli) -> Result<()> {
    match args.command.clone() {
        Command::Run { dataset, question } => run_estimate(&args, &dataset, &question).await,
        Command::Significance { spec_ids, outcome } => {
            run_significance(&args, spec_ids, outcome).await
        }
        Command::Count {
            question,
            dataframe,
        } => run_count(&args, &question, &dataframe).await,
        Command::Upload { files } => run_upload(&args, files).await,
        Command::Download { file_name, out } => run_download(&args, &file_name, out).await,
        Command::History { set_default } => run_history(&args, set_default).await,
    }
}

/// Build `Settings` from the config file plus CLI overrides.
pub fn build_settings(args: &Cli) -> Result<Settings> {
    let mut settings = match args.config.as_deref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings file {}", path.display()))?;
            serde_json::from_str::<Settings>(&raw)
                .with_context(|| format!("parsing settings file {}", path.display()))?
        }
        None => Settings {
            base_url: String::new(),
            keys: Default::default(),
            session_id: None,
            poll_interval: std::time::Duration::from_millis(3000),
        },
    };
    if let Some(base_url) = args.base_url.clone() {
        settings.base_url = base_url;
    }
    if let Some(interval) = args.poll_interval {
        settings.poll_interval = interval.into();
    }
    anyhow::ensure!(
        !settings.base_url.is_empty(),
        "no backend base URL; pass --base-url or a --config file"
    );
    Ok(settings)
}

async fn read_question(path: &Path) -> Result<CausalQuestion> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading causal question {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing causal question {}", path.display()))
}

fn build_client(settings: &Settings) -> Result<ApiClient> {
    let session_id = match settings.session_id.clone() {
        Some(id) => id,
        None => storage::load_or_create_session_id(false)?,
    };
    Ok(ApiClient::new(settings, session_id)?)
}

/// Cancel the run on Ctrl-C instead of killing the process, so the backend
/// job gets terminated too.
fn cancel_on_ctrl_c(cancel: crate::orchestrator::CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel(None);
        }
    });
}

async fn run_estimate(args: &Cli, dataset: &Path, question_path: &Path) -> Result<()> {
    let settings = build_settings(args)?;
    let question = read_question(question_path).await?;
    let mut history = storage::load_history()?;
    if history.is_processing() {
        anyhow::bail!("the default run is still processing; wait for it to finish");
    }
    let mut client = build_client(&settings)?;
    let (out_tx, out_handle) = spawn_output_writer();

    let prepared = runs::prepare_estimate(&mut client, &question, dataset).await?;
    storage::store_session_id(client.session_id())?;
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Uploaded {}: {} specifications",
        prepared.file_name, prepared.spec_count
    )));

    let run_number = runs::initial_run_entry(
        &mut history,
        &question,
        prepared.spec_count,
        client.session_id(),
    );
    let (orchestrator, mut events, cancel) =
        Orchestrator::new(client.clone(), settings.poll_interval);
    let job = tokio::spawn(orchestrator.execute(prepared.request, StatusKind::Estimate));
    cancel_on_ctrl_c(cancel);

    let mut run_id = String::new();
    let mut canceled = false;
    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Started { response } => {
                run_id = runs::on_estimate_started(
                    &mut history,
                    run_number,
                    &response,
                    client.session_id(),
                );
                let _ = out_tx.send(OutputLine::Stderr(format!("Run started: {run_id}")));
            }
            JobEvent::Update { status } => {
                runs::on_estimate_update(&mut history, &run_id, &status, &question);
                if let Some(entry) = history.find(&run_id) {
                    let _ = out_tx.send(OutputLine::Stderr(text_summary::progress_line(entry)));
                }
                if args.auto_save {
                    storage::save_history(&history)?;
                }
            }
            JobEvent::Completed { .. } => {}
            JobEvent::Canceled => {
                canceled = true;
                let tick = CheckStatus {
                    runtime_status: Some(RuntimeStatus::Terminated),
                    ..Default::default()
                };
                runs::on_estimate_update(&mut history, &run_id, &tick, &question);
                let _ = out_tx.send(OutputLine::Stderr("Run canceled".to_string()));
            }
        }
    }
    job.await.context("orchestrator task failed")??;

    if args.auto_save {
        let path = storage::save_history(&history)?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }
    if let Some(entry) = history.find(&run_id) {
        if let Some(path) = args.export_json.as_deref() {
            storage::export_json(path, entry)?;
        }
        if args.json {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(entry)?));
        } else if !canceled {
            for line in text_summary::build_run_summary(entry).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_significance(args: &Cli, spec_ids: Vec<String>, outcome: Option<String>) -> Result<()> {
    let settings = build_settings(args)?;
    let history = storage::load_history()?;
    let run = history
        .default_run()
        .context("no default run; execute an estimation run first")?;
    anyhow::ensure!(
        run.status.status == RuntimeStatus::Completed,
        "the default run has not completed yet"
    );
    let run_id = run.id.clone();
    let outcome = outcome.as_deref();

    let mut tests = storage::load_significance_tests()?;
    let client = ApiClient::new(&settings, run.session_id.clone())?;
    let (out_tx, out_handle) = spawn_output_writer();

    let request = build_significance_test_node(&spec_ids);
    runs::initial_significance_entry(&mut tests, &run_id, outcome);

    let (orchestrator, mut events, cancel) =
        Orchestrator::new(client.clone(), settings.poll_interval);
    let job = tokio::spawn(orchestrator.execute(request, StatusKind::Significance));
    cancel_on_ctrl_c(cancel);

    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Started { response } => {
                runs::on_significance_started(&mut tests, &run_id, outcome, &response);
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "Significance test started for run {run_id}"
                )));
            }
            JobEvent::Update { status } => {
                runs::on_significance_update(&mut tests, &run_id, outcome, &status);
                if let Some(test) = tests.get(&run_id, outcome) {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Simulations: {}/{} ({:.2}%)",
                        test.simulation_completed, test.total_simulations, test.percentage
                    )));
                }
                if args.auto_save {
                    storage::save_significance_tests(&tests)?;
                }
            }
            JobEvent::Completed { .. } => {}
            JobEvent::Canceled => {
                runs::on_significance_canceled(&mut tests, &run_id, outcome);
                if args.auto_save {
                    storage::save_significance_tests(&tests)?;
                }
                let _ = out_tx.send(OutputLine::Stderr("Significance test canceled".to_string()));
            }
        }
    }
    if let Err(err) = job.await.context("orchestrator task failed")? {
        runs::on_significance_failed(&mut tests, &run_id, outcome);
        storage::save_significance_tests(&tests)?;
        return Err(err).context("submitting the significance test");
    }

    if args.auto_save {
        let path = storage::save_significance_tests(&tests)?;
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }
    if let Some(test) = tests.get(&run_id, outcome) {
        if let Some(path) = args.export_json.as_deref() {
            storage::export_json(path, test)?;
        }
        if args.json {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(test)?));
        } else {
            for line in text_summary::build_significance_summary(test).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_count(args: &Cli, question_path: &Path, dataframe: &str) -> Result<()> {
    let settings = build_settings(args)?;
    let question = read_question(question_path).await?;
    let client = build_client(&settings)?;

    let node = build_estimate_node(&question, dataframe);
    let count = client
        .execution_count(&node)
        .await
        .context("sizing the specification grid")?;

    if args.json {
        println!("{}", serde_json::json!({ "total_executions": count }));
    } else {
        println!("Specifications: {count}");
    }
    Ok(())
}

async fn run_upload(args: &Cli, files: Vec<PathBuf>) -> Result<()> {
    let settings = build_settings(args)?;
    let mut client = build_client(&settings)?;

    let mut batch = Vec::with_capacity(files.len());
    for path in &files {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("invalid file path {}", path.display()))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        batch.push((name, bytes));
    }

    let uploaded = client.upload_files(batch).await.context("uploading files")?;
    storage::store_session_id(client.session_id())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&uploaded)?);
    } else {
        for (name, url) in &uploaded {
            println!("{name}: {url}");
        }
    }
    Ok(())
}

async fn run_download(args: &Cli, file_name: &str, out: Option<PathBuf>) -> Result<()> {
    let settings = build_settings(args)?;
    let client = build_client(&settings)?;

    match client
        .download_file(file_name)
        .await
        .context("resolving the download URL")?
    {
        DownloadOutcome::Fetched { bytes, .. } => {
            let out = out.unwrap_or_else(|| PathBuf::from(file_name));
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("Saved: {}", out.display());
        }
        DownloadOutcome::Fallback { url } => {
            println!("Could not fetch the file; retrieve it manually: {url}");
        }
    }
    Ok(())
}

async fn run_history(args: &Cli, set_default: Option<String>) -> Result<()> {
    let mut history = storage::load_history()?;
    let tests = storage::load_significance_tests()?;

    if let Some(run_id) = set_default {
        let session_id = history
            .set_default(&run_id)
            .with_context(|| format!("no run with id {run_id}"))?;
        storage::store_session_id(&session_id)?;
        storage::save_history(&history)?;
    }

    if let Some(path) = args.export_json.as_deref() {
        storage::export_json(path, &history)?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    print_history(&history);
    for test in tests.all() {
        for line in text_summary::build_significance_summary(test).lines {
            println!("{line}");
        }
        println!();
    }
    Ok(())
}

fn print_history(history: &RunHistory) {
    for entry in history.entries() {
        for line in text_summary::build_run_summary(entry).lines {
            println!("{line}");
        }
        println!();
    }
}
