use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use lead_core::lead::LeadSource;
use lead_pipeline::adapters::ad_sheet::AdSheetSource;
use lead_pipeline::adapters::http_client;
use lead_pipeline::adapters::inbox::{DirectoryInboxReader, InboxSource};
use lead_pipeline::adapters::lead_sink::HttpLeadSink;
use lead_pipeline::adapters::source::SourceAdapter;
use lead_pipeline::adapters::tabular_store::{CsvTabularStore, TabularStore};
use lead_pipeline::config::PipelineConfig;
use lead_pipeline::error::RunError;
use lead_pipeline::handlers::run::{run_pipeline, RunPorts, RunSettings, RunSummary};
use lead_pipeline::observability::{init_logging, LogFormat};

/// One pipeline run against local CSV tabs, with the CRM from the environment.
#[derive(Parser)]
#[command(name = "lead_run", about = "Run the lead pipeline once against local CSV tabs")]
struct Cli {
    /// Directory holding `<tab>.csv` files (ledger and ad export)
    #[arg(long, env = "LEAD_DATA_DIR")]
    data_dir: PathBuf,
    /// Directory of `.eml`/`.txt` messages to import as email leads
    #[arg(long, env = "LEAD_INBOX_DIR")]
    inbox_dir: Option<PathBuf>,
    /// Identifier reported in logs and in the summary
    #[arg(long)]
    run_id: Option<String>,
    /// Log formatter; overrides LOG_FORMAT
    #[arg(long)]
    log_format: Option<LogFormat>,
}

fn execute(cli: &Cli, config: &PipelineConfig, run_id: &str) -> Result<RunSummary, RunError> {
    let client = http_client(config.io_timeout)?;
    let store = Arc::new(CsvTabularStore::new(&cli.data_dir));

    let inbox = cli
        .inbox_dir
        .as_ref()
        .map(|dir| InboxSource::new(DirectoryInboxReader::new(dir)));
    let id_columns = config
        .mappings
        .get(LeadSource::MetaAds)
        .map(|mapping| mapping.external_id.clone())
        .unwrap_or_default();
    let ads_store: Arc<dyn TabularStore> = store.clone();
    let ads = AdSheetSource::new(ads_store, config.ads_tab.as_str(), id_columns);

    let mut sources: Vec<&dyn SourceAdapter> = Vec::new();
    if let Some(inbox) = &inbox {
        sources.push(inbox);
    }
    sources.push(&ads);

    let sink = HttpLeadSink::new(client, &config.crm);
    run_pipeline(
        run_id,
        RunSettings::from(config),
        &RunPorts {
            sources,
            ledger: store.as_ref(),
            sink: &sink,
        },
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            init_logging(cli.log_format.unwrap_or_default());
            tracing::error!(event = "config_invalid", error = %error, "cannot start run");
            eprintln!("configuration error: {error}");
            return ExitCode::from(2);
        }
    };
    init_logging(cli.log_format.unwrap_or(config.log_format));

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| format!("local-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S")));

    match execute(&cli, &config, &run_id) {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("could not render summary: {error}");
                ExitCode::FAILURE
            }
        },
        Err(error) => {
            tracing::error!(event = "run_aborted", run_id = %run_id, error = %error, "pipeline run did not complete");
            eprintln!("run aborted: {error}");
            ExitCode::FAILURE
        }
    }
}
