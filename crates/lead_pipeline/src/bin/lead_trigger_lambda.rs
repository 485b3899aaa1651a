use std::sync::Arc;

use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

use lead_core::lead::LeadSource;
use lead_pipeline::adapters::ad_sheet::AdSheetSource;
use lead_pipeline::adapters::http_client;
use lead_pipeline::adapters::inbox::{GmailInboxReader, InboxSource};
use lead_pipeline::adapters::lead_sink::HttpLeadSink;
use lead_pipeline::adapters::sheets::SheetsTabularStore;
use lead_pipeline::adapters::source::SourceAdapter;
use lead_pipeline::adapters::tabular_store::TabularStore;
use lead_pipeline::config::{GoogleConfig, PipelineConfig};
use lead_pipeline::error::RunError;
use lead_pipeline::handlers::run::{run_pipeline, RunPorts, RunSettings, RunSummary};
use lead_pipeline::handlers::trigger::{trigger_response, ApiGatewayResponse};
use lead_pipeline::observability::{init_logging, LogFormat};

/// Builds the Google and CRM adapters and runs the pipeline once.
///
/// Runs on a blocking thread: every adapter uses the blocking client.
fn execute_run(run_id: &str) -> Result<RunSummary, RunError> {
    let config = PipelineConfig::from_env()?;
    let google = GoogleConfig::from_env()?;
    let client = http_client(config.io_timeout)?;

    let sheets = Arc::new(SheetsTabularStore::new(
        client.clone(),
        google.spreadsheet_id.as_str(),
        google.access_token.as_str(),
    ));
    let inbox = InboxSource::new(
        GmailInboxReader::new(client.clone(), google.access_token.as_str())
            .with_user_id(google.gmail_user.as_str())
            .with_query(google.gmail_query.as_str()),
    );
    let id_columns = config
        .mappings
        .get(LeadSource::MetaAds)
        .map(|mapping| mapping.external_id.clone())
        .unwrap_or_default();
    let ads_store: Arc<dyn TabularStore> = sheets.clone();
    let ads = AdSheetSource::new(ads_store, config.ads_tab.as_str(), id_columns);
    let sink = HttpLeadSink::new(client, &config.crm);

    run_pipeline(
        run_id,
        RunSettings::from(&config),
        &RunPorts {
            sources: vec![&inbox as &dyn SourceAdapter, &ads],
            ledger: sheets.as_ref(),
            sink: &sink,
        },
    )
}

async fn handle_request(event: LambdaEvent<Value>) -> Result<ApiGatewayResponse, Error> {
    let run_id = event.context.request_id.clone();
    let outcome = tokio::task::spawn_blocking(move || execute_run(&run_id)).await?;
    if let Err(error) = &outcome {
        tracing::error!(event = "run_aborted", error = %error, "pipeline run did not complete");
    }
    Ok(trigger_response(outcome))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let log_format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or_default();
    init_logging(log_format);
    lambda_runtime::run(service_fn(handle_request)).await
}
