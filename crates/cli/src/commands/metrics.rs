//! Time-series commands: index, check-alerts and import

use anyhow::{Context, Result};
use burner_lib::alerting::{AlertEvaluator, AlertSummary};
use burner_lib::config::EngineSettings;
use burner_lib::indexer::{import_archive, IndexSummary, IndexWriter};
use burner_lib::models::{Record, RunId};
use burner_lib::scraper::Scraper;
use burner_lib::{Outcome, Shutdown};
use std::slice;

use crate::config::load_alert_profiles;
use crate::output::{print_error, print_info, print_verdicts, print_warning};
use crate::{CheckAlertsArgs, ImportArgs, IndexArgs};

/// Signal fired by Ctrl-C
fn interrupt() -> Shutdown {
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            print_warning("Interrupted, abandoning queries");
            signal.trigger();
        }
    });
    shutdown
}

/// Report an index summary and bundle the output
async fn finish_indexing(writer: &IndexWriter, summary: &IndexSummary) -> Outcome {
    print_info(&format!(
        "{} records written to {}, {} failed",
        summary.written,
        writer.indexer_name(),
        summary.failed
    ));
    let mut outcome = Outcome::Success;
    for error in &summary.errors {
        print_warning(error);
    }
    if !summary.is_complete() {
        outcome = outcome.merge(Outcome::Degraded);
    }
    match writer.finalize().await {
        Ok(Some(archive)) => print_info(&format!("Archive written to {}", archive.display())),
        Ok(None) => {}
        Err(e) => {
            print_warning(&format!("Failed to finalize indexer: {e}"));
            outcome = outcome.merge(Outcome::Degraded);
        }
    }
    outcome
}

/// Scrape a window with the given metric profiles and index the samples
pub async fn index(args: IndexArgs) -> Result<Outcome> {
    let settings = EngineSettings::load()?;
    let window = args.window.window()?;
    let endpoint = args
        .prometheus
        .endpoint(args.window.step, &args.metrics_profile, &[])?;
    let writer = args.indexer.target_or_local()?.writer(&settings)?;
    let run_id = RunId::from_option(args.uuid);

    let scraper = Scraper::from_endpoints(slice::from_ref(&endpoint), &settings)?;
    let report = scraper.scrape(window, &args.job_name, &run_id, &interrupt()).await;
    for failure in &report.failures {
        print_warning(&format!("scraping {} failed: {}", failure.endpoint, failure.message));
    }
    if report.all_failed() {
        print_error("Every query failed, nothing to index");
        return Ok(Outcome::Fatal);
    }

    let mut outcome = if report.is_clean() {
        Outcome::Success
    } else {
        Outcome::Degraded
    };
    let records = report.samples.into_iter().map(Record::Metric).collect();
    let summary = writer.write(records).await;
    outcome = outcome.merge(finish_indexing(&writer, &summary).await);
    Ok(outcome)
}

/// Evaluate alert profiles over a window
pub async fn check_alerts(args: CheckAlertsArgs) -> Result<Outcome> {
    let settings = EngineSettings::load()?;
    let window = args.window.window()?;
    let profile = load_alert_profiles(&args.alert_profile)?;
    let endpoint = args.prometheus.endpoint(args.window.step, &[], &[])?;
    let target = args.indexer.target()?;
    let run_id = RunId::from_option(args.uuid);

    let evaluator = AlertEvaluator::for_endpoint(&endpoint, &settings, run_id)?;
    let verdicts = evaluator.evaluate(&profile, window, "check-alerts", &interrupt()).await;
    print_verdicts(&verdicts);

    let summary = AlertSummary::new(verdicts);
    let mut outcome = Outcome::Success;
    if summary.failed(args.fail_severity) {
        outcome = outcome.merge(Outcome::AlertsFailed);
    }
    if summary.errors().next().is_some() {
        outcome = outcome.merge(Outcome::Degraded);
    }

    if let Some(target) = target {
        let writer = target.writer(&settings)?;
        let records = summary.verdicts.into_iter().map(Record::Alert).collect();
        let indexed = writer.write(records).await;
        outcome = outcome.merge(finish_indexing(&writer, &indexed).await);
    }
    Ok(outcome)
}

/// Replay an archive into the selected indexer
pub async fn import(args: ImportArgs) -> Result<Outcome> {
    let settings = EngineSettings::load()?;
    let writer = args.indexer.target_or_local()?.writer(&settings)?;
    let summary = import_archive(&args.tarball, &writer)
        .await
        .with_context(|| format!("Failed to import {}", args.tarball.display()))?;
    Ok(finish_indexing(&writer, &summary).await)
}
