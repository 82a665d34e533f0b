//! `burner init`: run a benchmark spec end to end

use anyhow::{Context, Result};
use burner_lib::config::{BenchmarkSpec, EngineSettings};
use burner_lib::engine::Benchmark;
use burner_lib::models::RunId;
use burner_lib::{BurnerMetrics, Outcome, Shutdown};
use tracing::warn;

use crate::config::{endpoint_with_profiles, load_endpoints, load_user_metadata, ConnectArgs};
use crate::output::{print_info, print_run, print_warning};
use crate::InitArgs;

/// Apply the endpoint overrides given on the command line
fn apply_endpoint_flags(spec: &mut BenchmarkSpec, args: &InitArgs) -> Result<()> {
    if let Some(path) = &args.metrics_endpoint {
        spec.metrics_endpoints = load_endpoints(path)?;
    }
    if !args.metrics_profile.is_empty() || !args.alert_profile.is_empty() {
        let first = spec.metrics_endpoints.first();
        let url = args
            .prometheus_url
            .clone()
            .or_else(|| first.map(|e| e.endpoint.clone()))
            .context("--metrics-profile and --alert-profile need --prometheus-url or a metrics endpoint in the benchmark spec")?;
        let token = args.token.clone().or_else(|| first.and_then(|e| e.token.clone()));
        let step = first.map(|e| e.step).unwrap_or(std::time::Duration::from_secs(30));
        spec.metrics_endpoints = vec![endpoint_with_profiles(
            &url,
            token,
            step,
            args.skip_tls_verify,
            &args.metrics_profile,
            &args.alert_profile,
        )?];
    }
    if !args.skip_tls_verify {
        for endpoint in &mut spec.metrics_endpoints {
            endpoint.skip_tls_verify = false;
        }
    }
    Ok(())
}

pub async fn run(connect: &ConnectArgs, args: InitArgs) -> Result<Outcome> {
    let settings = EngineSettings::load()?;
    let mut spec = BenchmarkSpec::load(&args.config)
        .with_context(|| format!("Failed to load spec {}", args.config.display()))?;
    apply_endpoint_flags(&mut spec, &args)?;

    let run_id = RunId::from_option(args.uuid.clone());
    print_info(&format!("Starting run {run_id}"));
    let cluster = connect.connect(args.dry_run).await?;

    let mut benchmark = Benchmark::from_spec(spec, cluster, run_id, settings)?;
    if let Some(timeout) = args.timeout {
        benchmark = benchmark.with_timeout(timeout);
    }
    if let Some(path) = &args.user_metadata {
        benchmark = benchmark.with_user_metadata(load_user_metadata(path)?);
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight requests");
            signal.trigger();
        }
    });

    let report = benchmark.run(&shutdown).await;
    print_run(&report);

    let mut outcome = report.outcome();
    if let Some(path) = &args.metrics_dump {
        if let Err(e) = std::fs::write(path, BurnerMetrics::new().render()) {
            print_warning(&format!("Failed to write metrics dump {}: {e}", path.display()));
            outcome = outcome.merge(Outcome::Degraded);
        }
    }
    Ok(outcome)
}
