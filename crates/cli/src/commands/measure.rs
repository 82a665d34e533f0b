//! `burner measure`: measurements over objects created outside a run

use anyhow::{bail, Context, Result};
use burner_lib::cluster::{parse_label_selector, ResourceKind};
use burner_lib::config::{BenchmarkSpec, EngineSettings};
use burner_lib::engine::measure;
use burner_lib::measurements::MeasurementScope;
use burner_lib::models::RunId;
use burner_lib::Outcome;

use crate::config::ConnectArgs;
use crate::output::{print_info, print_warning};
use crate::MeasureArgs;

/// `apiVersion/kind`, where the api version may itself contain a group
fn parse_kind(value: &str) -> Result<ResourceKind> {
    match value.trim().rsplit_once('/') {
        Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() => {
            Ok(ResourceKind::new(api_version, kind))
        }
        _ => bail!("invalid kind {value:?}, expected apiVersion/kind such as v1/Pod or apps/v1/Deployment"),
    }
}

pub async fn run(connect: &ConnectArgs, args: MeasureArgs) -> Result<Outcome> {
    let settings = EngineSettings::load()?;
    let spec = BenchmarkSpec::load(&args.config)
        .with_context(|| format!("Failed to load spec {}", args.config.display()))?;
    parse_label_selector(&args.selector).context("Invalid --selector")?;
    let kinds = args
        .kinds
        .iter()
        .map(|k| parse_kind(k))
        .collect::<Result<Vec<_>>>()?;

    let run_id = RunId::from_option(args.uuid);
    let cluster = connect.connect(false).await?;
    let scope = MeasurementScope::external(args.namespaces, args.selector, kinds);
    let report = measure(&spec, cluster, run_id, &args.job_name, scope, &settings).await?;

    print_info(&format!(
        "Run {}: {} samples collected",
        report.run_id, report.samples
    ));
    for failure in &report.failures {
        print_warning(&format!("measurement {} failed: {}", failure.measurement, failure.message));
    }
    if let Some(indexed) = &report.indexed {
        print_info(&format!("{} records indexed, {} failed", indexed.written, indexed.failed));
    }
    Ok(report.outcome())
}
