//! Output formatting utilities

use burner_lib::cleanup::CleanupReport;
use burner_lib::engine::RunReport;
use burner_lib::models::{AlertVerdict, JobStatus, VerdictOutcome};
use burner_lib::Outcome;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

/// Row of the job summary table
#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Created")]
    created: usize,
    #[tabled(rename = "Deleted")]
    deleted: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Not ready")]
    not_ready: usize,
    #[tabled(rename = "P99 ready")]
    p99: String,
    #[tabled(rename = "Samples")]
    samples: usize,
    #[tabled(rename = "Elapsed")]
    elapsed: String,
}

/// Row of the alert verdict table
#[derive(Tabled)]
struct VerdictRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Expression")]
    expression: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Result")]
    outcome: String,
    #[tabled(rename = "Description")]
    description: String,
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn print_outcome(outcome: Outcome) {
    let label = format!("{outcome} (exit code {})", outcome.exit_code());
    match outcome {
        Outcome::Success => println!("{} {}", "✓".green().bold(), label.green()),
        Outcome::Degraded | Outcome::AlertsFailed => println!("{} {}", "⚠".yellow().bold(), label.yellow()),
        Outcome::Timeout | Outcome::Fatal => eprintln!("{} {}", "✗".red().bold(), label.red()),
    }
}

fn color_status(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::Degraded => text.yellow().to_string(),
        JobStatus::Failed | JobStatus::TimedOut => text.red().to_string(),
    }
}

fn color_verdict(outcome: VerdictOutcome) -> String {
    match outcome {
        VerdictOutcome::Passed => "passed".green().to_string(),
        VerdictOutcome::Failed => "failed".red().to_string(),
        VerdictOutcome::Error => "error".yellow().to_string(),
    }
}

/// Format seconds as a short human-readable duration
pub fn format_secs(secs: f64) -> String {
    if secs >= 3600.0 {
        format!("{:.0}h{:.0}m", (secs / 3600.0).floor(), (secs % 3600.0) / 60.0)
    } else if secs >= 60.0 {
        format!("{:.0}m{:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{secs:.2}s")
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

pub fn print_verdicts(verdicts: &[AlertVerdict]) {
    if verdicts.is_empty() {
        println!("{}", "No alert entries evaluated".yellow());
        return;
    }
    let rows: Vec<VerdictRow> = verdicts
        .iter()
        .map(|v| VerdictRow {
            index: v.index,
            expression: v.expression.clone(),
            severity: v.severity.to_string(),
            value: format_value(v.value),
            outcome: color_verdict(v.outcome),
            description: v.error.clone().unwrap_or_else(|| v.description.clone()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_cleanup(report: &CleanupReport) {
    println!(
        "Deleted {} objects and {} namespaces in {}",
        report.deleted_objects,
        report.deleted_namespaces,
        format_secs(report.elapsed_secs)
    );
    if !report.complete {
        print_warning(&format!("{} resources remain", report.remaining.len()));
        for object in &report.remaining {
            println!("  {object}");
        }
    }
    for error in &report.errors {
        print_warning(error);
    }
}

pub fn print_run(report: &RunReport) {
    println!("{} {}", "Run".bold(), report.run_id.to_string().cyan());
    println!("{}", "=".repeat(50));

    if !report.jobs.is_empty() {
        let rows: Vec<JobRow> = report
            .jobs
            .iter()
            .map(|run| JobRow {
                job: run.report.job_name.clone(),
                status: color_status(run.report.status),
                created: run.report.created,
                deleted: run.report.deleted,
                failed: run.report.failed,
                not_ready: run.report.not_ready,
                p99: format!("{:.0}ms", run.report.readiness.p99_ms),
                samples: run.measurement_samples + run.metric_samples,
                elapsed: format_secs(run.report.elapsed_secs),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    let verdicts = report.alerts().verdicts;
    if !verdicts.is_empty() {
        println!();
        println!("{}", "Alerts".bold());
        print_verdicts(&verdicts);
    }

    for run in &report.jobs {
        for failure in &run.measurement_failures {
            print_warning(&format!(
                "{}: measurement {} failed: {}",
                run.report.job_name, failure.measurement, failure.message
            ));
        }
        for failure in &run.scrape_failures {
            print_warning(&format!(
                "{}: scraping {} failed: {}",
                run.report.job_name, failure.endpoint, failure.message
            ));
        }
        for error in &run.indexed.errors {
            print_warning(&format!("{}: indexing: {error}", run.report.job_name));
        }
    }
    if let Some(cleanup) = &report.cleanup {
        println!();
        print_cleanup(cleanup);
    }
    if let Some(archive) = &report.archive {
        print_info(&format!("Archive written to {}", archive.display()));
    }
    for warning in &report.warnings {
        print_warning(warning);
    }
    if let Some(fatal) = &report.fatal {
        print_error(fatal);
    }
    println!("Elapsed: {}", format_secs(report.elapsed_secs));
}
