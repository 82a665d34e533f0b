//! Cluster maintenance commands

use anyhow::Result;
use burner_lib::cleanup::destroy as destroy_run;
use burner_lib::cluster::ClusterHealth;
use burner_lib::models::RunId;
use burner_lib::Outcome;
use colored::Colorize;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use crate::config::ConnectArgs;
use crate::output::{print_cleanup, print_info};

/// Row for the node readiness table
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    name: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Delete everything labelled with `uuid`
pub async fn destroy(connect: &ConnectArgs, uuid: &str, timeout: Duration) -> Result<Outcome> {
    let run_id = RunId::from(uuid);
    print_info(&format!("Destroying resources of run {run_id}"));
    let cluster = connect.connect(false).await?;
    let report = destroy_run(cluster, &run_id, timeout).await?;
    print_cleanup(&report);
    Ok(report.outcome())
}

pub async fn health_check(connect: &ConnectArgs) -> Result<Outcome> {
    let cluster = connect.connect(false).await?;
    let health = ClusterHealth::check(cluster.as_ref()).await?;

    let rows: Vec<NodeRow> = health
        .nodes
        .iter()
        .map(|node| NodeRow {
            name: node.name.clone(),
            ready: if node.ready {
                "True".green().to_string()
            } else {
                "False".red().to_string()
            },
            message: node.message.clone().unwrap_or_default(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    Ok(if health.is_healthy() {
        Outcome::Success
    } else {
        Outcome::Fatal
    })
}
