//! Readiness detection and polling

use crate::cluster::{ClusterClient, ObjectRef};
use crate::error::ClusterError;
use crate::shutdown::Shutdown;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling schedule for a readiness or deletion wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(initial: Duration, max: Duration, timeout: Duration) -> Self {
        Self {
            initial: initial.max(Duration::from_millis(1)),
            max: max.max(initial),
            timeout,
        }
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// Condition reached after the given time
    Reached(Duration),
    TimedOut,
    Cancelled,
    /// The object vanished while waiting for readiness
    Gone,
    Failed(ClusterError),
}

fn int_at(value: &Value, path: &[&str]) -> Option<i64> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_i64()
}

fn condition_true(status: &Value, types: &[&str]) -> Option<bool> {
    let conditions = status.get("conditions")?.as_array()?;
    let matching: Vec<&Value> = conditions
        .iter()
        .filter(|c| {
            c.get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| types.contains(&t))
        })
        .collect();
    if matching.is_empty() {
        return None;
    }
    Some(
        matching
            .iter()
            .all(|c| c.get("status").and_then(|s| s.as_str()) == Some("True")),
    )
}

/// Whether an observed object counts as ready
pub fn is_ready(object: &Value) -> bool {
    if object
        .get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .is_some()
    {
        return false;
    }
    let kind = object.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
    let Some(status) = object.get("status") else {
        return !matches!(kind, "Deployment" | "StatefulSet" | "ReplicaSet" | "Pod" | "Job" | "DaemonSet");
    };
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = int_at(object, &["spec", "replicas"]).unwrap_or(1);
            int_at(status, &["readyReplicas"]).unwrap_or(0) >= desired
        }
        "DaemonSet" => {
            let desired = int_at(status, &["desiredNumberScheduled"]).unwrap_or(0);
            int_at(status, &["numberReady"]).unwrap_or(0) >= desired
        }
        "Pod" => match status.get("phase").and_then(|p| p.as_str()) {
            Some("Succeeded") => true,
            Some("Running") => condition_true(status, &["Ready"]).unwrap_or(false),
            _ => false,
        },
        "Job" => {
            let completions = int_at(object, &["spec", "completions"]).unwrap_or(1);
            int_at(status, &["succeeded"]).unwrap_or(0) >= completions
        }
        _ => condition_true(status, &["Ready", "Available"]).unwrap_or(true),
    }
}

async fn poll<F>(
    cluster: &dyn ClusterClient,
    object: &ObjectRef,
    policy: PollPolicy,
    shutdown: &Shutdown,
    mut done: F,
) -> WaitOutcome
where
    F: FnMut(Option<&Value>) -> Option<WaitOutcome>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut interval = policy.initial;
    loop {
        match cluster.get(object).await {
            Ok(observed) => {
                if let Some(outcome) = done(observed.as_ref()) {
                    return match outcome {
                        WaitOutcome::Reached(_) => WaitOutcome::Reached(started.elapsed()),
                        other => other,
                    };
                }
            }
            Err(ClusterError::Unreachable(msg)) => {
                debug!(object = %object, error = %msg, "Poll failed, retrying");
            }
            Err(e) => return WaitOutcome::Failed(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let sleep_for = interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.triggered() => return WaitOutcome::Cancelled,
        }
        interval = std::cmp::min(interval * 2, policy.max);
    }
}

/// Poll `object` until it is ready
pub async fn wait_ready(
    cluster: &dyn ClusterClient,
    object: &ObjectRef,
    policy: PollPolicy,
    shutdown: &Shutdown,
) -> WaitOutcome {
    poll(cluster, object, policy, shutdown, |observed| match observed {
        None => Some(WaitOutcome::Gone),
        Some(obj) if is_ready(obj) => Some(WaitOutcome::Reached(Duration::ZERO)),
        Some(_) => None,
    })
    .await
}

/// Poll `object` until it no longer exists
pub async fn wait_deleted(
    cluster: &dyn ClusterClient,
    object: &ObjectRef,
    policy: PollPolicy,
    shutdown: &Shutdown,
) -> WaitOutcome {
    poll(cluster, object, policy, shutdown, |observed| match observed {
        None => Some(WaitOutcome::Reached(Duration::ZERO)),
        Some(_) => None,
    })
    .await
}
