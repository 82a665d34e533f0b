//! Churn cycles: delete a share of the live objects, wait, recreate them

use super::job::{drain, LiveObject, Tally, WorkerContext, WorkerResult};
use super::rate_limiter::WorkerPool;
use crate::config::{ChurnPolicy, ChurnSelection};
use rand::seq::index;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

/// Indices of the objects replaced in the next cycle
pub(super) fn select_victims(live: &[LiveObject], count: usize, selection: ChurnSelection) -> Vec<usize> {
    let count = count.min(live.len());
    match selection {
        ChurnSelection::Random => {
            let mut rng = rand::thread_rng();
            index::sample(&mut rng, live.len(), count).into_vec()
        }
        ChurnSelection::Oldest => {
            let mut order: Vec<usize> = (0..live.len()).collect();
            order.sort_by_key(|&i| live[i].created_at);
            order.truncate(count);
            order
        }
    }
}

/// Remove the objects at `indices` from `live`, returning them
fn take(live: &mut Vec<LiveObject>, mut indices: Vec<usize>) -> Vec<LiveObject> {
    indices.sort_unstable_by(|a, b| b.cmp(a));
    indices.into_iter().map(|i| live.swap_remove(i)).collect()
}

/// Run churn cycles until the policy is exhausted or the job is stopped
///
/// Returns the number of completed cycles. The live set never grows past
/// its size at entry: every victim is confirmed gone before it is recreated.
pub(super) async fn run(
    ctx: &WorkerContext,
    pool: &WorkerPool,
    policy: &ChurnPolicy,
    live: &mut Vec<LiveObject>,
    tally: &mut Tally,
) -> usize {
    let per_cycle = policy.per_cycle(live.len());
    if per_cycle == 0 {
        debug!(job = %ctx.job_name, "Churn replaces no objects, skipping");
        return 0;
    }
    let started = Instant::now();
    let mut cycles = 0;
    loop {
        if ctx.stop.is_triggered() {
            break;
        }
        if policy.cycles.is_some_and(|max| cycles >= max) {
            break;
        }
        if policy.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if cycles > 0 {
            if let Some(delay) = policy.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.stop.triggered() => break,
                }
            }
        }

        let victims = take(live, select_victims(live, per_cycle, policy.selection));
        let mut tasks = JoinSet::new();
        let mut confirmed = Vec::with_capacity(victims.len());
        for victim in &victims {
            let work = ctx.clone().delete(victim.reference.clone(), true);
            if !pool.submit(&mut tasks, &ctx.stop, work).await {
                break;
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(WorkerResult::Deleted(object)) => {
                    tally.deleted += 1;
                    confirmed.push(object);
                }
                Ok(other) => {
                    tally.absorb(other);
                }
                Err(e) => tally.errors.push(format!("worker task failed: {e}")),
            }
        }

        // unconfirmed victims still exist and stay in the live set
        let mut recreate = JoinSet::new();
        let mut accepting = true;
        for victim in victims {
            if !confirmed.contains(&victim.reference) {
                live.push(victim);
                continue;
            }
            if !accepting {
                continue;
            }
            let work = ctx
                .clone()
                .create(victim.manifest, victim.reference.name, victim.wait);
            accepting = pool.submit(&mut recreate, &ctx.stop, work).await;
        }
        drain(&mut recreate, tally, live).await;

        cycles += 1;
        info!(
            job = %ctx.job_name,
            cycle = cycles,
            replaced = confirmed.len(),
            live = live.len(),
            "Churn cycle finished"
        );
    }
    cycles
}
