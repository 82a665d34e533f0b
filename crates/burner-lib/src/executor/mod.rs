//! Job execution
//!
//! A [`JobExecutor`] turns one [`crate::config::Job`] into cluster objects:
//! namespaces first, then every planned object through a bounded,
//! rate-limited worker pool, optionally waiting for readiness, then the
//! churn cycles. Object lifecycle events are published to an
//! [`ObjectObserver`] so measurements can follow along.

mod churn;
mod job;
pub mod plan;
mod rate_limiter;
pub mod readiness;
pub mod stats;

#[cfg(test)]
mod tests;

pub use job::JobExecutor;
pub use rate_limiter::{RateLimiter, WorkerPool};
pub use readiness::{is_ready, PollPolicy, WaitOutcome};

use crate::cluster::ObjectRef;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Lifecycle event of one object created by a job
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Created {
        object: ObjectRef,
        job: String,
        at: DateTime<Utc>,
    },
    Ready {
        object: ObjectRef,
        job: String,
        latency: Duration,
        at: DateTime<Utc>,
    },
    NotReady {
        object: ObjectRef,
        job: String,
        at: DateTime<Utc>,
    },
    Deleted {
        object: ObjectRef,
        job: String,
        at: DateTime<Utc>,
    },
}

impl ObjectEvent {
    pub fn object(&self) -> &ObjectRef {
        match self {
            ObjectEvent::Created { object, .. }
            | ObjectEvent::Ready { object, .. }
            | ObjectEvent::NotReady { object, .. }
            | ObjectEvent::Deleted { object, .. } => object,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ObjectEvent::Created { at, .. }
            | ObjectEvent::Ready { at, .. }
            | ObjectEvent::NotReady { at, .. }
            | ObjectEvent::Deleted { at, .. } => *at,
        }
    }
}

/// Receives object events from job workers
///
/// Called from worker tasks; implementations must not block.
pub trait ObjectObserver: Send + Sync {
    fn observe(&self, event: &ObjectEvent);
}

/// Observer that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ObjectObserver for NoopObserver {
    fn observe(&self, _event: &ObjectEvent) {}
}
