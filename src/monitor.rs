//! Stack monitor.
//!
//! Polls the stack event log until a mutating operation reaches a
//! terminal status. Events are deduplicated by id and processed oldest
//! first. Only stack-level events move the stack status; nested stacks
//! and resources can fail the operation but never complete it.
//!
//! Time is injected through [`Clock`] so the loop runs without real
//! waits under test, and a [`CancellationToken`] interrupts any wait.

use crate::backend::StackBackend;
use crate::error::DeployError;
use crate::types::{OperationKind, StackEvent, StackStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of time for the monitor.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// How a monitored operation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub status: StackStatus,
    /// Event-log polls issued.
    pub polls: u32,
}

pub struct StackMonitor<'a, S: StackBackend, C: Clock> {
    stacks: &'a S,
    clock: &'a C,
    interval: Duration,
    verbose: bool,
    cancel: CancellationToken,
}

impl<'a, S: StackBackend, C: Clock> StackMonitor<'a, S, C> {
    pub fn new(stacks: &'a S, clock: &'a C, interval: Duration) -> Self {
        Self {
            stacks,
            clock,
            interval,
            verbose: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Stream every event and keep watching a failed operation until
    /// the stack settles.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Ids of the events already in the log of `stack`. Taken before a
    /// mutating call, it separates earlier operations from the one being
    /// watched without comparing clocks. A stack that does not exist has
    /// no history.
    pub async fn history(&self, stack: &str) -> Result<HashSet<String>, DeployError> {
        match self.stacks.describe_stack_events(stack).await {
            Ok(events) => Ok(events.into_iter().map(|e| e.event_id).collect()),
            Err(e) if e.is_not_found() => Ok(HashSet::new()),
            Err(e) => Err(e),
        }
    }

    /// Poll until `kind` reaches a terminal status.
    ///
    /// Events whose ids are in `history` belong to earlier operations and
    /// are skipped. The first failure seen names the error. A removal of
    /// a stack that no longer exists counts as complete.
    pub async fn wait_for_terminal(
        &self,
        stack_name: &str,
        stack_id: &str,
        kind: OperationKind,
        history: HashSet<String>,
    ) -> Result<MonitorReport, DeployError> {
        let mut seen = history;
        let mut status: Option<StackStatus> = None;
        let mut first_failure: Option<String> = None;
        let mut polls = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(stack_name, kind));
            }

            polls += 1;
            let events = match self.stacks.describe_stack_events(stack_id).await {
                Ok(events) => events,
                Err(e) if kind == OperationKind::Removal && e.is_not_found() => {
                    info!(stack = stack_name, polls, "stack removed");
                    return Ok(MonitorReport {
                        status: StackStatus::DeleteComplete,
                        polls,
                    });
                }
                Err(e) => return Err(e),
            };

            for event in events.into_iter().rev() {
                if !seen.insert(event.event_id.clone()) {
                    continue;
                }
                self.log_event(&event);

                let stack_level = event.is_stack_event(stack_name);
                if first_failure.is_none() && is_failure(&event, stack_level, kind) {
                    first_failure = Some(failure_reason(&event));
                }
                if stack_level {
                    status = Some(event.status());
                }
            }

            if let Some(reason) = &first_failure {
                let settled = status.as_ref().is_some_and(is_settled);
                if !self.verbose || settled {
                    return Err(self.failed(stack_name, reason.clone()));
                }
            }

            match &status {
                Some(current) if *current == kind.success_status() => {
                    info!(stack = stack_name, status = %current, polls, "stack operation finished");
                    return Ok(MonitorReport {
                        status: current.clone(),
                        polls,
                    });
                }
                Some(current) if kind.is_in_progress(current) => {}
                Some(current) if self.verbose && !is_settled(current) => {}
                Some(current) => {
                    let reason = first_failure
                        .clone()
                        .unwrap_or_else(|| format!("{} - {}", stack_name, current));
                    return Err(self.failed(stack_name, reason));
                }
                None => debug!(stack = stack_name, "no stack event yet"),
            }

            self.pause(stack_name, kind).await?;
        }
    }

    async fn pause(&self, stack_name: &str, kind: OperationKind) -> Result<(), DeployError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled(stack_name, kind)),
            _ = self.clock.sleep(self.interval) => Ok(()),
        }
    }

    fn log_event(&self, event: &StackEvent) {
        let reason = event.resource_status_reason.as_deref().unwrap_or("");
        if self.verbose {
            info!(
                event_id = %event.event_id,
                resource = %event.logical_resource_id,
                resource_type = %event.resource_type,
                status = %event.resource_status,
                timestamp = %event.timestamp,
                reason,
                "stack event"
            );
        } else {
            debug!(
                resource = %event.logical_resource_id,
                status = %event.resource_status,
                reason,
                "stack event"
            );
        }
    }

    fn failed(&self, stack_name: &str, reason: String) -> DeployError {
        warn!(stack = stack_name, %reason, "stack operation failed");
        DeployError::StackOperation {
            stack: stack_name.to_string(),
            reason,
        }
    }

    fn cancelled(&self, stack_name: &str, kind: OperationKind) -> DeployError {
        DeployError::Cancelled(format!(
            "stopped monitoring {} of stack {}; the operation continues remotely",
            kind.name(),
            stack_name
        ))
    }
}

/// Stack status no longer moving.
fn is_settled(status: &StackStatus) -> bool {
    !status.as_str().ends_with("_IN_PROGRESS")
}

fn is_failure(event: &StackEvent, stack_level: bool, kind: OperationKind) -> bool {
    if event.is_failure() {
        return true;
    }
    if !stack_level {
        return false;
    }
    let status = event.status();
    status.is_rollback()
        || (kind == OperationKind::Create && status == StackStatus::DeleteInProgress)
}

fn failure_reason(event: &StackEvent) -> String {
    format!(
        "{} - {}",
        event.logical_resource_id,
        event
            .resource_status_reason
            .as_deref()
            .unwrap_or(&event.resource_status)
    )
}
