// Result Aggregator
// Collects job outcomes as they arrive until every instance reports or the deadline passes

use crate::execution::matrix::JobInstance;
use crate::execution::outcome::{JobOutcome, JobStatus, RunFailure, RunOutcome, RunStatus};
use crate::spec::trigger::TriggerEvent;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use std::time::Duration;

/// Receiving side of the job outcome channel
pub type OutcomeReceiver = mpsc::UnboundedReceiver<JobOutcome>;

/// Sending side of the job outcome channel
pub type OutcomeSender = mpsc::UnboundedSender<JobOutcome>;

pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
    mpsc::unbounded_channel()
}

/// Builds the [`RunOutcome`] for one run
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    run_id: Uuid,
    run_name: String,
    trigger: TriggerEvent,
    instances: Vec<JobInstance>,
    started_at: DateTime<Utc>,
}

impl ResultAggregator {
    pub fn new(
        run_id: Uuid,
        run_name: impl Into<String>,
        trigger: TriggerEvent,
        instances: Vec<JobInstance>,
    ) -> Self {
        Self {
            run_id,
            run_name: run_name.into(),
            trigger,
            instances,
            started_at: Utc::now(),
        }
    }

    /// Wait for outcomes in arrival order. Stops when every instance has
    /// reported, every sender is gone, or `timeout` elapses. Instances that
    /// never reported are recorded as Incomplete.
    pub async fn collect(self, mut rx: OutcomeReceiver, timeout: Option<Duration>) -> RunOutcome {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slots: Vec<Option<JobOutcome>> = vec![None; self.instances.len()];
        let mut remaining = self.instances.len();
        let mut timed_out = false;

        while remaining > 0 {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => rx.recv().await,
            };

            let Some(outcome) = received else {
                tracing::warn!(run_id = %self.run_id, remaining, "outcome channel closed early");
                break;
            };

            match slots.get_mut(outcome.instance.index) {
                Some(slot) if slot.is_none() => {
                    tracing::debug!(
                        run_id = %self.run_id,
                        job = %outcome.instance.name,
                        status = ?outcome.status,
                        "job reported"
                    );
                    *slot = Some(outcome);
                    remaining -= 1;
                }
                Some(_) => {
                    tracing::warn!(job = %outcome.instance.name, "duplicate outcome ignored");
                }
                None => {
                    tracing::warn!(index = outcome.instance.index, "outcome for unknown job ignored");
                }
            }
        }

        let jobs: Vec<JobOutcome> = self
            .instances
            .into_iter()
            .zip(slots)
            .map(|(instance, slot)| slot.unwrap_or_else(|| JobOutcome::incomplete(instance)))
            .collect();

        let incomplete = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Incomplete)
            .count();
        let failure = match (timed_out, timeout) {
            (true, Some(deadline)) => {
                tracing::warn!(run_id = %self.run_id, incomplete, "run deadline elapsed");
                Some(RunFailure::Timeout {
                    deadline,
                    incomplete,
                })
            }
            _ => None,
        };

        let status = if jobs.iter().all(JobOutcome::is_success) {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };

        RunOutcome {
            run_id: self.run_id,
            run_name: self.run_name,
            trigger: self.trigger,
            status,
            jobs,
            failure,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::execution::matrix::{MatrixBuilder, MatrixExpander};

    fn instances() -> Vec<JobInstance> {
        let axes = MatrixBuilder::new()
            .axis(
                "python-version",
                ["3.9.x", "3.10.x", "3.11.x", "3.12.x", "3.13.x"],
            )
            .axis("os", ["macos-latest"])
            .build();
        MatrixExpander::expand_all("integration", &axes).unwrap()
    }

    fn success(instance: &JobInstance) -> JobOutcome {
        JobOutcome::from_steps(instance.clone(), Vec::new(), false)
    }

    fn aggregator(instances: Vec<JobInstance>) -> ResultAggregator {
        ResultAggregator::new(Uuid::new_v4(), "integration", TriggerEvent::manual(), instances)
    }

    #[tokio::test]
    async fn test_all_success_in_matrix_order() {
        let instances = instances();
        let (tx, rx) = outcome_channel();
        for instance in instances.iter().rev() {
            tx.send(success(instance)).unwrap();
        }

        let outcome = aggregator(instances).collect(rx, None).await;

        assert!(outcome.is_success());
        let order: Vec<usize> = outcome.jobs.iter().map(|j| j.instance.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(outcome.failure.is_none());
    }

    #[tokio::test]
    async fn test_one_failure_fails_run() {
        let instances = instances();
        let (tx, rx) = outcome_channel();
        for instance in &instances {
            let mut job = success(instance);
            if instance.index == 2 {
                job.status = JobStatus::Failure;
            }
            tx.send(job).unwrap();
        }

        let outcome = aggregator(instances).collect(rx, None).await;
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.failed_jobs().count(), 1);
        assert_eq!(outcome.jobs.len(), 5);
    }

    #[tokio::test]
    async fn test_deadline_with_three_of_five() {
        let instances = instances();
        let (tx, rx) = outcome_channel();
        for instance in instances.iter().take(3) {
            tx.send(success(instance)).unwrap();
        }

        let outcome = aggregator(instances)
            .collect(rx, Some(Duration::from_millis(50)))
            .await;
        drop(tx);

        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.count(JobStatus::Success), 3);
        assert_eq!(outcome.count(JobStatus::Incomplete), 2);
        assert_eq!(
            outcome.failure,
            Some(RunFailure::Timeout {
                deadline: Duration::from_millis(50),
                incomplete: 2
            })
        );
        assert!(matches!(
            outcome.into_result(),
            Err(ServiceError::Timeout { incomplete: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_marks_missing_incomplete() {
        let instances = instances();
        let (tx, rx) = outcome_channel();
        tx.send(success(&instances[0])).unwrap();
        drop(tx);

        let outcome = aggregator(instances).collect(rx, None).await;
        assert_eq!(outcome.count(JobStatus::Incomplete), 4);
        assert_eq!(outcome.status, RunStatus::Failure);
        assert!(outcome.failure.is_none());
    }

    #[tokio::test]
    async fn test_duplicates_are_ignored() {
        let instances: Vec<JobInstance> = instances().into_iter().take(1).collect();
        let (tx, rx) = outcome_channel();
        tx.send(success(&instances[0])).unwrap();
        let mut late = success(&instances[0]);
        late.status = JobStatus::Failure;
        tx.send(late).unwrap();

        let outcome = aggregator(instances).collect(rx, None).await;
        assert!(outcome.is_success());
    }
}
