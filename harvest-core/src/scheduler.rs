use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::job::{Job, JobSummary};

/// Requested limits below this are raised to it.
pub const MIN_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded { summary: JobSummary },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub license: String,
    /// Index of the job in submission order.
    pub position: usize,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded { .. })
    }
}

/// Outcomes in completion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub concurrency: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.total() - self.succeeded_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Admits jobs in submission order, keeping at most `limit` in flight.
#[derive(Debug, Clone, Copy)]
pub struct JobScheduler {
    limit: usize,
}

impl JobScheduler {
    pub fn new(limit: usize) -> Self {
        if limit < MIN_CONCURRENCY {
            warn!(requested = limit, using = MIN_CONCURRENCY, "concurrency raised to minimum");
        }
        Self {
            limit: limit.max(MIN_CONCURRENCY),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drives every job to completion. A failed job is recorded and never
    /// cancels its siblings; the next job is admitted as soon as any
    /// in-flight job settles.
    pub async fn run<F, Fut, E>(&self, jobs: Vec<Job>, runner: F) -> RunReport
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = Result<JobSummary, E>>,
        E: Display,
    {
        let total = jobs.len();
        info!(jobs = total, concurrency = self.limit, "Starting harvest run");
        let runner = &runner;
        let outcomes: Vec<JobOutcome> = stream::iter(jobs.into_iter().enumerate())
            .map(move |(position, job)| async move {
                let license = job.license.number.clone();
                let started_at = Utc::now();
                info!(license = %license, position, "Admitting job");
                let status = match runner(job).await {
                    Ok(summary) => JobStatus::Succeeded { summary },
                    Err(err) => JobStatus::Failed {
                        error: err.to_string(),
                    },
                };
                JobOutcome {
                    license,
                    position,
                    status,
                    started_at,
                    finished_at: Utc::now(),
                }
            })
            .buffer_unordered(self.limit)
            .collect()
            .await;

        let report = RunReport {
            concurrency: self.limit,
            outcomes,
        };
        info!(
            jobs = total,
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            "Harvest run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::license::License;

    fn job(number: &str) -> Job {
        Job::new(License::new(number, number, "0"), Vec::new(), Vec::new())
    }

    fn duration_for(number: &str) -> Duration {
        match number {
            "A" => Duration::from_millis(300),
            "B" => Duration::from_millis(100),
            "C" => Duration::from_millis(50),
            _ => Duration::from_millis(80),
        }
    }

    #[test]
    fn limit_never_drops_below_two() {
        assert_eq!(JobScheduler::new(0).limit(), 2);
        assert_eq!(JobScheduler::new(1).limit(), 2);
        assert_eq!(JobScheduler::new(5).limit(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn next_job_starts_when_first_slot_frees() {
        let origin = Instant::now();
        let events: RefCell<Vec<(String, &'static str, Duration)>> = RefCell::new(Vec::new());
        let scheduler = JobScheduler::new(2);

        let report = scheduler
            .run(vec![job("A"), job("B"), job("C")], |job| {
                let events = &events;
                async move {
                    let number = job.license.number.clone();
                    events
                        .borrow_mut()
                        .push((number.clone(), "start", origin.elapsed()));
                    sleep(duration_for(&number)).await;
                    events
                        .borrow_mut()
                        .push((number.clone(), "end", origin.elapsed()));
                    Ok::<_, String>(JobSummary::default())
                }
            })
            .await;

        let events = events.into_inner();
        let starts: Vec<_> = events
            .iter()
            .filter(|(_, kind, _)| *kind == "start")
            .map(|(n, _, at)| (n.as_str(), *at))
            .collect();
        assert_eq!(
            starts,
            vec![
                ("A", Duration::ZERO),
                ("B", Duration::ZERO),
                ("C", Duration::from_millis(100)),
            ]
        );
        let finish_order: Vec<_> = report.outcomes.iter().map(|o| o.license.as_str()).collect();
        assert_eq!(finish_order, vec!["B", "C", "A"]);
        assert!(report.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_jobs_never_exceed_limit() {
        let active = Cell::new(0usize);
        let peak = Cell::new(0usize);
        let jobs: Vec<Job> = ["A", "B", "C", "D", "E", "F", "G"].iter().map(|n| job(n)).collect();
        let scheduler = JobScheduler::new(3);

        let report = scheduler
            .run(jobs, |job| {
                let (active, peak) = (&active, &peak);
                async move {
                    active.set(active.get() + 1);
                    peak.set(peak.get().max(active.get()));
                    sleep(duration_for(&job.license.number)).await;
                    active.set(active.get() - 1);
                    Ok::<_, String>(JobSummary::default())
                }
            })
            .await;

        assert_eq!(report.total(), 7);
        assert_eq!(peak.get(), 3);
        assert_eq!(active.get(), 0);
        let mut positions: Vec<_> = report.outcomes.iter().map(|o| o.position).collect();
        positions.sort_unstable();
        assert_eq!(positions, (0..7).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_cancel_siblings() {
        let scheduler = JobScheduler::new(2);
        let report = scheduler
            .run(vec![job("A"), job("B"), job("C")], |job| async move {
                sleep(duration_for(&job.license.number)).await;
                if job.license.number == "B" {
                    Err("listing grid missing".to_string())
                } else {
                    Ok(JobSummary::default())
                }
            })
            .await;

        assert_eq!(report.total(), 3);
        assert_eq!(report.failed_count(), 1);
        let failed = report
            .outcomes
            .iter()
            .find(|o| !o.succeeded())
            .unwrap();
        assert_eq!(failed.license, "B");
        assert_eq!(
            failed.status,
            JobStatus::Failed {
                error: "listing grid missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn empty_job_list_produces_empty_report() {
        let report = JobScheduler::new(2)
            .run(Vec::new(), |_job| async { Ok::<_, String>(JobSummary::default()) })
            .await;
        assert_eq!(report.total(), 0);
        assert!(report.all_succeeded());
    }
}
