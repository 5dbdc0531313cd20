use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::HarvestConfig;
use crate::error::ConfigError;
use crate::extract::{Direction, ExtractError, ExtractStats, PaginatedExtractor};
use crate::license::License;
use crate::portal::{
    PortalError, PortalResult, PortalSession, ProfileManager, SessionCookie, SessionFactory,
    SessionSpec,
};
use crate::reports::{ReportError, ReportFetcher, ReportKind};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type JobResult<T> = Result<T, JobError>;

/// All the work for one license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub license: License,
    pub reports: Vec<ReportKind>,
    pub directions: Vec<Direction>,
}

impl Job {
    pub fn new(license: License, reports: Vec<ReportKind>, directions: Vec<Direction>) -> Self {
        Self {
            license,
            reports,
            directions,
        }
    }

    /// One job per license, all requesting the same reports and directions.
    pub fn for_licenses(
        licenses: Vec<License>,
        reports: &[ReportKind],
        directions: &[Direction],
    ) -> Vec<Job> {
        licenses
            .into_iter()
            .map(|license| Job::new(license, reports.to_vec(), directions.to_vec()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct JobSummary {
    pub reports: Vec<PathBuf>,
    pub documents: Vec<ExtractStats>,
}

impl JobSummary {
    pub fn documents_downloaded(&self) -> usize {
        self.documents.iter().map(|stats| stats.downloaded).sum()
    }
}

/// A session bound to one license's private profile.
///
/// `release` closes the session and purges the profile. If the lease is
/// dropped without `release` (the owning future was dropped or panicked),
/// the profile directory is still purged synchronously.
pub struct SessionLease {
    session: Box<dyn PortalSession>,
    profiles: ProfileManager,
    owner: String,
    released: bool,
}

impl SessionLease {
    pub async fn open(
        factory: &dyn SessionFactory,
        profiles: ProfileManager,
        owner: &str,
        spec: &SessionSpec,
    ) -> PortalResult<Self> {
        match factory.open(spec).await {
            Ok(session) => Ok(Self {
                session,
                profiles,
                owner: owner.to_string(),
                released: false,
            }),
            Err(err) => {
                profiles.purge_blocking(owner);
                Err(err)
            }
        }
    }

    pub fn session(&mut self) -> &mut dyn PortalSession {
        self.session.as_mut()
    }

    pub async fn release(mut self) {
        if let Err(err) = self.session.close().await {
            warn!(owner = %self.owner, error = %err, "failed to close session");
        }
        if let Err(err) = self.profiles.purge(&self.owner).await {
            warn!(owner = %self.owner, error = %err, "failed to purge browser profile");
        }
        self.released = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(owner = %self.owner, "session lease dropped without release");
            self.profiles.purge_blocking(&self.owner);
        }
    }
}

/// Runs one license end to end inside its own session.
pub struct JobRunner {
    portal_root: String,
    output_dir: PathBuf,
    profiles: ProfileManager,
    factory: Rc<dyn SessionFactory>,
    reports: ReportFetcher,
    extractor: PaginatedExtractor,
}

impl JobRunner {
    pub fn new(
        portal_root: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        profiles: ProfileManager,
        factory: Rc<dyn SessionFactory>,
        reports: ReportFetcher,
        extractor: PaginatedExtractor,
    ) -> Self {
        Self {
            portal_root: portal_root.into(),
            output_dir: output_dir.into(),
            profiles,
            factory,
            reports,
            extractor,
        }
    }

    pub fn from_config(
        config: &HarvestConfig,
        factory: Rc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.portal_root()?,
            config.run.output_dir.clone(),
            ProfileManager::from_config(config),
            factory,
            ReportFetcher::from_config(config)?,
            PaginatedExtractor::from_config(config)?,
        ))
    }

    pub fn license_dir(&self, license: &License) -> PathBuf {
        self.output_dir.join(&license.number)
    }

    /// Failures are logged with the license and returned; the session is
    /// torn down on every path.
    pub async fn run(&self, job: &Job, cookies: &[SessionCookie]) -> JobResult<JobSummary> {
        let license = &job.license;
        info!(license = %license.number, name = %license.name, "Processing license");
        let outcome = self.run_inner(job, cookies).await;
        match &outcome {
            Ok(summary) => info!(
                license = %license.number,
                reports = summary.reports.len(),
                documents = summary.documents_downloaded(),
                "Done with license"
            ),
            Err(err) => error!(license = %license.number, error = %err, "License failed"),
        }
        outcome
    }

    async fn run_inner(&self, job: &Job, cookies: &[SessionCookie]) -> JobResult<JobSummary> {
        let license = &job.license;
        let download_dir = self.license_dir(license);
        fs::create_dir_all(&download_dir)
            .await
            .map_err(|source| JobError::Io {
                path: download_dir.clone(),
                source,
            })?;

        let profile_dir = self.profiles.prepare(&license.number).await?;
        let spec = SessionSpec {
            profile_dir,
            download_dir: Some(download_dir.clone()),
        };
        let mut lease = SessionLease::open(
            self.factory.as_ref(),
            self.profiles.clone(),
            &license.number,
            &spec,
        )
        .await?;
        let outcome = self.drive(lease.session(), job, cookies, &download_dir).await;
        lease.release().await;
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn PortalSession,
        job: &Job,
        cookies: &[SessionCookie],
        download_dir: &Path,
    ) -> JobResult<JobSummary> {
        let license = &job.license;
        session.set_cookies(cookies).await?;
        session.goto(&self.portal_root).await?;

        let reports = self
            .reports
            .fetch_all(session, license, download_dir, &job.reports)
            .await?;

        let mut documents = Vec::with_capacity(job.directions.len());
        for &direction in &job.directions {
            let stats = self
                .extractor
                .run(session, license, direction, download_dir)
                .await?;
            documents.push(stats);
        }
        Ok(JobSummary { reports, documents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_job_per_license() {
        let licenses = vec![
            License::new("A-1", "Alpha", "1"),
            License::new("B-2", "Bravo", "2"),
        ];
        let jobs = Job::for_licenses(
            licenses,
            &[ReportKind::Transfers],
            &[Direction::Incoming, Direction::Outgoing],
        );
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].license.number, "B-2");
        assert_eq!(jobs[1].reports, vec![ReportKind::Transfers]);
        assert_eq!(jobs[0].directions.len(), 2);
    }
}
