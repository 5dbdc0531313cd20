pub mod config;
pub mod error;
pub mod extract;
pub mod job;
pub mod license;
pub mod poller;
pub mod portal;
pub mod reports;
pub mod scheduler;
pub mod selection;

pub use config::{
    load_harvest_config, BrowserSection, Credentials, CredentialsSection, HarvestConfig,
    PortalSection, RunSection, TimingSection,
};
pub use error::{ConfigError, Result};
pub use extract::{
    Direction, ExtractError, ExtractResult, ExtractStats, ListingSelectors, PageCursor,
    PaginatedExtractor, DOWNLOAD_ACTION,
};
pub use job::{Job, JobError, JobResult, JobRunner, JobSummary, SessionLease};
pub use license::License;
pub use poller::{publish, CompletionPoller, PollError, PollReport, PollResult};
pub use reports::{ReportError, ReportFetcher, ReportKind, ReportResult};
pub use scheduler::{JobOutcome, JobScheduler, JobStatus, RunReport, MIN_CONCURRENCY};
pub use selection::{
    select_licenses, LicenseSelection, SelectionError, SelectionResult, UnmatchedPolicy,
};
