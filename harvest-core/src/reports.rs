use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use futures::StreamExt;
use reqwest::header::COOKIE;
use reqwest::{Client, Response};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

use crate::config::HarvestConfig;
use crate::error::ConfigError;
use crate::license::License;
use crate::portal::{cookie_header, PortalError, PortalSession};

/// Start of the export range; the portal holds nothing older.
const EPOCH: &str = "01/01/2011";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error("report request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid report url: {0}")]
    Url(String),
}

pub type ReportResult<T> = Result<T, ReportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReportKind {
    Transfers,
    LabResults,
    PackagesAdjustments,
    SalesTransactions,
    PackagesSales,
    Harvests,
    PlantsTrend,
}

impl ReportKind {
    pub const ALL: [ReportKind; 7] = [
        ReportKind::Transfers,
        ReportKind::LabResults,
        ReportKind::PackagesAdjustments,
        ReportKind::SalesTransactions,
        ReportKind::PackagesSales,
        ReportKind::Harvests,
        ReportKind::PlantsTrend,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReportKind::Transfers => "Transfers",
            ReportKind::LabResults => "LabResults",
            ReportKind::PackagesAdjustments => "PackagesAdjustments",
            ReportKind::SalesTransactions => "SalesTransactions",
            ReportKind::PackagesSales => "PackagesSales",
            ReportKind::Harvests => "Harvests",
            ReportKind::PlantsTrend => "PlantsTrend",
        }
    }

    /// Identifier used in output file names, e.g. `Transfers_report`.
    pub fn identifier(&self) -> String {
        format!("{}_report", self.name())
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportKind::Transfers => "Transfers Report",
            ReportKind::LabResults => "Lab Results Report",
            ReportKind::PackagesAdjustments => "Packages Adjustments Report",
            ReportKind::SalesTransactions => "Sales Transactions Report",
            ReportKind::PackagesSales => "Packages Sales Report",
            ReportKind::Harvests => "Harvests Report",
            ReportKind::PlantsTrend => "Plants Trend Report",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            ReportKind::Transfers => "reports/transfers",
            ReportKind::LabResults => "reports/labresults",
            ReportKind::PackagesAdjustments => "reports/packagesadjustments",
            ReportKind::SalesTransactions => "reports/salestransactions",
            ReportKind::PackagesSales => "reports/packagessales",
            ReportKind::Harvests => "reports/harvests",
            ReportKind::PlantsTrend => "reports/plantstrend",
        }
    }

    fn id_param(&self) -> &'static str {
        match self {
            ReportKind::PackagesAdjustments => "facilityId",
            _ => "id",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let base = trimmed
            .strip_suffix("_report")
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        ReportKind::ALL
            .into_iter()
            .find(|kind| kind.name().to_ascii_lowercase() == base)
            .ok_or_else(|| format!("unknown report: {trimmed}"))
    }
}

/// Downloads CSV exports straight over HTTP using the session's cookies.
#[derive(Debug, Clone)]
pub struct ReportFetcher {
    client: Client,
    portal_root: String,
}

impl ReportFetcher {
    pub fn new(portal_root: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            portal_root: portal_root.into(),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.portal_root()?))
    }

    /// Export URL covering the fixed epoch through `today`.
    pub fn report_url(
        &self,
        kind: ReportKind,
        license: &License,
        today: NaiveDate,
    ) -> ReportResult<Url> {
        let base = format!("{}/{}", self.portal_root.trim_end_matches('/'), kind.endpoint());
        let mut url = Url::parse(&base).map_err(|err| ReportError::Url(format!("{base}: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(kind.id_param(), &license.id)
                .append_pair("start", EPOCH)
                .append_pair("end", &format_date(today));
            if kind == ReportKind::SalesTransactions {
                query.append_pair("includeHistory", "true");
            }
            query.append_pair("format", "csv");
        }
        Ok(url)
    }

    pub fn output_path(&self, download_dir: &Path, kind: ReportKind, license: &License) -> PathBuf {
        download_dir.join(format!("{}_{}.csv", kind.identifier(), license.number))
    }

    /// Fetches every requested report in order, one at a time.
    pub async fn fetch_all(
        &self,
        session: &mut dyn PortalSession,
        license: &License,
        download_dir: &Path,
        kinds: &[ReportKind],
    ) -> ReportResult<Vec<PathBuf>> {
        let today = chrono::Local::now().date_naive();
        let mut written = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let url = self.report_url(kind, license, today)?;
            let path = self.output_path(download_dir, kind, license);
            info!(license = %license.number, report = %kind, url = %url, "Downloading report");
            let cookies = session.cookies().await?;
            self.fetch_to_file(url, &cookie_header(&cookies), &path).await?;
            written.push(path);
        }
        Ok(written)
    }

    /// Streams the body into a `.part` sibling and renames it into place
    /// once complete, so `path` only ever holds a whole report.
    async fn fetch_to_file(&self, url: Url, cookies: &str, path: &Path) -> ReportResult<()> {
        let response = self
            .client
            .get(url)
            .header(COOKIE, cookies)
            .send()
            .await?
            .error_for_status()?;
        let partial = partial_path(path);
        if let Err(err) = stream_to_file(response, &partial).await {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "failed to remove partial report");
                }
            }
            return Err(err);
        }
        fs::rename(&partial, path)
            .await
            .map_err(|source| ReportError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn stream_to_file(response: Response, path: &Path) -> ReportResult<()> {
    let io_error = |source: std::io::Error| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut stream = response.bytes_stream();
    let mut file = fs::File::create(path).await.map_err(io_error)?;
    while let Some(chunk) = stream.next().await {
        let data = chunk?;
        file.write_all(&data).await.map_err(io_error)?;
    }
    file.flush().await.map_err(io_error)?;
    Ok(())
}

fn format_date(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}
