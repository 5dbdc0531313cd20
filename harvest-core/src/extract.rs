use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::error::ConfigError;
use crate::license::{is_path_segment, License};
use crate::poller::{publish, CompletionPoller, PollError};
use crate::portal::{PortalError, PortalSession, RowSnapshot};

/// Action that downloads the manifest of the selected row.
pub const DOWNLOAD_ACTION: &str = "#viewmanifest-btn";

/// Column holding the manifest number.
const KEY_COLUMN: usize = 1;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("row {row} has an unusable key {key:?}")]
    InvalidKey { row: usize, key: String },
}

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Incoming, Direction::Outgoing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("unknown document direction: {other}")),
        }
    }
}

/// Selectors of the inactive-transfers grid for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSelectors {
    pub tab: String,
    pub page_size_toggle: String,
    pub page_size_select: String,
    pub page_count: String,
    pub rows: String,
    pub next_page: String,
    pub next_page_disabled: String,
}

impl ListingSelectors {
    pub fn for_direction(direction: Direction) -> Self {
        let grid = format!("div#{direction}Inactive-grid");
        let pager = format!("{grid} .k-grid-pager");
        let next = format!("{pager} a[title=\"Go to the next page\"]");
        Self {
            tab: format!("#{direction}Inactive-tab"),
            page_size_toggle: format!("{pager} .k-pager-sizes .k-dropdown"),
            page_size_select: format!("{pager} .k-pager-sizes select"),
            page_count: format!("{pager} .k-pager-input"),
            rows: format!("{grid} table tbody tr"),
            next_page_disabled: format!("{next}.k-state-disabled"),
            next_page: next,
        }
    }
}

/// Position in a paginated listing. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    index: u32,
    total_pages: Option<u32>,
}

impl PageCursor {
    pub fn new(total_pages: Option<u32>) -> Self {
        Self {
            index: 1,
            total_pages,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Page count read before the walk; informational only.
    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    fn advance(&mut self) {
        self.index += 1;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExtractStats {
    pub direction: Direction,
    pub pages: u32,
    pub rows_seen: usize,
    pub downloaded: usize,
    pub skipped: usize,
}

impl ExtractStats {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            pages: 0,
            rows_seen: 0,
            downloaded: 0,
            skipped: 0,
        }
    }
}

/// Walks the transfers grid of one direction to its last page, downloading
/// the manifest of every row that has no file yet.
///
/// Rows are handled one at a time: the portal saves every manifest under the
/// same staging name, so only one download may be in flight per session.
#[derive(Debug, Clone)]
pub struct PaginatedExtractor {
    portal_root: String,
    staging_file: String,
    page_size: String,
    poller: CompletionPoller,
    settle: Duration,
    page_settle: Duration,
    dropdown_settle: Duration,
    page_count_regex: Regex,
}

impl PaginatedExtractor {
    pub fn new(
        portal_root: impl Into<String>,
        staging_file: impl Into<String>,
        poller: CompletionPoller,
    ) -> Self {
        Self {
            portal_root: portal_root.into(),
            staging_file: staging_file.into(),
            page_size: "500".to_string(),
            poller,
            settle: Duration::ZERO,
            page_settle: Duration::ZERO,
            dropdown_settle: Duration::ZERO,
            page_count_regex: Regex::new(r"of\s+(\d+)").expect("valid regex"),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self, ConfigError> {
        let timing = &config.timing;
        Ok(Self {
            page_size: config.portal.page_size.clone(),
            settle: timing.settle(),
            page_settle: timing.page_settle(),
            dropdown_settle: timing.dropdown_settle(),
            ..Self::new(
                config.portal_root()?,
                config.portal.staging_file.clone(),
                CompletionPoller::from_config(timing),
            )
        })
    }

    pub fn staging_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(&self.staging_file)
    }

    pub fn listing_url(&self, license: &License) -> String {
        format!(
            "{}/industry/{}/transfers/licensed",
            self.portal_root, license.number
        )
    }

    pub async fn run(
        &self,
        session: &mut dyn PortalSession,
        license: &License,
        direction: Direction,
        download_dir: &Path,
    ) -> ExtractResult<ExtractStats> {
        let selectors = ListingSelectors::for_direction(direction);
        session.goto(&self.listing_url(license)).await?;
        session.wait_for_idle().await?;
        pause(self.settle).await;

        info!(license = %license.number, %direction, "Downloading manifests");
        let target_dir = download_dir.join(direction.as_str());
        fs::create_dir_all(&target_dir)
            .await
            .map_err(|source| ExtractError::Io {
                path: target_dir.clone(),
                source,
            })?;

        session.click(&selectors.tab).await?;
        pause(self.settle).await;
        session.wait_for_idle().await?;

        session.click(&selectors.page_size_toggle).await?;
        pause(self.dropdown_settle).await;
        session
            .select_option(&selectors.page_size_select, &self.page_size)
            .await?;
        pause(self.settle).await;
        session.wait_for_idle().await?;

        let total_pages = self.read_total_pages(session, &selectors).await;
        let staging = self.staging_path(download_dir);
        let mut cursor = PageCursor::new(total_pages);
        let mut stats = ExtractStats::new(direction);

        loop {
            let rows = session.query_all(&selectors.rows).await?;
            stats.pages += 1;
            info!(
                license = %license.number,
                %direction,
                page = cursor.index(),
                total_pages = ?cursor.total_pages(),
                rows = rows.len(),
                "Processing page"
            );

            for row in &rows {
                stats.rows_seen += 1;
                let key = row_key(row)?;
                let permanent = target_dir.join(format!("{key}.pdf"));
                if path_exists(&permanent).await? {
                    stats.skipped += 1;
                    continue;
                }

                discard_stale(&staging).await?;
                session.click_nth(&selectors.rows, row.index).await?;
                session.click(DOWNLOAD_ACTION).await?;
                let report = self.poller.wait_for(&staging).await?;
                publish(&staging, &permanent).await?;
                stats.downloaded += 1;
                debug!(
                    license = %license.number,
                    %direction,
                    manifest = key,
                    checks = report.checks,
                    waited_ms = report.waited.as_millis() as u64,
                    "manifest saved"
                );
            }

            session.scroll_to_bottom().await?;
            if session.exists(&selectors.next_page_disabled).await? {
                break;
            }
            session.click(&selectors.next_page).await?;
            session.wait_for_idle().await?;
            pause(self.page_settle).await;
            cursor.advance();
        }

        info!(
            license = %license.number,
            %direction,
            pages = stats.pages,
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            "Finished manifests"
        );
        Ok(stats)
    }

    async fn read_total_pages(
        &self,
        session: &mut dyn PortalSession,
        selectors: &ListingSelectors,
    ) -> Option<u32> {
        match session.read_text(&selectors.page_count).await {
            Ok(text) => {
                let total = self.parse_total_pages(&text);
                if total.is_none() {
                    warn!(text = %text, "could not read page count");
                }
                total
            }
            Err(err) => {
                warn!(error = %err, "page count unavailable");
                None
            }
        }
    }

    fn parse_total_pages(&self, text: &str) -> Option<u32> {
        self.page_count_regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        sleep(duration).await;
    }
}

fn row_key(row: &RowSnapshot) -> ExtractResult<&str> {
    let key = row.cell(KEY_COLUMN).map(str::trim).unwrap_or_default();
    if !is_path_segment(key) {
        return Err(ExtractError::InvalidKey {
            row: row.index,
            key: key.to_string(),
        });
    }
    Ok(key)
}

async fn path_exists(path: &Path) -> ExtractResult<bool> {
    fs::try_exists(path)
        .await
        .map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn discard_stale(staging: &Path) -> ExtractResult<()> {
    match fs::remove_file(staging).await {
        Ok(()) => {
            warn!(path = %staging.display(), "removed stale staged download");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExtractError::Io {
            path: staging.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: usize, key: &str) -> RowSnapshot {
        RowSnapshot {
            index,
            text: String::new(),
            cells: vec!["".into(), key.into(), "Licensed".into()],
            link: None,
        }
    }

    #[test]
    fn selectors_follow_direction() {
        let selectors = ListingSelectors::for_direction(Direction::Outgoing);
        assert_eq!(selectors.tab, "#outgoingInactive-tab");
        assert_eq!(selectors.rows, "div#outgoingInactive-grid table tbody tr");
        assert_eq!(
            selectors.next_page_disabled,
            "div#outgoingInactive-grid .k-grid-pager a[title=\"Go to the next page\"].k-state-disabled"
        );
    }

    #[test]
    fn parses_page_count_text() {
        let extractor = PaginatedExtractor::new(
            "https://co.example.com",
            "TransferManifest.pdf",
            CompletionPoller::new(Duration::from_millis(100)),
        );
        assert_eq!(extractor.parse_total_pages("Page 1 of 12"), Some(12));
        assert_eq!(extractor.parse_total_pages("of 3"), Some(3));
        assert_eq!(extractor.parse_total_pages("no pages"), None);
    }

    #[test]
    fn row_keys_must_be_plain_file_names() {
        assert_eq!(row_key(&row(0, " 0004417 ")).unwrap(), "0004417");
        for bad in ["", "  ", "..", "a/b", "a\\b"] {
            assert!(matches!(
                row_key(&row(3, bad)),
                Err(ExtractError::InvalidKey { row: 3, .. })
            ));
        }
        let short = RowSnapshot {
            index: 1,
            cells: vec!["only".into()],
            ..Default::default()
        };
        assert!(row_key(&short).is_err());
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("Incoming".parse::<Direction>().unwrap(), Direction::Incoming);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
