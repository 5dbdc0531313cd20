use std::fmt;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::extract::Direction;
use crate::reports::ReportKind;
use crate::selection::{LicenseSelection, UnmatchedPolicy};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub portal: PortalSection,
    pub run: RunSection,
    pub browser: BrowserSection,
    pub timing: TimingSection,
    pub credentials: CredentialsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSection {
    /// Two-letter region code substituted into `base_url`.
    pub region: Option<String>,
    pub base_url: String,
    /// Fixed name the portal gives every downloaded manifest.
    pub staging_file: String,
    pub page_size: String,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            region: None,
            base_url: "https://{region}.metrc.com".to_string(),
            staging_file: "TransferManifest.pdf".to_string(),
            page_size: "500".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub licenses: String,
    pub reports: String,
    pub documents: String,
    pub unmatched_licenses: UnmatchedPolicy,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            concurrency: 2,
            output_dir: PathBuf::from("./harvest-output"),
            licenses: "all".to_string(),
            reports: "all".to_string(),
            documents: "all".to_string(),
            unmatched_licenses: UnmatchedPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub sandbox: bool,
    pub profile_root: PathBuf,
    pub profile_prefix: String,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agents: Vec<String>,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: true,
            profile_root: std::env::temp_dir(),
            profile_prefix: "harvest_profile_".to_string(),
            window_width: 1920,
            window_height: 900,
            user_agents: vec![DEFAULT_USER_AGENT.to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
    pub page_settle_ms: u64,
    pub dropdown_settle_ms: u64,
    pub idle_quiet_ms: u64,
    pub idle_timeout_ms: u64,
    /// Unset keeps the download wait unbounded.
    pub download_timeout_ms: Option<u64>,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            settle_ms: 1000,
            page_settle_ms: 1500,
            dropdown_settle_ms: 250,
            idle_quiet_ms: 500,
            idle_timeout_ms: 30_000,
            download_timeout_ms: None,
        }
    }
}

impl TimingSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn page_settle(&self) -> Duration {
        Duration::from_millis(self.page_settle_ms)
    }

    pub fn dropdown_settle(&self) -> Duration {
        Duration::from_millis(self.dropdown_settle_ms)
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("email", &self.email)
            .finish()
    }
}

impl HarvestConfig {
    /// Overlays `HARVEST_*` variables on top of the file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(region) = get("HARVEST_REGION") {
            self.portal.region = Some(region);
        }
        if let Some(username) = get("HARVEST_USERNAME") {
            self.credentials.username = Some(username);
        }
        if let Some(password) = get("HARVEST_PASSWORD") {
            self.credentials.password = Some(password);
        }
        if let Some(email) = get("HARVEST_EMAIL") {
            self.credentials.email = Some(email);
        }
        if let Some(licenses) = get("HARVEST_LICENSES") {
            self.run.licenses = licenses;
        }
        if let Some(reports) = get("HARVEST_REPORTS") {
            self.run.reports = reports;
        }
        if let Some(documents) = get("HARVEST_DOCUMENTS") {
            self.run.documents = documents;
        }
        if let Some(output_dir) = get("HARVEST_OUTPUT_DIR") {
            self.run.output_dir = PathBuf::from(output_dir);
        }
        if let Some(concurrency) = get("HARVEST_CONCURRENCY") {
            self.run.concurrency = concurrency.parse().map_err(|err: ParseIntError| {
                ConfigError::Invalid {
                    field: "HARVEST_CONCURRENCY",
                    message: err.to_string(),
                }
            })?;
        }
        Ok(())
    }

    pub fn region(&self) -> Result<String> {
        let region = self
            .portal
            .region
            .as_deref()
            .ok_or(ConfigError::Missing("portal.region"))?
            .to_ascii_lowercase();
        if region.len() != 2 || !region.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::Invalid {
                field: "portal.region",
                message: format!("expected a two letter code, got {region:?}"),
            });
        }
        Ok(region)
    }

    /// Portal root URL with the region substituted, without a trailing slash.
    pub fn portal_root(&self) -> Result<String> {
        let region = self.region()?;
        let root = self.portal.base_url.replace("{region}", &region);
        url::Url::parse(&root).map_err(|err| ConfigError::Invalid {
            field: "portal.base_url",
            message: err.to_string(),
        })?;
        Ok(root.trim_end_matches('/').to_string())
    }

    pub fn credentials(&self) -> Result<Credentials> {
        let section = &self.credentials;
        Ok(Credentials {
            username: section
                .username
                .clone()
                .ok_or(ConfigError::Missing("credentials.username"))?,
            password: section
                .password
                .clone()
                .ok_or(ConfigError::Missing("credentials.password"))?,
            email: section
                .email
                .clone()
                .ok_or(ConfigError::Missing("credentials.email"))?,
        })
    }

    pub fn license_selection(&self) -> Result<LicenseSelection> {
        self.run
            .licenses
            .parse()
            .map_err(|message| ConfigError::Invalid {
                field: "run.licenses",
                message,
            })
    }

    pub fn report_kinds(&self) -> Result<Vec<ReportKind>> {
        let raw = self.run.reports.trim();
        if raw.eq_ignore_ascii_case("all") {
            return Ok(ReportKind::ALL.to_vec());
        }
        if raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("false")
        {
            return Ok(Vec::new());
        }
        let mut kinds = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let kind: ReportKind = entry.parse().map_err(|message| ConfigError::Invalid {
                field: "run.reports",
                message,
            })?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    pub fn directions(&self) -> Result<Vec<Direction>> {
        let raw = self.run.documents.trim();
        if raw.eq_ignore_ascii_case("all") {
            return Ok(Direction::ALL.to_vec());
        }
        if raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("false")
        {
            return Ok(Vec::new());
        }
        let mut directions = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let direction: Direction = entry.parse().map_err(|message| ConfigError::Invalid {
                field: "run.documents",
                message,
            })?;
            if !directions.contains(&direction) {
                directions.push(direction);
            }
        }
        Ok(directions)
    }
}

pub fn load_harvest_config<P: AsRef<Path>>(path: P) -> Result<HarvestConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(content: &str) -> HarvestConfig {
        toml::from_str(content).expect("config should parse")
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.run.concurrency, 2);
        assert_eq!(config.portal.staging_file, "TransferManifest.pdf");
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(100));
        assert!(config.timing.download_timeout().is_none());
        assert_eq!(config.report_kinds().unwrap().len(), ReportKind::ALL.len());
        assert_eq!(config.directions().unwrap(), Direction::ALL.to_vec());
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
            [portal]
            region = "CO"

            [run]
            concurrency = 4
            reports = "Transfers, LabResults_report, Transfers"
            documents = "outgoing"
            unmatched_licenses = "fail"

            [timing]
            download_timeout_ms = 60000
            "#,
        );
        assert_eq!(config.run.concurrency, 4);
        assert_eq!(config.region().unwrap(), "co");
        assert_eq!(config.portal_root().unwrap(), "https://co.metrc.com");
        assert_eq!(
            config.report_kinds().unwrap(),
            vec![ReportKind::Transfers, ReportKind::LabResults]
        );
        assert_eq!(config.directions().unwrap(), vec![Direction::Outgoing]);
        assert_eq!(config.run.unmatched_licenses, UnmatchedPolicy::Fail);
        assert_eq!(
            config.timing.download_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn env_overlay_replaces_file_values() {
        let mut config = parse("[run]\nconcurrency = 3\n");
        let env: HashMap<&str, &str> = [
            ("HARVEST_REGION", "ks"),
            ("HARVEST_CONCURRENCY", "6"),
            ("HARVEST_DOCUMENTS", "false"),
            ("HARVEST_LICENSES", "402-X0001, 402-X0002"),
            ("HARVEST_PASSWORD", "  "),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.run.concurrency, 6);
        assert_eq!(config.region().unwrap(), "ks");
        assert!(config.directions().unwrap().is_empty());
        assert!(config.credentials.password.is_none());
        assert_eq!(
            config.license_selection().unwrap(),
            LicenseSelection::Only(vec!["402-X0001".into(), "402-X0002".into()])
        );
    }

    #[test]
    fn sample_config_parses() {
        let config = load_harvest_config("../configs/harvest.toml").unwrap();
        assert_eq!(config.portal_root().unwrap(), "https://co.metrc.com");
        assert_eq!(config.run.unmatched_licenses, UnmatchedPolicy::Warn);
        assert_eq!(config.directions().unwrap(), Direction::ALL.to_vec());
        assert_eq!(config.report_kinds().unwrap().len(), ReportKind::ALL.len());
        assert!(config.timing.download_timeout().is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = parse("[portal]\nregion = \"colorado\"\n");
        assert!(matches!(
            config.region(),
            Err(ConfigError::Invalid { field: "portal.region", .. })
        ));
        config.run.reports = "Transfers,Bogus".into();
        assert!(config.report_kinds().is_err());
        assert!(config
            .apply_env(|key| (key == "HARVEST_CONCURRENCY").then(|| "many".to_string()))
            .is_err());
    }

    #[test]
    fn credentials_require_all_fields_and_redact_password() {
        let mut config = HarvestConfig::default();
        config.credentials.username = Some("operator".into());
        config.credentials.password = Some("hunter2".into());
        assert!(matches!(
            config.credentials(),
            Err(ConfigError::Missing("credentials.email"))
        ));
        config.credentials.email = Some("ops@example.com".into());
        let creds = config.credentials().unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
