use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::license::License;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("configured licenses not available to this account: {}", .0.join(", "))]
    Unmatched(Vec<String>),
}

pub type SelectionResult<T> = Result<T, SelectionError>;

/// Which of the account's licenses a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseSelection {
    All,
    Only(Vec<String>),
}

impl FromStr for LicenseSelection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Ok(LicenseSelection::All);
        }
        let numbers: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|number| !number.is_empty())
            .map(str::to_string)
            .collect();
        if numbers.is_empty() {
            Err("expected \"all\" or a comma separated list of license numbers".to_string())
        } else {
            Ok(LicenseSelection::Only(numbers))
        }
    }
}

/// What to do with configured license numbers the account does not have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    Ignore,
    #[default]
    Warn,
    Fail,
}

impl fmt::Display for UnmatchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnmatchedPolicy::Ignore => "ignore",
            UnmatchedPolicy::Warn => "warn",
            UnmatchedPolicy::Fail => "fail",
        };
        f.write_str(label)
    }
}

/// Filters `available` down to the selection, keeping the account's order.
///
/// An empty result is not an error unless the policy is [`UnmatchedPolicy::Fail`]
/// and some configured number went unmatched.
pub fn select_licenses(
    available: &[License],
    selection: &LicenseSelection,
    policy: UnmatchedPolicy,
) -> SelectionResult<Vec<License>> {
    let wanted = match selection {
        LicenseSelection::All => {
            info!(count = available.len(), "Using all available licenses");
            return Ok(available.to_vec());
        }
        LicenseSelection::Only(numbers) => numbers,
    };

    let selected: Vec<License> = available
        .iter()
        .filter(|license| wanted.contains(&license.number))
        .cloned()
        .collect();

    let unmatched: Vec<String> = wanted
        .iter()
        .filter(|number| !available.iter().any(|license| &license.number == *number))
        .cloned()
        .collect();

    if !unmatched.is_empty() {
        match policy {
            UnmatchedPolicy::Ignore => {}
            UnmatchedPolicy::Warn => {
                for number in &unmatched {
                    warn!(license = %number, "configured license is not available to this account");
                }
            }
            UnmatchedPolicy::Fail => return Err(SelectionError::Unmatched(unmatched)),
        }
    }

    if selected.is_empty() {
        warn!("none of the configured licenses match the available licenses");
    }
    Ok(selected)
}
