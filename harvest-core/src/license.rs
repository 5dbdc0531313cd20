use std::fmt;

use serde::{Deserialize, Serialize};

use crate::portal::RowSnapshot;

/// One tenant account on the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    /// External license number; names the output directory.
    pub number: String,
    pub name: String,
    /// Internal facility id used by the report endpoints.
    pub id: String,
}

impl License {
    pub fn new(number: impl Into<String>, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: name.into(),
            id: id.into(),
        }
    }

    /// Parses one entry of the facilities menu: the first text line is the
    /// display name, the second the license number, and the trailing digits
    /// of the entry link are the internal id. Entries whose number cannot
    /// name a directory are rejected.
    pub fn from_menu_entry(row: &RowSnapshot) -> Option<Self> {
        let mut lines = row
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());
        let name = lines.next()?.to_string();
        let number = lines.next().filter(|n| is_path_segment(n))?.to_string();
        let id = row
            .link
            .as_deref()
            .map(trailing_digits)
            .unwrap_or_default()
            .to_string();
        Some(Self { number, name, id })
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.number)
    }
}

/// True when `value` can be joined onto a directory as a single component.
pub(crate) fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
        && !value.chars().any(char::is_control)
}

fn trailing_digits(value: &str) -> &str {
    let start = value
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    &value[start..]
}
