use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Central bank that delivered a speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Institution {
    #[serde(rename = "Fed")]
    Fed,
    #[serde(rename = "ECB")]
    Ecb,
}

impl Institution {
    pub const ALL: [Institution; 2] = [Institution::Fed, Institution::Ecb];

    /// Canonical display name (`Fed`, `ECB`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Institution::Fed => "Fed",
            Institution::Ecb => "ECB",
        }
    }

    /// Lowercase form used in file names.
    pub fn slug(&self) -> &'static str {
        match self {
            Institution::Fed => "fed",
            Institution::Ecb => "ecb",
        }
    }
}

impl fmt::Display for Institution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Institution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fed" => Ok(Institution::Fed),
            "ecb" => Ok(Institution::Ecb),
            other => Err(format!("unknown institution '{other}' (expected Fed or ECB)")),
        }
    }
}

/// One speech from the corpus. Immutable once loaded.
///
/// `id` must be stable across runs: it is the correlation key between a
/// batch request line and its response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub id: String,
    pub date: NaiveDate,
    pub institution: Institution,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}
