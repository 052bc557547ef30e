use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned identifier of one batch submission.
///
/// A chunk may own several over its life (one per resubmission); only the
/// latest is live, the rest are kept in the chunk's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub String);

impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_bare_string() {
        let id = SubmissionId::new("batch_abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"batch_abc123\"");
        let back: SubmissionId = serde_json::from_str("\"batch_abc123\"").unwrap();
        assert_eq!(back, id);
    }
}
