//! Core domain model for the pageview harvester.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pvh-core";

/// Identifier of the input unit a batch of articles came from.
///
/// Derived from the batch file name; also the key written to the
/// completion log once the batch is fully processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome classification of one article fetch.
///
/// `Pending` is the only non-terminal state; a record leaves it exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    Success,
    /// Non-2xx HTTP response; carries the status code and a truncated body.
    Failed { code: u16, detail: String },
    /// Transport or decode failure that never produced a usable response.
    Error { kind: String, detail: String },
}

impl FetchStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, FetchStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// The status cell written to the audit file.
    pub fn audit_label(&self) -> String {
        match self {
            FetchStatus::Pending => "Pending".to_string(),
            FetchStatus::Success => "Success".to_string(),
            FetchStatus::Failed { .. } => "Failed".to_string(),
            FetchStatus::Error { kind, detail } => format!("Error: {kind}: {detail}"),
        }
    }
}

/// One article to fetch, carrying its terminal outcome once known.
///
/// Constructed only as pending; `complete` performs the single allowed
/// transition to a terminal status and refuses everything after that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    title: String,
    source_batch: BatchId,
    pageviews: Option<u64>,
    status: FetchStatus,
}

impl ArticleRecord {
    pub fn pending(title: impl Into<String>, source_batch: BatchId) -> Self {
        Self {
            title: title.into(),
            source_batch,
            pageviews: None,
            status: FetchStatus::Pending,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn source_batch(&self) -> &BatchId {
        &self.source_batch
    }

    pub fn pageviews(&self) -> Option<u64> {
        self.pageviews
    }

    pub fn status(&self) -> &FetchStatus {
        &self.status
    }

    /// Record the terminal outcome. Returns `false` (leaving the record
    /// untouched) if the record is already terminal or `status` is not a
    /// terminal value.
    pub fn complete(&mut self, pageviews: Option<u64>, status: FetchStatus) -> bool {
        if !self.status.is_pending() || !status.is_terminal() {
            return false;
        }
        self.pageviews = pageviews;
        self.status = status;
        true
    }
}

/// An ordered group of article records sourced from one input file.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub records: Vec<ArticleRecord>,
}
