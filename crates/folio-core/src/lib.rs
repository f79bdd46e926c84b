//! Core domain model for the developer portfolio directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "folio-core";

/// Pointer to the stored screenshot artifact for one entry. The bytes live
/// in the artifact store; the catalog persists only this reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub file_name: String,
    pub content_type: String,
    pub byte_size: u64,
    pub sha256: String,
    pub captured_at: DateTime<Utc>,
}

/// Canonical catalog record for one developer portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEntry {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub tagline: Option<String>,
    pub active: bool,
    pub screenshot: Option<ScreenshotRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated form of one record from the external portfolio feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub name: String,
    pub url: String,
    pub tagline: Option<String>,
}

/// Field set for creating a catalog entry; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub name: String,
    pub url: String,
    pub tagline: Option<String>,
    pub active: bool,
}

impl EntryDraft {
    /// Draft for a feed item with no matching entry; new entries start active.
    pub fn from_feed_item(item: &FeedItem) -> Self {
        Self {
            name: item.name.clone(),
            url: item.url.clone(),
            tagline: item.tagline.clone(),
            active: true,
        }
    }
}

/// Partial update for an existing entry. Unset fields are left untouched;
/// `tagline` is two-level so a feed item without one clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryChanges {
    pub name: Option<String>,
    pub url: Option<String>,
    pub tagline: Option<Option<String>>,
    pub active: Option<bool>,
}

impl EntryChanges {
    /// Changes for an entry matched by URL: refresh name and tagline, keep it active.
    pub fn confirm(item: &FeedItem) -> Self {
        Self {
            name: Some(item.name.clone()),
            url: None,
            tagline: Some(item.tagline.clone()),
            active: Some(true),
        }
    }

    /// Changes for an inactive entry matched by name: the portfolio moved, so the
    /// URL is reassigned and the entry comes back active under the same identity.
    pub fn reassign_url(item: &FeedItem) -> Self {
        Self {
            name: None,
            url: Some(item.url.clone()),
            tagline: Some(item.tagline.clone()),
            active: Some(true),
        }
    }
}

/// One feed item whose upsert failed; the run continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub name: String,
    pub url: String,
    pub reason: String,
}

/// Bookkeeping for one reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_items: usize,
    pub skipped_invalid: usize,
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub failures: Vec<ItemFailure>,
}

impl ReconcileSummary {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.reactivated
    }
}

/// Terminal result of one capture attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CaptureStatus {
    /// A fresh artifact was stored and the entry's pointer now references it.
    Captured(ScreenshotRef),
    /// The entry was gone, inactive, or without a URL at capture time.
    Skipped,
    Failed { reason: String },
}

/// Outcome emitted by the capture orchestrator for one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureOutcome {
    pub entry_id: Uuid,
    pub url: String,
    pub status: CaptureStatus,
}

impl CaptureOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, CaptureStatus::Captured(_))
    }
}
