//! Core domain model for promowatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "promowatch-core";

/// One listing entry pointing at an announcement page, before its detail is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateReference {
    pub identifier: i64,
    pub link: String,
}

impl CandidateReference {
    pub fn new(identifier: i64, link: impl Into<String>) -> Self {
        Self {
            identifier,
            link: link.into(),
        }
    }
}

/// When a promotion runs. Falls back to the raw text when no calendar date can be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectivePeriod {
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Raw(String),
}

impl EffectivePeriod {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Range { start, .. } => Some(*start),
            Self::Raw(_) => None,
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Range { end, .. } => Some(*end),
            Self::Raw(_) => None,
        }
    }
}

impl Default for EffectivePeriod {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

/// Structured content of one announcement page. Any field may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub title: String,
    /// Date paragraph exactly as printed on the page.
    pub date_text: String,
    pub period: EffectivePeriod,
    pub body: String,
    pub note: String,
}

/// An announcement bound to its listing identifier and provenance, ready to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedAnnouncement {
    pub identifier: i64,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub record: AnnouncementRecord,
}

/// Brand row served by the read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub brand_id: i64,
    pub brand_name: Option<String>,
}

/// Promotion that has not ended yet, joined with its brand and source announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotion {
    pub id: i64,
    pub brand: Option<String>,
    #[serde(rename = "type")]
    pub promotion_type: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub title: Option<String>,
}
