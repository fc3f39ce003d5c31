//! Core domain model for the facility scoring and job enrichment pipelines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofs-core";

/// Schema version stamped into every enrichment blob. Bump when the shape of
/// `ParsedFields` or `EnrichmentRecord` changes so stale blobs can be
/// re-enriched.
pub const ENRICHMENT_VERSION: u32 = 2;

/// How an enrichment record was produced. A discriminant, not a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Primary,
    Fallback,
    Expired,
    Failed,
    NoContent,
}

/// Structured fields extracted from a job posting body.
///
/// Every field is explicitly optional: a value is present only when the
/// extractor found evidence for it, never fabricated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedFields {
    pub summary: Option<String>,
    pub education: Option<String>,
    pub experience: Option<String>,
    pub certifications: Option<String>,
    pub benefits: Option<Vec<String>>,
    pub schedule: Option<String>,
    pub sign_on_bonus: Option<i64>,
}

impl ParsedFields {
    pub fn is_empty(&self) -> bool {
        self.populated_field_count() == 0
    }

    pub fn populated_field_count(&self) -> usize {
        [
            self.summary.is_some(),
            self.education.is_some(),
            self.experience.is_some(),
            self.certifications.is_some(),
            self.benefits.as_ref().is_some_and(|b| !b.is_empty()),
            self.schedule.is_some(),
            self.sign_on_bonus.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// Versioned annotation attached to a job posting by the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub version: u32,
    pub parsed: ParsedFields,
    pub raw_text: String,
    pub extraction_method: ExtractionMethod,
    pub description_hash: String,
    pub is_expired: bool,
    pub expired_message: Option<String>,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    /// Terminal record for a posting confirmed gone at the source.
    pub fn expired(
        message: impl Into<String>,
        description_hash: String,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: ENRICHMENT_VERSION,
            parsed: ParsedFields::default(),
            raw_text: String::new(),
            extraction_method: ExtractionMethod::Expired,
            description_hash,
            is_expired: true,
            expired_message: Some(message.into()),
            error: None,
            fetched_at,
        }
    }

    /// Record for a fetch that failed with no fallback description to lean on.
    pub fn failed(
        error: impl Into<String>,
        description_hash: String,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: ENRICHMENT_VERSION,
            parsed: ParsedFields::default(),
            raw_text: String::new(),
            extraction_method: ExtractionMethod::Failed,
            description_hash,
            is_expired: false,
            expired_message: None,
            error: Some(error.into()),
            fetched_at,
        }
    }

    /// Record for a fetch that succeeded but yielded no usable text.
    pub fn no_content(description_hash: String, fetched_at: DateTime<Utc>) -> Self {
        Self {
            version: ENRICHMENT_VERSION,
            parsed: ParsedFields::default(),
            raw_text: String::new(),
            extraction_method: ExtractionMethod::NoContent,
            description_hash,
            is_expired: false,
            expired_message: None,
            error: None,
            fetched_at,
        }
    }

    /// Record carrying extractor output. `method` must be `Primary` or
    /// `Fallback`.
    pub fn extracted(
        method: ExtractionMethod,
        parsed: ParsedFields,
        raw_text: String,
        description_hash: String,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(matches!(
            method,
            ExtractionMethod::Primary | ExtractionMethod::Fallback
        ));
        Self {
            version: ENRICHMENT_VERSION,
            parsed,
            raw_text,
            extraction_method: method,
            description_hash,
            is_expired: false,
            expired_message: None,
            error: None,
            fetched_at,
        }
    }

    /// Structural invariant: expired records carry nothing; extracted records
    /// carry at least one parsed field or non-empty prose.
    pub fn is_valid(&self) -> bool {
        match self.extraction_method {
            ExtractionMethod::Expired => {
                self.is_expired && self.parsed.is_empty() && self.raw_text.is_empty()
            }
            ExtractionMethod::Primary | ExtractionMethod::Fallback => {
                !self.parsed.is_empty() || !self.raw_text.is_empty()
            }
            ExtractionMethod::Failed | ExtractionMethod::NoContent => !self.is_expired,
        }
    }
}

/// A scraped job posting. Created by an external scraper; mutated only by the
/// enrichment pipeline (enrichment blob, `is_active` on expiration) and by
/// re-scraping (display fields). Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: Uuid,
    pub facility_id: Uuid,
    pub source_url: String,
    pub external_id: Option<String>,
    pub title: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub shift_type: Option<String>,
    pub shift_hours: Option<String>,
    pub employment_type: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub enrichment: Option<EnrichmentRecord>,
}

impl JobPosting {
    pub fn pay_disclosed(&self) -> bool {
        self.pay_min.is_some() || self.pay_max.is_some()
    }

    pub fn shift_disclosed(&self) -> bool {
        self.shift_type.is_some() && self.shift_hours.is_some()
    }
}

/// The thirteen independently-sourced facility sub-indices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubIndex {
    Pay,
    Reviews,
    LocationSafety,
    PatientExperience,
    FacilityStats,
    CmsQuality,
    Amenities,
    JobTransparency,
    LeapfrogSafety,
    Commute,
    QualityOfLife,
    OpportunityInsights,
    Climate,
}

impl SubIndex {
    pub const ALL: [SubIndex; 13] = [
        SubIndex::Pay,
        SubIndex::Reviews,
        SubIndex::LocationSafety,
        SubIndex::PatientExperience,
        SubIndex::FacilityStats,
        SubIndex::CmsQuality,
        SubIndex::Amenities,
        SubIndex::JobTransparency,
        SubIndex::LeapfrogSafety,
        SubIndex::Commute,
        SubIndex::QualityOfLife,
        SubIndex::OpportunityInsights,
        SubIndex::Climate,
    ];

    /// Stable storage key, matching the serde representation.
    pub fn key(self) -> &'static str {
        match self {
            SubIndex::Pay => "pay",
            SubIndex::Reviews => "reviews",
            SubIndex::LocationSafety => "location_safety",
            SubIndex::PatientExperience => "patient_experience",
            SubIndex::FacilityStats => "facility_stats",
            SubIndex::CmsQuality => "cms_quality",
            SubIndex::Amenities => "amenities",
            SubIndex::JobTransparency => "job_transparency",
            SubIndex::LeapfrogSafety => "leapfrog_safety",
            SubIndex::Commute => "commute",
            SubIndex::QualityOfLife => "quality_of_life",
            SubIndex::OpportunityInsights => "opportunity_insights",
            SubIndex::Climate => "climate",
        }
    }

    pub fn from_key(key: &str) -> Option<SubIndex> {
        SubIndex::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// One sub-index slot inside a facility score row: the sourced value (absent
/// when the collector had nothing) and the weighted contribution actually used
/// in the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubIndexEntry {
    pub value: Option<u8>,
    pub weighted: f64,
}

/// Composite score row, one per facility. Always written wholesale so a
/// reader never observes a composite built from a mixed old/new sub-index set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityScore {
    pub facility_id: Uuid,
    pub sub_scores: BTreeMap<SubIndex, SubIndexEntry>,
    pub indices_available: u32,
    pub ofs_score: u8,
    pub ofs_grade: String,
}

/// Outcome of one enrichment batch execution. Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRun {
    pub id: Uuid,
    pub policy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: u32,
    pub enriched: u32,
    pub expired: u32,
    pub failed: u32,
    pub status: RunStatus,
}

impl EnrichmentRun {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
        }
    }
}
