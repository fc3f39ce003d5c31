//! Composite facility scoring: fixed sub-index weights, default substitution,
//! the letter-grade ladder, the derived job-transparency index, and the
//! per-facility scoring batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ofs_core::{FacilityScore, JobPosting, SubIndex, SubIndexEntry};
use ofs_storage::{FacilityStore, JobStore};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofs-scoring";

/// Neutral substitute for a sub-index with no sourced value. Fixed policy.
pub const DEFAULT_SUB_INDEX: u8 = 50;

/// Fixed relative weight per sub-index. The table expresses proportions;
/// `compute_score` normalizes contributions by the table total, so a uniform
/// input maps to itself.
pub fn weight(index: SubIndex) -> f64 {
    match index {
        SubIndex::Pay => 0.15,
        SubIndex::Reviews => 0.12,
        SubIndex::LocationSafety => 0.10,
        SubIndex::PatientExperience => 0.10,
        SubIndex::FacilityStats => 0.10,
        SubIndex::CmsQuality => 0.08,
        SubIndex::Amenities => 0.08,
        SubIndex::JobTransparency => 0.07,
        SubIndex::LeapfrogSafety => 0.06,
        SubIndex::Commute => 0.05,
        SubIndex::QualityOfLife => 0.05,
        SubIndex::OpportunityInsights => 0.04,
        SubIndex::Climate => 0.03,
    }
}

/// Letter grade for a composite score. The boundary ladder is fixed policy:
/// 97/90/86/80/75/71/65/60/55/50/45/40 mapping A+ down to F.
pub fn letter_grade(score: u8) -> &'static str {
    match score {
        97..=u8::MAX => "A+",
        90..=96 => "A",
        86..=89 => "A-",
        80..=85 => "B+",
        75..=79 => "B",
        71..=74 => "B-",
        65..=70 => "C+",
        60..=64 => "C",
        55..=59 => "C-",
        50..=54 => "D+",
        45..=49 => "D",
        40..=44 => "D-",
        _ => "F",
    }
}

fn weight_total() -> f64 {
    SubIndex::ALL.iter().map(|i| weight(*i)).sum()
}

/// Pure, idempotent composite computation. Missing sub-indices are replaced
/// with the neutral default so a facility is never left without a score.
pub fn compute_score(facility_id: Uuid, values: &BTreeMap<SubIndex, u8>) -> FacilityScore {
    let mut sub_scores = BTreeMap::new();
    let mut total = 0.0;
    let mut indices_available = 0u32;
    let normalizer = weight_total();

    for index in SubIndex::ALL {
        let value = values.get(&index).copied();
        if value.is_some() {
            indices_available += 1;
        }
        let effective = value.unwrap_or(DEFAULT_SUB_INDEX);
        let weighted = f64::from(effective) * weight(index) / normalizer;
        total += weighted;
        sub_scores.insert(index, SubIndexEntry { value, weighted });
    }

    let ofs_score = total.round().clamp(0.0, 100.0) as u8;
    FacilityScore {
        facility_id,
        sub_scores,
        indices_available,
        ofs_score,
        ofs_grade: letter_grade(ofs_score).to_string(),
    }
}

const TRANSPARENCY_PAY_WEIGHT: f64 = 0.40;
const TRANSPARENCY_BENEFITS_WEIGHT: f64 = 0.25;
const TRANSPARENCY_BONUS_WEIGHT: f64 = 0.20;
const TRANSPARENCY_SHIFT_WEIGHT: f64 = 0.15;

/// Derived job-transparency sub-index: disclosure rates over a facility's
/// active postings. A facility with no active postings has no defined score.
pub fn transparency_score(postings: &[JobPosting]) -> Option<u8> {
    let active: Vec<&JobPosting> = postings.iter().filter(|p| p.is_active).collect();
    if active.is_empty() {
        return None;
    }
    let total = active.len() as f64;

    let rate = |predicate: fn(&JobPosting) -> bool| {
        active.iter().filter(|p| predicate(p)).count() as f64 / total
    };

    let pay_rate = rate(JobPosting::pay_disclosed);
    let benefits_rate = rate(|p| {
        p.enrichment
            .as_ref()
            .and_then(|rec| rec.parsed.benefits.as_ref())
            .is_some_and(|b| !b.is_empty())
    });
    let bonus_rate = rate(|p| {
        p.enrichment
            .as_ref()
            .and_then(|rec| rec.parsed.sign_on_bonus)
            .is_some_and(|bonus| bonus > 0)
    });
    let shift_rate = rate(JobPosting::shift_disclosed);

    let score = 100.0
        * (pay_rate * TRANSPARENCY_PAY_WEIGHT
            + benefits_rate * TRANSPARENCY_BENEFITS_WEIGHT
            + bonus_rate * TRANSPARENCY_BONUS_WEIGHT
            + shift_rate * TRANSPARENCY_SHIFT_WEIGHT);
    Some(score.round().clamp(0.0, 100.0) as u8)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub facilities: usize,
    pub scored: usize,
}

/// Recompute every facility's composite row. Each facility reads a consistent
/// snapshot of its sub-indices and is written with a whole-row upsert; there
/// is no cross-facility dependency.
pub async fn run_scoring(
    job_store: &dyn JobStore,
    facility_store: &dyn FacilityStore,
) -> anyhow::Result<ScoringRunSummary> {
    let started_at = Utc::now();
    let facility_ids = facility_store.facility_ids().await?;
    info!(facilities = facility_ids.len(), "starting scoring batch");

    let mut scored = 0usize;
    for facility_id in &facility_ids {
        let mut values = facility_store.sub_index_values(*facility_id).await?;
        // Job transparency is derived here, never sourced from collectors.
        values.remove(&SubIndex::JobTransparency);
        let postings = job_store.jobs_for_facility(*facility_id).await?;
        if let Some(transparency) = transparency_score(&postings) {
            values.insert(SubIndex::JobTransparency, transparency);
        }

        let score = compute_score(*facility_id, &values);
        debug!(
            facility_id = %facility_id,
            ofs_score = score.ofs_score,
            grade = %score.ofs_grade,
            indices_available = score.indices_available,
            "computed facility score"
        );
        facility_store.upsert_score(&score).await?;
        scored += 1;
    }

    let finished_at = Utc::now();
    info!(scored, "scoring batch finished");
    Ok(ScoringRunSummary {
        started_at,
        finished_at,
        facilities: facility_ids.len(),
        scored,
    })
}
