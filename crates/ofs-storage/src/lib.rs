//! Store traits, in-memory and Postgres store backends, and HTTP fetch
//! utilities shared by both pipelines.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ofs_core::{EnrichmentRecord, EnrichmentRun, FacilityScore, JobPosting, RunStatus, SubIndex};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofs-storage";

/// Hex-encoded SHA-256 of a posting description, used to detect content drift
/// between enrichment runs.
pub fn description_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Decoded response for a completed request. Non-success client statuses are
/// returned here rather than as errors: 404/410 are meaningful signals to the
/// platform adapters, not failures.
#[derive(Debug, Clone)]
pub struct FetchedText {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with fixed timeout and bounded exponential backoff for
/// transient statuses. Owns its session state; callers pass it by reference.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET a URL and return the decoded body for any 2xx-4xx outcome.
    /// Retryable statuses (5xx, 429) and transport errors are retried with
    /// backoff; exhausting retries yields an error.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedText, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if classify_status(status) == RetryDisposition::Retryable {
                        if attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }

                    let body = resp.text().await?;
                    return Ok(FetchedText {
                        status: status.as_u16(),
                        final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt enrichment blob for job {job_id}: {source}")]
    CorruptEnrichment {
        job_id: Uuid,
        source: serde_json::Error,
    },
    #[error("unknown sub-index key {0:?} in facility_attributes")]
    UnknownSubIndex(String),
}

/// Read/write access to job postings and the enrichment audit trail.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn all_jobs(&self) -> Result<Vec<JobPosting>, StoreError>;

    async fn jobs_for_facility(&self, facility_id: Uuid) -> Result<Vec<JobPosting>, StoreError>;

    /// Attach an enrichment record to a posting; when `deactivate` is set the
    /// posting's `is_active` flag is cleared in the same write.
    async fn write_enrichment(
        &self,
        job_id: Uuid,
        record: &EnrichmentRecord,
        deactivate: bool,
    ) -> Result<(), StoreError>;

    async fn record_run(&self, run: &EnrichmentRun) -> Result<(), StoreError>;

    async fn last_successful_run(&self) -> Result<Option<EnrichmentRun>, StoreError>;

    async fn runs(&self) -> Result<Vec<EnrichmentRun>, StoreError>;
}

/// Read access to raw facility sub-index attributes and write access to the
/// composite score rows.
#[async_trait]
pub trait FacilityStore: Send + Sync {
    async fn facility_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Raw sub-index values sourced by the external collectors. Never includes
    /// the derived job-transparency index.
    async fn sub_index_values(
        &self,
        facility_id: Uuid,
    ) -> Result<BTreeMap<SubIndex, u8>, StoreError>;

    /// Whole-row upsert. Implementations replace every column together so a
    /// reader never sees a composite over a mixed old/new sub-index set.
    async fn upsert_score(&self, score: &FacilityScore) -> Result<(), StoreError>;

    async fn score(&self, facility_id: Uuid) -> Result<Option<FacilityScore>, StoreError>;
}

#[derive(Debug, Default)]
struct MemInner {
    jobs: Vec<JobPosting>,
    attributes: HashMap<Uuid, BTreeMap<SubIndex, u8>>,
    scores: HashMap<Uuid, FacilityScore>,
    runs: Vec<EnrichmentRun>,
}

/// In-memory store used by tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_job(&self, job: JobPosting) {
        self.inner.lock().await.jobs.push(job);
    }

    pub async fn set_attributes(&self, facility_id: Uuid, values: BTreeMap<SubIndex, u8>) {
        self.inner.lock().await.attributes.insert(facility_id, values);
    }

    pub async fn job(&self, job_id: Uuid) -> Option<JobPosting> {
        self.inner
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }
}

#[async_trait]
impl JobStore for MemStore {
    async fn all_jobs(&self) -> Result<Vec<JobPosting>, StoreError> {
        Ok(self.inner.lock().await.jobs.clone())
    }

    async fn jobs_for_facility(&self, facility_id: Uuid) -> Result<Vec<JobPosting>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.facility_id == facility_id)
            .cloned()
            .collect())
    }

    async fn write_enrichment(
        &self,
        job_id: Uuid,
        record: &EnrichmentRecord,
        deactivate: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.enrichment = Some(record.clone());
        if deactivate {
            job.is_active = false;
        }
        Ok(())
    }

    async fn record_run(&self, run: &EnrichmentRun) -> Result<(), StoreError> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn last_successful_run(&self) -> Result<Option<EnrichmentRun>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .max_by_key(|r| r.finished_at)
            .cloned())
    }

    async fn runs(&self) -> Result<Vec<EnrichmentRun>, StoreError> {
        let mut runs = self.inner.lock().await.runs.clone();
        runs.sort_by_key(|r| std::cmp::Reverse(r.finished_at));
        Ok(runs)
    }
}

#[async_trait]
impl FacilityStore for MemStore {
    async fn facility_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<Uuid> = inner.attributes.keys().copied().collect();
        for job in &inner.jobs {
            if !ids.contains(&job.facility_id) {
                ids.push(job.facility_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn sub_index_values(
        &self,
        facility_id: Uuid,
    ) -> Result<BTreeMap<SubIndex, u8>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .attributes
            .get(&facility_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_score(&self, score: &FacilityScore) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .scores
            .insert(score.facility_id, score.clone());
        Ok(())
    }

    async fn score(&self, facility_id: Uuid) -> Result<Option<FacilityScore>, StoreError> {
        Ok(self.inner.lock().await.scores.get(&facility_id).cloned())
    }
}

/// Postgres-backed store. Queries are bound at runtime; each write is a
/// single-row statement so row-level locking at the database is sufficient.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobPosting, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let enrichment_json: Option<serde_json::Value> = row.try_get("enrichment")?;
        let enrichment = enrichment_json
            .map(serde_json::from_value::<EnrichmentRecord>)
            .transpose()
            .map_err(|source| StoreError::CorruptEnrichment { job_id: id, source })?;
        Ok(JobPosting {
            id,
            facility_id: row.try_get("facility_id")?,
            source_url: row.try_get("source_url")?,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            pay_min: row.try_get("pay_min")?,
            pay_max: row.try_get("pay_max")?,
            shift_type: row.try_get("shift_type")?,
            shift_hours: row.try_get("shift_hours")?,
            employment_type: row.try_get("employment_type")?,
            description: row.try_get("description")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            enrichment,
        })
    }

    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<EnrichmentRun, StoreError> {
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "partial" => RunStatus::Partial,
            _ => RunStatus::Success,
        };
        Ok(EnrichmentRun {
            id: row.try_get("id")?,
            policy: row.try_get("policy")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            processed: row.try_get::<i32, _>("processed")? as u32,
            enriched: row.try_get::<i32, _>("enriched")? as u32,
            expired: row.try_get::<i32, _>("expired")? as u32,
            failed: row.try_get::<i32, _>("failed")? as u32,
            status,
        })
    }
}

const JOB_COLUMNS: &str = "id, facility_id, source_url, external_id, title, city, state, \
     pay_min, pay_max, shift_type, shift_hours, employment_type, description, \
     is_active, created_at, enrichment";

#[async_trait]
impl JobStore for PgStore {
    async fn all_jobs(&self) -> Result<Vec<JobPosting>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_postings ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn jobs_for_facility(&self, facility_id: Uuid) -> Result<Vec<JobPosting>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_postings WHERE facility_id = $1 ORDER BY created_at"
        ))
        .bind(facility_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn write_enrichment(
        &self,
        job_id: Uuid,
        record: &EnrichmentRecord,
        deactivate: bool,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_value(record).expect("enrichment record serializes");
        let result = sqlx::query(
            r#"
            UPDATE job_postings
               SET enrichment = $2,
                   is_active = CASE WHEN $3 THEN FALSE ELSE is_active END
             WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(blob)
        .bind(deactivate)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn record_run(&self, run: &EnrichmentRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO enrichment_runs
                (id, policy, started_at, finished_at, processed, enriched, expired, failed, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(&run.policy)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.processed as i32)
        .bind(run.enriched as i32)
        .bind(run.expired as i32)
        .bind(run.failed as i32)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_successful_run(&self) -> Result<Option<EnrichmentRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, policy, started_at, finished_at, processed, enriched, expired, failed, status
              FROM enrichment_runs
             WHERE status = 'success'
             ORDER BY finished_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn runs(&self) -> Result<Vec<EnrichmentRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, policy, started_at, finished_at, processed, enriched, expired, failed, status
              FROM enrichment_runs
             ORDER BY finished_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }
}

#[async_trait]
impl FacilityStore for PgStore {
    async fn facility_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT facility_id FROM facility_attributes
            UNION
            SELECT facility_id FROM job_postings
            ORDER BY facility_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("facility_id").map_err(StoreError::from))
            .collect()
    }

    async fn sub_index_values(
        &self,
        facility_id: Uuid,
    ) -> Result<BTreeMap<SubIndex, u8>, StoreError> {
        let rows = sqlx::query(
            "SELECT sub_index, score FROM facility_attributes WHERE facility_id = $1",
        )
        .bind(facility_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("sub_index")?;
            let score: i16 = row.try_get("score")?;
            let index =
                SubIndex::from_key(&key).ok_or_else(|| StoreError::UnknownSubIndex(key.clone()))?;
            out.insert(index, score.clamp(0, 100) as u8);
        }
        Ok(out)
    }

    async fn upsert_score(&self, score: &FacilityScore) -> Result<(), StoreError> {
        let sub_scores = serde_json::to_value(&score.sub_scores).expect("sub scores serialize");
        sqlx::query(
            r#"
            INSERT INTO facility_scores
                (facility_id, sub_scores, indices_available, ofs_score, ofs_grade, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (facility_id) DO UPDATE
               SET sub_scores = EXCLUDED.sub_scores,
                   indices_available = EXCLUDED.indices_available,
                   ofs_score = EXCLUDED.ofs_score,
                   ofs_grade = EXCLUDED.ofs_grade,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(score.facility_id)
        .bind(sub_scores)
        .bind(score.indices_available as i32)
        .bind(score.ofs_score as i16)
        .bind(&score.ofs_grade)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn score(&self, facility_id: Uuid) -> Result<Option<FacilityScore>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT facility_id, sub_scores, indices_available, ofs_score, ofs_grade
              FROM facility_scores
             WHERE facility_id = $1
            "#,
        )
        .bind(facility_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sub_scores_json: serde_json::Value = row.try_get("sub_scores")?;
        let sub_scores = serde_json::from_value(sub_scores_json).map_err(|source| {
            StoreError::CorruptEnrichment {
                job_id: facility_id,
                source,
            }
        })?;
        Ok(Some(FacilityScore {
            facility_id: row.try_get("facility_id")?,
            sub_scores,
            indices_available: row.try_get::<i32, _>("indices_available")? as u32,
            ofs_score: row.try_get::<i16, _>("ofs_score")? as u8,
            ofs_grade: row.try_get("ofs_grade")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ofs_core::{ExtractionMethod, ParsedFields};

    fn posting(facility_id: Uuid) -> JobPosting {
        JobPosting {
            id: Uuid::new_v4(),
            facility_id,
            source_url: "https://jobs.example.org/rn-icu".into(),
            external_id: None,
            title: "RN - ICU".into(),
            city: Some("Austin".into()),
            state: Some("TX".into()),
            pay_min: Some(38.0),
            pay_max: Some(52.0),
            shift_type: Some("Night".into()),
            shift_hours: Some("12hr".into()),
            employment_type: Some("Full-time".into()),
            description: Some("ICU nights, BSN preferred.".into()),
            is_active: true,
            created_at: Utc::now(),
            enrichment: None,
        }
    }

    #[test]
    fn description_hashing_is_stable() {
        assert_eq!(
            description_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_ne!(description_hash("hello world"), description_hash("hello world!"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn write_enrichment_can_deactivate_the_posting() {
        let store = MemStore::new();
        let job = posting(Uuid::new_v4());
        let job_id = job.id;
        store.insert_job(job).await;

        let record = EnrichmentRecord::expired("filled", description_hash("x"), Utc::now());
        store.write_enrichment(job_id, &record, true).await.unwrap();

        let stored = store.job(job_id).await.unwrap();
        assert!(!stored.is_active);
        assert_eq!(
            stored.enrichment.unwrap().extraction_method,
            ExtractionMethod::Expired
        );
    }

    #[tokio::test]
    async fn write_enrichment_for_unknown_job_errors() {
        let store = MemStore::new();
        let record = EnrichmentRecord::extracted(
            ExtractionMethod::Fallback,
            ParsedFields::default(),
            "text".into(),
            description_hash("text"),
            Utc::now(),
        );
        let err = store
            .write_enrichment(Uuid::new_v4(), &record, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn last_successful_run_skips_partial_runs() {
        let store = MemStore::new();
        let base = Utc::now();
        let mk = |status: RunStatus, offset_secs: i64| EnrichmentRun {
            id: Uuid::new_v4(),
            policy: "new_or_changed".into(),
            started_at: base,
            finished_at: base + chrono::Duration::seconds(offset_secs),
            processed: 10,
            enriched: 8,
            expired: 1,
            failed: 1,
            status,
        };
        store.record_run(&mk(RunStatus::Success, 10)).await.unwrap();
        store.record_run(&mk(RunStatus::Partial, 20)).await.unwrap();

        let last = store.last_successful_run().await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Success);
        assert_eq!(last.finished_at, base + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn facility_ids_include_job_only_facilities() {
        let store = MemStore::new();
        let with_attributes = Uuid::new_v4();
        let jobs_only = Uuid::new_v4();
        store
            .set_attributes(with_attributes, BTreeMap::from([(SubIndex::Pay, 80u8)]))
            .await;
        store.insert_job(posting(jobs_only)).await;

        let ids = store.facility_ids().await.unwrap();
        assert!(ids.contains(&with_attributes));
        assert!(ids.contains(&jobs_only));
    }
}
