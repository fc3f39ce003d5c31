//! Platform adapter contracts + the closed URL-shape registry used by the
//! enrichment pipeline to fetch job postings from their source platforms.

use async_trait::async_trait;
use ego_tree::NodeRef;
use ofs_storage::{FetchError, HttpFetcher};
use scraper::{Html, Node};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ofs-adapters";

/// Outcome of a platform fetch: usable raw content, or a confirmed-gone
/// signal with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Content(String),
    Expired(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One source platform's fetch capability. `interpret` is pure so expiration
/// classification can be tested without network access.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform_id(&self) -> &'static str;

    /// URL-shape predicate for the registry.
    fn matches(&self, url: &str) -> bool;

    /// Classify a completed response body. Expiration signals must win here
    /// before any extraction is attempted downstream.
    fn interpret(&self, status: u16, url: &str, body: &str) -> Result<FetchOutcome, AdapterError>;

    async fn fetch(&self, http: &HttpFetcher, url: &str) -> Result<FetchOutcome, AdapterError> {
        let resp = http.fetch_text(url).await?;
        self.interpret(resp.status, &resp.final_url, &resp.body)
    }
}

/// Phrases that mark a posting as gone on platforms without a machine-readable
/// status field. Matched case-insensitively against the raw body.
const EXPIRY_PHRASES: &[&str] = &[
    "this job has been filled",
    "this position has been filled",
    "position has been filled",
    "no longer accepting applications",
    "this posting has expired",
    "job is no longer available",
    "position is no longer available",
];

fn status_expiry(status: u16) -> Option<String> {
    match status {
        404 => Some("listing not found (HTTP 404)".to_string()),
        410 => Some("listing removed (HTTP 410)".to_string()),
        _ => None,
    }
}

fn body_expiry(body: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();
    EXPIRY_PHRASES
        .iter()
        .find(|phrase| lower.contains(**phrase))
        .map(|phrase| format!("posting marked gone: {phrase:?}"))
}

fn require_success(status: u16, url: &str) -> Result<(), AdapterError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(AdapterError::HttpStatus {
            status,
            url: url.to_string(),
        })
    }
}

/// Jobvite career pages: plain HTML, no embedded status. Text heuristics only.
#[derive(Debug, Clone, Copy)]
pub struct JobviteAdapter;

#[async_trait]
impl PlatformAdapter for JobviteAdapter {
    fn platform_id(&self) -> &'static str {
        "jobvite"
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(".jobvite.com/")
    }

    fn interpret(&self, status: u16, url: &str, body: &str) -> Result<FetchOutcome, AdapterError> {
        if let Some(message) = status_expiry(status) {
            return Ok(FetchOutcome::Expired(message));
        }
        require_success(status, url)?;
        if let Some(message) = body_expiry(body) {
            return Ok(FetchOutcome::Expired(message));
        }
        Ok(FetchOutcome::Content(body.to_string()))
    }
}

/// iCIMS portals. Every iCIMS page ships a hidden "this position has been
/// filled" template node regardless of actual status, so the embedded
/// `jobState` field must be consulted first; text matching applies only when
/// the field is missing.
#[derive(Debug, Clone, Copy)]
pub struct IcimsAdapter;

impl IcimsAdapter {
    fn embedded_job_state(body: &str) -> Option<String> {
        let start = body.find("\"jobState\"")?;
        let rest = &body[start + "\"jobState\"".len()..];
        let rest = rest.trim_start().strip_prefix(':')?.trim_start();
        let rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        Some(rest[..end].to_ascii_lowercase())
    }
}

#[async_trait]
impl PlatformAdapter for IcimsAdapter {
    fn platform_id(&self) -> &'static str {
        "icims"
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(".icims.com/")
    }

    fn interpret(&self, status: u16, url: &str, body: &str) -> Result<FetchOutcome, AdapterError> {
        if let Some(message) = status_expiry(status) {
            return Ok(FetchOutcome::Expired(message));
        }
        require_success(status, url)?;
        match Self::embedded_job_state(body).as_deref() {
            Some("open") | Some("active") | Some("accepting") => {
                Ok(FetchOutcome::Content(body.to_string()))
            }
            Some(state @ ("filled" | "closed" | "inactive" | "expired")) => Ok(
                FetchOutcome::Expired(format!("iCIMS jobState is {state:?}")),
            ),
            // Unrecognized state: trust the platform that the page is live.
            Some(_) => Ok(FetchOutcome::Content(body.to_string())),
            None => {
                if let Some(message) = body_expiry(body) {
                    return Ok(FetchOutcome::Expired(message));
                }
                Ok(FetchOutcome::Content(body.to_string()))
            }
        }
    }
}

/// Workday job posting JSON API. A live posting carries `jobPostingInfo`;
/// removed postings drop it or answer with an error payload.
#[derive(Debug, Clone, Copy)]
pub struct WorkdayAdapter;

#[async_trait]
impl PlatformAdapter for WorkdayAdapter {
    fn platform_id(&self) -> &'static str {
        "workday"
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(".myworkdayjobs.com/")
    }

    fn interpret(&self, status: u16, url: &str, body: &str) -> Result<FetchOutcome, AdapterError> {
        if let Some(message) = status_expiry(status) {
            return Ok(FetchOutcome::Expired(message));
        }
        require_success(status, url)?;

        let Ok(value) = serde_json::from_str::<JsonValue>(body) else {
            // Some tenants serve the HTML shell instead of JSON.
            if let Some(message) = body_expiry(body) {
                return Ok(FetchOutcome::Expired(message));
            }
            return Ok(FetchOutcome::Content(body.to_string()));
        };

        if value.get("error").is_some() {
            return Ok(FetchOutcome::Expired(
                "Workday returned an error payload for the posting".to_string(),
            ));
        }
        match value.get("jobPostingInfo") {
            None => Ok(FetchOutcome::Expired(
                "Workday posting no longer present (jobPostingInfo missing)".to_string(),
            )),
            Some(info) => {
                let description = info
                    .get("jobDescription")
                    .and_then(|d| d.as_str())
                    .unwrap_or(body);
                Ok(FetchOutcome::Content(description.to_string()))
            }
        }
    }
}

/// Fallback for URL shapes outside the known set: fetch and treat the body as
/// HTML, with text-only expiry heuristics.
#[derive(Debug, Clone, Copy)]
pub struct GenericHtmlAdapter;

#[async_trait]
impl PlatformAdapter for GenericHtmlAdapter {
    fn platform_id(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, _url: &str) -> bool {
        true
    }

    fn interpret(&self, status: u16, url: &str, body: &str) -> Result<FetchOutcome, AdapterError> {
        if let Some(message) = status_expiry(status) {
            return Ok(FetchOutcome::Expired(message));
        }
        require_success(status, url)?;
        if let Some(message) = body_expiry(body) {
            return Ok(FetchOutcome::Expired(message));
        }
        Ok(FetchOutcome::Content(body.to_string()))
    }
}

static JOBVITE: JobviteAdapter = JobviteAdapter;
static ICIMS: IcimsAdapter = IcimsAdapter;
static WORKDAY: WorkdayAdapter = WorkdayAdapter;
static GENERIC: GenericHtmlAdapter = GenericHtmlAdapter;

/// Resolve the adapter for a source URL. Unknown shapes fall through to the
/// generic HTML adapter.
pub fn adapter_for_url(url: &str) -> &'static dyn PlatformAdapter {
    let known: [&'static dyn PlatformAdapter; 3] = [&JOBVITE, &ICIMS, &WORKDAY];
    known
        .into_iter()
        .find(|adapter| adapter.matches(url))
        .unwrap_or(&GENERIC)
}

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "head", "template", "svg"];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "table", "section",
    "article", "header", "footer", "blockquote",
];

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text),
        Node::Element(element) => {
            let name = element.name();
            if SKIPPED_ELEMENTS.contains(&name) {
                return;
            }
            if name == "br" {
                out.push('\n');
                return;
            }
            for child in node.children() {
                collect_text(child, out);
            }
            if BLOCK_ELEMENTS.contains(&name) {
                out.push('\n');
            }
        }
        _ => {
            for child in node.children() {
                collect_text(child, out);
            }
        }
    }
}

/// Reduce raw HTML to normalized plain text: script/style stripped, inline
/// whitespace collapsed, block-level line breaks preserved.
pub fn clean_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    collect_text(*document.root_element(), &mut raw);

    let mut lines = Vec::new();
    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

/// Truncate to a character budget without splitting a code point.
pub fn cap_text(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_known_platform_shapes() {
        assert_eq!(
            adapter_for_url("https://jobs.jobvite.com/mercy-health/job/abc").platform_id(),
            "jobvite"
        );
        assert_eq!(
            adapter_for_url("https://careers-stjoseph.icims.com/jobs/1234/rn-icu/job").platform_id(),
            "icims"
        );
        assert_eq!(
            adapter_for_url("https://ascension.wd5.myworkdayjobs.com/jobs/1234").platform_id(),
            "workday"
        );
        assert_eq!(
            adapter_for_url("https://www.hospitalcareers.example/job/99").platform_id(),
            "generic"
        );
    }

    #[test]
    fn gone_statuses_expire_regardless_of_body() {
        let outcome = GenericHtmlAdapter
            .interpret(410, "https://x.example/job", "<html>anything</html>")
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Expired(_)));
    }

    #[test]
    fn other_failure_statuses_are_errors_not_expirations() {
        let err = GenericHtmlAdapter
            .interpret(403, "https://x.example/job", "forbidden")
            .unwrap_err();
        assert!(matches!(err, AdapterError::HttpStatus { status: 403, .. }));
    }

    #[test]
    fn generic_template_text_marks_posting_expired() {
        let outcome = GenericHtmlAdapter
            .interpret(
                200,
                "https://x.example/job",
                "<p>Sorry, this job is no longer available.</p>",
            )
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Expired(_)));
    }

    #[test]
    fn icims_embedded_open_state_wins_over_filled_template() {
        // iCIMS pages always embed the filled-template text; the jobState
        // field decides.
        let body = r#"
            <div class="hidden">This position has been filled.</div>
            <script>var icimsData = {"jobState": "open", "jobId": 4411};</script>
            <div>RN - Medical ICU - Nights</div>
        "#;
        let outcome = IcimsAdapter
            .interpret(200, "https://careers-x.icims.com/jobs/4411/job", body)
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Content(_)));
    }

    #[test]
    fn icims_filled_state_expires_the_posting() {
        let body = r#"<script>var icimsData = {"jobState": "filled"};</script>"#;
        let outcome = IcimsAdapter
            .interpret(200, "https://careers-x.icims.com/jobs/1/job", body)
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Expired("iCIMS jobState is \"filled\"".to_string())
        );
    }

    #[test]
    fn icims_without_state_field_falls_back_to_text_matching() {
        let body = "<div>This position has been filled.</div>";
        let outcome = IcimsAdapter
            .interpret(200, "https://careers-x.icims.com/jobs/1/job", body)
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Expired(_)));
    }

    #[test]
    fn workday_missing_posting_info_expires() {
        let outcome = WorkdayAdapter
            .interpret(200, "https://h.wd1.myworkdayjobs.com/j/1", r#"{"total": 0}"#)
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Expired(_)));
    }

    #[test]
    fn workday_live_posting_yields_description_html() {
        let body = r#"{"jobPostingInfo": {"jobDescription": "<p>ICU RN, nights.</p>"}}"#;
        let outcome = WorkdayAdapter
            .interpret(200, "https://h.wd1.myworkdayjobs.com/j/1", body)
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Content("<p>ICU RN, nights.</p>".to_string())
        );
    }

    #[test]
    fn clean_html_strips_scripts_and_preserves_block_breaks() {
        let html = r#"
            <html><head><style>.x{color:red}</style></head><body>
            <h1>RN   -  ICU</h1>
            <script>trackPageView();</script>
            <p>Night shift position.</p>
            <ul><li>BLS required</li><li>Two years experience</li></ul>
            </body></html>
        "#;
        let text = clean_html(html);
        assert!(!text.contains("trackPageView"));
        assert!(!text.contains("color:red"));
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"RN - ICU"));
        assert!(lines.contains(&"Night shift position."));
        assert!(lines.contains(&"BLS required"));
        assert!(lines.contains(&"Two years experience"));
    }

    #[test]
    fn cap_text_respects_char_boundaries() {
        assert_eq!(cap_text("héllo", 2), "hé");
        assert_eq!(cap_text("abc", 10), "abc");
    }
}
