// Doublefetch page handler
//
// Re-fetches an observed page as an anonymous visitor (no cookies, no
// credentials, no cache) and only lets it continue toward emission when
// the uncredentialed fetch returns the same public content. Everything
// that fails here is remembered by the new-page approver so future
// observations short-circuit.

use crate::config::Options;
use crate::error::{Error, Result};
use crate::pages::quorum_check::PAGE_QUORUM_CHECK_JOB;
use crate::pages::structure::{parse_page_structure, PageStructure};
use crate::pages::{PageObservation, Redirect, SafePage, REDIRECT_TRUNCATED};
use crate::probe::NewPageApprover;
use crate::sanitizer::{protected_url, sanitize_title, sanitize_url, SanitizeResult};
use crate::scheduler::{JobHandler, JobRequest};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Job type of this handler.
pub const DOUBLEFETCH_JOB: &str = "doublefetch-page";

/// Content types an anonymous fetch may return.
const ACCEPTED_CONTENT_TYPES: &[&str] = &["text/html", "text/plain", "application/xhtml+xml"];

/// Normalized titles shorter than this never match by containment.
const MIN_TITLE_MATCH_LEN: usize = 6;

/// Compare the pre-fetch title with the anonymously fetched one.
///
/// Titles match when equal after lowercasing and whitespace removal, or
/// when the fetched title contains the observed one (breadcrumbs may be
/// appended for anonymous visitors, but nothing may be stripped).
pub fn titles_match_after_doublefetch(before: &str, after: &str) -> bool {
    let before = normalize_title(before);
    let after = normalize_title(after);
    if before.is_empty() || after.is_empty() {
        return false;
    }
    if before == after {
        return true;
    }
    before.chars().count() >= MIN_TITLE_MATCH_LEN && after.contains(&before)
}

fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Result of one doublefetch attempt. Transient failures are not an
/// outcome; they surface as errors and the scheduler retries.
#[derive(Debug, Clone, PartialEq)]
pub enum DoublefetchOutcome {
    Accepted(Box<SafePage>),
    Rejected { reason: String },
}

struct FetchedDocument {
    final_url: Url,
    body: String,
}

/// HTTP client configured for anonymous re-fetches.
struct AnonymousFetcher {
    client: reqwest::Client,
    body_limit: usize,
}

impl AnonymousFetcher {
    fn new(options: &Options) -> Result<Self> {
        // Redirects are followed only while origin and path survive;
        // anything else is returned as-is and rejected below.
        let client = reqwest::Client::builder()
            .redirect(Policy::custom(|attempt| {
                let preserved = attempt
                    .previous()
                    .last()
                    .map(|prev| {
                        prev.origin() == attempt.url().origin()
                            && prev.path() == attempt.url().path()
                    })
                    .unwrap_or(false);
                if preserved {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .timeout(options.doublefetch_timeout)
            .build()
            .map_err(Error::transient)?;
        Ok(Self {
            client,
            body_limit: options.doublefetch_body_limit,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<FetchedDocument> {
        let mut response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/html")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache")
            .send()
            .await
            .map_err(Error::transient)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::Permanent("rate limited (429)".into()));
        }
        if status.is_redirection() {
            return Err(Error::Permanent("redirect left origin or path".into()));
        }
        if !status.is_success() {
            return Err(Error::Transient(format!("http status {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(Error::Permanent(format!(
                "unsupported content type {content_type:?}"
            )));
        }

        let final_url = response.url().clone();
        let mut body = bytes::BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(Error::transient)? {
            if body.len() + chunk.len() > self.body_limit {
                return Err(Error::Permanent("download limit exceeded".into()));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedDocument {
            final_url,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

pub struct DoublefetchHandler {
    fetcher: AnonymousFetcher,
    approver: Arc<NewPageApprover>,
}

impl DoublefetchHandler {
    pub fn new(options: &Options, approver: Arc<NewPageApprover>) -> Result<Self> {
        Ok(Self {
            fetcher: AnonymousFetcher::new(options)?,
            approver,
        })
    }

    async fn fetch_structure(&self, url: &Url) -> Result<(Url, PageStructure)> {
        let document = self.fetcher.fetch(url).await?;
        let structure = parse_page_structure(&document.body, &document.final_url);
        Ok((document.final_url, structure))
    }

    /// Run the full doublefetch decision for one observation.
    pub async fn run_page(&self, page: &PageObservation) -> Result<DoublefetchOutcome> {
        let pre = page
            .pre_doublefetch
            .as_ref()
            .ok_or_else(|| Error::BadJob("missing pre-doublefetch structure".into()))?;
        let url = Url::parse(&page.url)
            .map_err(|err| Error::BadJob(format!("unparseable page url: {err}")))?;

        if self
            .approver
            .might_be_marked_as_private(&page.url)
            .await?
        {
            return Ok(reject("marked as private"));
        }

        let (mut final_url, mut structure) = match self.fetch_structure(&url).await {
            Ok(fetched) => fetched,
            Err(Error::Permanent(reason)) => return Ok(reject(reason)),
            Err(err) => return Err(err),
        };

        // Recurse once on a diverging canonical URL; prefer its result
        // when the second fetch succeeds cleanly.
        let mut canonical_confirmed = false;
        if let Some(canonical) = structure.canonical_url.clone() {
            if canonical != page.url && canonical != final_url.as_str() {
                if let Ok(canonical_url) = Url::parse(&canonical) {
                    if matches!(canonical_url.scheme(), "http" | "https") {
                        if let Ok((fetched_url, fetched_structure)) =
                            self.fetch_structure(&canonical_url).await
                        {
                            if !fetched_structure.noindex && !fetched_structure.title.is_empty() {
                                final_url = fetched_url;
                                structure = fetched_structure;
                                canonical_confirmed = true;
                            }
                        }
                    }
                }
            }
        }

        if pre.noindex || structure.noindex {
            return Ok(reject("page is noindex"));
        }

        if !titles_match_after_doublefetch(&pre.title, &structure.title) {
            return Ok(reject("titles do not match"));
        }

        // Static URL check: count the public signals and tighten the
        // sanitizer accordingly.
        let is_canonical = canonical_confirmed
            || structure.canonical_url.as_deref() == Some(page.url.as_str());
        let indexed = page.indexed_by_search_engine();
        let requested_index = pre.requested_index || structure.requested_index;
        let signals = [is_canonical, indexed, requested_index]
            .iter()
            .filter(|s| **s)
            .count();
        if signals < 3 {
            let strict = signals < 2;
            if !sanitize_url(final_url.as_str(), strict).is_safe() {
                return Ok(reject("static url check failed"));
            }
        }

        let search = page.search.clone().map(|mut search| {
            if crate::sanitizer::is_suspicious_query(&search.query) {
                search.query = String::new();
            }
            search
        });

        let safe_page = SafePage {
            url: final_url.to_string(),
            title: sanitize_title(&structure.title),
            lang_html: structure.language.clone(),
            lang_detect: page.lang.clone(),
            search,
            ref_url: page
                .ref_url
                .as_deref()
                .and_then(|r| sanitize_url(r, false).safe_url().map(str::to_string)),
            redirects: sanitize_redirects(&page.redirects),
            activity: page.activity,
            canonical_url: canonical_confirmed.then(|| final_url.to_string()),
        };
        Ok(DoublefetchOutcome::Accepted(Box::new(safe_page)))
    }
}

fn reject(reason: impl Into<String>) -> DoublefetchOutcome {
    DoublefetchOutcome::Rejected {
        reason: reason.into(),
    }
}

/// Sanitize every redirect endpoint, preserving the truncation sentinel.
/// Endpoints that fail sanitization degrade to the protected origin.
fn sanitize_redirects(redirects: &[Redirect]) -> Vec<Redirect> {
    redirects
        .iter()
        .filter_map(|redirect| {
            let from = sanitize_endpoint(&redirect.from)?;
            let to = if redirect.to == REDIRECT_TRUNCATED {
                REDIRECT_TRUNCATED.to_string()
            } else {
                sanitize_endpoint(&redirect.to)?
            };
            Some(Redirect {
                from,
                to,
                status_code: redirect.status_code,
            })
        })
        .collect()
}

fn sanitize_endpoint(endpoint: &str) -> Option<String> {
    match sanitize_url(endpoint, false) {
        SanitizeResult::Safe { safe_url } | SanitizeResult::Truncated { safe_url } => {
            Some(safe_url)
        }
        SanitizeResult::Dropped { .. } => {
            let url = Url::parse(endpoint).ok()?;
            let host = url.host_str()?;
            Some(protected_url(url.scheme(), host))
        }
    }
}

#[async_trait]
impl JobHandler for DoublefetchHandler {
    async fn run(&self, args: Value) -> Result<Vec<JobRequest>> {
        let page: PageObservation = serde_json::from_value(args)
            .map_err(|err| Error::BadJob(format!("malformed page observation: {err}")))?;
        page.validate()?;

        match self.run_page(&page).await? {
            DoublefetchOutcome::Accepted(safe_page) => {
                let args = serde_json::to_value(&*safe_page).map_err(Error::transient)?;
                Ok(vec![JobRequest::new(PAGE_QUORUM_CHECK_JOB, args)])
            }
            DoublefetchOutcome::Rejected { reason } => {
                tracing::debug!(url = %page.url, "doublefetch rejected page: {reason}");
                self.approver.mark_as_private(&page.url).await?;
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::{PageMeta, PreDoublefetch, SearchInfo};
    use crate::storage::MemoryStorage;

    fn observation(url: &str, title: &str) -> PageObservation {
        PageObservation {
            url: url.into(),
            title: title.into(),
            pre_doublefetch: Some(PreDoublefetch {
                title: title.into(),
                meta: PageMeta::default(),
                requested_index: false,
                noindex: false,
            }),
            search: None,
            redirects: Vec::new(),
            ref_url: None,
            activity: 0.4,
            lang: Some("en".into()),
        }
    }

    fn handler() -> DoublefetchHandler {
        let approver = Arc::new(NewPageApprover::new(Arc::new(MemoryStorage::new())).unwrap());
        DoublefetchHandler::new(&Options::default(), approver).unwrap()
    }

    fn html_page(title: &str) -> String {
        format!("<html lang=\"en\"><head><title>{title}</title></head><body>public body</body></html>")
    }

    #[test]
    fn title_match_ignores_case_and_whitespace() {
        assert!(titles_match_after_doublefetch(
            "Example Search - YouTube",
            "example search - YouTube"
        ));
    }

    #[test]
    fn title_match_allows_appended_context_only() {
        let before = "muenchen.social - Die Mastodon Instanz";
        let after = "Max (@max@m.s) - muenchen.social - Die Mastodon Instanz";
        assert!(titles_match_after_doublefetch(before, after));
        assert!(!titles_match_after_doublefetch(after, before));
    }

    #[test]
    fn title_match_requires_both_titles_and_min_len() {
        assert!(!titles_match_after_doublefetch("", "anything"));
        assert!(!titles_match_after_doublefetch("abc", ""));
        // 5 normalized chars: too short for containment.
        assert!(!titles_match_after_doublefetch("ab cde", "xxabcdexx"));
        assert!(titles_match_after_doublefetch("abcdef", "xx abcdef xx"));
    }

    /// HTML that marks itself canonical and index-requested, so the
    /// static URL check is satisfied by signals alone (the mock server
    /// lives on an IP literal, which the sanitizer would drop).
    fn public_html_page(title: &str, canonical: &str) -> String {
        format!(
            "<html lang=\"en\"><head><title>{title}</title>\
             <link rel=\"canonical\" href=\"{canonical}\">\
             <meta name=\"robots\" content=\"index, follow\">\
             </head><body>public body</body></html>"
        )
    }

    fn indexed(mut page: PageObservation) -> PageObservation {
        page.search = Some(SearchInfo {
            category: "go".into(),
            query: "weather berlin".into(),
            depth: 1,
        });
        page
    }

    #[tokio::test]
    async fn happy_path_produces_safe_page() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/article", server.url());
        server
            .mock("GET", "/article")
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(public_html_page("A Public Article", &url))
            .create_async()
            .await;

        let page = indexed(observation(&url, "A Public Article"));
        let outcome = handler().run_page(&page).await.unwrap();
        match outcome {
            DoublefetchOutcome::Accepted(safe) => {
                assert_eq!(safe.url, url);
                assert_eq!(safe.title, "A Public Article");
                assert_eq!(safe.lang_html.as_deref(), Some("en"));
                assert_eq!(safe.lang_detect.as_deref(), Some("en"));
                assert!((safe.activity - 0.4).abs() < 1e-9);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_fetched_title_is_bounded() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/article", server.url());
        let served_title = format!("A Public Article - {}", "x".repeat(400));
        server
            .mock("GET", "/article")
            .with_header("content-type", "text/html")
            .with_body(public_html_page(&served_title, &url))
            .create_async()
            .await;

        let page = indexed(observation(&url, "A Public Article"));
        match handler().run_page(&page).await.unwrap() {
            DoublefetchOutcome::Accepted(safe) => {
                assert!(safe.title.len() <= crate::sanitizer::TITLE_MAX_LEN);
                assert!(safe.title.starts_with("A Public Article"));
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_title_rejects() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/inbox")
            .with_header("content-type", "text/html")
            .with_body(html_page("Login required"))
            .create_async()
            .await;

        let url = format!("{}/inbox", server.url());
        let page = observation(&url, "Your private inbox (3 unread)");
        assert!(matches!(
            handler().run_page(&page).await.unwrap(),
            DoublefetchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn noindex_rejects() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_header("content-type", "text/html")
            .with_body(
                "<html><head><title>T shared</title>\
                 <meta name=\"robots\" content=\"noindex\"></head></html>",
            )
            .create_async()
            .await;

        let page = observation(&format!("{}/a", server.url()), "T shared");
        assert!(matches!(
            handler().run_page(&page).await.unwrap(),
            DoublefetchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn http_429_rejects_permanently() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_status(429)
            .create_async()
            .await;

        let page = observation(&format!("{}/a", server.url()), "Anything here");
        assert!(matches!(
            handler().run_page(&page).await.unwrap(),
            DoublefetchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a")
            .with_status(503)
            .create_async()
            .await;

        let page = observation(&format!("{}/a", server.url()), "Anything here");
        let err = handler().run_page(&page).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unsupported_content_type_rejects() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api")
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let page = observation(&format!("{}/api", server.url()), "Some Title Here");
        assert!(matches!(
            handler().run_page(&page).await.unwrap(),
            DoublefetchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn body_over_limit_rejects() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_header("content-type", "text/html")
            .with_body("x".repeat(3 * 1024 * 1024))
            .create_async()
            .await;

        let page = observation(&format!("{}/big", server.url()), "Big Page Title");
        assert!(matches!(
            handler().run_page(&page).await.unwrap(),
            DoublefetchOutcome::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn canonical_divergence_recurses_once() {
        let mut server = mockito::Server::new_async().await;
        let canonical_path = "/articles/clean";
        let canonical_url = format!("{}{}", server.url(), canonical_path);
        server
            .mock("GET", "/articles/clean?utm=tracking")
            .with_header("content-type", "text/html")
            .with_body(format!(
                "<html><head><title>Clean Article</title>\
                 <link rel=\"canonical\" href=\"{canonical_url}\"></head></html>"
            ))
            .create_async()
            .await;
        server
            .mock("GET", canonical_path)
            .with_header("content-type", "text/html")
            .with_body(public_html_page("Clean Article", &canonical_url))
            .create_async()
            .await;

        let page = indexed(observation(
            &format!("{}{}?utm=tracking", server.url(), canonical_path),
            "Clean Article",
        ));
        match handler().run_page(&page).await.unwrap() {
            DoublefetchOutcome::Accepted(safe) => {
                assert_eq!(safe.url, canonical_url);
                assert_eq!(safe.canonical_url.as_deref(), Some(canonical_url.as_str()));
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_marks_url_private_via_handler() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/private")
            .with_header("content-type", "text/html")
            .with_body(html_page("Completely Different"))
            .expect(1)
            .create_async()
            .await;

        let approver = Arc::new(NewPageApprover::new(Arc::new(MemoryStorage::new())).unwrap());
        let handler =
            DoublefetchHandler::new(&Options::default(), approver.clone()).unwrap();

        let url = format!("{}/private", server.url());
        let page = observation(&url, "My Secret Document");
        let followups = handler
            .run(serde_json::to_value(&page).unwrap())
            .await
            .unwrap();
        assert!(followups.is_empty());
        assert!(approver.might_be_marked_as_private(&url).await.unwrap());

        // Second observation short-circuits before any fetch.
        let followups = handler
            .run(serde_json::to_value(&page).unwrap())
            .await
            .unwrap();
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn suspicious_search_query_is_blanked() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/result", server.url());
        server
            .mock("GET", "/result")
            .with_header("content-type", "text/html")
            .with_body(public_html_page("Search Landing Page", &url))
            .create_async()
            .await;

        let mut page = observation(&url, "Search Landing Page");
        page.search = Some(SearchInfo {
            category: "go".into(),
            query: "jane.doe@example.com".into(),
            depth: 1,
        });
        match handler().run_page(&page).await.unwrap() {
            DoublefetchOutcome::Accepted(safe) => {
                assert_eq!(safe.search.as_ref().unwrap().query, "");
                assert_eq!(safe.search.as_ref().unwrap().depth, 1);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_pre_doublefetch_is_bad_job() {
        let mut page = observation("https://example.com/a", "Title Of Page");
        page.pre_doublefetch = None;
        let err = handler().run_page(&page).await.unwrap_err();
        assert!(matches!(err, Error::BadJob(_)));
    }
}
