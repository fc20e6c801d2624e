// Page quorum check handler
//
// A doublefetched page may only be shared once enough independent
// clients saw the same URL. This handler casts the votes, queries
// consent, redacts companion URLs that did not reach quorum, and hands
// the finished `wtm.page` message to the deduplicating sender.

use crate::config::Options;
use crate::country::CountryProvider;
use crate::dedup::SEND_MESSAGE_JOB;
use crate::error::{Error, Result};
use crate::pages::{is_pure_domain, SafePage, REDIRECT_TRUNCATED};
use crate::quorum::QuorumClient;
use crate::sanitizer::{protected_url, sanitize_activity, PROTECTED_SUFFIX};
use crate::scheduler::{JobHandler, JobRequest};
use crate::transport::OutboundMessage;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

/// Job type of this handler.
pub const PAGE_QUORUM_CHECK_JOB: &str = "page-quorum-check";

/// Action of the emitted page message.
pub const PAGE_ACTION: &str = "wtm.page";

pub struct PageQuorumCheckHandler {
    quorum: Arc<QuorumClient>,
    country: Arc<CountryProvider>,
    options: Options,
}

impl PageQuorumCheckHandler {
    pub fn new(
        options: Options,
        quorum: Arc<QuorumClient>,
        country: Arc<CountryProvider>,
    ) -> Self {
        Self {
            quorum,
            country,
            options,
        }
    }

    /// A URL that consent may be asked about: parseable, not already
    /// redacted, not the truncation sentinel.
    fn checkable(url: &str) -> Result<Option<Url>> {
        if url == REDIRECT_TRUNCATED || url.ends_with(PROTECTED_SUFFIX) {
            return Ok(None);
        }
        Url::parse(url)
            .map(Some)
            .map_err(|err| Error::BadJob(format!("unparseable url in page report: {err}")))
    }

    /// Consent-gate one companion URL (ref or redirect endpoint):
    /// keep it when public, redact to the protected origin otherwise.
    async fn consent_or_protect(&self, url: &str) -> Result<String> {
        let Some(parsed) = Self::checkable(url)? else {
            return Ok(url.to_string());
        };
        if is_pure_domain(&parsed) {
            return Ok(url.to_string());
        }
        if self.quorum.check_quorum_consent(url).await? {
            return Ok(url.to_string());
        }
        Ok(protected_url(
            parsed.scheme(),
            parsed.host_str().unwrap_or_default(),
        ))
    }

    pub async fn run_page(&self, page: &SafePage) -> Result<Option<OutboundMessage>> {
        // Collect the URL set: page URL, ref, every redirect endpoint
        // except the sentinel. Parse failures poison the whole job.
        let mut vote_set = BTreeSet::new();
        vote_set.insert(page.url.clone());
        if let Some(ref_url) = &page.ref_url {
            vote_set.insert(ref_url.clone());
        }
        for redirect in &page.redirects {
            vote_set.insert(redirect.from.clone());
            vote_set.insert(redirect.to.clone());
        }

        // Vote phase. Votes go out even for URLs we already consider
        // public; other clients need them to reach quorum.
        for url in &vote_set {
            let Some(parsed) = Self::checkable(url)? else {
                continue;
            };
            if is_pure_domain(&parsed) {
                continue;
            }
            self.quorum.send_quorum_increment(url).await?;
        }

        // Consent phase for the page URL itself. Pure domains and pages
        // indexed by a search engine are publicly safe by construction.
        let page_url = Url::parse(&page.url)
            .map_err(|err| Error::BadJob(format!("unparseable page url: {err}")))?;
        let indexed = page.search.as_ref().map(|s| s.depth) == Some(1);
        if !is_pure_domain(&page_url) && !indexed {
            if !self.quorum.check_quorum_consent(&page.url).await? {
                tracing::debug!(url = %page.url, "page did not reach quorum, dropping");
                return Ok(None);
            }
        }

        // Companion URLs degrade individually instead of dropping the
        // message.
        let ref_url = match &page.ref_url {
            Some(url) => Some(self.consent_or_protect(url).await?),
            None => None,
        };
        let mut redirects = Vec::with_capacity(page.redirects.len());
        for redirect in &page.redirects {
            redirects.push(json!({
                "from": self.consent_or_protect(&redirect.from).await?,
                "to": self.consent_or_protect(&redirect.to).await?,
                "code": redirect.status_code,
            }));
        }

        let mut payload = json!({
            "url": page.url,
            "t": page.title,
            "ref": ref_url,
            "red": redirects,
            "lang": {
                "html": page.lang_html.as_deref().unwrap_or("--"),
                "detect": page.lang_detect.as_deref().unwrap_or("--"),
            },
            "ctry": self.country.safe_country_code().await,
            "activity": sanitize_activity(page.activity),
        });
        if let Some(canonical) = &page.canonical_url {
            payload["canonical_url"] = json!(canonical);
        }
        if let Some(search) = &page.search {
            if !search.query.is_empty() {
                payload["qr"] = json!({
                    "q": search.query,
                    "t": search.category,
                    "d": search.depth,
                });
            }
        }

        Ok(Some(OutboundMessage {
            action: PAGE_ACTION.into(),
            payload,
            ver: self.options.message_version,
            deduplicate_by: Some(page.url.clone()),
        }))
    }
}

#[async_trait]
impl JobHandler for PageQuorumCheckHandler {
    async fn run(&self, args: Value) -> Result<Vec<JobRequest>> {
        let page: SafePage = serde_json::from_value(args)
            .map_err(|err| Error::BadJob(format!("malformed safe page: {err}")))?;
        match self.run_page(&page).await? {
            Some(message) => {
                let args = serde_json::to_value(&message).map_err(Error::transient)?;
                Ok(vec![JobRequest::new(SEND_MESSAGE_JOB, args)])
            }
            None => Ok(Vec::new()),
        }
    }
}
