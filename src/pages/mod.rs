// Page pipeline data model
//
// A `PageObservation` is the tab snapshot delivered by the (out of
// scope) observer; a `SafePage` is what survives doublefetch and feeds
// the quorum check. Invariants are enforced before a page may enter the
// quorum phase.

pub mod doublefetch;
pub mod quorum_check;
pub mod structure;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Redirect chains are cut off here; the sentinel marks the cut.
pub const REDIRECT_CHAIN_LIMIT: usize = 8;
/// Sentinel `to` value of a truncated redirect chain.
pub const REDIRECT_TRUNCATED: &str = "...";
/// Search results (0), landing pages (1) and one click inside (2);
/// deeper observations are dropped at intake.
pub const MAX_SEARCH_DEPTH: u8 = 2;

/// Snapshot of one tab at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageObservation {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_doublefetch: Option<PreDoublefetch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<Redirect>,
    /// Prior URL, if any.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_url: Option<String>,
    /// Score from the activity estimator, in [0,1].
    #[serde(default)]
    pub activity: f64,
    /// Detected language code, `--` when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

/// Structure extracted from the live DOM before the anonymous re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreDoublefetch {
    pub title: String,
    pub meta: PageMeta,
    /// `<meta name="robots" content="index">` was present.
    pub requested_index: bool,
    pub noindex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// How the page relates to a search engine visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchInfo {
    /// Engine code, carried opaque (e.g. `go`, `bi`, `dd`).
    pub category: String,
    pub query: String,
    /// 0 = results page, 1 = landing page, 2 = one click inside.
    pub depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Redirect {
    pub from: String,
    pub to: String,
    pub status_code: u16,
}

impl PageObservation {
    /// Enforce the intake invariants. Violations are permanent.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|err| Error::BadJob(format!("unparseable page url: {err}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::BadJob("page url scheme not http(s)".into()));
        }
        if self.title.trim().is_empty() {
            return Err(Error::BadJob("page title empty".into()));
        }
        if let Some(pre) = &self.pre_doublefetch {
            if pre.noindex {
                return Err(Error::BadJob("page marked noindex".into()));
            }
            if pre.title.trim().is_empty() {
                return Err(Error::BadJob("pre-doublefetch title empty".into()));
            }
        }
        if self.redirects.len() > REDIRECT_CHAIN_LIMIT {
            return Err(Error::BadJob("redirect chain too long".into()));
        }
        if let Some(search) = &self.search {
            if search.depth > MAX_SEARCH_DEPTH {
                return Err(Error::BadJob("search depth beyond limit".into()));
            }
        }
        Ok(())
    }

    /// Cap the redirect chain, replacing the cut tail with the sentinel.
    pub fn truncate_redirect_chain(&mut self) {
        if self.redirects.len() > REDIRECT_CHAIN_LIMIT {
            self.redirects.truncate(REDIRECT_CHAIN_LIMIT);
            if let Some(last) = self.redirects.last_mut() {
                last.to = REDIRECT_TRUNCATED.to_string();
            }
        }
    }

    /// Whether the page was reached from a search results page.
    pub fn indexed_by_search_engine(&self) -> bool {
        self.search.as_ref().map(|s| s.depth) == Some(1)
    }
}

/// A page that passed doublefetch; input to the quorum check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafePage {
    /// The doublefetched URL.
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_detect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchInfo>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<Redirect>,
    pub activity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
}

/// `true` iff path is `/` with no query or fragment. Pure-domain URLs
/// are always considered public.
pub fn is_pure_domain(url: &Url) -> bool {
    url.path() == "/" && url.query().is_none() && url.fragment().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> PageObservation {
        PageObservation {
            url: "https://example.com/article".into(),
            title: "An Article".into(),
            pre_doublefetch: Some(PreDoublefetch {
                title: "An Article".into(),
                meta: PageMeta::default(),
                requested_index: false,
                noindex: false,
            }),
            search: None,
            redirects: Vec::new(),
            ref_url: None,
            activity: 0.0,
            lang: None,
        }
    }

    #[test]
    fn valid_observation_passes() {
        assert!(observation().validate().is_ok());
    }

    #[test]
    fn rejects_bad_scheme_and_empty_title() {
        let mut page = observation();
        page.url = "ftp://example.com/".into();
        assert!(page.validate().is_err());

        let mut page = observation();
        page.title = "  ".into();
        assert!(page.validate().is_err());
    }

    #[test]
    fn rejects_noindex_and_deep_search() {
        let mut page = observation();
        page.pre_doublefetch.as_mut().unwrap().noindex = true;
        assert!(page.validate().is_err());

        let mut page = observation();
        page.search = Some(SearchInfo {
            category: "go".into(),
            query: "weather".into(),
            depth: 3,
        });
        assert!(page.validate().is_err());
    }

    #[test]
    fn redirect_chain_truncates_with_sentinel() {
        let mut page = observation();
        for i in 0..12 {
            page.redirects.push(Redirect {
                from: format!("https://a.example/{i}"),
                to: format!("https://a.example/{}", i + 1),
                status_code: 301,
            });
        }
        assert!(page.validate().is_err());

        page.truncate_redirect_chain();
        assert_eq!(page.redirects.len(), REDIRECT_CHAIN_LIMIT);
        assert_eq!(page.redirects.last().unwrap().to, REDIRECT_TRUNCATED);
        assert!(page.validate().is_ok());
    }

    #[test]
    fn pure_domain_detection() {
        assert!(is_pure_domain(&Url::parse("https://example.com/").unwrap()));
        assert!(!is_pure_domain(&Url::parse("https://example.com/x").unwrap()));
        assert!(!is_pure_domain(&Url::parse("https://example.com/?q=1").unwrap()));
        assert!(!is_pure_domain(&Url::parse("https://example.com/#f").unwrap()));
    }

    #[test]
    fn observation_serde_uses_ref_field() {
        let mut page = observation();
        page.ref_url = Some("https://prev.example/".into());
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["ref"], "https://prev.example/");
        let back: PageObservation = serde_json::from_value(value).unwrap();
        assert_eq!(back, page);
    }
}
