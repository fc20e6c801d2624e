// Page structure extraction from fetched HTML
//
// Derives the second `PageStructure` that doublefetch compares against
// the pre-fetch snapshot: title, canonical link, og metas, robots
// directives and language.

use scraper::{Html, Selector};
use std::collections::HashMap;
use url::Url;

/// Structure of a fetched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageStructure {
    pub title: String,
    pub canonical_url: Option<String>,
    pub og: HashMap<String, String>,
    pub noindex: bool,
    pub requested_index: bool,
    pub language: Option<String>,
}

/// Parse the fetched document. Relative canonical links resolve against
/// `base`.
pub fn parse_page_structure(html: &str, base: &Url) -> PageStructure {
    let document = Html::parse_document(html);
    let mut structure = PageStructure::default();

    // Selectors are static and known-good.
    let title_sel = Selector::parse("title").unwrap();
    let html_sel = Selector::parse("html").unwrap();
    let canonical_sel = Selector::parse("link[rel=\"canonical\"]").unwrap();
    let meta_sel = Selector::parse("meta").unwrap();

    if let Some(title) = document.select(&title_sel).next() {
        structure.title = title.text().collect::<String>().trim().to_string();
    }

    if let Some(root) = document.select(&html_sel).next() {
        structure.language = root
            .value()
            .attr("lang")
            .map(|lang| lang.trim().to_ascii_lowercase())
            .filter(|lang| !lang.is_empty());
    }

    if let Some(link) = document.select(&canonical_sel).next() {
        structure.canonical_url = link
            .value()
            .attr("href")
            .and_then(|href| base.join(href.trim()).ok())
            .map(|url| url.to_string());
    }

    for meta in document.select(&meta_sel) {
        let element = meta.value();
        let content = element.attr("content").unwrap_or_default();
        match (element.attr("name"), element.attr("property")) {
            (Some(name), _) if name.eq_ignore_ascii_case("robots") => {
                for directive in content.split(',') {
                    match directive.trim().to_ascii_lowercase().as_str() {
                        "noindex" | "none" => structure.noindex = true,
                        "index" => structure.requested_index = true,
                        _ => {}
                    }
                }
            }
            (_, Some(property)) if property.starts_with("og:") => {
                structure
                    .og
                    .insert(property.to_string(), content.to_string());
            }
            _ => {}
        }
    }

    structure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/articles/1").unwrap()
    }

    #[test]
    fn extracts_title_canonical_and_lang() {
        let html = r#"<!doctype html>
            <html lang="DE">
            <head>
              <title>  Ein Artikel  </title>
              <link rel="canonical" href="/articles/1"/>
            </head>
            <body>text</body></html>"#;
        let structure = parse_page_structure(html, &base());
        assert_eq!(structure.title, "Ein Artikel");
        assert_eq!(
            structure.canonical_url.as_deref(),
            Some("https://example.com/articles/1")
        );
        assert_eq!(structure.language.as_deref(), Some("de"));
        assert!(!structure.noindex);
    }

    #[test]
    fn robots_directives() {
        let html = r#"<html><head>
            <meta name="robots" content="NOINDEX, nofollow">
            </head></html>"#;
        let structure = parse_page_structure(html, &base());
        assert!(structure.noindex);
        assert!(!structure.requested_index);

        let html = r#"<html><head>
            <meta name="robots" content="index, follow">
            </head></html>"#;
        let structure = parse_page_structure(html, &base());
        assert!(!structure.noindex);
        assert!(structure.requested_index);
    }

    #[test]
    fn og_properties_are_collected() {
        let html = r#"<html><head>
            <meta property="og:title" content="Shared Title">
            <meta property="og:type" content="article">
            <meta property="unrelated" content="x">
            </head></html>"#;
        let structure = parse_page_structure(html, &base());
        assert_eq!(structure.og.get("og:title").map(String::as_str), Some("Shared Title"));
        assert_eq!(structure.og.get("og:type").map(String::as_str), Some("article"));
        assert_eq!(structure.og.len(), 2);
    }

    #[test]
    fn absolute_canonical_wins_over_base() {
        let html = r#"<html><head>
            <link rel="canonical" href="https://other.example.org/a">
            </head></html>"#;
        let structure = parse_page_structure(html, &base());
        assert_eq!(
            structure.canonical_url.as_deref(),
            Some("https://other.example.org/a")
        );
    }

    #[test]
    fn missing_pieces_stay_empty() {
        let structure = parse_page_structure("<html><body>nothing</body></html>", &base());
        assert!(structure.title.is_empty());
        assert!(structure.canonical_url.is_none());
        assert!(structure.language.is_none());
        assert!(structure.og.is_empty());
    }
}
