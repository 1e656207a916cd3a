use crate::error::PipelineError;
use crate::model::ExtractionMethod;
use llm_readability::extractor;
use once_cell::sync::Lazy;
use regex::Regex;
use select::document::Document;
use select::node::Node;
use select::predicate::{Name, Predicate};
use std::collections::HashSet;
use url::Url;

/// Class/id fragments that usually wrap the content we care about.
static CONTENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(service|product|offer|solution|about|feature|company|team|mission|content|description)")
        .expect("valid regex")
});

/// Sentences containing these tend to carry company facts even on pages
/// the structural pass misses.
static KEYWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(founded|headquarter|based in|our (team|mission|company|clients|customers)|we (provide|offer|build|deliver|specialize|help)|offices? in|since \d{4}|employees)\b")
        .expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub text: String,
    pub method: ExtractionMethod,
}

/// Extract prose from raw HTML, primary tier first, structural fallback
/// second.
///
/// The fallback exists because readability-style boilerplate stripping
/// silently returns near-empty content on many real marketing sites (a few
/// hundred characters where the DOM holds thousands of characters of
/// service descriptions). Synchronous on purpose; callers run it inside
/// `spawn_blocking`.
pub fn extract_content(
    html: &str,
    url: &Url,
    sufficiency_threshold: usize,
) -> Result<ExtractedContent, PipelineError> {
    let primary = primary_extract(html, url);
    if primary.len() >= sufficiency_threshold {
        return Ok(ExtractedContent {
            text: primary,
            method: ExtractionMethod::Primary,
        });
    }
    tracing::debug!(
        url = %url,
        primary_len = primary.len(),
        "primary extraction under threshold, trying fallback"
    );

    let fallback = fallback_extract(html, sufficiency_threshold);
    if fallback.len() >= sufficiency_threshold {
        return Ok(ExtractedContent {
            text: fallback,
            method: ExtractionMethod::Fallback,
        });
    }

    Err(PipelineError::ExtractionInsufficient(
        primary.len().max(fallback.len()),
    ))
}

/// Tier 1: readability boilerplate stripping, flattened to plain text.
fn primary_extract(html: &str, url: &Url) -> String {
    match extractor::extract(&mut html.as_bytes(), url) {
        Ok(product) => {
            let text = html2text::from_read(product.content.as_bytes(), 200).unwrap_or_default();
            normalize_whitespace(&text)
        }
        Err(e) => {
            tracing::debug!("readability extraction failed: {}", e);
            String::new()
        }
    }
}

/// Tier 2: structural DOM heuristics, applied progressively until the
/// accumulated text clears the threshold.
fn fallback_extract(html: &str, sufficiency_threshold: usize) -> String {
    let document = match Document::from_read(html.as_bytes()) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!("failed to parse HTML for fallback extraction: {}", e);
            return String::new();
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut blocks: Vec<String> = Vec::new();

    let mut push_block = |text: String, blocks: &mut Vec<String>, seen: &mut HashSet<String>| {
        let text = normalize_whitespace(&text);
        if text.len() >= 40 && seen.insert(text.clone()) {
            blocks.push(text);
        }
    };
    let total = |blocks: &[String]| blocks.iter().map(|b| b.len()).sum::<usize>();

    // Pass 1: semantic containers.
    for node in document.find(Name("main").or(Name("article"))) {
        push_block(node.text(), &mut blocks, &mut seen);
    }
    for node in document.find(Name("section")) {
        if !in_page_chrome(&node) {
            push_block(node.text(), &mut blocks, &mut seen);
        }
    }

    // Pass 2: divs whose class/id look like content blocks.
    if total(&blocks) < sufficiency_threshold {
        for node in document.find(Name("div")) {
            let labeled = node
                .attr("class")
                .into_iter()
                .chain(node.attr("id"))
                .any(|value| CONTENT_PATTERN.is_match(value));
            if labeled && !in_page_chrome(&node) {
                push_block(node.text(), &mut blocks, &mut seen);
            }
        }
    }

    // Pass 3: bare paragraphs, headings, list items.
    if total(&blocks) < sufficiency_threshold {
        for node in document.find(
            Name("p")
                .or(Name("h1"))
                .or(Name("h2"))
                .or(Name("h3"))
                .or(Name("li")),
        ) {
            if !in_page_chrome(&node) {
                push_block(node.text(), &mut blocks, &mut seen);
            }
        }
    }

    // Pass 4: keyword sentences from the whole body, last resort.
    if total(&blocks) < sufficiency_threshold {
        if let Some(body) = document.find(Name("body")).next() {
            let body_text = normalize_whitespace(&body.text());
            for sentence in body_text.split_inclusive(['.', '!', '?']) {
                if KEYWORD_PATTERN.is_match(sentence) {
                    push_block(sentence.to_string(), &mut blocks, &mut seen);
                }
            }
        }
    }

    blocks.join("\n")
}

/// True when the node sits inside navigation, footer or other page chrome
/// (including script/style, which `select` otherwise surfaces as text).
fn in_page_chrome(node: &Node) -> bool {
    let mut current = Some(*node);
    while let Some(n) = current {
        if let Some(name) = n.name() {
            if matches!(
                name,
                "nav" | "footer" | "aside" | "header" | "script" | "style" | "noscript" | "form"
            ) {
                return true;
            }
        }
        current = n.parent();
    }
    false
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_blank = true;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            last_blank = true;
            continue;
        }
        if !last_blank {
            out.push(' ');
        } else if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line.split_whitespace().collect::<Vec<_>>().join(" "));
        last_blank = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://acme.example/about").unwrap()
    }

    /// A page whose real content sits in service-card divs that readability
    /// cannot see as an article.
    fn service_grid_html() -> String {
        let mut cards = String::new();
        for i in 0..12 {
            cards.push_str(&format!(
                r#"<div class="service-card"><h3>Service {i}</h3>
                <span>We provide tailored consulting and implementation for workflow number {i},
                covering discovery, rollout and long-term support for mid-size manufacturers.</span></div>"#
            ));
        }
        format!(
            r#"<html><head><title>Acme Services</title></head><body>
            <nav><a href="/">Home</a><a href="/about">About</a></nav>
            <div class="services">{cards}</div>
            <footer>© Acme Inc. All rights reserved.</footer>
            </body></html>"#
        )
    }

    #[test]
    fn article_page_uses_primary_extraction() {
        let paragraph = "Acme was founded in 1998 in Rotterdam and has grown into a \
            specialist supplier of industrial valves, serving shipyards and refineries \
            across Europe with a team of two hundred engineers and technicians. "
            .repeat(4);
        let html = format!(
            "<html><body><article><h1>About Acme</h1><p>{}</p></article></body></html>",
            paragraph
        );
        let result = extract_content(&html, &url(), 300).expect("sufficient");
        assert_eq!(result.method, ExtractionMethod::Primary);
        assert!(result.text.contains("founded in 1998"));
    }

    #[test]
    fn service_grid_falls_back_to_dom_heuristics() {
        let html = service_grid_html();
        // Readability picks up a share of the card text on this fixture, so
        // pin the threshold just past its yield; the structural pass sees
        // both the grid wrapper and each card and clears it comfortably.
        let threshold = primary_extract(&html, &url()).len() + 1;
        let result = extract_content(&html, &url(), threshold).expect("fallback finds it");
        assert_eq!(result.method, ExtractionMethod::Fallback);
        assert!(result.text.len() >= threshold);
        assert!(result.text.contains("tailored consulting"));
        // Navigation and footer chrome must not leak into the prose.
        assert!(!result.text.contains("All rights reserved"));
    }

    #[test]
    fn boilerplate_only_page_is_insufficient() {
        let html = "<html><body><nav>Home</nav><footer>© Acme</footer></body></html>";
        let err = extract_content(html, &url(), 300).expect_err("nothing to extract");
        assert!(matches!(err, PipelineError::ExtractionInsufficient(_)));
    }

    #[test]
    fn keyword_sentences_are_harvested_when_structure_is_flat() {
        let filler = "Lorem ipsum dolor sit amet. ".repeat(10);
        let html = format!(
            "<html><body><span>{filler} Acme was founded in 2004 and is based in Oslo, \
             where we provide maritime logistics software to over three hundred customers. \
             {filler} Our team of forty employees operates offices in Oslo and Bergen, \
             and we specialize in cold-chain tracking for fishing fleets. {filler}</span></body></html>"
        );
        let text = fallback_extract(&html, 100_000);
        assert!(text.contains("founded in 2004"));
        assert!(!text.contains("Lorem ipsum"));
    }

}
