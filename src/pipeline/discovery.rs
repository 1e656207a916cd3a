use crate::config::ResearchConfig;
use crate::error::PipelineError;
use crate::model::{CandidateUrl, DiscoverySource};
use reqwest::Client;
use select::document::Document;
use select::predicate::Name;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::time::Duration;
use texting_robots::Robot;
use url::Url;

/// Paths worth fetching for company facts regardless of whether discovery
/// surfaces them.
const SEED_PATHS: &[&str] = &[
    "/about",
    "/about-us",
    "/company",
    "/team",
    "/contact",
    "/products",
    "/services",
    "/careers",
    "/blog",
];

/// File extensions that never contain extractable prose.
const BINARY_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".zip", ".gz", ".tar",
    ".mp4", ".mp3", ".webm", ".avi", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".css",
    ".js", ".json", ".xml", ".rss", ".woff", ".woff2", ".ttf", ".eot", ".exe", ".dmg",
];

/// Gathers candidate URLs for one origin: robots/sitemap first, then a
/// shallow same-origin link crawl, plus the fixed seed paths.
pub struct LinkDiscoverer {
    client: Client,
    max_candidates: usize,
    link_depth: usize,
    link_page_cap: usize,
}

impl LinkDiscoverer {
    pub fn new(client: Client, config: &ResearchConfig) -> Self {
        Self {
            client,
            max_candidates: config.max_candidates,
            link_depth: config.link_depth,
            link_page_cap: config.link_page_cap,
        }
    }

    /// Discover a deduplicated candidate set for `base_url`.
    ///
    /// Sitemap failures fall back silently to link following; an origin
    /// with neither a reachable homepage nor any sitemap is fatal.
    #[tracing::instrument(skip(self), fields(base_url = %base_url))]
    pub async fn discover(&self, base_url: &Url) -> Result<Vec<CandidateUrl>, PipelineError> {
        let origin = base_url
            .host_str()
            .ok_or_else(|| PipelineError::FatalDiscovery(format!("no host in {}", base_url)))?
            .to_string();

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates: Vec<CandidateUrl> = Vec::new();
        let mut push = |url: String, source: DiscoverySource,
                        seen: &mut HashSet<String>,
                        candidates: &mut Vec<CandidateUrl>| {
            if candidates.len() < self.max_candidates && seen.insert(url.clone()) {
                candidates.push(CandidateUrl::new(url, source));
            }
        };

        // Seed paths first so the cap can never squeeze them out.
        for path in SEED_PATHS {
            if let Ok(u) = base_url.join(path) {
                push(normalize(&u), DiscoverySource::Seed, &mut seen, &mut candidates);
            }
        }
        push(
            normalize(base_url),
            DiscoverySource::Seed,
            &mut seen,
            &mut candidates,
        );

        // 1. Sitemaps, via robots.txt first, then common locations.
        let mut sitemap_found = false;
        match self.find_sitemaps(base_url).await {
            Ok((sitemap_urls, from_robots)) if !sitemap_urls.is_empty() => {
                let source = if from_robots {
                    DiscoverySource::Robots
                } else {
                    DiscoverySource::Sitemap
                };
                let page_urls = self.collect_sitemap_urls(&sitemap_urls).await;
                sitemap_found = !page_urls.is_empty();
                for page_url in page_urls {
                    if let Some(url) = accept(&page_url, &origin) {
                        push(url, source, &mut seen, &mut candidates);
                    }
                }
            }
            Ok(_) => {
                tracing::info!("No sitemap found for {}, relying on link crawl", base_url);
            }
            Err(e) => {
                // Non-fatal by contract; the link crawl decides reachability.
                tracing::warn!("Sitemap discovery failed for {}: {}", base_url, e);
            }
        }

        // 2. Same-origin link following from the homepage.
        match self.follow_links(base_url, &origin).await {
            Ok(linked) => {
                for url in linked {
                    push(url, DiscoverySource::Link, &mut seen, &mut candidates);
                }
            }
            Err(e) => {
                if !sitemap_found {
                    return Err(PipelineError::FatalDiscovery(format!(
                        "origin unreachable: {}",
                        e
                    )));
                }
                tracing::warn!(
                    "Homepage crawl failed for {} but sitemap succeeded, continuing: {}",
                    base_url,
                    e
                );
            }
        }

        tracing::info!(
            count = candidates.len(),
            sitemap_found,
            "link discovery finished"
        );
        Ok(candidates)
    }

    /// Locate sitemap URLs for a site: robots.txt listings, then guessed
    /// common locations. Returns `(urls, found_via_robots)`.
    #[tracing::instrument(skip(self, base_url))]
    async fn find_sitemaps(&self, base_url: &Url) -> Result<(Vec<String>, bool), PipelineError> {
        let robots_url = base_url
            .join("/robots.txt")
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        tracing::debug!("Attempting to fetch robots.txt from: {}", robots_url);

        match self.get(robots_url.as_str()).await {
            Ok(content) => match Robot::new("*", content.as_bytes()) {
                Ok(robot) => {
                    if !robot.sitemaps.is_empty() {
                        tracing::info!("Found {} sitemap(s) in robots.txt", robot.sitemaps.len());
                        return Ok((robot.sitemaps.clone(), true));
                    }
                    tracing::debug!("No sitemaps listed in robots.txt");
                }
                Err(e) => {
                    tracing::warn!("Failed to parse robots.txt ({}): {}", robots_url, e);
                }
            },
            Err(e) => {
                tracing::debug!("robots.txt not available ({}): {}", robots_url, e);
            }
        }

        // Fall back to guessing common locations.
        for guess in ["/sitemap.xml", "/sitemap_index.xml", "/sitemap/sitemap.xml"] {
            let url = match base_url.join(guess) {
                Ok(u) => u,
                Err(_) => continue,
            };
            match self
                .client
                .head(url.as_str())
                .timeout(Duration::from_secs(10))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("Found sitemap by guessing: {}", url);
                    return Ok((vec![url.to_string()], false));
                }
                Ok(response) => {
                    tracing::debug!("Guess failed for {}: Status {}", url, response.status());
                }
                Err(e) => {
                    tracing::debug!("Error checking guess {}: {}", url, e);
                }
            }
        }

        Ok((Vec::new(), false))
    }

    /// Drain a sitemap queue, following nested sitemap indexes, until the
    /// candidate cap is covered. Individual sitemap failures are skipped.
    #[tracing::instrument(skip(self, initial))]
    async fn collect_sitemap_urls(&self, initial: &[String]) -> Vec<String> {
        let mut page_urls: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = initial.iter().cloned().collect();
        let mut processed: HashSet<String> = HashSet::new();

        while let Some(sitemap_url) = queue.pop_front() {
            if page_urls.len() >= self.max_candidates {
                break;
            }
            if !processed.insert(sitemap_url.clone()) {
                continue;
            }
            tracing::debug!("Processing sitemap: {}", sitemap_url);

            let content = match self.get(&sitemap_url).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("Failed to fetch sitemap {}: {}", sitemap_url, e);
                    continue;
                }
            };

            let cursor = Cursor::new(content.into_bytes());
            for entity in SiteMapReader::new(cursor) {
                match entity {
                    SiteMapEntity::Url(url_entry) => {
                        if let Some(loc) = url_entry.loc.get_url() {
                            page_urls.push(loc.to_string());
                        }
                    }
                    SiteMapEntity::SiteMap(sitemap_entry) => {
                        if let Some(nested) = sitemap_entry.loc.get_url() {
                            let nested = nested.to_string();
                            if !processed.contains(&nested) {
                                tracing::debug!("Found nested sitemap, queueing: {}", nested);
                                queue.push_back(nested);
                            }
                        }
                    }
                    SiteMapEntity::Err(error) => {
                        tracing::warn!("Error parsing entity in {}: {}", sitemap_url, error);
                    }
                }
            }
        }

        tracing::info!("Collected {} page URLs from sitemap(s)", page_urls.len());
        page_urls
    }

    /// Breadth-first same-origin `<a href>` crawl from the homepage, up to
    /// `link_depth` with a page cap. Errors only if the homepage itself is
    /// unreachable.
    #[tracing::instrument(skip(self, base_url, origin))]
    async fn follow_links(
        &self,
        base_url: &Url,
        origin: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let mut found: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
        queue.push_back((base_url.clone(), 0));

        let mut fetched = 0usize;
        while let Some((page_url, depth)) = queue.pop_front() {
            if fetched >= self.link_page_cap {
                break;
            }
            if !visited.insert(normalize(&page_url)) {
                continue;
            }

            let html = match self.get(page_url.as_str()).await {
                Ok(body) => body,
                Err(e) => {
                    if fetched == 0 {
                        // Nothing fetched yet and the homepage failed.
                        return Err(e);
                    }
                    tracing::debug!("Skipping unfetchable page {}: {}", page_url, e);
                    continue;
                }
            };
            fetched += 1;

            let links = same_origin_links(&html, &page_url, origin);
            for link in links {
                if found.len() >= self.max_candidates {
                    break;
                }
                found.push(link.clone());
                if depth + 1 <= self.link_depth {
                    if let Ok(parsed) = Url::parse(&link) {
                        if !visited.contains(&normalize(&parsed)) {
                            queue.push_back((parsed, depth + 1));
                        }
                    }
                }
            }
        }

        tracing::info!(
            pages_visited = fetched,
            links_found = found.len(),
            "link crawl finished"
        );
        Ok(found)
    }

    async fn get(&self, url: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::TransientNetwork(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }
        response
            .text()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))
    }
}

/// Parse `<a href>` links out of a page, keeping only same-origin HTML ones.
fn same_origin_links(html: &str, page_url: &Url, origin: &str) -> Vec<String> {
    let document = match Document::from_read(html.as_bytes()) {
        Ok(doc) => doc,
        Err(_) => return Vec::new(),
    };

    let mut links = Vec::new();
    for node in document.find(Name("a")) {
        let Some(href) = node.attr("href") else {
            continue;
        };
        if let Some(url) = resolve(href, page_url) {
            if let Some(accepted) = accept(url.as_str(), origin) {
                links.push(accepted);
            }
        }
    }
    links
}

fn resolve(href: &str, page_url: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    page_url.join(href).ok()
}

/// Filter to same-origin, fetchable, prose-bearing URLs; returns the
/// normalized form.
fn accept(raw: &str, origin: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        // mailto:, tel:, javascript:, ftp:, data: all land here.
        _ => return None,
    }
    if url.host_str() != Some(origin) {
        return None;
    }
    let path = url.path().to_lowercase();
    if BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return None;
    }
    Some(normalize(&url))
}

/// Canonical form used for dedup: no fragment, no trailing slash.
fn normalize(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let normalized = url.to_string();
    if normalized.ends_with('/') && url.path() != "/" {
        normalized.trim_end_matches('/').to_string()
    } else {
        normalized
    }
}
