use crate::ai::{extract_json, GuardedAiClient};
use crate::model::{CandidateUrl, DiscoverySource, TargetField};
use std::collections::HashSet;
use url::Url;

/// Path patterns with the fields a matching page is likely to satisfy.
/// Weights are relative; only patterns that can still fill a missing field
/// contribute to the score.
const PATH_RULES: &[(&[&str], f64, &[TargetField])] = &[
    (
        &["about", "company", "who-we-are", "our-story", "history"],
        5.0,
        &[
            TargetField::FoundingYear,
            TargetField::Location,
            TargetField::Industry,
            TargetField::Description,
        ],
    ),
    (
        &["team", "leadership", "people", "founders", "management"],
        5.0,
        &[TargetField::Leadership, TargetField::CompanySize],
    ),
    (
        &["contact", "locations", "offices"],
        4.0,
        &[TargetField::Location, TargetField::SocialLinks],
    ),
    (
        &["product", "service", "solution", "platform", "offering"],
        4.0,
        &[TargetField::Products, TargetField::Industry],
    ),
    (
        &["career", "jobs", "join"],
        2.0,
        &[TargetField::CompanySize, TargetField::Location],
    ),
    (
        &["press", "news", "media", "milestones"],
        2.5,
        &[TargetField::FoundingYear, TargetField::Description],
    ),
];

const HOMEPAGE_WEIGHT: f64 = 3.5;
const DEPTH_PENALTY: f64 = 0.6;
const SITEMAP_BONUS: f64 = 0.2;

/// Ranks candidate URLs against the fields still missing and returns the
/// ordered subset worth fetching.
pub struct PageSelector {
    max_pages: usize,
}

impl PageSelector {
    pub fn new(max_pages: usize) -> Self {
        Self { max_pages }
    }

    /// Deterministic heuristic ranking. Mutates candidate scores and
    /// likely-field tags in place, then returns the top slice.
    #[tracing::instrument(skip(self, candidates, missing), fields(candidates = candidates.len()))]
    pub fn rank(
        &self,
        mut candidates: Vec<CandidateUrl>,
        missing: &[TargetField],
    ) -> Vec<CandidateUrl> {
        let missing: HashSet<TargetField> = missing.iter().copied().collect();

        for candidate in &mut candidates {
            let (score, fields) = score_url(&candidate.url, candidate.source, &missing);
            candidate.score = score;
            candidate.likely_fields = fields;
        }

        // Stable order for equal scores keeps reruns byte-identical.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.url.cmp(&b.url))
        });
        candidates.truncate(self.max_pages);
        candidates
    }

    /// Optional AI pass over the heuristic ranking. Strictly additive: any
    /// validation failure leaves the heuristic order untouched.
    #[tracing::instrument(skip(self, ai, ranked, missing))]
    pub async fn ai_rerank(
        &self,
        ai: &GuardedAiClient,
        ranked: Vec<CandidateUrl>,
        missing: &[TargetField],
    ) -> Vec<CandidateUrl> {
        if ranked.len() < 3 {
            return ranked;
        }

        let url_list = ranked
            .iter()
            .map(|c| format!("- {}", c.url))
            .collect::<Vec<_>>()
            .join("\n");
        let field_list = missing
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "You are selecting which pages of a company website to read in order to find: {field_list}.\n\
             Reorder the following URLs from most to least promising and drop any that are \
             clearly useless for those facts. Respond with ONLY a JSON array of URL strings \
             taken verbatim from the list. Do not invent URLs.\n\n{url_list}"
        );

        let response = match ai.complete(&prompt, 1000).await {
            Ok(completion) => completion.text,
            Err(e) => {
                tracing::info!("AI re-rank unavailable, keeping heuristic order: {}", e);
                return ranked;
            }
        };

        match validate_rerank(&response, &ranked) {
            Some(reordered) => {
                tracing::info!(
                    kept = reordered.len(),
                    dropped = ranked.len() - reordered.len(),
                    "AI re-rank accepted"
                );
                reordered
            }
            None => {
                tracing::warn!("AI re-rank response failed validation, keeping heuristic order");
                ranked
            }
        }
    }
}

/// Accept the model's ordering only if it is a JSON array of strings and
/// every entry names a URL from the candidate set. Anything else rejects
/// the whole response: a hallucinated URL must not displace a real one.
fn validate_rerank(response: &str, ranked: &[CandidateUrl]) -> Option<Vec<CandidateUrl>> {
    let urls: Vec<String> = extract_json(response).ok()?;
    if urls.is_empty() {
        return None;
    }

    let known: HashSet<&str> = ranked.iter().map(|c| c.url.as_str()).collect();
    if urls.iter().any(|u| !known.contains(u.as_str())) {
        return None;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut reordered = Vec::with_capacity(urls.len());
    for url in &urls {
        if seen.insert(url.as_str()) {
            if let Some(candidate) = ranked.iter().find(|c| c.url == *url) {
                reordered.push(candidate.clone());
            }
        }
    }
    Some(reordered)
}

fn score_url(
    url: &str,
    source: DiscoverySource,
    missing: &HashSet<TargetField>,
) -> (f64, Vec<TargetField>) {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return (0.0, Vec::new()),
    };
    let path = parsed.path().to_lowercase();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut score = 0.0;
    let mut fields: Vec<TargetField> = Vec::new();

    if segments.is_empty() {
        // Homepage: a little of everything.
        score += HOMEPAGE_WEIGHT;
        fields.extend(missing.iter().copied());
    }

    for (needles, weight, rule_fields) in PATH_RULES {
        let hit = needles.iter().any(|needle| path.contains(needle));
        if !hit {
            continue;
        }
        let satisfiable: Vec<TargetField> = rule_fields
            .iter()
            .copied()
            .filter(|f| missing.contains(f))
            .collect();
        if satisfiable.is_empty() {
            continue;
        }
        score += weight;
        for field in satisfiable {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
    }

    if segments.len() > 1 {
        score -= DEPTH_PENALTY * (segments.len() - 1) as f64;
    }
    if matches!(source, DiscoverySource::Sitemap | DiscoverySource::Robots) {
        score += SITEMAP_BONUS;
    }

    fields.sort();
    (score, fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscoverySource;

    fn candidate(url: &str, source: DiscoverySource) -> CandidateUrl {
        CandidateUrl::new(url, source)
    }

    fn all_missing() -> Vec<TargetField> {
        TargetField::all()
    }

    #[test]
    fn about_outranks_deep_blog_posts() {
        let selector = PageSelector::new(10);
        let ranked = selector.rank(
            vec![
                candidate(
                    "https://acme.example/blog/2024/03/some-long-post",
                    DiscoverySource::Sitemap,
                ),
                candidate("https://acme.example/about", DiscoverySource::Seed),
                candidate("https://acme.example/team", DiscoverySource::Link),
            ],
            &all_missing(),
        );
        assert_eq!(ranked[0].url, "https://acme.example/about");
        assert!(ranked[0]
            .likely_fields
            .contains(&TargetField::FoundingYear));
    }

    #[test]
    fn patterns_for_already_found_fields_do_not_score() {
        let selector = PageSelector::new(10);
        // Leadership already extracted: /team has nothing left to offer.
        let missing = vec![TargetField::Products];
        let ranked = selector.rank(
            vec![
                candidate("https://acme.example/team", DiscoverySource::Link),
                candidate("https://acme.example/services", DiscoverySource::Link),
            ],
            &missing,
        );
        assert_eq!(ranked[0].url, "https://acme.example/services");
        assert!(ranked[1].likely_fields.is_empty());
    }

    #[test]
    fn ranking_is_deterministic_for_equal_scores() {
        let selector = PageSelector::new(10);
        let a = vec![
            candidate("https://acme.example/x", DiscoverySource::Link),
            candidate("https://acme.example/y", DiscoverySource::Link),
        ];
        let b = vec![
            candidate("https://acme.example/y", DiscoverySource::Link),
            candidate("https://acme.example/x", DiscoverySource::Link),
        ];
        let ranked_a = selector.rank(a, &all_missing());
        let ranked_b = selector.rank(b, &all_missing());
        let urls_a: Vec<_> = ranked_a.iter().map(|c| c.url.as_str()).collect();
        let urls_b: Vec<_> = ranked_b.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls_a, urls_b);
    }

    #[test]
    fn cap_is_enforced() {
        let selector = PageSelector::new(2);
        let ranked = selector.rank(
            vec![
                candidate("https://acme.example/about", DiscoverySource::Seed),
                candidate("https://acme.example/team", DiscoverySource::Seed),
                candidate("https://acme.example/contact", DiscoverySource::Seed),
            ],
            &all_missing(),
        );
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn rerank_rejects_urls_outside_candidate_set() {
        let ranked = vec![
            candidate("https://acme.example/about", DiscoverySource::Seed),
            candidate("https://acme.example/team", DiscoverySource::Seed),
            candidate("https://acme.example/blog", DiscoverySource::Link),
        ];
        // One invented URL poisons the whole response.
        let response = r#"["https://acme.example/team", "https://evil.example/phish"]"#;
        assert!(validate_rerank(response, &ranked).is_none());

        let response = "The best order is probably about, then team.";
        assert!(validate_rerank(response, &ranked).is_none());
    }

    #[test]
    fn rerank_accepts_valid_reorder_and_prune() {
        let ranked = vec![
            candidate("https://acme.example/about", DiscoverySource::Seed),
            candidate("https://acme.example/team", DiscoverySource::Seed),
            candidate("https://acme.example/blog", DiscoverySource::Link),
        ];
        let response = r#"```json
["https://acme.example/team", "https://acme.example/about"]
```"#;
        let reordered = validate_rerank(response, &ranked).expect("valid");
        assert_eq!(reordered.len(), 2);
        assert_eq!(reordered[0].url, "https://acme.example/team");
    }
}
