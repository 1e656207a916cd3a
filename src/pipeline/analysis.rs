use crate::ai::{extract_json, GuardedAiClient};
use crate::error::PipelineError;
use crate::model::{FieldExtraction, PageResult, TargetField, TokenUsage};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Per-page and total character budgets for prompt assembly. Large pages
/// get truncated the same way oversized article content does elsewhere.
const PER_PAGE_CHAR_BUDGET: usize = 4_000;
const TOTAL_CHAR_BUDGET: usize = 24_000;
const ANSWER_MAX_TOKENS: u32 = 1_500;

/// What one analysis phase produced.
#[derive(Debug, Default)]
pub struct AnalysisOutcome {
    pub fields: Vec<FieldExtraction>,
    pub usage: TokenUsage,
    /// True when at least one call ultimately failed and its fields are lost.
    pub partial: bool,
    pub calls_made: u32,
    pub calls_failed: u32,
    pub parse_failures: u32,
}

/// Raw model output shape for field extraction.
#[derive(Deserialize, Debug)]
struct ExtractionPayload {
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Deserialize, Debug)]
struct RawField {
    name: String,
    value: serde_json::Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    source_urls: Vec<String>,
}

/// Synthesizes structured company fields from extracted page text via the
/// guarded AI client. Designed so that no single model failure can abort
/// the job: failed calls lose only their own fields.
pub struct AiAnalyzer<'a> {
    ai: &'a GuardedAiClient,
}

impl<'a> AiAnalyzer<'a> {
    pub fn new(ai: &'a GuardedAiClient) -> Self {
        Self { ai }
    }

    /// Run the analysis phase: one main pass over the aggregated text, and
    /// one targeted follow-up if requested fields are still missing.
    #[tracing::instrument(skip_all, fields(pages = pages.len(), requested = requested.len()))]
    pub async fn analyze(
        &self,
        company_name: &str,
        pages: &[PageResult],
        requested: &[TargetField],
    ) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome::default();

        let corpus = assemble_corpus(pages);
        if corpus.is_empty() {
            tracing::warn!("no successfully extracted pages, skipping AI analysis");
            return outcome;
        }
        let known_urls: HashSet<&str> = pages
            .iter()
            .filter(|p| p.is_success())
            .map(|p| p.url.as_str())
            .collect();

        let prompt = extraction_prompt(company_name, requested, &corpus);
        self.run_call(&prompt, requested, &known_urls, &mut outcome)
            .await;

        // One follow-up for whatever the first pass left empty.
        let found: HashSet<TargetField> = outcome.fields.iter().map(|f| f.field).collect();
        let still_missing: Vec<TargetField> = requested
            .iter()
            .copied()
            .filter(|f| !found.contains(f))
            .collect();
        if !still_missing.is_empty() && !outcome.partial {
            tracing::info!(missing = still_missing.len(), "running targeted follow-up call");
            let prompt = extraction_prompt(company_name, &still_missing, &corpus);
            self.run_call(&prompt, &still_missing, &known_urls, &mut outcome)
                .await;
        }

        dedup_best(&mut outcome.fields);
        outcome
    }

    /// Issue one extraction call and fold its result into `outcome`.
    async fn run_call(
        &self,
        prompt: &str,
        requested: &[TargetField],
        known_urls: &HashSet<&str>,
        outcome: &mut AnalysisOutcome,
    ) {
        outcome.calls_made += 1;
        match self.ai.complete(prompt, ANSWER_MAX_TOKENS).await {
            Ok(completion) => {
                outcome.usage.add(completion.usage);
                match extract_json::<ExtractionPayload>(&completion.text) {
                    Ok(payload) => {
                        let accepted = validate_fields(payload, requested, known_urls);
                        tracing::info!(fields = accepted.len(), "extraction call parsed");
                        outcome.fields.extend(accepted);
                    }
                    Err(e) => {
                        // A malformed response degrades to an empty
                        // extraction for this call, never an abort.
                        tracing::warn!("model response unparseable: {}", e);
                        outcome.parse_failures += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("extraction call failed after retries: {}", e);
                outcome.calls_failed += 1;
                outcome.partial = true;
                if let PipelineError::CircuitOpen { retry_after } = e {
                    tracing::warn!(
                        retry_after_secs = retry_after.as_secs(),
                        "AI circuit open, keeping fields extracted so far"
                    );
                }
            }
        }
    }
}

/// Concatenate successful page text with per-source markers, under the
/// prompt budget. Pages arrive in selection order, so the most promising
/// sources survive truncation.
fn assemble_corpus(pages: &[PageResult]) -> String {
    let mut corpus = String::new();
    for page in pages.iter().filter(|p| p.is_success()) {
        if corpus.len() >= TOTAL_CHAR_BUDGET {
            break;
        }
        let text: &str = if page.text.len() > PER_PAGE_CHAR_BUDGET {
            let mut end = PER_PAGE_CHAR_BUDGET;
            while !page.text.is_char_boundary(end) {
                end -= 1;
            }
            &page.text[..end]
        } else {
            &page.text
        };
        let remaining = TOTAL_CHAR_BUDGET - corpus.len();
        let mut chunk = format!("=== SOURCE: {} ===\n{}\n\n", page.url, text);
        if chunk.len() > remaining {
            let mut end = remaining;
            while end > 0 && !chunk.is_char_boundary(end) {
                end -= 1;
            }
            chunk.truncate(end);
        }
        corpus.push_str(&chunk);
    }
    corpus
}

fn extraction_prompt(company_name: &str, fields: &[TargetField], corpus: &str) -> String {
    let field_list = fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are extracting facts about the company \"{company_name}\" from text gathered \
         off its website. Each section below is labeled with the page it came from.\n\n\
         Extract these fields: {field_list}.\n\n\
         Respond with ONLY this JSON shape:\n\
         {{\"fields\": [{{\"name\": \"<field>\", \"value\": \"<value>\", \"confidence\": <0..1>, \
         \"source_urls\": [\"<page the value was read from>\"]}}]}}\n\n\
         Rules: omit fields the text does not support rather than guessing; \
         cite only the SOURCE urls given below; if you are inferring a value from general \
         knowledge rather than the text, use an empty source_urls array.\n\n{corpus}"
    )
}

/// Keep only fields that were requested, carry a usable value, and cite
/// real page URLs. Values inferred without a valid citation are kept but
/// flagged.
fn validate_fields(
    payload: ExtractionPayload,
    requested: &[TargetField],
    known_urls: &HashSet<&str>,
) -> Vec<FieldExtraction> {
    let requested: HashSet<TargetField> = requested.iter().copied().collect();
    let mut accepted = Vec::new();

    for raw in payload.fields {
        let Some(field) = TargetField::from_name(raw.name.trim()) else {
            tracing::debug!("dropping unknown field name {:?}", raw.name);
            continue;
        };
        if !requested.contains(&field) {
            continue;
        }
        let value = match &raw.value {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        };
        if value.is_empty() || value.eq_ignore_ascii_case("unknown") {
            continue;
        }

        let source_urls: Vec<String> = raw
            .source_urls
            .into_iter()
            .filter(|u| known_urls.contains(u.as_str()))
            .collect();
        let inferred = source_urls.is_empty();

        accepted.push(FieldExtraction {
            field,
            value,
            confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            source_urls,
            inferred,
        });
    }
    accepted
}

/// Collapse duplicate field entries, keeping the highest-confidence value
/// and preferring cited values over inferred ones.
fn dedup_best(fields: &mut Vec<FieldExtraction>) {
    let mut best: HashMap<TargetField, FieldExtraction> = HashMap::new();
    for extraction in fields.drain(..) {
        match best.get(&extraction.field) {
            Some(existing) => {
                let existing_rank = (!existing.inferred, existing.confidence);
                let candidate_rank = (!extraction.inferred, extraction.confidence);
                if candidate_rank > existing_rank {
                    best.insert(extraction.field, extraction);
                }
            }
            None => {
                best.insert(extraction.field, extraction);
            }
        }
    }
    let mut merged: Vec<FieldExtraction> = best.into_values().collect();
    merged.sort_by_key(|f| f.field);
    *fields = merged;
}
