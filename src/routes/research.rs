use crate::error::ApiError;
use crate::model::{JobStatus, Phase, PhaseRecord, ResearchJob, TargetField};
use crate::pipeline::Orchestrator;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

/// Request to start a research job. At least one of `company_name` and
/// `website_url` must be present; with only a name, the seed URL is
/// resolved by probing common domains for it.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ResearchRequest {
    /// Company name, used for domain discovery and in prompts
    #[serde(default)]
    pub company_name: Option<String>,
    /// Website URL to research; scheme defaults to https
    #[serde(default)]
    pub website_url: Option<String>,
    /// Subset of fields to extract (default: all)
    #[serde(default)]
    pub fields: Option<Vec<TargetField>>,
    /// Per-job overrides of the pipeline configuration
    #[serde(default)]
    pub config: Option<crate::config::ResearchConfig>,
}

/// Response for an accepted research job
#[derive(Debug, Serialize, ToSchema)]
pub struct ResearchAcceptedResponse {
    /// Identifier to poll progress and fetch the result with
    pub job_id: Uuid,
    /// Seed URL the job will research
    pub website_url: String,
}

/// Point-in-time view of a job's progress
#[derive(Debug, Serialize, ToSchema)]
pub struct ProgressResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Current (or last) phase, if any has started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Rough 0-100 progress indicator
    pub percent: u8,
    pub message: String,
    pub phases: Vec<PhaseRecord>,
}

impl ProgressResponse {
    fn from_job(job: &ResearchJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            phase: job.current_phase(),
            percent: job.progress_percent(),
            message: job.message.clone(),
            phases: job.phases.clone(),
        }
    }
}

/// Terminal answer for a finished job
#[derive(Debug, Serialize, ToSchema)]
pub struct ResultResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present for completed jobs, and for failed/cancelled ones that
    /// gathered partial results before stopping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::model::CompanyIntelligence>,
}

/// Start a research job for a company
#[utoipa::path(
    post,
    path = "/research/company",
    request_body = ResearchRequest,
    responses(
        (status = 202, description = "Job accepted and running in the background", body = ResearchAcceptedResponse),
        (status = 400, description = "Invalid request or configuration"),
        (status = 422, description = "No website URL given and none could be discovered for the company name")
    )
)]
#[tracing::instrument(skip(state, request))]
pub async fn start_research(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = request.config.unwrap_or_else(|| state.config.clone());
    config
        .validate()
        .map_err(ApiError::InvalidRequest)?;

    let seed_url = resolve_seed_url(&state, &request.company_name, &request.website_url).await?;
    let company_name = request
        .company_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| name_from_url(&seed_url));
    let requested_fields = match request.fields {
        Some(fields) if !fields.is_empty() => fields,
        _ => TargetField::all(),
    };

    let job = ResearchJob::new(company_name, seed_url.to_string(), requested_fields);
    let job_id = state.store.insert(job).await;
    let cancel_flag = state.cancellations.register(job_id).await;

    let orchestrator = Orchestrator::new(
        state.store.clone(),
        state.http_client.clone(),
        state.ai.clone(),
        config,
    );
    let cancellations = state.cancellations.clone();
    tokio::spawn(async move {
        orchestrator.run(job_id, cancel_flag).await;
        cancellations.deregister(job_id).await;
    });

    tracing::info!(%job_id, url = %seed_url, "research job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(ResearchAcceptedResponse {
            job_id,
            website_url: seed_url.to_string(),
        }),
    ))
}

/// Poll the progress of a research job
#[utoipa::path(
    get,
    path = "/research/jobs/{id}/progress",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Current job progress", body = ProgressResponse),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProgressResponse>, ApiError> {
    match state.store.snapshot(id).await {
        Some(job) => Ok(Json(ProgressResponse::from_job(&job))),
        None => Err(ApiError::JobNotFound(id.to_string())),
    }
}

/// Fetch the final result of a research job.
///
/// Reading a terminal result archives the job; subsequent reads 404.
#[utoipa::path(
    get,
    path = "/research/jobs/{id}/result",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Final result (completed, failed or cancelled)", body = ResultResponse),
        (status = 202, description = "Job still running", body = ProgressResponse),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, ApiError> {
    let Some(job) = state.store.snapshot(id).await else {
        return Err(ApiError::JobNotFound(id.to_string()));
    };

    if !job.is_finished() {
        return Ok((
            StatusCode::ACCEPTED,
            Json(ProgressResponse::from_job(&job)),
        )
            .into_response());
    }

    // The caller has read the terminal state: archive the job.
    state.store.remove(id).await;
    state.cancellations.deregister(id).await;

    Ok((
        StatusCode::OK,
        Json(ResultResponse {
            job_id: job.id,
            status: job.status,
            error: job.error,
            result: job.result,
        }),
    )
        .into_response())
}

/// Cancel a running research job
#[utoipa::path(
    delete,
    path = "/research/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 202, description = "Cancellation requested"),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job already finished")
    )
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(job) = state.store.snapshot(id).await else {
        return Err(ApiError::JobNotFound(id.to_string()));
    };
    if job.is_finished() {
        return Err(ApiError::JobNotFinished(format!(
            "{} already {:?}",
            id, job.status
        )));
    }
    state.cancellations.cancel(id).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": id, "cancelling": true })),
    ))
}

/// Turn the request's name/URL pair into a concrete seed URL.
async fn resolve_seed_url(
    state: &AppState,
    company_name: &Option<String>,
    website_url: &Option<String>,
) -> Result<Url, ApiError> {
    if let Some(raw) = website_url.as_deref().filter(|u| !u.trim().is_empty()) {
        let with_scheme = if raw.starts_with("http") {
            raw.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", raw.trim_end_matches('/'))
        };
        return Url::parse(&with_scheme)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid website_url: {}", e)));
    }

    let Some(name) = company_name.as_deref().filter(|n| !n.trim().is_empty()) else {
        return Err(ApiError::InvalidRequest(
            "either company_name or website_url is required".to_string(),
        ));
    };

    guess_domain(&state.http_client, name).await.ok_or_else(|| {
        ApiError::InvalidRequest(format!(
            "could not discover a website for {:?}; pass website_url explicitly",
            name
        ))
    })
}

/// Best-effort domain discovery for a bare company name: slugify and probe
/// the common TLDs.
async fn guess_domain(client: &reqwest::Client, company_name: &str) -> Option<Url> {
    let slug: String = company_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if slug.is_empty() {
        return None;
    }

    for tld in ["com", "io", "co"] {
        let candidate = format!("https://{}.{}", slug, tld);
        match client
            .head(&candidate)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() || response.status().is_redirection() => {
                tracing::info!("resolved {:?} to {}", company_name, candidate);
                return Url::parse(&candidate).ok();
            }
            Ok(response) => {
                tracing::debug!("domain guess {} returned {}", candidate, response.status());
            }
            Err(e) => {
                tracing::debug!("domain guess {} failed: {}", candidate, e);
            }
        }
    }
    None
}

fn name_from_url(url: &Url) -> String {
    url.host_str()
        .map(|host| {
            host.trim_start_matches("www.")
                .split('.')
                .next()
                .unwrap_or(host)
                .to_string()
        })
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_from_url_strips_www_and_tld() {
        let url = Url::parse("https://www.acme-industrial.com/about").unwrap();
        assert_eq!(name_from_url(&url), "acme-industrial");
    }
}
