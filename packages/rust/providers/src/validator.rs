//! Liveness checks, GitHub star filtering, and description trimming for
//! accepted links.

use std::sync::Arc;
use std::time::Duration;

use listscout_shared::{Candidate, Result, ValidationConfig};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::build_client;
use crate::original::github_repo;

/// Counts reported after validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub trimmed_descriptions: usize,
}

/// A link that failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidLink {
    pub candidate: Candidate,
    pub reason: String,
}

/// Output of [`UrlValidator::validate`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Surviving candidates in input order, descriptions trimmed.
    pub valid: Vec<Candidate>,
    pub invalid: Vec<InvalidLink>,
    pub summary: ValidationSummary,
}

/// Concurrent HEAD checker.
pub struct UrlValidator {
    client: Client,
    concurrency: usize,
    require_https: bool,
    max_description_len: usize,
    stars: Option<Arc<StarFilter>>,
}

impl UrlValidator {
    pub fn new(config: &ValidationConfig) -> Result<Self> {
        let stars = config.min_github_stars.map(|min_stars| {
            Arc::new(StarFilter {
                min_stars,
                api_url: config.github_api_url.trim_end_matches('/').to_string(),
                token: std::env::var(&config.github_token_env)
                    .ok()
                    .filter(|t| !t.is_empty()),
            })
        });
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            concurrency: config.concurrency.max(1),
            require_https: config.require_https,
            max_description_len: config.max_description_len,
            stars,
        })
    }

    /// Check every candidate and trim over-long descriptions.
    ///
    /// A link is valid when it answers 2xx or 3xx. Servers that refuse
    /// `HEAD` with 405 are retried with `GET`. With a star minimum set,
    /// GitHub repository links are checked through the GitHub API instead.
    #[instrument(skip_all, fields(links = candidates.len()))]
    pub async fn validate(&self, candidates: Vec<Candidate>) -> ValidationReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let client = self.client.clone();
            let sem = semaphore.clone();
            let require_https = self.require_https;
            let stars = self.stars.clone();

            handles.push(tokio::spawn(async move {
                if require_https && !candidate.url.starts_with("https://") {
                    return (candidate, Err("not an https URL".to_string()));
                }
                let Ok(_permit) = sem.acquire().await else {
                    return (candidate, Err("validator shut down".to_string()));
                };
                let verdict = match (stars.as_deref(), github_repo(&candidate.url)) {
                    (Some(filter), Some((owner, repo))) => {
                        filter.check(&client, &owner, &repo).await
                    }
                    _ => check_url(&client, &candidate.url).await,
                };
                (candidate, verdict)
            }));
        }

        let mut report = ValidationReport::default();
        for handle in handles {
            let (mut candidate, verdict) = match handle.await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "validation task failed");
                    report.summary.checked += 1;
                    report.summary.invalid += 1;
                    continue;
                }
            };
            report.summary.checked += 1;

            match verdict {
                Ok(()) => {
                    if let Some(trimmed) =
                        truncate_description(&candidate.description, self.max_description_len)
                    {
                        candidate.description = trimmed;
                        report.summary.trimmed_descriptions += 1;
                    }
                    report.summary.valid += 1;
                    report.valid.push(candidate);
                }
                Err(reason) => {
                    debug!(url = %candidate.url, %reason, "link rejected");
                    report.summary.invalid += 1;
                    report.invalid.push(InvalidLink { candidate, reason });
                }
            }
        }

        info!(
            checked = report.summary.checked,
            valid = report.summary.valid,
            invalid = report.summary.invalid,
            trimmed = report.summary.trimmed_descriptions,
            "link validation complete"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// GitHub stars
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StarFilter {
    min_stars: u64,
    api_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    stargazers_count: u64,
}

impl StarFilter {
    /// Valid when the repository exists and has at least `min_stars` stars.
    async fn check(
        &self,
        client: &Client,
        owner: &str,
        repo: &str,
    ) -> std::result::Result<(), String> {
        let url = format!("{}/repos/{owner}/{repo}", self.api_url);
        let mut request = client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("GitHub star check failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("GitHub star check failed: HTTP {status}"));
        }
        let info: RepoInfo = response
            .json()
            .await
            .map_err(|e| format!("GitHub star check failed: {e}"))?;

        if info.stargazers_count < self.min_stars {
            Err(format!(
                "{} GitHub stars (minimum {})",
                info.stargazers_count, self.min_stars
            ))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

async fn check_url(client: &Client, url: &str) -> std::result::Result<(), String> {
    let mut status = send(client.head(url)).await?;
    if status == StatusCode::METHOD_NOT_ALLOWED {
        status = send(client.get(url)).await?;
    }
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else {
        Err(format!("HTTP {status}"))
    }
}

async fn send(request: reqwest::RequestBuilder) -> std::result::Result<StatusCode, String> {
    request
        .send()
        .await
        .map(|r| r.status())
        .map_err(|e| e.to_string())
}

/// Shorten `description` to at most `max_chars` characters, ending in "...".
/// Returns `None` when it already fits.
pub fn truncate_description(description: &str, max_chars: usize) -> Option<String> {
    if description.chars().count() <= max_chars {
        return None;
    }
    let keep = max_chars.saturating_sub(3);
    let cut = description
        .char_indices()
        .nth(keep)
        .map_or(description.len(), |(idx, _)| idx);
    Some(format!("{}...", description[..cut].trim_end()))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn candidate(url: &str, description: &str) -> Candidate {
        Candidate {
            category: "Tools".into(),
            title: "t".into(),
            url: url.into(),
            description: description.into(),
            source_tag: String::new(),
        }
    }

    fn validator(require_https: bool) -> UrlValidator {
        UrlValidator::new(&ValidationConfig {
            require_https,
            ..ValidationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn short_descriptions_are_kept() {
        assert_eq!(truncate_description("fast grep", 100), None);
    }

    #[test]
    fn long_descriptions_are_trimmed_on_char_boundary() {
        let long = "é".repeat(150);
        let trimmed = truncate_description(&long, 100).unwrap();
        assert_eq!(trimmed.chars().count(), 100);
        assert!(trimmed.ends_with("..."));
    }

    #[tokio::test]
    async fn live_links_pass_and_dead_links_fail() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let report = validator(false)
            .validate(vec![
                candidate(&format!("{}/ok", server.uri()), &"x".repeat(120)),
                candidate(&format!("{}/gone", server.uri()), ""),
            ])
            .await;

        assert_eq!(report.summary.checked, 2);
        assert_eq!(report.summary.valid, 1);
        assert_eq!(report.summary.invalid, 1);
        assert_eq!(report.summary.trimmed_descriptions, 1);
        assert_eq!(report.valid[0].description.chars().count(), 100);
        assert_eq!(report.invalid[0].reason, "HTTP 404 Not Found");
    }

    #[tokio::test]
    async fn head_refusal_falls_back_to_get() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let report = validator(false)
            .validate(vec![candidate(&format!("{}/page", server.uri()), "")])
            .await;
        assert_eq!(report.summary.valid, 1);
    }

    #[tokio::test]
    async fn github_repositories_need_enough_stars() {
        let server = MockServer::start().await;
        for (repo, stars) in [("big", 500), ("small", 3)] {
            Mock::given(method("GET"))
                .and(path(format!("/repos/acme/{repo}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(serde_json::json!({"stargazers_count": stars})),
                )
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/repos/acme/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let validator = UrlValidator::new(&ValidationConfig {
            require_https: false,
            min_github_stars: Some(100),
            github_api_url: server.uri(),
            github_token_env: "LS_TEST_NO_GITHUB_TOKEN_12345".into(),
            ..ValidationConfig::default()
        })
        .unwrap();

        let report = validator
            .validate(vec![
                candidate("https://github.com/acme/big", ""),
                candidate("https://github.com/acme/small", ""),
                candidate("https://github.com/acme/gone", ""),
                candidate(&format!("{}/docs", server.uri()), ""),
            ])
            .await;

        let valid: Vec<_> = report.valid.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            valid,
            [
                "https://github.com/acme/big".to_string(),
                format!("{}/docs", server.uri())
            ]
        );
        assert_eq!(report.invalid.len(), 2);
        assert_eq!(report.invalid[0].reason, "3 GitHub stars (minimum 100)");
        assert!(report.invalid[1].reason.contains("HTTP 404"));
    }

    #[tokio::test]
    async fn plain_http_is_rejected_when_https_required() {
        let report = validator(true)
            .validate(vec![candidate("http://example.com", "")])
            .await;
        assert_eq!(report.summary.invalid, 1);
        assert_eq!(report.invalid[0].reason, "not an https URL");
    }
}
