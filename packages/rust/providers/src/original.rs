//! Loading the curated list that a run extends.

use std::path::Path;
use std::time::Duration;

use listscout_shared::{ListScoutError, OriginalEntry, Result};
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::awesome::{parse_awesome_markdown, topic_of};
use crate::build_client;

/// Largest list document accepted (5 MB).
const MAX_DOCUMENT_SIZE: u64 = 5 * 1024 * 1024;

/// Raw README locations tried for a GitHub repository URL, in order.
const RAW_README_TEMPLATES: &[&str] = &[
    "https://raw.githubusercontent.com/{owner}/{repo}/HEAD/README.md",
    "https://raw.githubusercontent.com/{owner}/{repo}/refs/heads/main/README.md",
    "https://raw.githubusercontent.com/{owner}/{repo}/refs/heads/master/README.md",
];

/// The original list, flattened for deduplication and planning.
#[derive(Debug, Clone, Serialize)]
pub struct OriginalList {
    pub title: String,
    pub tagline: Option<String>,
    /// Section names in document order.
    pub sections: Vec<String>,
    pub entries: Vec<OriginalEntry>,
}

impl OriginalList {
    /// The subject of the list: the title without a leading "Awesome".
    pub fn topic(&self) -> &str {
        topic_of(&self.title)
    }

    /// Parse a document that is either a JSON array of entries or
    /// awesome-list Markdown. `fallback_title` names JSON lists.
    pub fn from_document(content: &str, fallback_title: &str) -> Result<Self> {
        let head = content.trim_start();
        if head.starts_with('[') && !head.starts_with("[!") {
            let entries: Vec<OriginalEntry> = serde_json::from_str(content)
                .map_err(|e| ListScoutError::parse(format!("invalid original list JSON: {e}")))?;
            let mut sections: Vec<String> = Vec::new();
            for entry in &entries {
                if !sections.contains(&entry.category) {
                    sections.push(entry.category.clone());
                }
            }
            return Ok(Self {
                title: fallback_title.to_string(),
                tagline: None,
                sections,
                entries,
            });
        }

        let list = parse_awesome_markdown(content)?;
        Ok(Self {
            entries: list.entries(),
            sections: list.sections.iter().map(|s| s.name.clone()).collect(),
            title: list.title,
            tagline: list.tagline,
        })
    }
}

/// Load the original list from a file path or an `http(s)` URL.
///
/// A `https://github.com/<owner>/<repo>` URL is resolved to the repository's
/// raw README.
#[instrument(skip_all, fields(source = %source))]
pub async fn load_original(source: &str, timeout: Duration) -> Result<OriginalList> {
    let list = if source.starts_with("http://") || source.starts_with("https://") {
        let client = build_client(timeout)?;
        let content = match raw_readme_urls(source) {
            Some(candidates) => fetch_first(&client, &candidates).await?,
            None => fetch_document(&client, source).await?,
        };
        OriginalList::from_document(&content, source)?
    } else {
        let path = Path::new(source);
        let content =
            std::fs::read_to_string(path).map_err(|e| ListScoutError::io(path, e))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(source);
        OriginalList::from_document(&content, stem)?
    };

    info!(
        title = %list.title,
        sections = list.sections.len(),
        entries = list.entries.len(),
        "original list loaded"
    );
    Ok(list)
}

/// Raw README URLs for a GitHub repository page, or `None` for other URLs.
pub fn raw_readme_urls(repo_url: &str) -> Option<Vec<String>> {
    let (owner, repo) = github_repo(repo_url)?;
    Some(
        RAW_README_TEMPLATES
            .iter()
            .map(|t| t.replace("{owner}", &owner).replace("{repo}", &repo))
            .collect(),
    )
}

/// `(owner, repo)` of a `https://github.com/<owner>/<repo>` URL. Deeper
/// paths and other hosts give `None`.
pub(crate) fn github_repo(repo_url: &str) -> Option<(String, String)> {
    let url = Url::parse(repo_url).ok()?;
    let host = url.host_str()?;
    if host != "github.com" && host != "www.github.com" {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?.trim_end_matches(".git");
    if segments.next().is_some() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

async fn fetch_first(client: &Client, urls: &[String]) -> Result<String> {
    let mut last_err = None;
    for url in urls {
        match fetch_document(client, url).await {
            Ok(body) => return Ok(body),
            Err(e) => {
                warn!(%url, error = %e, "README fetch failed, trying next location");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ListScoutError::Network("no README location to try".into())))
}

async fn fetch_document(client: &Client, url: &str) -> Result<String> {
    debug!(%url, "fetching original list");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ListScoutError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ListScoutError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_DOCUMENT_SIZE {
            return Err(ListScoutError::validation(format!(
                "{url}: document too large ({len} bytes, max {MAX_DOCUMENT_SIZE})"
            )));
        }
    }

    read_capped(url, response, MAX_DOCUMENT_SIZE).await
}

/// Read a response body, failing as soon as it grows past `limit` bytes.
/// Covers chunked responses that carry no `Content-Length`.
async fn read_capped(url: &str, mut response: Response, limit: u64) -> Result<String> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ListScoutError::Network(format!("{url}: failed to read body: {e}")))?
    {
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(ListScoutError::validation(format!(
                "{url}: document too large (more than {limit} bytes)"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    String::from_utf8(body)
        .map_err(|e| ListScoutError::parse(format!("{url}: document is not UTF-8: {e}")))
}
