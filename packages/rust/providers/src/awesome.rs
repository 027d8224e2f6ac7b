//! Awesome-list Markdown parser.
//!
//! Understands the usual README layout:
//! - `# Title` (badges after the title are dropped)
//! - Optional tagline: a `> blockquote` or plain line right after the title
//! - Sections: `## Section`, with `### Subsection` folded into the section
//! - Items: `- [Name](url) - Description` (also `*`/`+` bullets and `:`/en-dash separators)

use std::sync::LazyLock;

use listscout_shared::{ListScoutError, OriginalEntry, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parsed representation of an awesome list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwesomeList {
    /// The H1 title, without badges.
    pub title: String,
    /// Tagline under the title, if any.
    pub tagline: Option<String>,
    /// `##` sections in document order.
    pub sections: Vec<AwesomeSection>,
}

/// A `##` section and everything under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwesomeSection {
    pub name: String,
    pub items: Vec<AwesomeItem>,
}

/// One linked entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwesomeItem {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

impl AwesomeList {
    /// The subject of the list: the title without a leading "Awesome".
    pub fn topic(&self) -> &str {
        topic_of(&self.title)
    }

    /// Flatten into original entries, one per item, tagged with its section.
    pub fn entries(&self) -> Vec<OriginalEntry> {
        self.sections
            .iter()
            .flat_map(|section| {
                section.items.iter().map(|item| OriginalEntry {
                    category: section.name.clone(),
                    title: item.name.clone(),
                    url: item.url.clone(),
                    description: item.description.clone(),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+(.+)$").expect("H1 regex"));

/// `##` or `###`; deeper headings are treated as plain text.
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{2,3})\s+(.+)$").expect("section regex"));

static BLOCKQUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^>\s*(.+)$").expect("blockquote regex"));

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*+]\s+\[([^\]]+)\]\(([^)\s]+)\)(?:\s*[-:\x{2013}\x{2014}]\s*(.*))?$")
        .expect("item regex")
});

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse awesome-list Markdown.
///
/// Anchor links (`#tools`, usually a table of contents) and items that
/// appear before the first section are ignored.
pub fn parse_awesome_markdown(content: &str) -> Result<AwesomeList> {
    let mut lines = content.lines().peekable();

    // --- Find the H1 title ---
    let title = loop {
        match lines.next() {
            Some(line) => {
                if let Some(caps) = H1_RE.captures(line.trim()) {
                    break strip_badges(&caps[1]);
                }
            }
            None => {
                return Err(ListScoutError::parse(
                    "awesome list has no H1 heading (# Title)",
                ));
            }
        }
    };

    // --- Optional tagline ---
    let mut tagline = None;
    while let Some(&line) = lines.peek() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("[![") || trimmed.starts_with('<') {
            lines.next();
            continue;
        }
        if trimmed.starts_with('#') || ITEM_RE.is_match(trimmed) {
            break;
        }
        let text = match BLOCKQUOTE_RE.captures(trimmed) {
            Some(caps) => caps[1].trim().to_string(),
            None => trimmed.to_string(),
        };
        tagline = Some(text);
        lines.next();
        break;
    }

    // --- Sections and items ---
    let mut sections: Vec<AwesomeSection> = Vec::new();

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = SECTION_RE.captures(trimmed) {
            let name = caps[2].trim().to_string();
            // `###` folds into the enclosing `##` unless there is none yet.
            if &caps[1] == "##" || sections.is_empty() {
                sections.push(AwesomeSection {
                    name,
                    items: Vec::new(),
                });
            }
            continue;
        }

        if let Some(caps) = ITEM_RE.captures(trimmed) {
            let url = caps[2].trim();
            if url.starts_with('#') {
                continue;
            }
            let Some(section) = sections.last_mut() else {
                continue;
            };
            section.items.push(AwesomeItem {
                name: caps[1].trim().to_string(),
                url: url.to_string(),
                description: caps
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            });
        }

        // Other lines (prose, tables, HTML) are skipped.
    }

    Ok(AwesomeList {
        title,
        tagline,
        sections,
    })
}

/// Strip a leading "Awesome " from a list title.
pub(crate) fn topic_of(title: &str) -> &str {
    let title = title.trim();
    match title.get(..8) {
        Some(prefix) if prefix.eq_ignore_ascii_case("awesome ") => title[8..].trim(),
        _ => title,
    }
}

/// Drop trailing badge images from a heading.
fn strip_badges(heading: &str) -> String {
    let end = heading.find("[![").unwrap_or(heading.len());
    heading[..end].trim().to_string()
}
