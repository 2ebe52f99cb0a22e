// PRP Agent — Knowledge Ingest
// File → knowledge row: fingerprint, classification, tagging, and the
// idempotent insert/update/unchanged upsert keyed on `source`.

use super::{join_tags, KnowledgeRepository, NOW};
use crate::error::AgentResult;
use crate::store::row_str;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::LazyLock;

/// Bulk ingest is processed in chunks of this many files.
const INGEST_CHUNK: usize = 16;

/// Fixed keyword map driving tag derivation. A tag applies when its
/// keyword appears in the content or the source path.
const TAG_KEYWORDS: &[&str] = &[
    "turso",
    "mcp",
    "configuration",
    "security",
    "performance",
    "documentation",
    "migration",
    "integration",
    "monitoring",
];

static TROUBLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|troubleshoot").expect("valid trouble regex"));

// ── Outcome ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    Inserted,
    Updated,
    Unchanged,
}

// ── Classification ─────────────────────────────────────────────────────

/// Hex md5 digest of the content — the idempotency fingerprint.
pub fn fingerprint(content: &str) -> String {
    hex::encode(Md5::digest(content.as_bytes()))
}

/// Category from the source path.
pub fn classify_category(source: &str) -> &'static str {
    let lower = source.to_lowercase();
    if lower.contains("config") {
        "Configuration"
    } else if lower.contains("migrat") {
        "Migration"
    } else if lower.contains("security") {
        "Security"
    } else if lower.contains("doc") || lower.contains("readme") || lower.ends_with(".md") {
        "Documentation"
    } else {
        "General"
    }
}

/// Tags from the fixed keyword map, in map order.
pub fn derive_tags(source: &str, content: &str) -> Vec<String> {
    let haystack = format!("{} {}", source.to_lowercase(), content.to_lowercase());
    TAG_KEYWORDS
        .iter()
        .filter(|kw| haystack.contains(*kw))
        .map(|kw| kw.to_string())
        .collect()
}

/// Expertise by content length bucket.
pub fn classify_expertise(content: &str) -> &'static str {
    match content.len() {
        n if n > 5000 => "expert",
        n if n > 2000 => "intermediate",
        _ => "beginner",
    }
}

/// Priority: base 1, +2 for troubleshooting content, +1 for
/// configuration material, +1 for long documents, capped at 5.
pub fn derive_priority(content: &str, category: &str) -> i64 {
    let mut priority = 1;
    if TROUBLE_RE.is_match(content) {
        priority += 2;
    }
    if category == "Configuration" {
        priority += 1;
    }
    if content.len() > 3000 {
        priority += 1;
    }
    priority.min(5)
}

/// Topic: first markdown heading when present, else the file stem.
pub fn derive_topic(source: &str, content: &str) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }
    Path::new(source)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

// ── Ingest operations ──────────────────────────────────────────────────

impl KnowledgeRepository {
    /// Ingest one file. A second ingest of the same source is a no-op
    /// when the fingerprint matches, and an in-place update when it
    /// differs.
    pub async fn ingest_from_file(&self, path: &Path) -> AgentResult<IngestOutcome> {
        let content = std::fs::read_to_string(path)?;
        let source = path.to_string_lossy().into_owned();
        self.ingest_content(&source, &content).await
    }

    /// Ingest content under an explicit source key (paths and URLs both
    /// land here).
    pub async fn ingest_content(&self, source: &str, content: &str) -> AgentResult<IngestOutcome> {
        let hash = fingerprint(content);
        let category = classify_category(source);
        let tags = join_tags(&derive_tags(source, content));
        let expertise = classify_expertise(content);
        let priority = derive_priority(content, category);
        let topic = derive_topic(source, content);

        let existing = self
            .store()
            .read(
                "SELECT id, file_hash FROM knowledge_base WHERE source = ?1",
                vec![json!(source)],
            )
            .await?;

        match existing.first() {
            Some(row) if row_str(row, "file_hash") == hash => {
                debug!("[knowledge] Unchanged: {}", source);
                Ok(IngestOutcome::Unchanged)
            }
            Some(row) => {
                let sql = format!(
                    "UPDATE knowledge_base \
                     SET topic = ?1, content = ?2, category = ?3, expertise_level = ?4, \
                         tags = ?5, file_hash = ?6, priority = ?7, updated_at = {NOW} \
                     WHERE id = ?8"
                );
                self.store()
                    .write(
                        &sql,
                        vec![
                            json!(topic),
                            json!(content),
                            json!(category),
                            json!(expertise),
                            json!(tags),
                            json!(hash),
                            json!(priority),
                            row.get("id").cloned().unwrap_or_default(),
                        ],
                    )
                    .await?;
                info!("[knowledge] Updated: {}", source);
                Ok(IngestOutcome::Updated)
            }
            None => {
                let sql = format!(
                    "INSERT INTO knowledge_base \
                         (topic, content, category, expertise_level, tags, source, \
                          file_hash, priority, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, {NOW}, {NOW})"
                );
                self.store()
                    .write(
                        &sql,
                        vec![
                            json!(topic),
                            json!(content),
                            json!(category),
                            json!(expertise),
                            json!(tags),
                            json!(source),
                            json!(hash),
                            json!(priority),
                        ],
                    )
                    .await?;
                info!("[knowledge] Inserted: {}", source);
                Ok(IngestOutcome::Inserted)
            }
        }
    }

    /// Bulk ingest, chunked. Each file reports its own outcome; one
    /// failing row never fails the rest of the batch.
    pub async fn ingest_paths(
        &self,
        paths: &[std::path::PathBuf],
    ) -> Vec<(std::path::PathBuf, AgentResult<IngestOutcome>)> {
        let mut results = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(INGEST_CHUNK) {
            debug!("[knowledge] Ingesting chunk of {} file(s)", chunk.len());
            for path in chunk {
                let outcome = self.ingest_from_file(path).await;
                if let Err(e) = &outcome {
                    warn!("[knowledge] Ingest failed for {:?}: {}", path, e);
                }
                results.push((path.clone(), outcome));
            }
        }
        results
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_md5_hex() {
        // Well-known digest: md5("abc")
        assert_eq!(fingerprint("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[test]
    fn category_from_path() {
        assert_eq!(classify_category("etc/config/turso.toml"), "Configuration");
        assert_eq!(classify_category("db/migrations/001.sql"), "Migration");
        assert_eq!(classify_category("SECURITY.txt"), "Security");
        assert_eq!(classify_category("docs/turso.md"), "Documentation");
        assert_eq!(classify_category("notes.md"), "Documentation");
        assert_eq!(classify_category("scratch.txt"), "General");
    }

    #[test]
    fn tags_come_from_fixed_map_only() {
        let tags = derive_tags("docs/turso.md", "Use mcp for monitoring.");
        assert_eq!(tags, vec!["turso", "mcp", "documentation", "monitoring"]);
        assert!(derive_tags("x.txt", "nothing relevant").is_empty());
    }

    #[test]
    fn expertise_buckets() {
        assert_eq!(classify_expertise(&"x".repeat(100)), "beginner");
        assert_eq!(classify_expertise(&"x".repeat(2001)), "intermediate");
        assert_eq!(classify_expertise(&"x".repeat(5001)), "expert");
    }

    #[test]
    fn priority_formula() {
        assert_eq!(derive_priority("plain note", "General"), 1);
        assert_eq!(derive_priority("how to troubleshoot this", "General"), 3);
        assert_eq!(derive_priority("plain note", "Configuration"), 2);
        let long_trouble = format!("ERROR handling guide {}", "x".repeat(3000));
        // 1 + 2 (error) + 1 (length) = 4
        assert_eq!(derive_priority(&long_trouble, "General"), 4);
        let maxed = format!("error troubleshoot {}", "x".repeat(3000));
        assert_eq!(derive_priority(&maxed, "Configuration"), 5);
    }

    #[test]
    fn topic_prefers_heading() {
        assert_eq!(
            derive_topic("docs/turso.md", "## Turso Quickstart\nbody"),
            "Turso Quickstart"
        );
        assert_eq!(derive_topic("docs/turso.md", "no headings here"), "turso");
    }
}
