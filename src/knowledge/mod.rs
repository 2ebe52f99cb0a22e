// PRP Agent — Knowledge Repository
// Domain operations on top of StoreClient: keyword retrieval over
// knowledge rows and PRPs, the append-only conversation log, and row
// counts for the CLI. File ingest lives in `ingest`, PRP CRUD in `prp`.
//
// The repository exclusively owns mutations to knowledge rows,
// conversation turns and PRPs; nothing else in the crate writes to the
// store. Every operation maps 1:1 to a StoreClient call.

pub mod ingest;
pub mod prp;

pub use ingest::IngestOutcome;
pub use prp::{NewPrp, Prp, PrpFilter, PrpPatch, PrpRef, PrpStatus};

use crate::error::AgentResult;
use crate::store::{row_i64, row_str, Row, StoreClient};
use log::debug;
use serde::Serialize;
use serde_json::json;

/// SQL timestamp expression used for every row write. Millisecond
/// precision so `updated_at` advances between close-together updates.
pub(crate) const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

// ── Language policy ────────────────────────────────────────────────────

/// Controls the translation-annotation pass applied to incoming PRPs.
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    pub language: String,
    pub auto_translate_on_create: bool,
}

impl Default for LanguagePolicy {
    fn default() -> Self {
        LanguagePolicy {
            language: "pt-br".into(),
            auto_translate_on_create: false,
        }
    }
}

// ── Rows ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeRow {
    pub id: i64,
    pub topic: String,
    pub content: String,
    pub category: String,
    pub expertise_level: String,
    pub tags: Vec<String>,
    pub source: String,
    pub file_hash: String,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl KnowledgeRow {
    fn from_row(row: &Row) -> Self {
        KnowledgeRow {
            id: row_i64(row, "id"),
            topic: row_str(row, "topic"),
            content: row_str(row, "content"),
            category: row_str(row, "category"),
            expertise_level: row_str(row, "expertise_level"),
            tags: split_tags(&row_str(row, "tags")),
            source: row_str(row, "source"),
            file_hash: row_str(row, "file_hash"),
            priority: row_i64(row, "priority"),
            created_at: row_str(row, "created_at"),
            updated_at: row_str(row, "updated_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub seq: i64,
    pub user_message: String,
    pub agent_response: String,
    pub file_context: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RepositoryStats {
    pub knowledge_rows: i64,
    pub conversation_turns: i64,
    pub prps: i64,
}

// ── Retrieval ──────────────────────────────────────────────────────────

/// Where a retrieved context item came from. Ranked: PRPs outrank
/// knowledge rows, which outrank (future) conversation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    Prp,
    Knowledge,
    Conversation,
}

impl ContextSource {
    fn rank(self) -> u8 {
        match self {
            ContextSource::Prp => 2,
            ContextSource::Knowledge => 1,
            ContextSource::Conversation => 0,
        }
    }
}

/// One retrieved item, scored for prompt composition. Higher `score`
/// means a stronger keyword match (topic > content > tags).
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub source: ContextSource,
    /// Origin path, URL or PRP name — shown in the prompt preamble.
    pub origin: String,
    pub topic: String,
    pub content: String,
    pub score: i64,
    pub priority: i64,
    pub updated_at: String,
    pub id: i64,
}

/// Normalize a retrieval query: lowercased, whitespace collapsed.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Keyword tokens in matching order: normalized, punctuation-stripped,
/// short noise words dropped, capped so the statement stays bounded.
pub fn query_tokens(query: &str) -> Vec<String> {
    const MAX_TOKENS: usize = 8;
    let mut tokens: Vec<String> = Vec::new();
    for word in normalize_query(query).split(' ') {
        let token = word.trim_matches(|c: char| !c.is_alphanumeric());
        if token.len() >= 3 && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        if tokens.len() == MAX_TOKENS {
            break;
        }
    }
    tokens
}

// ── Repository ─────────────────────────────────────────────────────────

pub struct KnowledgeRepository {
    store: StoreClient,
    policy: LanguagePolicy,
}

impl KnowledgeRepository {
    pub fn new(store: StoreClient, policy: LanguagePolicy) -> Self {
        KnowledgeRepository { store, policy }
    }

    pub(crate) fn store(&self) -> &StoreClient {
        &self.store
    }

    pub(crate) fn policy(&self) -> &LanguagePolicy {
        &self.policy
    }

    /// Case-insensitive keyword search over knowledge rows. Each query
    /// token matches as a substring of topic, content or tags; matches
    /// in the topic outrank matches in the content, which outrank
    /// matches in the tags; ties break by
    /// `priority DESC, updated_at DESC, id ASC`.
    pub async fn search(&self, query: &str, limit: usize) -> AgentResult<Vec<KnowledgeRow>> {
        let tokens = query_tokens(query);
        let Some((where_clause, mut params)) =
            token_clause(&tokens, &["lower(topic)", "lower(content)", "lower(tags)"])
        else {
            return Ok(Vec::new());
        };

        // Over-fetch so the rank pass has ties to break, then order and
        // truncate here — the match weighting is ours, not SQL's.
        let fetch = (limit.max(1) * 4) as i64;
        let limit_param = params.len() + 1;
        params.push(json!(fetch));

        let sql = format!(
            "SELECT id, topic, content, category, expertise_level, tags, source, \
                    file_hash, priority, created_at, updated_at \
             FROM knowledge_base WHERE {where_clause} \
             ORDER BY priority DESC, updated_at DESC, id ASC \
             LIMIT ?{limit_param}"
        );
        let rows = self.store.read(&sql, params).await?;

        let mut found: Vec<KnowledgeRow> = rows.iter().map(KnowledgeRow::from_row).collect();
        found.sort_by(|a, b| {
            let rank_a = match_rank(&tokens, &a.topic, &a.content);
            let rank_b = match_rank(&tokens, &b.topic, &b.content);
            rank_b
                .cmp(&rank_a)
                .then(b.priority.cmp(&a.priority))
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        found.truncate(limit);
        Ok(found)
    }

    /// Retrieval for a turn: knowledge rows plus matching PRPs, merged
    /// and ordered by source rank, then match score, then the repository
    /// tie-break. Truncated to `limit`.
    pub async fn search_context(&self, query: &str, limit: usize) -> AgentResult<Vec<ContextItem>> {
        let tokens = query_tokens(query);
        let mut items: Vec<ContextItem> = Vec::new();

        for row in self.search(query, limit).await? {
            let score = match_rank(&tokens, &row.topic, &row.content);
            items.push(ContextItem {
                source: ContextSource::Knowledge,
                origin: row.source,
                topic: row.topic,
                content: row.content,
                score,
                priority: row.priority,
                updated_at: row.updated_at,
                id: row.id,
            });
        }

        for prp in self.search_prps_by_tokens(&tokens, limit).await? {
            items.push(ContextItem {
                source: ContextSource::Prp,
                origin: prp.name.clone(),
                topic: prp.title.clone(),
                content: prp.render_summary(),
                score: match_rank(&tokens, &prp.title, &prp.search_text),
                priority: prp.priority.weight(),
                updated_at: prp.updated_at,
                id: prp.id,
            });
        }

        items.sort_by(|a, b| {
            b.source
                .rank()
                .cmp(&a.source.rank())
                .then(b.score.cmp(&a.score))
                .then(b.priority.cmp(&a.priority))
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        items.truncate(limit);
        debug!("[knowledge] Retrieved {} context item(s)", items.len());
        Ok(items)
    }

    /// Append one turn to the conversation log. The next `seq` is taken
    /// from `COALESCE(MAX(seq),0)+1` inside the INSERT itself, so the
    /// numbering stays contiguous even across process restarts.
    pub async fn append_conversation(
        &self,
        session_id: &str,
        user_message: &str,
        agent_response: &str,
        file_context: Option<&str>,
    ) -> AgentResult<i64> {
        let sql = format!(
            "INSERT INTO conversations \
                 (session_id, seq, user_message, agent_response, file_context, created_at) \
             SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, {NOW} \
             FROM conversations WHERE session_id = ?1"
        );
        let result = self
            .store
            .write(
                &sql,
                vec![
                    json!(session_id),
                    json!(user_message),
                    json!(agent_response),
                    json!(file_context),
                ],
            )
            .await?;

        let seq = match result.last_insert_rowid {
            Some(rowid) => {
                let rows = self
                    .store
                    .read(
                        "SELECT seq FROM conversations WHERE id = ?1",
                        vec![json!(rowid)],
                    )
                    .await?;
                rows.first().map(|r| row_i64(r, "seq")).unwrap_or_default()
            }
            None => 0,
        };
        Ok(seq)
    }

    /// Most recent turns of a session, newest first.
    pub async fn recent_conversations(
        &self,
        session_id: &str,
        limit: usize,
    ) -> AgentResult<Vec<ConversationTurn>> {
        let rows = self
            .store
            .read(
                "SELECT session_id, seq, user_message, agent_response, file_context, created_at \
                 FROM conversations WHERE session_id = ?1 \
                 ORDER BY seq DESC LIMIT ?2",
                vec![json!(session_id), json!(limit as i64)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| ConversationTurn {
                session_id: row_str(r, "session_id"),
                seq: row_i64(r, "seq"),
                user_message: row_str(r, "user_message"),
                agent_response: row_str(r, "agent_response"),
                file_context: r
                    .get("file_context")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                created_at: row_str(r, "created_at"),
            })
            .collect())
    }

    /// Row counts across the three tables.
    pub async fn stats(&self) -> AgentResult<RepositoryStats> {
        let count = |rows: Vec<Row>| rows.first().map(|r| row_i64(r, "n")).unwrap_or_default();
        let knowledge_rows = count(
            self.store
                .read("SELECT COUNT(*) AS n FROM knowledge_base", vec![])
                .await?,
        );
        let conversation_turns = count(
            self.store
                .read("SELECT COUNT(*) AS n FROM conversations", vec![])
                .await?,
        );
        let prps = count(self.store.read("SELECT COUNT(*) AS n FROM prps", vec![]).await?);
        Ok(RepositoryStats {
            knowledge_rows,
            conversation_turns,
            prps,
        })
    }
}

// ── Internals ──────────────────────────────────────────────────────────

/// Build `(<col LIKE ?n OR …> OR …)` across tokens and columns with one
/// bound pattern per token. Returns `None` for an empty token list.
pub(crate) fn token_clause(
    tokens: &[String],
    columns: &[&str],
) -> Option<(String, Vec<serde_json::Value>)> {
    if tokens.is_empty() {
        return None;
    }
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<serde_json::Value> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let n = i + 1;
        let per_column: Vec<String> =
            columns.iter().map(|c| format!("{c} LIKE ?{n}")).collect();
        clauses.push(format!("({})", per_column.join(" OR ")));
        params.push(json!(format!("%{token}%")));
    }
    Some((clauses.join(" OR "), params))
}

/// Match strength for ordering retrieved items: any token in the topic
/// beats any token in the body beats a tag-only match.
pub(crate) fn match_rank(tokens: &[String], topic: &str, body: &str) -> i64 {
    let topic = topic.to_lowercase();
    let body = body.to_lowercase();
    if tokens.iter().any(|t| topic.contains(t.as_str())) {
        3
    } else if tokens.iter().any(|t| body.contains(t.as_str())) {
        2
    } else {
        1
    }
}

pub(crate) fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

// ── Tests ──────────────────────────────────────────────────────────────
