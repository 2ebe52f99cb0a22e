// PRP Agent — PRP Storage
// Product Requirement Prompt CRUD. `search_text` is recomputed in Rust
// and written in the same statement as the fields it derives from, so it
// can never drift. The translation-annotation pass is applied on create
// and consumed exactly once by the agent's analyze intent.

use super::{join_tags, split_tags, token_clause, KnowledgeRepository, NOW};
use crate::error::{AgentError, AgentResult};
use crate::store::{row_i64, row_str, Row};
use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;

// ── Status / priority ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrpStatus {
    Draft,
    Active,
    Archived,
}

impl PrpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrpStatus::Draft => "draft",
            PrpStatus::Active => "active",
            PrpStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> AgentResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(PrpStatus::Draft),
            "active" => Ok(PrpStatus::Active),
            "archived" => Ok(PrpStatus::Archived),
            other => Err(AgentError::store(format!("unknown PRP status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrpPriority {
    Low,
    Medium,
    High,
}

impl PrpPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            PrpPriority::Low => "low",
            PrpPriority::Medium => "medium",
            PrpPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> AgentResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(PrpPriority::Low),
            "medium" => Ok(PrpPriority::Medium),
            "high" => Ok(PrpPriority::High),
            other => Err(AgentError::store(format!("unknown PRP priority '{other}'"))),
        }
    }

    /// Numeric weight for retrieval ordering.
    pub fn weight(self) -> i64 {
        match self {
            PrpPriority::Low => 1,
            PrpPriority::Medium => 2,
            PrpPriority::High => 3,
        }
    }
}

// ── PRP row ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Prp {
    pub id: i64,
    pub name: String,
    pub title: String,
    pub description: String,
    pub objective: String,
    pub context_data: Option<String>,
    pub implementation_details: Option<String>,
    pub validation_gates: Option<String>,
    pub status: PrpStatus,
    pub priority: PrpPriority,
    pub tags: Vec<String>,
    pub search_text: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Prp {
    fn from_row(row: &Row) -> AgentResult<Self> {
        Ok(Prp {
            id: row_i64(row, "id"),
            name: row_str(row, "name"),
            title: row_str(row, "title"),
            description: row_str(row, "description"),
            objective: row_str(row, "objective"),
            context_data: opt_str(row, "context_data"),
            implementation_details: opt_str(row, "implementation_details"),
            validation_gates: opt_str(row, "validation_gates"),
            status: PrpStatus::parse(&row_str(row, "status"))?,
            priority: PrpPriority::parse(&row_str(row, "priority"))?,
            tags: split_tags(&row_str(row, "tags")),
            search_text: row_str(row, "search_text"),
            created_at: row_str(row, "created_at"),
            updated_at: row_str(row, "updated_at"),
        })
    }

    /// Compact one-paragraph rendering used as retrieval context.
    pub fn render_summary(&self) -> String {
        format!(
            "{} ({}, {}) — {} Objective: {}",
            self.title,
            self.status.as_str(),
            self.priority.as_str(),
            self.description,
            self.objective
        )
    }

    /// True when any text field still carries a translation annotation.
    pub fn needs_translation(&self) -> bool {
        pending_translation(&self.title).is_some()
            || pending_translation(&self.description).is_some()
            || pending_translation(&self.objective).is_some()
    }
}

fn opt_str(row: &Row, key: &str) -> Option<String> {
    row.get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ── Inputs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrp {
    pub name: String,
    pub title: String,
    pub description: String,
    pub objective: String,
    #[serde(default)]
    pub context_data: Option<String>,
    #[serde(default)]
    pub implementation_details: Option<String>,
    #[serde(default)]
    pub validation_gates: Option<String>,
    #[serde(default)]
    pub priority: Option<PrpPriority>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Field-wise patch; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrpPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub objective: Option<String>,
    pub context_data: Option<String>,
    pub implementation_details: Option<String>,
    pub validation_gates: Option<String>,
    pub priority: Option<PrpPriority>,
    pub tags: Option<Vec<String>>,
}

/// Lookup key: numeric id or unique name.
#[derive(Debug, Clone)]
pub enum PrpRef {
    Id(i64),
    Name(String),
}

impl PrpRef {
    /// Parse user input: digits become an id, anything else a name.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => PrpRef::Id(id),
            Err(_) => PrpRef::Name(raw.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrpFilter {
    pub status: Option<PrpStatus>,
    pub search: Option<String>,
}

// ── search_text ────────────────────────────────────────────────────────

/// `lower(title) + " " + lower(description) + " " + lower(objective)` —
/// the invariant every mutation must preserve.
pub fn compute_search_text(title: &str, description: &str, objective: &str) -> String {
    format!(
        "{} {} {}",
        title.to_lowercase(),
        description.to_lowercase(),
        objective.to_lowercase()
    )
}

// ── Translation annotation ─────────────────────────────────────────────

static ANNOTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\[\[traduzir:([a-z-]+)\]\](.*)\[\[/traduzir\]\]$")
        .expect("valid annotation regex")
});

/// Portuguese hints plus explicit markers: text carrying any of these is
/// treated as already in the target language.
const LANGUAGE_MARKERS: &[&str] = &["pt-br", "🇧🇷", "ção", "não", "você", "português"];

pub fn has_language_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    LANGUAGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Wrap text in a machine-readable conversion instruction. The original
/// is preserved verbatim inside the block.
pub fn annotate_for_translation(text: &str, language: &str) -> String {
    format!("[[traduzir:{language}]]{text}[[/traduzir]]")
}

/// The original text inside an annotation, if one is present.
pub fn pending_translation(text: &str) -> Option<&str> {
    ANNOTATION_RE
        .captures(text)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// Annotate a field unless it already reads as the target language or is
/// already annotated.
fn maybe_annotate(text: &str, language: &str) -> String {
    if has_language_marker(text) || pending_translation(text).is_some() {
        text.to_string()
    } else {
        annotate_for_translation(text, language)
    }
}

// ── CRUD ───────────────────────────────────────────────────────────────

const PRP_COLUMNS: &str = "id, name, title, description, objective, context_data, \
                           implementation_details, validation_gates, status, priority, \
                           tags, search_text, created_at, updated_at";

impl KnowledgeRepository {
    /// Create a PRP. Fails with `Conflict` when the name is taken.
    pub async fn create_prp(&self, mut fields: NewPrp) -> AgentResult<Prp> {
        let existing = self
            .store()
            .read(
                "SELECT id FROM prps WHERE name = ?1",
                vec![json!(fields.name)],
            )
            .await?;
        if !existing.is_empty() {
            return Err(AgentError::Conflict(format!(
                "PRP '{}' already exists",
                fields.name
            )));
        }

        if self.policy().auto_translate_on_create {
            let lang = self.policy().language.clone();
            fields.title = maybe_annotate(&fields.title, &lang);
            fields.description = maybe_annotate(&fields.description, &lang);
            fields.objective = maybe_annotate(&fields.objective, &lang);
        }

        let search_text =
            compute_search_text(&fields.title, &fields.description, &fields.objective);
        let priority = fields.priority.unwrap_or(PrpPriority::Medium);

        let sql = format!(
            "INSERT INTO prps \
                 (name, title, description, objective, context_data, \
                  implementation_details, validation_gates, status, priority, tags, \
                  search_text, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, {NOW}, {NOW})"
        );
        let result = self
            .store()
            .write(
                &sql,
                vec![
                    json!(fields.name),
                    json!(fields.title),
                    json!(fields.description),
                    json!(fields.objective),
                    json!(fields.context_data),
                    json!(fields.implementation_details),
                    json!(fields.validation_gates),
                    json!(PrpStatus::Draft.as_str()),
                    json!(priority.as_str()),
                    json!(join_tags(&fields.tags)),
                    json!(search_text),
                ],
            )
            .await
            .map_err(|e| remap_unique_violation(e, &fields.name))?;

        info!("[knowledge] Created PRP '{}'", fields.name);
        let id = result.last_insert_rowid.unwrap_or_default();
        self.get_prp(&PrpRef::Id(id)).await
    }

    /// Fetch a PRP by id or name.
    pub async fn get_prp(&self, key: &PrpRef) -> AgentResult<Prp> {
        let (clause, param) = match key {
            PrpRef::Id(id) => ("id = ?1", json!(id)),
            PrpRef::Name(name) => ("name = ?1", json!(name)),
        };
        let rows = self
            .store()
            .read(
                &format!("SELECT {PRP_COLUMNS} FROM prps WHERE {clause}"),
                vec![param],
            )
            .await?;
        match rows.first() {
            Some(row) => Prp::from_row(row),
            None => Err(AgentError::NotFound(format!("PRP {key:?}"))),
        }
    }

    /// List PRPs, optionally filtered by status and/or search substring.
    pub async fn list_prps(&self, filter: &PrpFilter) -> AgentResult<Vec<Prp>> {
        let mut sql = format!("SELECT {PRP_COLUMNS} FROM prps");
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<serde_json::Value> = Vec::new();

        if let Some(status) = filter.status {
            params.push(json!(status.as_str()));
            clauses.push("status = ?1");
        }
        if let Some(search) = &filter.search {
            params.push(json!(format!("%{}%", search.to_lowercase())));
            clauses.push(if params.len() == 2 {
                "(search_text LIKE ?2 OR name LIKE ?2)"
            } else {
                "(search_text LIKE ?1 OR name LIKE ?1)"
            });
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC");

        let rows = self.store().read(&sql, params).await?;
        rows.iter().map(Prp::from_row).collect()
    }

    /// Keyword retrieval over PRPs for turn context: any token matching
    /// the name or the search text qualifies.
    pub(crate) async fn search_prps_by_tokens(
        &self,
        tokens: &[String],
        limit: usize,
    ) -> AgentResult<Vec<Prp>> {
        let Some((where_clause, mut params)) =
            token_clause(tokens, &["lower(name)", "search_text"])
        else {
            return Ok(Vec::new());
        };
        let limit_param = params.len() + 1;
        params.push(json!(limit as i64));

        let sql = format!(
            "SELECT {PRP_COLUMNS} FROM prps WHERE {where_clause} \
             ORDER BY updated_at DESC, id ASC LIMIT ?{limit_param}"
        );
        let rows = self.store().read(&sql, params).await?;
        rows.iter().map(Prp::from_row).collect()
    }

    /// Patch a PRP. `search_text` is recomputed from the merged fields
    /// and written in the same statement.
    pub async fn update_prp(&self, key: &PrpRef, patch: PrpPatch) -> AgentResult<Prp> {
        let current = self.get_prp(key).await?;

        let title = patch.title.unwrap_or(current.title);
        let description = patch.description.unwrap_or(current.description);
        let objective = patch.objective.unwrap_or(current.objective);
        let context_data = patch.context_data.or(current.context_data);
        let implementation_details = patch
            .implementation_details
            .or(current.implementation_details);
        let validation_gates = patch.validation_gates.or(current.validation_gates);
        let priority = patch.priority.unwrap_or(current.priority);
        let tags = patch.tags.unwrap_or(current.tags);
        let search_text = compute_search_text(&title, &description, &objective);

        let sql = format!(
            "UPDATE prps \
             SET title = ?1, description = ?2, objective = ?3, context_data = ?4, \
                 implementation_details = ?5, validation_gates = ?6, priority = ?7, \
                 tags = ?8, search_text = ?9, updated_at = {NOW} \
             WHERE id = ?10"
        );
        self.store()
            .write(
                &sql,
                vec![
                    json!(title),
                    json!(description),
                    json!(objective),
                    json!(context_data),
                    json!(implementation_details),
                    json!(validation_gates),
                    json!(priority.as_str()),
                    json!(join_tags(&tags)),
                    json!(search_text),
                    json!(current.id),
                ],
            )
            .await?;

        self.get_prp(&PrpRef::Id(current.id)).await
    }

    /// Move a PRP through its status lifecycle.
    pub async fn set_prp_status(&self, key: &PrpRef, status: PrpStatus) -> AgentResult<Prp> {
        let current = self.get_prp(key).await?;
        let sql = format!("UPDATE prps SET status = ?1, updated_at = {NOW} WHERE id = ?2");
        self.store()
            .write(&sql, vec![json!(status.as_str()), json!(current.id)])
            .await?;
        info!(
            "[knowledge] PRP '{}' status → {}",
            current.name,
            status.as_str()
        );
        self.get_prp(&PrpRef::Id(current.id)).await
    }
}

/// The create path races against concurrent creators; the store's UNIQUE
/// constraint is the arbiter, surfaced as `Conflict`.
fn remap_unique_violation(err: AgentError, name: &str) -> AgentError {
    match &err {
        AgentError::Store(msg) if msg.to_lowercase().contains("unique") => {
            AgentError::Conflict(format!("PRP '{name}' already exists"))
        }
        _ => err,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
