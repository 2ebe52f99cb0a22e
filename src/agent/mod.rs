// PRP Agent — Turn Orchestration
// The core loop: retrieve context → compose the prompt → generate
// (dispatching intent tool calls back through the repository) → persist
// the turn. Failures at any stage surface once, tagged with an opaque
// correlation id through the observability hook; a persistence failure
// after generation never invalidates the reply.

pub mod prompt;
pub mod tools;

use crate::config::Settings;
use crate::error::{AgentError, AgentResult};
use crate::knowledge::{
    prp::pending_translation, KnowledgeRepository, NewPrp, Prp, PrpFilter, PrpPatch, PrpRef,
    PrpStatus, RepositoryStats,
};
use crate::llm::LlmClient;
use crate::observability::{AgentEvent, NoopHook, ObservabilityHook, TurnStage};
use crate::session::{Session, SessionRegistry};
use crate::types::{ChatOptions, Message};
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tools::{ListPrpsArgs, PrpKeyArgs, UpdateStatusArgs};

/// Tool-call rounds allowed before the turn fails with ToolLoopExceeded.
pub const MAX_TOOL_DEPTH: u32 = 4;

// ── Reply ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    /// Opaque id linking this turn to its observability events.
    pub correlation_id: String,
    /// Sequence number of the persisted conversation row, when the
    /// persist step succeeded.
    pub seq: Option<i64>,
}

/// Internal: an error plus the stage it happened in.
type StageResult<T> = Result<T, (TurnStage, AgentError)>;

fn at(stage: TurnStage) -> impl Fn(AgentError) -> (TurnStage, AgentError) {
    move |e| (stage, e)
}

// ── Agent ──────────────────────────────────────────────────────────────

pub struct Agent {
    repository: Arc<KnowledgeRepository>,
    llm: Arc<LlmClient>,
    sessions: SessionRegistry,
    hook: Arc<dyn ObservabilityHook>,
    language: String,
    max_context_items: usize,
    max_tokens_per_turn: usize,
    turn_deadline: Duration,
}

impl Agent {
    pub fn new(
        repository: Arc<KnowledgeRepository>,
        llm: Arc<LlmClient>,
        settings: &Settings,
    ) -> Self {
        Agent {
            repository,
            llm,
            sessions: SessionRegistry::new(),
            hook: Arc::new(NoopHook),
            language: settings.default_language.clone(),
            max_context_items: settings.max_context_items,
            max_tokens_per_turn: settings.max_tokens_per_turn,
            // Per-call deadlines guard each nested request; this bounds
            // the whole turn including the tool loop.
            turn_deadline: settings.request_timeout() * (MAX_TOOL_DEPTH + 2),
        }
    }

    /// Attach an observability hook (replaces the default no-op sink).
    pub fn with_hook(mut self, hook: Arc<dyn ObservabilityHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn repository(&self) -> &KnowledgeRepository {
        &self.repository
    }

    pub fn session_count(&self) -> usize {
        self.sessions.session_count()
    }

    /// Drop a session's window and counters.
    pub async fn clear_session(&self, session_id: &str) {
        self.sessions.entry(session_id).lock().await.clear();
    }

    pub async fn session_turn_count(&self, session_id: &str) -> u64 {
        self.sessions.entry(session_id).lock().await.turn_count
    }

    /// Record a profile hint ("prefers short answers", timezone, …);
    /// hints ride along in every later system prompt for the session.
    pub async fn add_user_hint(&self, session_id: &str, hint: impl Into<String>) {
        self.sessions
            .entry(session_id)
            .lock()
            .await
            .user_hints
            .push(hint.into());
    }

    // ── The turn ───────────────────────────────────────────────────────

    /// Run one user turn. A second concurrent call on the same session
    /// fails fast with `SessionBusy`.
    pub async fn turn(&self, session_id: &str, user_message: &str) -> AgentResult<TurnReply> {
        let mut session = self.sessions.try_acquire(session_id)?;
        let correlation_id = uuid::Uuid::new_v4().to_string();

        self.hook.emit(AgentEvent::TurnStarted {
            session_id: session_id.to_string(),
            correlation_id: correlation_id.clone(),
        });

        let outcome = tokio::time::timeout(
            self.turn_deadline,
            self.run_turn(&mut session, user_message, &correlation_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err((
                TurnStage::Generating,
                AgentError::RequestTimeout {
                    what: "turn".into(),
                    timeout_ms: self.turn_deadline.as_millis() as u64,
                },
            ))
        });

        match outcome {
            Ok(reply) => Ok(reply),
            Err((stage, err)) => {
                error!(
                    "[agent] Turn failed at {:?} (ref {}): {}",
                    stage, correlation_id, err
                );
                self.hook.emit(AgentEvent::TurnFailed {
                    session_id: session_id.to_string(),
                    correlation_id,
                    stage,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_turn(
        &self,
        session: &mut Session,
        user_message: &str,
        correlation_id: &str,
    ) -> StageResult<TurnReply> {
        let session_id = session.session_id.clone();

        // ── Retrieving ─────────────────────────────────────────────────
        let started = Instant::now();
        let items = self
            .repository
            .search_context(user_message, self.max_context_items)
            .await
            .map_err(at(TurnStage::Retrieving))?;
        self.hook.emit(AgentEvent::RetrievalCompleted {
            session_id: session_id.clone(),
            count: items.len(),
            latency_ms: started.elapsed().as_millis() as u64,
        });

        // ── Composing ──────────────────────────────────────────────────
        let mut base_system = prompt::system_prompt(&self.language);
        if !session.user_hints.is_empty() {
            base_system.push_str(&format!(
                "\nUser profile: {}",
                session.user_hints.join("; ")
            ));
        }
        let composed = prompt::compose(
            &base_system,
            items,
            session.window(),
            user_message,
            self.max_tokens_per_turn,
        );
        let system = composed.system;
        let mut messages = composed.messages;
        let options = ChatOptions {
            max_tokens: None,
            temperature: None,
            tools: tools::intent_tools(),
        };

        // ── Generating (tool loop) ─────────────────────────────────────
        let mut depth = 0u32;
        let final_text = loop {
            let llm_started = Instant::now();
            let completion = self
                .llm
                .complete(&system, &messages, &options)
                .await
                .map_err(at(TurnStage::Generating))?;
            for attempt in 1..=completion.retries {
                self.hook.emit(AgentEvent::LlmRetried {
                    session_id: session_id.clone(),
                    attempt,
                });
            }
            let usage = completion.reply.usage.unwrap_or_default();
            self.hook.emit(AgentEvent::LlmCompleted {
                session_id: session_id.clone(),
                tokens_in: usage.input_tokens,
                tokens_out: usage.output_tokens,
                latency_ms: llm_started.elapsed().as_millis() as u64,
            });

            if completion.reply.is_final() {
                break completion.reply.text;
            }

            depth += 1;
            if depth > MAX_TOOL_DEPTH {
                return Err((
                    TurnStage::Generating,
                    AgentError::ToolLoopExceeded(MAX_TOOL_DEPTH),
                ));
            }

            let tool_calls = completion.reply.tool_calls;
            messages.push(Message {
                role: crate::types::Role::Assistant,
                content: completion.reply.text,
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
            });

            for tc in &tool_calls {
                info!("[agent] Tool call: {} id={}", tc.function.name, tc.id);
                self.hook.emit(AgentEvent::ToolInvoked {
                    session_id: session_id.clone(),
                    name: tc.function.name.clone(),
                });
                let output = self
                    .dispatch_intent(&tc.function.name, &tc.function.arguments)
                    .await;
                match output {
                    Ok(text) => messages.push(Message::tool(tc.id.clone(), text)),
                    Err(e) => {
                        self.hook.emit(AgentEvent::ToolFailed {
                            session_id: session_id.clone(),
                            name: tc.function.name.clone(),
                            error: e.to_string(),
                        });
                        messages.push(Message::tool(tc.id.clone(), format!("Error: {e}")));
                    }
                }
            }
        };

        // ── Persisting ─────────────────────────────────────────────────
        session.push(Message::user(user_message));
        session.push(Message::assistant(final_text.clone()));
        session.turn_count += 1;

        let seq = match self
            .repository
            .append_conversation(&session_id, user_message, &final_text, None)
            .await
        {
            Ok(seq) => {
                self.hook.emit(AgentEvent::TurnPersisted {
                    session_id: session_id.clone(),
                    seq,
                });
                Some(seq)
            }
            Err(e) => {
                // The reply survives; the loss is recorded and surfaced
                // through the hook only.
                warn!(
                    "[agent] Persist failed (ref {}), reply still returned: {}",
                    correlation_id, e
                );
                self.hook.emit(AgentEvent::TurnFailed {
                    session_id: session_id.clone(),
                    correlation_id: correlation_id.to_string(),
                    stage: TurnStage::Persisting,
                    reason: e.to_string(),
                });
                None
            }
        };

        Ok(TurnReply {
            text: final_text,
            correlation_id: correlation_id.to_string(),
            seq,
        })
    }

    // ── Intent dispatch (model-invoked tools) ──────────────────────────

    /// Route a model tool call to the repository. Unknown names come
    /// back as errors for the model to read, not as turn failures.
    async fn dispatch_intent(&self, name: &str, arguments: &str) -> AgentResult<String> {
        match name {
            tools::TOOL_LIST_PRPS => {
                let args: ListPrpsArgs = parse_args(arguments)?;
                let filter = PrpFilter {
                    status: args.status.as_deref().map(PrpStatus::parse).transpose()?,
                    search: args.search,
                };
                let prps = self.list_prps(&filter).await?;
                let summaries: Vec<_> = prps
                    .iter()
                    .map(|p| {
                        json!({
                            "id": p.id,
                            "name": p.name,
                            "title": p.title,
                            "status": p.status.as_str(),
                            "priority": p.priority.as_str(),
                        })
                    })
                    .collect();
                Ok(json!({ "prps": summaries }).to_string())
            }
            tools::TOOL_CREATE_PRP => {
                let fields: NewPrp = parse_args(arguments)?;
                let prp = self.create_prp(fields).await?;
                Ok(json!({ "created": prp.name, "id": prp.id }).to_string())
            }
            tools::TOOL_ANALYZE_PRP => {
                let args: PrpKeyArgs = parse_args(arguments)?;
                let prp = self.resolve_translations(&PrpRef::parse(&args.prp)).await?;
                Ok(serde_json::to_string(&prp)?)
            }
            tools::TOOL_UPDATE_PRP_STATUS => {
                let args: UpdateStatusArgs = parse_args(arguments)?;
                let status = PrpStatus::parse(&args.status)?;
                let prp = self
                    .set_prp_status(&PrpRef::parse(&args.prp), status)
                    .await?;
                Ok(json!({ "name": prp.name, "status": prp.status.as_str() }).to_string())
            }
            other => Err(AgentError::store(format!("unknown tool '{other}'"))),
        }
    }

    // ── Direct intents (explicit user invocation, no free-form LLM) ────

    pub async fn create_prp(&self, fields: NewPrp) -> AgentResult<Prp> {
        validate_prp_fields(&fields)?;
        self.repository.create_prp(fields).await
    }

    pub async fn list_prps(&self, filter: &PrpFilter) -> AgentResult<Vec<Prp>> {
        self.repository.list_prps(filter).await
    }

    pub async fn get_prp(&self, key: &PrpRef) -> AgentResult<Prp> {
        self.repository.get_prp(key).await
    }

    pub async fn set_prp_status(&self, key: &PrpRef, status: PrpStatus) -> AgentResult<Prp> {
        self.repository.set_prp_status(key, status).await
    }

    pub async fn stats(&self) -> AgentResult<RepositoryStats> {
        self.repository.stats().await
    }

    /// Analyze a PRP: consume any pending translation annotations, then
    /// ask the model for an implementation-readiness assessment.
    pub async fn analyze_prp(&self, key: &PrpRef) -> AgentResult<String> {
        let prp = self.resolve_translations(key).await?;

        let system = prompt::system_prompt(&self.language);
        let request = format!(
            "Analyze this Product Requirement Prompt for completeness, risks and \
             suggested next steps:\n\n{}",
            serde_json::to_string_pretty(&prp)?
        );
        let completion = self
            .llm
            .complete(&system, &[Message::user(request)], &ChatOptions::default())
            .await?;
        Ok(completion.reply.text)
    }

    /// Replace translation annotations with translated content, exactly
    /// once. A PRP without annotations is returned untouched.
    async fn resolve_translations(&self, key: &PrpRef) -> AgentResult<Prp> {
        let prp = self.repository.get_prp(key).await?;
        if !prp.needs_translation() {
            return Ok(prp);
        }

        info!("[agent] Resolving translation annotations for PRP '{}'", prp.name);
        let originals = json!({
            "title": pending_translation(&prp.title).unwrap_or(&prp.title),
            "description": pending_translation(&prp.description).unwrap_or(&prp.description),
            "objective": pending_translation(&prp.objective).unwrap_or(&prp.objective),
        });
        let request = format!(
            "Translate the values of this JSON object into {} and answer with JSON \
             only, keeping the same keys:\n{}",
            self.language, originals
        );
        let completion = self
            .llm
            .complete(
                "You are a precise translator. Answer with a JSON object only.",
                &[Message::user(request)],
                &ChatOptions::default(),
            )
            .await?;

        let translated: serde_json::Value = match serde_json::from_str(&completion.reply.text) {
            Ok(v) => v,
            Err(e) => {
                // Keep the annotations for a later attempt rather than
                // storing a half-translated PRP.
                warn!(
                    "[agent] Translation reply was not valid JSON for '{}': {}",
                    prp.name, e
                );
                return Ok(prp);
            }
        };

        let field = |key: &str| {
            translated
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        let patch = PrpPatch {
            title: field("title"),
            description: field("description"),
            objective: field("objective"),
            ..PrpPatch::default()
        };
        self.repository.update_prp(&PrpRef::Id(prp.id), patch).await
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: &str) -> AgentResult<T> {
    serde_json::from_str(arguments)
        .map_err(|e| AgentError::store(format!("invalid tool arguments: {e}")))
}

fn validate_prp_fields(fields: &NewPrp) -> AgentResult<()> {
    if fields.name.trim().is_empty() {
        return Err(AgentError::store("PRP name must not be empty"));
    }
    if fields.name.contains(char::is_whitespace) {
        return Err(AgentError::store("PRP name must not contain whitespace"));
    }
    if fields.title.trim().is_empty() {
        return Err(AgentError::store("PRP title must not be empty"));
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────
