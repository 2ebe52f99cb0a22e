// Turn state machine, driven end-to-end with the in-memory store bus
// and scripted chat providers.

mod common;

use async_trait::async_trait;
use common::FakeStoreBus;
use parking_lot::Mutex;
use prp_agent::agent::{Agent, MAX_TOOL_DEPTH};
use prp_agent::config::Settings;
use prp_agent::error::AgentError;
use prp_agent::knowledge::{KnowledgeRepository, LanguagePolicy, PrpFilter, PrpRef};
use prp_agent::llm::{ChatProvider, LlmClient, ProviderError};
use prp_agent::observability::{AgentEvent, ObservabilityHook};
use prp_agent::store::StoreClient;
use prp_agent::types::{
    ChatOptions, ChatReply, FunctionCall, Message, ProviderKind, ToolCall,
};
use std::sync::Arc;

// ── Harness ────────────────────────────────────────────────────────────

fn test_settings() -> Settings {
    Settings {
        llm_provider: ProviderKind::OpenAi,
        llm_api_key: "test-key".into(),
        llm_model: "test-model".into(),
        llm_base_url: None,
        store_url: "libsql://kb.test".into(),
        store_auth_token: None,
        store_default_database: "kb".into(),
        mcp_command: "unused-in-tests".into(),
        mcp_args: vec![],
        max_context_items: 5,
        max_tokens_per_turn: 4096,
        request_timeout_ms: 5_000,
        default_language: "pt-br".into(),
        auto_translate_on_create: false,
    }
}

/// What a scripted provider does on one attempt.
enum Step {
    Reply(&'static str),
    CallTool(&'static str, &'static str),
    Sleep(u64),
}

/// Scripted provider that records every prompt it is given.
#[derive(Default)]
struct ScriptedProvider {
    steps: Mutex<Vec<Step>>,
    pub seen_systems: Arc<Mutex<Vec<String>>>,
    pub seen_messages: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Self {
        ScriptedProvider {
            steps: Mutex::new(steps),
            seen_systems: Arc::new(Mutex::new(Vec::new())),
            seen_messages: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_once(
        &self,
        system_prompt: &str,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ChatReply, ProviderError> {
        self.seen_systems.lock().push(system_prompt.to_string());
        self.seen_messages.lock().push(messages.to_vec());

        let step = {
            let mut steps = self.steps.lock();
            if steps.is_empty() {
                Step::Reply("script exhausted")
            } else {
                steps.remove(0)
            }
        };

        match step {
            Step::Sleep(ms) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok(reply("slow reply"))
            }
            Step::Reply(text) => Ok(reply(text)),
            Step::CallTool(name, args) => Ok(ChatReply {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: format!("call_{name}"),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: name.into(),
                        arguments: args.into(),
                    },
                }],
                usage: None,
            }),
        }
    }
}

fn reply(text: &str) -> ChatReply {
    ChatReply {
        text: text.into(),
        tool_calls: vec![],
        usage: None,
    }
}

/// Hook that collects every event for assertions.
#[derive(Default)]
struct CollectingHook {
    events: Mutex<Vec<AgentEvent>>,
}

impl ObservabilityHook for CollectingHook {
    fn emit(&self, event: AgentEvent) {
        self.events.lock().push(event);
    }
}

fn build_agent(
    steps: Vec<Step>,
) -> (Agent, Arc<FakeStoreBus>, Arc<Mutex<Vec<String>>>, Arc<CollectingHook>) {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus.clone(), "kb");
    let repository = Arc::new(KnowledgeRepository::new(store, LanguagePolicy::default()));

    let provider = ScriptedProvider::new(steps);
    let systems = provider.seen_systems.clone();
    let llm = Arc::new(LlmClient::new(Box::new(provider)));

    let hook = Arc::new(CollectingHook::default());
    let agent =
        Agent::new(repository, llm, &test_settings()).with_hook(hook.clone());
    (agent, bus, systems, hook)
}

// ── Ingest → retrieve → answer (the S1 shape) ─────────────────────────

#[tokio::test]
async fn turn_injects_retrieved_context_and_persists() {
    let (agent, _bus, systems, hook) =
        build_agent(vec![Step::Reply("Turso é um serviço SQLite de borda.")]);

    agent
        .repository()
        .ingest_content(
            "docs/turso.md",
            "Turso is an edge SQLite service. Use mcp to connect.",
        )
        .await
        .unwrap();

    let turn = agent.turn("s1", "What is Turso?").await.unwrap();
    assert!(!turn.text.is_empty());
    assert_eq!(turn.seq, Some(1));

    // The retrieved row made it into the composed prompt verbatim.
    let seen = systems.lock();
    assert!(seen[0].contains("Turso is an edge SQLite service"));
    assert!(seen[0].contains("[docs/turso.md — "));

    // Exactly one conversation row, seq 1.
    let turns = agent
        .repository()
        .recent_conversations("s1", 10)
        .await
        .unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].seq, 1);
    assert_eq!(turns[0].user_message, "What is Turso?");

    // Event order: started → retrieval → llm → persisted.
    let events = hook.events.lock();
    assert!(matches!(events[0], AgentEvent::TurnStarted { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::RetrievalCompleted { count: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::TurnPersisted { seq: 1, .. })));
}

// ── Tool dispatch ──────────────────────────────────────────────────────

#[tokio::test]
async fn model_tool_call_round_trips_through_repository() {
    let (agent, _bus, _systems, hook) = build_agent(vec![
        Step::CallTool(
            "create_prp",
            r#"{"name":"auth-system","title":"Auth","description":"JWT login","objective":"Secure access"}"#,
        ),
        Step::Reply("PRP criado."),
    ]);

    let turn = agent.turn("s1", "create an auth PRP").await.unwrap();
    assert_eq!(turn.text, "PRP criado.");

    let prps = agent.list_prps(&PrpFilter::default()).await.unwrap();
    assert_eq!(prps.len(), 1);
    assert_eq!(prps[0].name, "auth-system");
    assert_eq!(prps[0].search_text, "auth jwt login secure access");

    assert!(hook
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolInvoked { name, .. } if name == "create_prp")));
}

#[tokio::test]
async fn unknown_tool_is_reported_to_model_not_fatal() {
    let (agent, _bus, _systems, hook) = build_agent(vec![
        Step::CallTool("drop_database", "{}"),
        Step::Reply("desculpe, não posso"),
    ]);

    let turn = agent.turn("s1", "do something odd").await.unwrap();
    assert_eq!(turn.text, "desculpe, não posso");
    assert!(hook
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolFailed { .. })));
}

// ── Tool loop guard (the S5 shape) ─────────────────────────────────────

#[tokio::test]
async fn endless_tool_calls_fail_with_loop_exceeded_and_nothing_persists() {
    let steps: Vec<Step> = (0..16)
        .map(|_| Step::CallTool("list_prps", "{}"))
        .collect();
    let (agent, _bus, _systems, hook) = build_agent(steps);

    let err = agent.turn("s1", "loop forever").await.unwrap_err();
    assert!(
        matches!(err, AgentError::ToolLoopExceeded(depth) if depth == MAX_TOOL_DEPTH),
        "got {err:?}"
    );

    // No conversation row for the failed turn.
    let turns = agent
        .repository()
        .recent_conversations("s1", 10)
        .await
        .unwrap();
    assert!(turns.is_empty());

    // The failure was recorded with a correlation id.
    let events = hook.events.lock();
    let failed = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TurnFailed { correlation_id, .. } => Some(correlation_id.clone()),
            _ => None,
        })
        .expect("TurnFailed event");
    assert!(!failed.is_empty());
}

// ── Concurrent-turn exclusion ──────────────────────────────────────────

#[tokio::test]
async fn second_concurrent_turn_on_same_session_is_busy() {
    let (agent, _bus, _systems, _hook) =
        build_agent(vec![Step::Sleep(50), Step::Reply("second")]);
    let agent = Arc::new(agent);

    let a = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.turn("s1", "first").await })
    };
    // Give the first turn time to take the session lock.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let b = agent.turn("s1", "second").await;

    let first = a.await.unwrap();
    assert!(first.is_ok(), "first turn succeeds: {first:?}");
    assert!(
        matches!(b, Err(AgentError::SessionBusy(ref id)) if id == "s1"),
        "second turn is busy: {b:?}"
    );

    // Exactly one turn persisted.
    let turns = agent
        .repository()
        .recent_conversations("s1", 10)
        .await
        .unwrap();
    assert_eq!(turns.len(), 1);
}

#[tokio::test]
async fn different_sessions_run_concurrently() {
    let (agent, _bus, _systems, _hook) =
        build_agent(vec![Step::Sleep(30), Step::Reply("two")]);
    let agent = Arc::new(agent);

    let a = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.turn("s1", "one").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let b = agent.turn("s2", "two").await;

    assert!(a.await.unwrap().is_ok());
    assert!(b.is_ok());
}

// ── Persistence failure keeps the reply ────────────────────────────────

#[tokio::test]
async fn persist_failure_still_returns_reply() {
    let (agent, bus, _systems, hook) = build_agent(vec![Step::Reply("resposta")]);
    bus.set_write_broken(true);

    let turn = agent.turn("s1", "hello").await.unwrap();
    assert_eq!(turn.text, "resposta");
    assert_eq!(turn.seq, None, "persist failed, reply survived");

    let events = hook.events.lock();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::TurnFailed {
            stage: prp_agent::observability::TurnStage::Persisting,
            ..
        }
    )));
}

// ── Translation annotations are consumed exactly once ──────────────────

#[tokio::test]
async fn analyze_prp_consumes_translation_annotations() {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus.clone(), "kb");
    let repository = Arc::new(KnowledgeRepository::new(
        store,
        LanguagePolicy {
            language: "pt-br".into(),
            auto_translate_on_create: true,
        },
    ));
    let provider = ScriptedProvider::new(vec![
        Step::Reply(
            r#"{"title":"Formulário de login","description":"Login com JWT","objective":"Entregar"}"#,
        ),
        Step::Reply("Análise: PRP completo."),
        Step::Reply("Análise repetida."),
    ]);
    let llm = Arc::new(LlmClient::new(Box::new(provider)));
    let agent = Agent::new(repository, llm, &test_settings());

    agent
        .create_prp(prp_agent::knowledge::NewPrp {
            name: "login".into(),
            title: "Login form".into(),
            description: "JWT login".into(),
            objective: "Ship".into(),
            context_data: None,
            implementation_details: None,
            validation_gates: None,
            priority: None,
            tags: vec![],
        })
        .await
        .unwrap();

    let before = agent
        .get_prp(&PrpRef::Name("login".into()))
        .await
        .unwrap();
    assert!(before.needs_translation());

    let analysis = agent
        .analyze_prp(&PrpRef::Name("login".into()))
        .await
        .unwrap();
    assert_eq!(analysis, "Análise: PRP completo.");

    let after = agent.get_prp(&PrpRef::Name("login".into())).await.unwrap();
    assert!(!after.needs_translation(), "annotations consumed");
    assert_eq!(after.title, "Formulário de login");
    assert_eq!(
        after.search_text,
        "formulário de login login com jwt entregar"
    );
}
