// Repository invariants, driven end-to-end through the real StoreClient
// against the in-memory fake store bus.

mod common;

use common::FakeStoreBus;
use prp_agent::error::AgentError;
use prp_agent::knowledge::{
    IngestOutcome, KnowledgeRepository, LanguagePolicy, NewPrp, PrpFilter, PrpRef, PrpStatus,
};
use prp_agent::store::{Statement, StoreClient};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

fn repository() -> (KnowledgeRepository, Arc<FakeStoreBus>) {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus.clone(), "kb");
    (
        KnowledgeRepository::new(store, LanguagePolicy::default()),
        bus,
    )
}

fn translating_repository() -> KnowledgeRepository {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus, "kb");
    KnowledgeRepository::new(
        store,
        LanguagePolicy {
            language: "pt-br".into(),
            auto_translate_on_create: true,
        },
    )
}

fn new_prp(name: &str) -> NewPrp {
    NewPrp {
        name: name.into(),
        title: "Auth".into(),
        description: "JWT login".into(),
        objective: "Secure access".into(),
        context_data: None,
        implementation_details: None,
        validation_gates: None,
        priority: None,
        tags: vec![],
    }
}

// ── Fingerprint idempotence ────────────────────────────────────────────

#[tokio::test]
async fn ingest_is_idempotent_until_content_changes() {
    let (repo, _) = repository();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "Turso is an edge SQLite service. Use mcp to connect.").unwrap();

    let first = repo.ingest_from_file(file.path()).await.unwrap();
    assert_eq!(first, IngestOutcome::Inserted);

    let second = repo.ingest_from_file(file.path()).await.unwrap();
    assert_eq!(second, IngestOutcome::Unchanged);

    let before = repo
        .search("turso", 5)
        .await
        .unwrap()
        .pop()
        .expect("row present");

    // Millisecond timestamps: make sure the clock can tick.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    writeln!(file, "Now with replication details.").unwrap();
    file.flush().unwrap();
    let third = repo.ingest_from_file(file.path()).await.unwrap();
    assert_eq!(third, IngestOutcome::Updated);

    let after = repo
        .search("turso", 5)
        .await
        .unwrap()
        .pop()
        .expect("row still present");
    assert_eq!(after.id, before.id, "update was in place");
    assert_ne!(after.file_hash, before.file_hash);
    assert!(
        after.updated_at > before.updated_at,
        "updated_at must strictly advance: {} vs {}",
        after.updated_at,
        before.updated_at
    );
}

// ── Conversation monotonicity ──────────────────────────────────────────

#[tokio::test]
async fn conversation_seq_is_contiguous_per_session() {
    let (repo, _) = repository();

    for i in 1..=4 {
        let seq = repo
            .append_conversation("s1", &format!("q{i}"), &format!("a{i}"), None)
            .await
            .unwrap();
        assert_eq!(seq, i);
    }

    // Interleave another session — s1 numbering is unaffected.
    assert_eq!(
        repo.append_conversation("s2", "other", "reply", None)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        repo.append_conversation("s1", "q5", "a5", None).await.unwrap(),
        5
    );

    let turns = repo.recent_conversations("s1", 10).await.unwrap();
    let mut seqs: Vec<i64> = turns.iter().map(|t| t.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

// ── PRP search_text coherence ──────────────────────────────────────────

#[tokio::test]
async fn prp_search_text_tracks_source_fields() {
    let (repo, _) = repository();

    let prp = repo.create_prp(new_prp("auth-system")).await.unwrap();
    assert_eq!(prp.search_text, "auth jwt login secure access");
    assert_eq!(prp.status, PrpStatus::Draft);

    let updated = repo
        .update_prp(
            &PrpRef::Name("auth-system".into()),
            prp_agent::knowledge::PrpPatch {
                description: Some("OAuth2 login".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.search_text, "auth oauth2 login secure access");

    // Status changes leave search_text alone.
    let archived = repo
        .set_prp_status(&PrpRef::Id(updated.id), PrpStatus::Archived)
        .await
        .unwrap();
    assert_eq!(archived.search_text, "auth oauth2 login secure access");
    assert_eq!(archived.status, PrpStatus::Archived);
}

#[tokio::test]
async fn duplicate_prp_name_conflicts() {
    let (repo, _) = repository();
    repo.create_prp(new_prp("auth-system")).await.unwrap();

    let err = repo.create_prp(new_prp("auth-system")).await.unwrap_err();
    assert!(matches!(err, AgentError::Conflict(_)), "got {err:?}");

    let listed = repo.list_prps(&PrpFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "auth-system");
}

#[tokio::test]
async fn missing_prp_is_not_found() {
    let (repo, _) = repository();
    let err = repo
        .get_prp(&PrpRef::Name("nope".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
}

// ── Search ranking ─────────────────────────────────────────────────────

#[tokio::test]
async fn search_ranks_topic_over_content_over_tags() {
    let (repo, _) = repository();
    repo.ingest_content("docs/a.md", "# Unrelated heading\nBody mentions turso here.")
        .await
        .unwrap();
    repo.ingest_content("docs/turso-guide.md", "# Turso Guide\nAll about the service.")
        .await
        .unwrap();

    let results = repo.search("turso", 10).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].topic, "Turso Guide",
        "topic match must outrank content match"
    );
}

#[tokio::test]
async fn search_respects_limit() {
    let (repo, _) = repository();
    for i in 0..7 {
        repo.ingest_content(
            &format!("docs/n{i}.md"),
            &format!("# Note {i}\nmcp connection notes"),
        )
        .await
        .unwrap();
    }
    let results = repo.search("mcp", 3).await.unwrap();
    assert_eq!(results.len(), 3);
}

// ── Read-only guard end-to-end ─────────────────────────────────────────

#[tokio::test]
async fn read_only_guard_issues_zero_bus_calls() {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus.clone(), "kb");
    let err = store
        .read("DELETE FROM knowledge_base", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ReadOnlyViolation(_)));
    assert_eq!(bus.calls(), 0);
}

// ── Translation annotation policy ──────────────────────────────────────

#[tokio::test]
async fn auto_translate_annotates_english_fields_only() {
    let repo = translating_repository();
    let prp = repo
        .create_prp(NewPrp {
            name: "login".into(),
            title: "Login form".into(),
            description: "Já em português".into(),
            objective: "Ship it".into(),
            context_data: None,
            implementation_details: None,
            validation_gates: None,
            priority: None,
            tags: vec![],
        })
        .await
        .unwrap();

    assert!(prp.title.starts_with("[[traduzir:pt-br]]"));
    assert_eq!(prp.description, "Já em português");
    assert!(prp.needs_translation());
    assert_eq!(
        prp_agent::knowledge::prp::pending_translation(&prp.title),
        Some("Login form")
    );
}

// ── Batched ingest ─────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_ingest_reports_per_row_outcomes() {
    let (repo, _) = repository();
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.md");
    std::fs::write(&good, "# Good\nturso notes").unwrap();
    let missing = dir.path().join("missing.md");

    let results = repo
        .ingest_paths(&[good.clone(), missing.clone(), good.clone()])
        .await;

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0].1, Ok(IngestOutcome::Inserted)));
    assert!(results[1].1.is_err(), "missing file fails its own row");
    assert!(matches!(results[2].1, Ok(IngestOutcome::Unchanged)));
}

// ── Store catalog surface ──────────────────────────────────────────────

#[tokio::test]
async fn catalog_operations_round_trip() {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus, "kb");

    assert_eq!(store.list_databases().await.unwrap(), vec!["kb"]);
    let tables = store.list_tables().await.unwrap();
    assert!(tables.contains(&"knowledge_base".to_string()));
    assert!(tables.contains(&"prps".to_string()));

    let columns = store.describe_table("conversations").await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"session_id"));
    assert!(names.contains(&"seq"));
}

#[tokio::test]
async fn batch_reports_one_result_per_statement() {
    let bus = Arc::new(FakeStoreBus::new());
    let store = StoreClient::new(bus, "kb");

    let insert = "INSERT INTO conversations \
                      (session_id, seq, user_message, agent_response, created_at) \
                  VALUES (?1, ?2, 'q', 'a', '2026-01-01T00:00:00Z')";
    let results = store
        .batch(vec![
            Statement::new(insert, vec![json!("sb"), json!(1)]),
            Statement::new(insert, vec![json!("sb"), json!(2)]),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.rows_affected == 1));

    let rows = store
        .read(
            "SELECT COUNT(*) AS n FROM conversations WHERE session_id = ?1",
            vec![json!("sb")],
        )
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], json!(2));
}

// ── Transport failure surfaces ─────────────────────────────────────────

#[tokio::test]
async fn broken_bus_surfaces_transport_error() {
    let (repo, bus) = repository();
    bus.set_broken(true);
    let err = repo.search("anything", 5).await.unwrap_err();
    assert!(matches!(err, AgentError::Transport(_)));

    bus.set_broken(false);
    assert!(repo.search("anything", 5).await.is_ok());
}
