// PRP Agent — CLI
// A minimal REPL over the agent: read a line, run a turn, print the
// reply. Commands: help, stats, prps, ingest <path>, clear-session,
// quit. Exit codes: 0 clean, 1 fatal startup error, 2 config error.

use clap::Parser;
use log::{error, info};
use prp_agent::agent::Agent;
use prp_agent::config::Settings;
use prp_agent::error::AgentError;
use prp_agent::knowledge::{KnowledgeRepository, LanguagePolicy, PrpFilter};
use prp_agent::llm::LlmClient;
use prp_agent::mcp::client::McpClient;
use prp_agent::mcp::types::McpEndpoint;
use prp_agent::observability::LogHook;
use prp_agent::store::StoreClient;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "prp-agent",
    about = "Context-augmented conversational agent over a Turso knowledge store",
    version
)]
struct Cli {
    /// Session id to resume; a fresh one is generated when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Log filter, e.g. "info" or "prp_agent=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    // Load .env before clap resolves env-backed args.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .init();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("prp-agent: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("prp-agent: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(settings, cli.session)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("prp-agent: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(settings: Settings, session: Option<String>) -> Result<(), AgentError> {
    let endpoint = McpEndpoint {
        command: settings.mcp_command.clone(),
        args: settings.mcp_args.clone(),
        env: settings.mcp_child_env(),
        auto_restart: true,
    };
    let mcp = Arc::new(McpClient::new(endpoint, settings.request_timeout()));
    let store = StoreClient::new(mcp.clone(), settings.store_default_database.clone());
    let repository = Arc::new(KnowledgeRepository::new(
        store,
        LanguagePolicy {
            language: settings.default_language.clone(),
            auto_translate_on_create: settings.auto_translate_on_create,
        },
    ));
    let llm = Arc::new(LlmClient::from_settings(&settings));
    let agent = Agent::new(repository, llm, &settings).with_hook(Arc::new(LogHook));

    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("[cli] Session {session_id}");
    println!("prp-agent — type 'help' for commands, 'quit' to exit.");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next() else { break };
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => break,
            "help" => print_help(),
            "stats" => show_stats(&agent, &session_id).await,
            "clear-session" => {
                agent.clear_session(&session_id).await;
                println!("session cleared");
            }
            "prps" => match agent.list_prps(&PrpFilter::default()).await {
                Ok(prps) if prps.is_empty() => println!("no PRPs yet"),
                Ok(prps) => {
                    for p in prps {
                        println!(
                            "  #{} {} [{}] {} — {}",
                            p.id,
                            p.name,
                            p.status.as_str(),
                            p.priority.as_str(),
                            p.title
                        );
                    }
                }
                Err(e) => println!("error: {e}"),
            },
            _ if input.starts_with("ingest ") => {
                let path = std::path::PathBuf::from(input.trim_start_matches("ingest ").trim());
                match agent.repository().ingest_from_file(&path).await {
                    Ok(outcome) => println!("{outcome:?}: {}", path.display()),
                    Err(e) => println!("error: {e}"),
                }
            }
            _ => match agent.turn(&session_id, input).await {
                Ok(reply) => println!("{}", reply.text),
                Err(e) => {
                    error!("[cli] turn error: {e}");
                    println!("error: {e}");
                }
            },
        }
    }

    mcp.shutdown().await;
    info!("[cli] Bye");
    Ok(())
}

fn print_help() {
    println!(
        "commands:\n  \
         help            show this help\n  \
         stats           store row counts and session counters\n  \
         prps            list Product Requirement Prompts\n  \
         ingest <path>   ingest a file into the knowledge base\n  \
         clear-session   forget the current session window\n  \
         quit            exit\n\
         anything else is sent to the agent as a message."
    );
}

async fn show_stats(agent: &Agent, session_id: &str) {
    match agent.stats().await {
        Ok(stats) => {
            println!(
                "knowledge rows: {}\nconversation turns: {}\nprps: {}\nsession turns: {}",
                stats.knowledge_rows,
                stats.conversation_turns,
                stats.prps,
                agent.session_turn_count(session_id).await,
            );
        }
        Err(e) => println!("error: {e}"),
    }
}
