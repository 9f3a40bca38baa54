//! Flowstack - command line session
//!
//! Reads user messages from stdin, one per line, and prints the assistant's
//! replies. State is persisted to SQLite, so a session can be resumed by
//! passing the same `FLOWSTACK_SESSION`.

use flowstack::config::EngineConfig;
use flowstack::db::Database;
use flowstack::flows::load_flows;
use flowstack::nlu::DirectCommandParser;
use flowstack::runtime::http::{HttpActionServer, HttpCommandGenerator, HttpResponseGenerator};
use flowstack::runtime::local::{ActionRegistry, TemplateResponseGenerator};
use flowstack::runtime::{
    ActionExecutor, Collaborators, CommandGenerator, DatabaseStore, ResponseGenerator,
    RuntimeManager,
};
use flowstack::state_machine::DialogueContext;
use flowstack::validators::ValidatorRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so replies stay readable on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowstack=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Configuration
    let flows_path = std::env::var("FLOWSTACK_FLOWS")
        .map_err(|_| "FLOWSTACK_FLOWS must point at a flow file")?;
    let db_path = std::env::var("FLOWSTACK_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.flowstack/flowstack.db")
    });
    let session_id = std::env::var("FLOWSTACK_SESSION")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let config = EngineConfig::from_env();

    let validators = ValidatorRegistry::new();
    let flows = load_flows(&flows_path, &validators)?;

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    let collaborators = Collaborators {
        store: Arc::new(DatabaseStore::new(db)),
        nlu: command_generator()?,
        actions: action_executor()?,
        generator: response_generator()?,
    };
    let context = DialogueContext::new(Arc::new(flows), Arc::new(validators), config);
    let manager = RuntimeManager::new(context, collaborators);

    tracing::info!(session_id = %session_id, "Session ready");
    eprintln!("session {session_id} (Ctrl-D to quit, /reset to start over)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            manager.reset(&session_id).await?;
            println!("(session reset)");
            continue;
        }
        match manager.handle_message(&session_id, line).await {
            Ok(reply) => {
                for message in &reply.messages {
                    println!("bot> {message}");
                }
                if reply.handed_off {
                    println!("(handed off to a human agent, /reset to start over)");
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    manager.close(&session_id).await;
    Ok(())
}

fn command_generator() -> Result<Arc<dyn CommandGenerator>, Box<dyn std::error::Error>> {
    Ok(match std::env::var("FLOWSTACK_NLU_URL") {
        Ok(url) => {
            tracing::info!(url = %url, "Using NLU endpoint");
            Arc::new(HttpCommandGenerator::new(url)?)
        }
        Err(_) => Arc::new(DirectCommandParser),
    })
}

fn action_executor() -> Result<Arc<dyn ActionExecutor>, Box<dyn std::error::Error>> {
    Ok(match std::env::var("FLOWSTACK_ACTION_URL") {
        Ok(url) => {
            tracing::info!(url = %url, "Using action server");
            Arc::new(HttpActionServer::new(url)?)
        }
        Err(_) => Arc::new(ActionRegistry::new()),
    })
}

fn response_generator() -> Result<Arc<dyn ResponseGenerator>, Box<dyn std::error::Error>> {
    Ok(match std::env::var("FLOWSTACK_NLG_URL") {
        Ok(url) => {
            tracing::info!(url = %url, "Using generation endpoint");
            Arc::new(HttpResponseGenerator::new(url)?)
        }
        Err(_) => Arc::new(TemplateResponseGenerator),
    })
}
