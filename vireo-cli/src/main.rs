//! Headless driver for the assistant: inspect MCP tools or run a chat turn
//! without the browser frontend.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use vireo_browser::{Browser, SharedBrowser};
use vireo_core::agent::{AgentEvent, AgentLoop, TurnOutcome};
use vireo_core::config::ConfigStore;
use vireo_core::mcp::{ConnectionState, McpEvent, McpManager};
use vireo_core::openai::OpenAiProvider;
use vireo_core::tools::{BrowserHost, BrowserTool, ToolDispatcher};

/// vireo - drive the browser assistant from a terminal
#[derive(Parser)]
#[command(name = "vireo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Assistant config file (default: the platform config dir)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled MCP server and list the tools on offer
    Tools,
    /// Run one agentic turn against the configured provider
    Chat {
        /// The user message
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        /// Start with this page open in the in-memory browser
        #[arg(long, value_name = "URL", default_value = "about:blank")]
        url: String,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ConfigStore, String> {
    match path {
        Some(path) => ConfigStore::load(path).map_err(|e| e.to_string()),
        None => ConfigStore::open_default().map_err(|e| e.to_string()),
    }
}

/// Connection changes are already logged by the manager; the receiver only
/// has to outlive the command.
async fn connect_servers(store: &ConfigStore) -> (Arc<McpManager>, mpsc::UnboundedReceiver<McpEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let manager = Arc::new(McpManager::new(events));
    manager.sync(&store.config().mcp_servers).await;
    (manager, rx)
}

fn summarize_connections(events: &mut mpsc::UnboundedReceiver<McpEvent>) -> usize {
    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        if let McpEvent::StateChanged {
            server_id,
            state: ConnectionState::Error(message),
        } = event
        {
            log::warn!("MCP server '{}' is unavailable: {}", server_id, message);
            failed += 1;
        }
    }
    failed
}

async fn list_tools(store: ConfigStore) -> Result<(), String> {
    let (manager, mut events) = connect_servers(&store).await;
    summarize_connections(&mut events);

    println!("Browser tools:");
    for tool in &store.config().enabled_tools {
        println!("  {:<14} {}", tool.name(), tool.description());
    }

    for (server_id, state) in manager.states() {
        match state {
            ConnectionState::Error(message) => println!("\n{} (error: {})", server_id, message),
            state => println!("\n{} ({:?})", server_id, state),
        }
        for (owner, tool) in manager.tools() {
            if owner == server_id {
                println!("  {:<14} {}", tool.name, tool.description);
            }
        }
    }

    manager.disconnect_all();
    Ok(())
}

fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::TextDelta { text } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolCallStarted { name, .. } => eprintln!("\n[tool] {}", name),
        AgentEvent::ToolCallFinished { result } if result.is_error => {
            eprintln!("[tool error] {}", result.content)
        }
        _ => {}
    }
}

async fn chat(store: ConfigStore, prompt: String, model: Option<String>, url: String) -> Result<(), String> {
    let config = store.config();
    let provider_config = config
        .provider()
        .ok_or_else(|| format!("No model provider is configured in {}", store.path().display()))?;
    let provider = OpenAiProvider::from_config(provider_config).map_err(|e| e.to_string())?;

    let mut browser = Browser::new();
    let window = browser.open_window();
    let tab = browser.create_tab(window, &url, None)?;
    browser.select_tab(window, tab)?;
    let host: Arc<dyn BrowserHost> = Arc::new(SharedBrowser::headless(browser));

    let (manager, mut mcp_events) = connect_servers(&store).await;
    let failed = summarize_connections(&mut mcp_events);
    if failed > 0 {
        log::info!("Continuing without {} MCP server(s)", failed);
    }
    let dispatcher = Arc::new(ToolDispatcher::new(Some(host), Arc::clone(&manager)));

    let mut settings = config.agent_settings();
    if let Some(model) = model {
        settings.model = model;
    }
    if settings.model.is_empty() {
        return Err("No model selected; pass --model or set active_model".to_string());
    }
    // Scripts need a rendering frontend.
    settings
        .enabled_tools
        .retain(|t| !matches!(t, BrowserTool::ReadPage | BrowserTool::RunScript));

    let (events, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let mut agent = AgentLoop::new(provider, dispatcher, settings, events);
    let outcome = agent.send_message(&prompt).await;
    drop(agent);
    let _ = printer.await;
    println!();
    manager.disconnect_all();

    match outcome {
        TurnOutcome::Completed => Ok(()),
        TurnOutcome::IterationLimit => {
            log::warn!("Turn stopped at the iteration limit");
            Ok(())
        }
        TurnOutcome::Failed(message) => Err(message),
        TurnOutcome::Cancelled => Err("Request cancelled".to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let store = match load_config(cli.config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Tools => list_tools(store).await,
        Commands::Chat { prompt, model, url } => chat(store, prompt.join(" "), model, url).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_joins_prompt_words() {
        let cli = Cli::try_parse_from(["vireo", "--config", "/tmp/a.json", "chat", "open", "rust-lang.org"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.json")));
        match cli.command {
            Commands::Chat { prompt, model, url } => {
                assert_eq!(prompt.join(" "), "open rust-lang.org");
                assert_eq!(model, None);
                assert_eq!(url, "about:blank");
            }
            Commands::Tools => panic!("expected chat"),
        }
    }

    #[test]
    fn chat_needs_a_prompt() {
        assert!(Cli::try_parse_from(["vireo", "chat"]).is_err());
    }

    #[test]
    fn failed_connections_are_counted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(McpEvent::StateChanged {
            server_id: "fs".into(),
            state: ConnectionState::Connecting,
        })
        .unwrap();
        tx.send(McpEvent::StateChanged {
            server_id: "fs".into(),
            state: ConnectionState::Error("spawn failed".into()),
        })
        .unwrap();
        tx.send(McpEvent::ToolsChanged {
            server_id: "web".into(),
            count: 3,
        })
        .unwrap();
        assert_eq!(summarize_connections(&mut rx), 1);
        assert_eq!(summarize_connections(&mut rx), 0);
    }

    #[tokio::test]
    async fn chat_without_provider_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("assistant.json")).unwrap();
        let err = chat(store, "hi".into(), None, "about:blank".into()).await.unwrap_err();
        assert!(err.starts_with("No model provider is configured"));
    }
}
