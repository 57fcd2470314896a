use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use charla::config::{normalize_backend_url, ServerConfig};
use charla::controller::{ChatController, ControllerEvent};
use charla::models::GenerationOptions;
use charla::relay::{ChatBackend, StreamRelay};
use charla::store::ConversationStore;
use charla::web::WebServer;

#[derive(Parser)]
#[command(name = "charla", version, about = "Chat with a locally hosted language model")]
struct Cli {
    /// Base URL of the inference backend
    #[arg(long, env = "CHARLA_BACKEND_URL", default_value = "http://localhost:11434")]
    backend_url: String,

    /// Directory for conversation records and the listing index
    #[arg(long, env = "CHARLA_DATA_DIR", default_value = "data/chats")]
    data_dir: PathBuf,

    /// Model identifier as known to the backend
    #[arg(long, env = "CHARLA_MODEL", default_value = "gpt-oss:20b")]
    model: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (streaming relay + session endpoints)
    Serve {
        /// Address to bind to
        #[arg(long, env = "CHARLA_BIND", default_value = "127.0.0.1:3000")]
        bind: SocketAddr,

        /// Directory with the browser UI, served at /
        #[arg(long, env = "CHARLA_WEB_DIR")]
        web_dir: Option<PathBuf>,
    },
    /// Chat from the terminal against the same store and backend
    Chat {
        /// Resume an existing conversation by id
        #[arg(long)]
        conversation: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, web_dir } => {
            let config = ServerConfig {
                bind_addr: bind,
                backend_url: normalize_backend_url(&cli.backend_url),
                data_dir: cli.data_dir,
                model: cli.model,
                options: GenerationOptions::default(),
                web_dir,
            };
            WebServer::new(config).start().await
        }
        Command::Chat { conversation } => {
            run_repl(&cli.backend_url, &cli.data_dir, &cli.model, conversation).await
        }
    }
}

/// Interactive loop driving the controller directly; fragments are printed as
/// they arrive via the controller's event stream.
async fn run_repl(
    backend_url: &str,
    data_dir: &std::path::Path,
    model: &str,
    conversation: Option<Uuid>,
) -> Result<()> {
    let store = Arc::new(ConversationStore::open(data_dir).await?);
    let backend: Arc<dyn ChatBackend> =
        Arc::new(StreamRelay::new(&normalize_backend_url(backend_url)));
    let mut controller =
        ChatController::new(store, backend, model, GenerationOptions::default());
    controller.select(conversation).await?;

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ControllerEvent::Fragment { text, .. } = event {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    println!(
        "💬 {} {} {}",
        "Chatting with".bright_cyan(),
        model.bright_cyan(),
        "(Ctrl-D to exit, /clear to empty the conversation)".bright_black()
    );
    if !controller.messages().is_empty() {
        println!(
            "{}",
            format!("resumed with {} earlier messages", controller.messages().len()).bright_black()
        );
    }

    let mut rl = DefaultEditor::new()?;
    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(&line);

                if line == "/clear" {
                    controller.clear().await?;
                    println!("{}", "conversation cleared".bright_black());
                    continue;
                }

                let reply = controller.send(&line, CancellationToken::new()).await;
                // Streamed replies were already printed fragment by fragment;
                // warning turns carry no latency metadata and arrive whole.
                if let Some(reply) = reply {
                    if reply.meta.is_none() {
                        println!("{}", reply.content.yellow());
                    } else {
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                printer.abort();
                return Err(e.into());
            }
        }
    }

    printer.abort();
    Ok(())
}
