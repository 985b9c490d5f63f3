mod client;
mod ndjson;
mod protocol;
mod server;
mod session;
mod store;
mod ui;

use clap::{Args, Parser, Subcommand};
use client::{ClientConfig, RcaClient};
use protocol::ChatContext;
use std::path::PathBuf;
use store::ChatStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rca-chat", version, about = "Streaming chat with the RCA agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the NDJSON chat endpoint, forwarding to the RCA agent.
    Serve(ServeArgs),
    /// Chat about a report in the terminal.
    Chat(ChatArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "RCA_LISTEN", default_value = "127.0.0.1:7007")]
    listen: String,
    /// Base URL of the RCA agent service.
    #[arg(long, env = "RCA_AGENT_URL")]
    agent_url: String,
    /// Bearer token sent to the agent.
    #[arg(long, env = "RCA_AGENT_TOKEN")]
    agent_token: Option<String>,
    /// Bearer token required from chat clients.
    #[arg(long, env = "RCA_TOKEN")]
    token: Option<String>,
}

#[derive(Args)]
struct ChatArgs {
    #[arg(long, env = "RCA_CHAT_URL", default_value = "http://127.0.0.1:7007")]
    url: String,
    #[arg(long, env = "RCA_TOKEN")]
    token: Option<String>,
    /// Report the conversation is about; history is kept per report.
    #[arg(long)]
    report: String,
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    environment: Option<String>,
    #[arg(long, env = "RCA_HISTORY_DIR")]
    history_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    match Cli::parse().command {
        Command::Serve(args) => {
            init_tracing();
            let agent = RcaClient::new(ClientConfig {
                base_url: args.agent_url,
                token: args.agent_token,
            });
            server::run(server::ServerConfig {
                listen: args.listen,
                agent,
                auth_token: args.token,
            })
            .await
        }
        Command::Chat(args) => {
            // Log lines would tear the inline viewport; only opt in explicitly.
            if std::env::var_os("RUST_LOG").is_some() {
                init_tracing();
            }
            let client = RcaClient::new(ClientConfig {
                base_url: args.url,
                token: args.token,
            });
            let store = ChatStore::new(args.history_dir.unwrap_or_else(ChatStore::default_dir));
            tracing::debug!(dir = %store.dir().display(), "using chat history store");
            let context = ChatContext {
                report_id: args.report,
                namespace: args.namespace,
                project: args.project,
                environment: args.environment,
            };
            ui::run_tui(client, store, context)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rca_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
