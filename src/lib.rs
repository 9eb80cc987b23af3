pub mod agent;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod nlp;
pub mod server;
pub mod storage;

use agent::ChatAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("WebSocket Address: {}", args.server_addr);
    info!("HTTP Port: {}", args.http_port);
    info!("History Store Type: {}", args.history_type);
    if args.history_type == "redis" {
        info!("History Store Host: {}", args.history_host);
    }
    info!("Auth Provider: {}", args.auth_type);
    info!("Object Storage: {}", args.storage_type);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Assistant Profile: {}", args.assistant_path);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let agent = Arc::new(ChatAgent::new(&args).await?);
    let addr = args.server_addr.clone();
    let server = Server::new(addr, agent, args);
    server.run().await?;

    Ok(())
}
