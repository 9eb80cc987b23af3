pub mod api;
pub mod websocket;

use crate::agent::ChatAgent;
use crate::cli::Args;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    agent: Arc<ChatAgent>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, agent: Arc<ChatAgent>, args: Args) -> Self {
        Self { addr, agent, args }
    }

    /// Starts the HTTP API in the background, then serves WebSocket chat until it fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(self.args.http_port, self.agent.clone(), self.args.clone()).await?;
        websocket::start_ws_server(&self.addr, self.agent.clone(), self.args.clone()).await
    }
}
