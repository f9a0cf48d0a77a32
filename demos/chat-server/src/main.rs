use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wschannel::prelude::*;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    username: String,
    message: String,
    #[serde(default)]
    timestamp: u64,
}

impl ChatMessage {
    fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

#[derive(Default)]
struct ChatRoom;

#[async_trait]
impl Handler for ChatRoom {
    async fn on_connected(&self, ctx: &HandlerContext) {
        println!("✅ User joined the chat: {}", ctx.id());
        let welcome = ChatMessage::new("System", format!("User {} joined the chat", ctx.id()));
        if let Ok(json) = serde_json::to_string(&welcome) {
            ctx.clients().broadcast(Message::text(json));
        }
    }

    async fn on_message(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
        let incoming: ChatMessage = message.json()?;
        println!("💬 {} says: {}", incoming.username, incoming.message);

        let outgoing = ChatMessage::new(incoming.username, incoming.message);
        let json = serde_json::to_string(&outgoing)?;
        let delivered = ctx
            .clients()
            .broadcast_except(ctx.id(), Message::text(json))
            .await;
        info!("Relayed message from {} to {} clients", ctx.id(), delivered);
        Ok(())
    }

    async fn on_disconnected(&self, ctx: &HandlerContext, reason: ClosureReason) {
        println!("❌ User left the chat: {} ({})", ctx.id(), reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = Server::new().add_handler::<ChatRoom>("/chat")?;
    let listener = TcpListener::bind("127.0.0.1:9000").await?;

    println!("💬 Chat server running on ws://127.0.0.1:9000/chat");
    println!(
        "📊 Send JSON: {{ \"username\": \"Alice\", \"message\": \"Hello!\" }}"
    );

    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
