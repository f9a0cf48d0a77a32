use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use wschannel::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    username: String,
    message: String,
    #[serde(default)]
    timestamp: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut args = std::env::args().skip(1);
    let username = args.next().unwrap_or_else(|| "anonymous".to_string());
    let url = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:9000/chat".to_string());

    let conn = Connection::client(url.as_str(), ConnectionConfig::default());
    conn.on_message(|message| match message.json::<ChatMessage>() {
        Ok(chat) => println!("[{}] {}", chat.username, chat.message),
        Err(_) => println!("<< {}", message.as_text().unwrap_or("<binary>")),
    });
    conn.on_disconnected(|reason| println!("❌ Disconnected: {}", reason));
    conn.on_connection_failed(|err| eprintln!("⚠️  Connection failed: {}", err));

    if !conn.connect(Duration::from_secs(5)).await {
        return Err(Error::custom(format!("could not connect to {}", url)));
    }
    println!("✅ Connected to {} as {}. Type messages, Ctrl-D to quit.", url, username);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let chat = ChatMessage {
            username: username.clone(),
            message: line,
            timestamp: 0,
        };
        if let Err(e) = conn.send_json(&chat).await {
            eprintln!("⚠️  Send failed: {}", e);
            break;
        }
    }

    conn.disconnect_async().await;
    Ok(())
}
