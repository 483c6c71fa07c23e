//! Serenity-self based Discord listener (self-bot). Filters channels and tracked
//! users, then forwards the signal payload found in the message.

use serenity_self::all::{Client, EventHandler, GatewayIntents, Message};
use serenity_self::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::parser::extract_payload;

pub struct Handler {
    pub channel_ids: Vec<String>,
    pub tracked_users: Vec<String>,
    pub tx: Sender<String>,
}

impl Handler {
    fn accepts(&self, channel_id: &str, author: &str) -> bool {
        if !self.channel_ids.iter().any(|id| id == channel_id) {
            return false;
        }
        // fuzzy, case-insensitive substring
        let author = author.to_lowercase();
        self.tracked_users
            .iter()
            .any(|needle| author.contains(&needle.to_lowercase()))
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: serenity_self::all::Context, msg: Message) {
        let ch = msg.channel_id.get().to_string();
        if !self.accepts(&ch, &msg.author.name) {
            return;
        }
        let Some(payload) = extract_payload(&msg.content) else {
            debug!("no signal payload in message from {}", msg.author.name);
            return;
        };
        if self.tx.send(payload.to_string()).await.is_err() {
            warn!("signal intake closed; dropping message from {}", msg.author.name);
        }
    }
}

pub async fn run(
    token: &str,
    channel_ids: Vec<String>,
    tracked_users: Vec<String>,
    tx: Sender<String>,
) -> anyhow::Result<()> {
    let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
    let handler = Handler {
        channel_ids,
        tracked_users,
        tx,
    };

    let mut client = Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    info!("Discord self-bot starting...");
    client.start().await?;
    Ok(())
}
