pub mod slack;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::formatter::Reply;

/// A chat message that matched the bot's attention rules, with user and
/// channel names already resolved by the adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub username: String,
    pub user_id: String,
    pub channel: String,
    pub channel_id: String,
    pub is_im: bool,
}

/// The capabilities the pipeline needs from any chat transport.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Listens for messages and pushes the matching ones into `sink` until
    /// the transport shuts down. The sink is bounded; adapters drop with a
    /// warning rather than block when the pipeline falls behind.
    async fn listen(&self, sink: mpsc::Sender<ChatMessage>) -> Result<()>;

    /// Posts a rendered reply on its channel.
    async fn reply(&self, reply: &Reply) -> Result<()>;

    /// Extracts the user id out of a rendered user mention.
    fn parse_user_link(&self, user_link: &str) -> Option<String>;

    /// Extracts the channel id out of a rendered channel link.
    fn parse_channel_link(&self, channel_link: &str) -> Option<String>;

    fn get_username(&self, user_id: &str) -> String;

    fn get_user_link(&self, user_id: &str) -> String;

    fn get_channel(&self, channel_id: &str) -> String;

    fn get_channel_link(&self, channel_id: &str) -> String;

    fn is_im(&self, channel_id: &str) -> bool;
}
