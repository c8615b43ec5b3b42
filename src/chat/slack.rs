use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::formatter::{Reply, ReplyStyle};

use super::{ChatAdapter, ChatMessage};

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Connection options for the Slack adapter.
pub struct ConnectionOpts {
    pub token: String,
    pub stealth: bool,
    /// Port the Events API receiver binds to.
    pub events_port: u16,
}

/// Slack chat adapter: an Events API receiver for inbound messages and the
/// Web API for replies.
pub struct SlackAdapter {
    token: String,
    http: reqwest::Client,
    bot_user_id: String,
    stealth: bool,
    auth: Arc<Authorizer>,
    events_port: u16,
    usernames: StdMutex<HashMap<String, String>>,
    channels: StdMutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct AuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct EventPayload {
    #[serde(rename = "type")]
    event_type: String,
    challenge: Option<String>,
    event: Option<EventDetails>,
}

#[derive(Deserialize, Debug)]
struct EventDetails {
    #[serde(rename = "type")]
    inner_type: String,
    text: Option<String>,
    user: Option<String>,
    channel: Option<String>,
    bot_id: Option<String>,
}

impl SlackAdapter {
    /// Connects to Slack, verifying the token with `auth.test`.
    pub async fn connect(opts: ConnectionOpts, auth: Arc<Authorizer>) -> Result<SlackAdapter> {
        if opts.token.is_empty() {
            return Err(anyhow!("could not connect to slack: SLACK_TOKEN is empty"));
        }

        let http = reqwest::Client::new();
        let response: AuthTestResponse = http
            .post(format!("{}/auth.test", SLACK_API_BASE))
            .bearer_auth(&opts.token)
            .send()
            .await
            .context("could not reach the slack API")?
            .json()
            .await
            .context("could not decode auth.test response")?;

        if !response.ok {
            return Err(anyhow!(
                "could not connect to slack: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }

        if opts.stealth {
            info!("running in stealth mode");
        }

        Ok(SlackAdapter {
            token: opts.token,
            http,
            bot_user_id: response.user_id.unwrap_or_default(),
            stealth: opts.stealth,
            auth,
            events_port: opts.events_port,
            usernames: StdMutex::new(HashMap::new()),
            channels: StdMutex::new(HashMap::new()),
        })
    }

    fn mention_prefix(&self) -> String {
        format!("<@{}>", self.bot_user_id)
    }

    /// Applies the attention rules: never the bot itself, IM always works,
    /// public channels need a mention prefix, and stealth mode restricts
    /// the bot to known users over IM.
    async fn matches(&self, event: EventDetails) -> Option<ChatMessage> {
        if event.bot_id.is_some() {
            return None;
        }
        if event.inner_type != "message" && event.inner_type != "app_mention" {
            return None;
        }
        let (text, user_id, channel_id) = match (event.text, event.user, event.channel) {
            (Some(text), Some(user), Some(channel)) => (text, user, channel),
            _ => return None,
        };
        if user_id == self.bot_user_id {
            debug!("ignoring message from myself");
            return None;
        }

        let username = self.fetch_username(&user_id).await;
        if self.stealth && !self.auth.is_known_user(&username) {
            debug!("stealth mode, ignoring message from unknown user {}", username);
            return None;
        }

        let is_im = self.is_im(&channel_id);
        if self.stealth && !is_im {
            debug!("stealth mode, ignoring message on public channel {}", channel_id);
            return None;
        }

        let text = if is_im {
            text
        } else {
            let prefix = self.mention_prefix();
            match text.strip_prefix(&prefix) {
                Some(rest) => rest.trim().to_string(),
                None => return None,
            }
        };

        Some(ChatMessage {
            text,
            username,
            user_id,
            channel: self.fetch_channel(&channel_id).await,
            channel_id,
            is_im,
        })
    }

    async fn fetch_username(&self, user_id: &str) -> String {
        if let Some(name) = self
            .usernames
            .lock()
            .expect("usernames lock poisoned")
            .get(user_id)
        {
            return name.clone();
        }

        let name = match self
            .http
            .get(format!("{}/users.info", SLACK_API_BASE))
            .bearer_auth(&self.token)
            .query(&[("user", user_id)])
            .send()
            .await
        {
            Ok(response) => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("user")?
                        .get("name")
                        .and_then(|name| name.as_str())
                        .map(str::to_string)
                }),
            Err(err) => {
                warn!("could not resolve user {}: {}", user_id, err);
                None
            }
        }
        .unwrap_or_else(|| "unknown-user".to_string());

        self.usernames
            .lock()
            .expect("usernames lock poisoned")
            .insert(user_id.to_string(), name.clone());
        name
    }

    async fn fetch_channel(&self, channel_id: &str) -> String {
        if self.is_im(channel_id) {
            return "IM".to_string();
        }
        if let Some(name) = self
            .channels
            .lock()
            .expect("channels lock poisoned")
            .get(channel_id)
        {
            return name.clone();
        }

        let name = match self
            .http
            .get(format!("{}/conversations.info", SLACK_API_BASE))
            .bearer_auth(&self.token)
            .query(&[("channel", channel_id)])
            .send()
            .await
        {
            Ok(response) => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("channel")?
                        .get("name")
                        .and_then(|name| name.as_str())
                        .map(str::to_string)
                }),
            Err(err) => {
                warn!("could not resolve channel {}: {}", channel_id, err);
                None
            }
        }
        .unwrap_or_else(|| "unknown-channel".to_string());

        self.channels
            .lock()
            .expect("channels lock poisoned")
            .insert(channel_id.to_string(), name.clone());
        name
    }

    fn is_im(&self, channel_id: &str) -> bool {
        channel_id.starts_with('D')
    }
}

#[derive(Clone)]
struct EventsState {
    adapter: Arc<SlackAdapter>,
    sink: mpsc::Sender<ChatMessage>,
}

async fn slack_events(
    State(state): State<EventsState>,
    Json(payload): Json<EventPayload>,
) -> Json<serde_json::Value> {
    if payload.event_type == "url_verification" {
        if let Some(challenge) = payload.challenge {
            return Json(json!({ "challenge": challenge }));
        }
    }

    if payload.event_type == "event_callback" {
        if let Some(event) = payload.event {
            if let Some(message) = state.adapter.matches(event).await {
                debug!("forwarding slack message to the pipeline: {:?}", message);
                if state.sink.try_send(message).is_err() {
                    warn!("message pipeline is full, dropping slack message");
                }
            }
        }
    }

    Json(json!({ "status": "ok" }))
}

#[async_trait]
impl ChatAdapter for Arc<SlackAdapter> {
    async fn listen(&self, sink: mpsc::Sender<ChatMessage>) -> Result<()> {
        let state = EventsState {
            adapter: self.clone(),
            sink,
        };
        let app = Router::new()
            .route("/slack/events", post(slack_events))
            .with_state(state);

        let addr = format!("0.0.0.0:{}", self.events_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("could not bind slack events receiver on {}", addr))?;
        info!("slack events receiver listening on http://{}/slack/events", addr);
        axum::serve(listener, app)
            .await
            .context("slack events receiver crashed")?;
        Ok(())
    }

    async fn reply(&self, reply: &Reply) -> Result<()> {
        let body = match reply.style {
            ReplyStyle::Text => json!({
                "channel": reply.channel_id,
                "text": reply.text,
                "as_user": true,
            }),
            ReplyStyle::Attachment => json!({
                "channel": reply.channel_id,
                "as_user": true,
                "attachments": [{
                    "text": reply.text,
                    "color": reply.color,
                    "mrkdwn_in": ["text"],
                }],
            }),
        };

        let response = self
            .http
            .post(format!("{}/chat.postMessage", SLACK_API_BASE))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("could not post message to slack")?;

        if !response.status().is_success() {
            error!("slack API error posting reply: {}", response.status());
        }
        Ok(())
    }

    fn parse_user_link(&self, user_link: &str) -> Option<String> {
        user_link
            .strip_prefix("<@")?
            .strip_suffix('>')
            .map(str::to_string)
    }

    fn parse_channel_link(&self, channel_link: &str) -> Option<String> {
        channel_link
            .strip_prefix("<#")?
            .strip_suffix('>')?
            .split('|')
            .next()
            .map(str::to_string)
    }

    fn get_username(&self, user_id: &str) -> String {
        self.usernames
            .lock()
            .expect("usernames lock poisoned")
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| "unknown-user".to_string())
    }

    fn get_user_link(&self, user_id: &str) -> String {
        format!("<@{}>", user_id)
    }

    fn get_channel(&self, channel_id: &str) -> String {
        if self.is_im(channel_id) {
            return "IM".to_string();
        }
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| "unknown-channel".to_string())
    }

    fn get_channel_link(&self, channel_id: &str) -> String {
        format!("<#{}|{}>", channel_id, self.get_channel(channel_id))
    }

    fn is_im(&self, channel_id: &str) -> bool {
        channel_id.starts_with('D')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> Arc<SlackAdapter> {
        Arc::new(SlackAdapter {
            token: "xoxb-test".to_string(),
            http: reqwest::Client::new(),
            bot_user_id: "UBOT".to_string(),
            stealth: false,
            auth: Arc::new(Authorizer::new(&HashMap::new())),
            events_port: 0,
            usernames: StdMutex::new(HashMap::from([(
                "U1".to_string(),
                "pablo".to_string(),
            )])),
            channels: StdMutex::new(HashMap::from([(
                "C1".to_string(),
                "general".to_string(),
            )])),
        })
    }

    fn event(text: &str, user: &str, channel: &str) -> EventDetails {
        EventDetails {
            inner_type: "message".to_string(),
            text: Some(text.to_string()),
            user: Some(user.to_string()),
            channel: Some(channel.to_string()),
            bot_id: None,
        }
    }

    #[tokio::test]
    async fn im_messages_are_forwarded_verbatim() {
        let message = adapter().matches(event("echo hi", "U1", "D99")).await.unwrap();
        assert_eq!(message.text, "echo hi");
        assert!(message.is_im);
        assert_eq!(message.channel, "IM");
        assert_eq!(message.username, "pablo");
    }

    #[tokio::test]
    async fn channel_messages_require_the_mention_prefix() {
        let adapter = adapter();
        assert!(adapter.matches(event("echo hi", "U1", "C1")).await.is_none());

        let message = adapter
            .matches(event("<@UBOT> echo hi", "U1", "C1"))
            .await
            .unwrap();
        assert_eq!(message.text, "echo hi");
        assert!(!message.is_im);
        assert_eq!(message.channel, "general");
    }

    #[tokio::test]
    async fn own_and_bot_messages_are_ignored() {
        let adapter = adapter();
        assert!(adapter
            .matches(event("echo hi", "UBOT", "D99"))
            .await
            .is_none());

        let mut from_bot = event("echo hi", "U1", "D99");
        from_bot.bot_id = Some("B1".to_string());
        assert!(adapter.matches(from_bot).await.is_none());
    }

    #[tokio::test]
    async fn stealth_mode_only_talks_to_known_users_over_im() {
        let auth = Arc::new(Authorizer::new(&HashMap::from([(
            "admin".to_string(),
            vec!["pablo".to_string()],
        )])));
        let stealthy = Arc::new(SlackAdapter {
            stealth: true,
            auth,
            ..match Arc::try_unwrap(adapter()) {
                Ok(adapter) => adapter,
                Err(_) => unreachable!(),
            }
        });

        assert!(stealthy
            .matches(event("echo hi", "U1", "D99"))
            .await
            .is_some());
        // known user but a public channel
        assert!(stealthy
            .matches(event("<@UBOT> echo hi", "U1", "C1"))
            .await
            .is_none());
    }

    #[test]
    fn link_parsing_roundtrips() {
        let adapter = adapter();
        assert_eq!(adapter.get_user_link("U1"), "<@U1>");
        assert_eq!(adapter.parse_user_link("<@U1>").as_deref(), Some("U1"));
        assert_eq!(adapter.get_channel_link("C1"), "<#C1|general>");
        assert_eq!(adapter.parse_channel_link("<#C1|general>").as_deref(), Some("C1"));
        assert!(adapter.parse_user_link("nope").is_none());
        assert!(adapter.is_im("D42"));
        assert!(!adapter.is_im("C42"));
    }
}
