use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{info, warn};

/// Anything that can deliver an alert body. The alerter only records alert
/// state after a successful send.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;

    fn enabled(&self) -> bool {
        true
    }
}

/// Bounded resend attempts when the chat API rate-limits us.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Chat dispatcher over the Telegram HTTP API. The bot variant posts with a
/// bot token; the user variant posts through a self-hosted gateway with a
/// session token. Disabled when neither variant is fully configured.
pub enum ChatDispatcher {
    Bot {
        http: Client,
        api_url: String,
        token: String,
        chat_id: String,
    },
    User {
        http: Client,
        base_url: String,
        access_token: String,
        channel: String,
    },
    Disabled,
}

/// Credentials as they arrive from the environment; any missing piece
/// disables its variant.
pub struct ChatSettings {
    pub mode: String,
    pub bot_api_url: String,
    pub bot_token: Option<String>,
    pub bot_chat_id: Option<String>,
    pub user_base_url: Option<String>,
    pub user_access_token: Option<String>,
    pub user_channel: Option<String>,
}

impl ChatDispatcher {
    pub fn from_settings(settings: &ChatSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let bot = || match (&settings.bot_token, &settings.bot_chat_id) {
            (Some(token), Some(chat_id)) => Some(ChatDispatcher::Bot {
                http: http.clone(),
                api_url: settings.bot_api_url.trim_end_matches('/').to_string(),
                token: token.clone(),
                chat_id: chat_id.clone(),
            }),
            _ => None,
        };
        let user = || match (
            &settings.user_base_url,
            &settings.user_access_token,
            &settings.user_channel,
        ) {
            (Some(base), Some(token), Some(channel)) => Some(ChatDispatcher::User {
                http: http.clone(),
                base_url: base.trim_end_matches('/').to_string(),
                access_token: token.clone(),
                channel: channel.clone(),
            }),
            _ => None,
        };

        // Preferred variant first, the other as fallback.
        let dispatcher = if settings.mode == "user" {
            user().or_else(bot)
        } else {
            bot().or_else(user)
        }
        .unwrap_or(ChatDispatcher::Disabled);

        match &dispatcher {
            ChatDispatcher::Bot { .. } => info!("Chat dispatcher: bot transport"),
            ChatDispatcher::User { .. } => info!("Chat dispatcher: user transport"),
            ChatDispatcher::Disabled => {
                info!("Chat dispatcher disabled (no transport fully configured)")
            }
        }
        Ok(dispatcher)
    }

    async fn post_with_rate_limit(
        build: impl Fn() -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<()> {
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let resp = build().send().await.context("chat send failed")?;
            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    anyhow::bail!("chat rate limit persisted after {} retries", attempt);
                }
                let headers = resp.headers().clone();
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let delay = retry_after_secs(&headers, &body).unwrap_or(2 + attempt as u64);
                warn!("chat 429, waiting {}s before retry", delay);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                continue;
            }
            if !resp.status().is_success() {
                anyhow::bail!("chat send error: {}", resp.status());
            }
            return Ok(());
        }
        unreachable!("retry loop always returns or bails")
    }
}

#[async_trait]
impl AlertSink for ChatDispatcher {
    async fn send(&self, text: &str) -> Result<()> {
        match self {
            ChatDispatcher::Bot {
                http,
                api_url,
                token,
                chat_id,
            } => {
                let url = format!("{}/bot{}/sendMessage", api_url, token);
                let payload = serde_json::json!({ "chat_id": chat_id, "text": text });
                Self::post_with_rate_limit(|| http.post(&url).json(&payload)).await
            }
            ChatDispatcher::User {
                http,
                base_url,
                access_token,
                channel,
            } => {
                let url = format!("{}/messages", base_url);
                let payload = serde_json::json!({ "channel": channel, "text": text });
                Self::post_with_rate_limit(|| {
                    http.post(&url).bearer_auth(access_token).json(&payload)
                })
                .await
            }
            ChatDispatcher::Disabled => Ok(()),
        }
    }

    fn enabled(&self) -> bool {
        !matches!(self, ChatDispatcher::Disabled)
    }
}

/// Server-supplied retry delay: the Telegram-style JSON field wins, then
/// the Retry-After header.
fn retry_after_secs(headers: &reqwest::header::HeaderMap, body: &serde_json::Value) -> Option<u64> {
    body["parameters"]["retry_after"]
        .as_u64()
        .or_else(|| {
            headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}
