// Telegram Bot API sink: one chat, one forum thread per channel class.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{NotificationSink, NotifyError};
use crate::config::TelegramThreads;
use crate::models::ChannelClass;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramSink {
    client: Client,
    api_url: String,
    token: String,
    chat_id: String,
    threads: TelegramThreads,
}

impl TelegramSink {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
        threads: TelegramThreads,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .user_agent(crate::version::user_agent())
                .build()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            threads,
        })
    }

    /// Thread id for a channel class; 0 posts to the main thread.
    fn thread_id(&self, channel: ChannelClass) -> Option<i64> {
        let id = match channel {
            ChannelClass::Daily => self.threads.daily,
            ChannelClass::Hourly => self.threads.hourly,
            ChannelClass::Error => self.threads.error,
            ChannelClass::Status => self.threads.status,
            ChannelClass::Worker => self.threads.worker,
        };
        (id > 0).then_some(id)
    }

    async fn post(
        &self,
        channel: ChannelClass,
        text: &str,
        parse_mode: Option<&'static str>,
    ) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode,
            message_thread_id: self.thread_id(channel),
        };
        let resp = self.client.post(url).json(&body).send().await?;
        let status = resp.status();
        let api: ApiResponse = resp.json().await.unwrap_or(ApiResponse {
            ok: false,
            description: None,
        });
        if status.is_success() && api.ok {
            return Ok(());
        }
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            description: api.description.unwrap_or_else(|| "no description".to_string()),
        })
    }
}

/// Telegram's answer when the text is not valid Markdown.
fn is_markup_error(err: &NotifyError) -> bool {
    matches!(
        err,
        NotifyError::Rejected { status: 400, description } if description.contains("can't parse entities")
    )
}

#[async_trait]
impl NotificationSink for TelegramSink {
    /// Sends as Markdown; text the API cannot parse goes out again as plain text.
    async fn send(&self, channel: ChannelClass, text: &str) -> Result<(), NotifyError> {
        match self.post(channel, text, Some("Markdown")).await {
            Err(e) if is_markup_error(&e) => {
                warn!(error = %e, channel = %channel, "markdown rejected; resending as plain text");
                self.post(channel, text, None).await
            }
            other => other,
        }
    }
}
