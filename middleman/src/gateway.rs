// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inbound chat traffic.
//!
//! A long-poll loop against the Telegram `getUpdates` API translates raw
//! updates into `TicketEvent`s and feeds them to the interaction router
//! over a channel. Transport failures back off and retry; the loop only
//! exits on cancellation.

use crate::types::{TicketId, UserId};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Long-poll window handed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;
const ERROR_BACKOFF_SECS: u64 = 5;

/// One user interaction on a ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketEvent {
    /// A new ticket chat within the configured scope.
    Opened { ticket: TicketId, opener: UserId },
    Text {
        ticket: TicketId,
        user: UserId,
        text: String,
    },
    Button {
        ticket: TicketId,
        user: UserId,
        data: String,
        interaction_id: String,
    },
    Command {
        ticket: TicketId,
        user: UserId,
        command: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Update {
    update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    #[serde(default)]
    group_chat_created: bool,
    #[serde(default)]
    new_chat_members: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    message: Option<Message>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    ok: bool,
    result: Option<User>,
}

/// Map one raw update to a ticket event, or drop it.
///
/// Messages are scoped by chat title prefix (the ticket-category
/// identifier); button presses carry their ticket through the prompt
/// message and are validated downstream against the deal store.
pub(crate) fn classify(update: Update, bot_id: i64, scope_prefix: &str) -> Option<TicketEvent> {
    if let Some(query) = update.callback_query {
        let ticket = TicketId(query.message?.chat.id);
        let data = query.data?;
        return Some(TicketEvent::Button {
            ticket,
            user: UserId(query.from.id),
            data,
            interaction_id: query.id,
        });
    }

    let message = update.message?;
    let in_scope = message
        .chat
        .title
        .as_deref()
        .map(|t| t.starts_with(scope_prefix))
        .unwrap_or(false);
    if !in_scope {
        return None;
    }
    let ticket = TicketId(message.chat.id);

    // The bot landing in a fresh scoped chat is the ticket-open signal.
    let bot_added = message.new_chat_members.iter().any(|u| u.id == bot_id);
    if message.group_chat_created || bot_added {
        let opener = message.from.as_ref().filter(|u| !u.is_bot)?;
        return Some(TicketEvent::Opened {
            ticket,
            opener: UserId(opener.id),
        });
    }

    let from = message.from?;
    if from.is_bot {
        return None;
    }
    let text = message.text?;

    if let Some(stripped) = text.strip_prefix('/') {
        let mut parts = stripped.split_whitespace();
        let command = parts.next()?;
        // Commands may arrive as /release@botname in group chats.
        let command = command.split('@').next().unwrap_or(command).to_string();
        let args: Vec<String> = parts.map(|s| s.to_string()).collect();
        return Some(TicketEvent::Command {
            ticket,
            user: UserId(from.id),
            command,
            args,
        });
    }

    Some(TicketEvent::Text {
        ticket,
        user: UserId(from.id),
        text,
    })
}

pub struct TelegramGateway {
    client: reqwest::Client,
    api_base: String,
    scope_prefix: String,
    events: mpsc::Sender<TicketEvent>,
}

impl TelegramGateway {
    pub fn new(bot_token: &str, scope_prefix: &str, events: mpsc::Sender<TicketEvent>) -> Self {
        // The client timeout must outlast the long-poll window.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            api_base: format!("https://api.telegram.org/bot{}", bot_token),
            scope_prefix: scope_prefix.to_string(),
            events,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let bot_id = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Gateway] cancelled before startup completed");
                        return;
                    }
                    result = self.get_me() => match result {
                        Ok(id) => break id,
                        Err(e) => {
                            warn!("[Gateway] getMe failed, retrying: {}", e);
                            tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                        }
                    }
                }
            };
            info!("[Gateway] connected as bot {}", bot_id);

            let mut offset: i64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Gateway] stopped");
                        break;
                    }
                    result = self.get_updates(offset) => match result {
                        Ok(updates) => {
                            for update in updates {
                                offset = offset.max(update.update_id + 1);
                                if let Some(event) = classify(update, bot_id, &self.scope_prefix) {
                                    debug!("[Gateway] event: {:?}", event);
                                    if self.events.send(event).await.is_err() {
                                        info!("[Gateway] router gone, stopping");
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!("[Gateway] getUpdates failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                        }
                    }
                }
            }
        })
    }

    async fn get_me(&self) -> Result<i64> {
        let response: MeResponse = self
            .client
            .get(format!("{}/getMe", self.api_base))
            .send()
            .await
            .context("getMe request failed")?
            .json()
            .await
            .context("getMe returned malformed JSON")?;
        if !response.ok {
            return Err(anyhow!("getMe rejected by API"));
        }
        response
            .result
            .map(|u| u.id)
            .ok_or_else(|| anyhow!("getMe returned no bot identity"))
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response: UpdatesResponse = self
            .client
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                (
                    "allowed_updates",
                    r#"["message","callback_query"]"#.to_string(),
                ),
            ])
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates returned malformed JSON")?;
        if !response.ok {
            return Err(anyhow!("getUpdates rejected by API"));
        }
        Ok(response.result)
    }
}
