// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Telegram Bot API notification channel.
//!
//! Messages are HTML-formatted and sent directly when events occur, with a
//! bounded retry on transient failures. Interactive prompts attach inline
//! keyboards whose callback data uses the identifiers in
//! [`crate::notify::buttons`].

use super::{buttons, DealNotice, NotificationChannel, NotifyError};
use crate::types::{TicketId, UserId};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Telegram bot credentials.
#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty()
    }
}

pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("configured", &self.config.is_configured())
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            config,
            client,
            api_base,
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<(), NotifyError> {
        if !self.config.is_configured() {
            warn!("[Telegram] not configured, dropping {} call", method);
            return Ok(());
        }

        let mut last_status = String::new();
        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/{}", self.api_base, method))
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_status = resp.status().to_string();
                    warn!(
                        "[Telegram] {} attempt {}/{} failed: {}",
                        method,
                        attempt + 1,
                        MAX_RETRIES,
                        last_status
                    );
                }
                Err(e) => {
                    last_status = e.to_string();
                    warn!(
                        "[Telegram] {} attempt {}/{} failed: {}",
                        method,
                        attempt + 1,
                        MAX_RETRIES,
                        last_status
                    );
                }
            }

            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        Err(NotifyError::Transport(format!(
            "{} failed after {} attempts: {}",
            method, MAX_RETRIES, last_status
        )))
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Value>,
    ) -> Result<(), NotifyError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(markup) = keyboard {
            payload["reply_markup"] = markup;
        }
        self.call("sendMessage", payload).await
    }
}

fn mention(user: UserId) -> String {
    format!("<a href=\"tg://user?id={}\">user {}</a>", user.0, user.0)
}

fn slot(user: Option<UserId>) -> String {
    user.map(mention).unwrap_or_else(|| "None".to_string())
}

fn keyboard(rows: &[&[(&str, &str)]]) -> Value {
    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|(label, data)| json!({"text": label, "callback_data": data}))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Render a notice into message text plus an optional inline keyboard.
pub(crate) fn render(notice: &DealNotice) -> (String, Option<Value>) {
    match notice {
        DealNotice::CounterpartyPrompt { code } => (
            format!(
                "<b>{}</b>\n\nPlease send the user ID of the person you're dealing with.\n\
                 Type <code>cancel</code> to cancel the deal.",
                code
            ),
            None,
        ),
        DealNotice::CounterpartyAdded { user } => {
            (format!("Added {} to the ticket!", mention(*user)), None)
        }
        DealNotice::Welcome => (
            "<b>Crypto Middleman</b>\n\
             Welcome to the automated cryptocurrency middleman system!\n\
             Your cryptocurrency is held securely until the deal completes.\n\n\
             <b>Please read:</b> check the deal info, confirm your deal and keep \
             all conversation inside this ticket."
                .to_string(),
            None,
        ),
        DealNotice::RolePrompt { sender, receiver } => (
            format!(
                "<b>Role Selection</b>\nSelect your role (one per user):\n\n\
                 <b>Sending Litecoin:</b> {}\n<b>Receiving Litecoin:</b> {}",
                slot(*sender),
                slot(*receiver)
            ),
            Some(keyboard(&[&[
                ("Sender", buttons::ROLE_SENDER),
                ("Receiver", buttons::ROLE_RECEIVER),
            ]])),
        ),
        DealNotice::RoleTaken { user, role } => (
            format!("{} selected the <b>{}</b> role", mention(*user), role),
            None,
        ),
        DealNotice::RoleConfirmPrompt { sender, receiver } => (
            format!(
                "<b>Confirm Roles</b>\nAre these roles correct?\n\n\
                 <b>Sender:</b> {}\n<b>Receiver:</b> {}",
                mention(*sender),
                mention(*receiver)
            ),
            Some(keyboard(&[&[
                ("Correct", buttons::CONFIRM_YES),
                ("Incorrect", buttons::CONFIRM_NO),
            ]])),
        ),
        DealNotice::VoteRegistered { user, approve } => (
            format!(
                "{} responded with <b>{}</b>",
                mention(*user),
                if *approve { "Correct" } else { "Incorrect" }
            ),
            None,
        ),
        DealNotice::RolesReset => (
            "<b>Roles Reset</b>\nPlease select roles again.".to_string(),
            None,
        ),
        DealNotice::AmountPrompt => (
            "<b>Deal Amount</b>\nSender, please enter the amount in USD \
             (e.g. <code>10</code> or <code>0.5</code>):"
                .to_string(),
            None,
        ),
        DealNotice::AmountConfirmPrompt { amounts } => (
            format!(
                "<b>Confirm Amount</b>\n<b>${:.2} USD</b> \u{2248} <code>{:.8} LTC</code>",
                amounts.fiat, amounts.crypto
            ),
            Some(keyboard(&[&[
                ("Correct", buttons::CONFIRM_YES),
                ("Incorrect", buttons::CONFIRM_NO),
            ]])),
        ),
        DealNotice::AmountReset => (
            "Amount rejected, please enter the amount again.".to_string(),
            None,
        ),
        DealNotice::Invoice {
            address,
            amounts,
            display_rate,
        } => (
            format!(
                "<b>Payment Invoice</b>\n\
                 Send exactly <code>{:.8} LTC</code> to:\n<code>{}</code>\n\n\
                 <b>USD Amount:</b> ${:.2}\n<b>Exchange Rate:</b> 1 LTC = ${:.2}",
                amounts.crypto, address, amounts.fiat, display_rate
            ),
            Some(keyboard(&[&[("Paste", buttons::PASTE_ADDRESS)]])),
        ),
        DealNotice::PaymentReceived { crypto, txid } => (
            format!(
                "\u{2705} <b>Payment Received</b>\n\
                 <b>Amount:</b> {:.8} LTC\n<b>TXID:</b> <code>{}</code>\n\n\
                 Please confirm release of funds.",
                crypto, txid
            ),
            Some(keyboard(&[&[("Release", buttons::RELEASE)]])),
        ),
        DealNotice::AddressPrompt => (
            "Please send the receiver LTC address as your next message.".to_string(),
            None,
        ),
        DealNotice::AddressConfirmPrompt { address } => (
            format!(
                "\u{26a0} <b>Confirm Address</b>\nIs this address correct?\n<code>{}</code>",
                address
            ),
            Some(keyboard(&[&[
                ("Confirm", buttons::CONFIRM_YES),
                ("Cancel", buttons::CONFIRM_NO),
            ]])),
        ),
        DealNotice::ReleaseCancelled => ("Release cancelled.".to_string(), None),
        DealNotice::Released {
            crypto,
            address,
            txid,
            via_override,
        } => {
            let title = if *via_override {
                "\u{1f4b0} <b>Funds Released (Owner Override)</b>"
            } else {
                "\u{2705} <b>Litecoin Released</b>"
            };
            (
                format!(
                    "{}\n<b>Amount:</b> {:.8} LTC\n<b>Receiver:</b> <code>{}</code>\n\
                     <b>TXID:</b> <code>{}</code>",
                    title, crypto, address, txid
                ),
                None,
            )
        }
        DealNotice::ReleaseFailed { message } => {
            (format!("\u{274c} Release failed: {}", message), None)
        }
        DealNotice::Cancelled { reason } => (
            format!("<b>Deal Cancelled</b>\n{}", reason),
            None,
        ),
        DealNotice::TimedOut => (
            "<b>Deal Expired</b>\nThis deal has timed out due to inactivity.".to_string(),
            None,
        ),
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    async fn broadcast(&self, ticket: TicketId, notice: DealNotice) -> Result<(), NotifyError> {
        let (text, markup) = render(&notice);
        self.send_message(ticket.0, &text, markup).await
    }

    async fn reply_private(&self, user: UserId, text: &str) -> Result<(), NotifyError> {
        self.send_message(user.0, text, None).await
    }

    async fn ack_interaction(&self, interaction_id: &str, text: &str) -> Result<(), NotifyError> {
        self.call(
            "answerCallbackQuery",
            json!({
                "callback_query_id": interaction_id,
                "text": text,
                "show_alert": false,
            }),
        )
        .await
    }
}
