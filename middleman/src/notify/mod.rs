// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chat notification seam.
//!
//! The state machine describes *what* happened through `DealNotice`; a
//! `NotificationChannel` implementation decides how that renders on the
//! chat platform. Accepted actions broadcast into the ticket so both
//! parties can audit the flow; rejections go back privately to whoever
//! caused them.

pub mod telegram;

use crate::types::{DealAmounts, DealCode, Role, TicketId, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// Stable button identifiers shared between prompt rendering and the
/// interaction router.
pub mod buttons {
    pub const ROLE_SENDER: &str = "role:sender";
    pub const ROLE_RECEIVER: &str = "role:receiver";
    pub const CONFIRM_YES: &str = "confirm:yes";
    pub const CONFIRM_NO: &str = "confirm:no";
    pub const RELEASE: &str = "release";
    pub const PASTE_ADDRESS: &str = "paste";
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// Semantic deal events for the chat surface.
#[derive(Debug, Clone, PartialEq)]
pub enum DealNotice {
    /// Ticket opened: show the deal code and ask for the counterparty id.
    CounterpartyPrompt { code: DealCode },
    CounterpartyAdded { user: UserId },
    /// Welcome plus the please-read notice.
    Welcome,
    RolePrompt {
        sender: Option<UserId>,
        receiver: Option<UserId>,
    },
    RoleTaken { user: UserId, role: Role },
    RoleConfirmPrompt { sender: UserId, receiver: UserId },
    VoteRegistered { user: UserId, approve: bool },
    RolesReset,
    AmountPrompt,
    AmountConfirmPrompt { amounts: DealAmounts },
    AmountReset,
    Invoice {
        address: String,
        amounts: DealAmounts,
        display_rate: f64,
    },
    PaymentReceived { crypto: f64, txid: String },
    /// Ask the releasing participant for the destination address.
    AddressPrompt,
    AddressConfirmPrompt { address: String },
    ReleaseCancelled,
    Released {
        crypto: f64,
        address: String,
        txid: String,
        via_override: bool,
    },
    ReleaseFailed { message: String },
    Cancelled { reason: String },
    TimedOut,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Post into the ticket, visible to both parties.
    async fn broadcast(&self, ticket: TicketId, notice: DealNotice) -> Result<(), NotifyError>;

    /// Private message to one user (rejections, sensitive data).
    async fn reply_private(&self, user: UserId, text: &str) -> Result<(), NotifyError>;

    /// Ephemeral acknowledgement of a button press.
    async fn ack_interaction(&self, interaction_id: &str, text: &str) -> Result<(), NotifyError>;
}
