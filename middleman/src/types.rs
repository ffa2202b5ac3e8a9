// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core deal types.
//!
//! A `Deal` is the single source of truth for one escrow transaction. All
//! mutation goes through `DealStateMachine`; everything here is plain data
//! plus the small invariant-preserving helpers the state machine builds on.

use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Ticket/chat identity. One deal per ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(pub i64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant identity on the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two sides of a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deal lifecycle stages.
///
/// Transitions are monotonic except the explicit confirmation-reject resets
/// (`RoleConfirmation -> RoleSelection`, `AmountConfirmation -> AmountEntry`,
/// `AddressConfirmation -> AwaitingRelease`). `Cancelled` and `TimedOut` are
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStage {
    /// Waiting for the ticket opener to supply the counterparty identity.
    Created,
    RoleSelection,
    RoleConfirmation,
    AmountEntry,
    AmountConfirmation,
    AwaitingPayment,
    AwaitingRelease,
    AddressConfirmation,
    Released,
    Cancelled,
    TimedOut,
}

impl DealStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStage::Released | DealStage::Cancelled | DealStage::TimedOut
        )
    }

    /// Interactive stages carry a per-step response deadline. The payment
    /// watch has its own timeout from `created_at`, and the release stages
    /// stay open until acted on.
    pub fn has_step_deadline(&self) -> bool {
        matches!(
            self,
            DealStage::Created
                | DealStage::RoleSelection
                | DealStage::RoleConfirmation
                | DealStage::AmountEntry
                | DealStage::AmountConfirmation
        )
    }

    /// Stable label for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            DealStage::Created => "created",
            DealStage::RoleSelection => "role_selection",
            DealStage::RoleConfirmation => "role_confirmation",
            DealStage::AmountEntry => "amount_entry",
            DealStage::AmountConfirmation => "amount_confirmation",
            DealStage::AwaitingPayment => "awaiting_payment",
            DealStage::AwaitingRelease => "awaiting_release",
            DealStage::AddressConfirmation => "address_confirmation",
            DealStage::Released => "released",
            DealStage::Cancelled => "cancelled",
            DealStage::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for DealStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiated amounts, fixed at amount entry.
///
/// `crypto = fiat / rate`; the rate is recorded so the conversion stays
/// auditable after the live rate moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DealAmounts {
    pub fiat: f64,
    pub crypto: f64,
    pub rate: f64,
}

impl DealAmounts {
    pub fn from_fiat(fiat: f64, rate: f64) -> Self {
        Self {
            fiat,
            crypto: fiat / rate,
            rate,
        }
    }
}

/// A chain transaction matched against the expected deposit.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMatch {
    pub txid: String,
    pub value: f64,
    pub confirmations: u32,
}

const DEAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Human-facing deal reference shown when a ticket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealCode(String);

impl DealCode {
    /// A 32-character body plus an 8-character suffix, uppercase
    /// alphanumeric.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut pick = |len: usize| -> String {
            (0..len)
                .map(|_| DEAL_CODE_CHARSET[rng.gen_range(0..DEAL_CODE_CHARSET.len())] as char)
                .collect()
        };
        let body = pick(32);
        let suffix = pick(8);
        Self(format!("{} {}", body, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DealCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of registering a confirmation vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The participant already voted this round; counts once.
    Duplicate,
    /// Vote recorded; `votes` is the round total so far.
    Counted { votes: usize },
}

/// One escrow transaction.
#[derive(Debug, Clone)]
pub struct Deal {
    pub id: TicketId,
    pub code: DealCode,
    /// The user who opened the ticket.
    pub opener: UserId,
    /// The second party, bound during the intake step.
    pub counterparty: Option<UserId>,
    pub stage: DealStage,
    pub sender: Option<UserId>,
    pub receiver: Option<UserId>,
    pub amounts: Option<DealAmounts>,
    pub payout_address: Option<String>,
    /// Inbound payment txid; immutable once set.
    pub txid: Option<String>,
    pub payout_txid: Option<String>,
    pub created_at: SystemTime,
    /// Deadline for the current interactive step.
    pub deadline: SystemTime,
    /// Votes registered for the pending confirmation round.
    pub confirmations: HashSet<UserId>,
    /// Set exactly once when the terminal teardown is scheduled.
    pub teardown_scheduled: bool,
}

impl Deal {
    pub fn new(id: TicketId, opener: UserId, now: SystemTime, step_timeout: Duration) -> Self {
        Self {
            id,
            code: DealCode::generate(),
            opener,
            counterparty: None,
            stage: DealStage::Created,
            sender: None,
            receiver: None,
            amounts: None,
            payout_address: None,
            txid: None,
            payout_txid: None,
            created_at: now,
            deadline: now + step_timeout,
            confirmations: HashSet::new(),
            teardown_scheduled: false,
        }
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.sender == Some(user) || self.receiver == Some(user)
    }

    pub fn participants(&self) -> Option<(UserId, UserId)> {
        self.sender.zip(self.receiver)
    }

    pub fn both_roles_filled(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    /// Bind `user` to `role`, clearing any slot they previously held and
    /// displacing the previous holder of the chosen slot. Keeps the
    /// one-slot-per-identity invariant.
    pub fn take_role(&mut self, user: UserId, role: Role) {
        if self.sender == Some(user) {
            self.sender = None;
        }
        if self.receiver == Some(user) {
            self.receiver = None;
        }
        match role {
            Role::Sender => self.sender = Some(user),
            Role::Receiver => self.receiver = Some(user),
        }
    }

    pub fn clear_roles(&mut self) {
        self.sender = None;
        self.receiver = None;
    }

    /// Record a vote for the pending round, at most once per participant.
    pub fn register_vote(&mut self, user: UserId) -> VoteOutcome {
        if !self.confirmations.insert(user) {
            return VoteOutcome::Duplicate;
        }
        VoteOutcome::Counted {
            votes: self.confirmations.len(),
        }
    }

    pub fn reset_votes(&mut self) {
        self.confirmations.clear();
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or_default()
    }

    /// Refresh the per-step deadline after a successful transition.
    pub fn touch(&mut self, now: SystemTime, step_timeout: Duration) {
        self.deadline = now + step_timeout;
    }

    pub fn step_expired(&self, now: SystemTime) -> bool {
        self.stage.has_step_deadline() && now > self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal() -> Deal {
        Deal::new(
            TicketId(100),
            UserId(1),
            SystemTime::now(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_deal_code_shape() {
        let code = DealCode::generate();
        let parts: Vec<&str> = code.as_str().split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1].len(), 8);
        assert!(code
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ' '));
    }

    #[test]
    fn test_take_role_reassignment_is_idempotent() {
        let mut d = deal();
        let alice = UserId(10);

        d.take_role(alice, Role::Sender);
        assert_eq!(d.sender, Some(alice));

        // Switching sides clears the old slot.
        d.take_role(alice, Role::Receiver);
        assert_eq!(d.sender, None);
        assert_eq!(d.receiver, Some(alice));

        // Re-picking the same side changes nothing.
        d.take_role(alice, Role::Receiver);
        assert_eq!(d.sender, None);
        assert_eq!(d.receiver, Some(alice));
    }

    #[test]
    fn test_take_role_displaces_previous_holder() {
        let mut d = deal();
        let alice = UserId(10);
        let bob = UserId(11);

        d.take_role(alice, Role::Sender);
        d.take_role(bob, Role::Sender);
        assert_eq!(d.sender, Some(bob));
        assert_eq!(d.receiver, None);
    }

    #[test]
    fn test_no_identity_occupies_both_slots() {
        let mut d = deal();
        let alice = UserId(10);
        let bob = UserId(11);

        d.take_role(alice, Role::Sender);
        d.take_role(bob, Role::Receiver);
        d.take_role(alice, Role::Receiver);

        // Alice moved; the sender slot must be empty, never duplicated.
        assert_eq!(d.receiver, Some(alice));
        assert_eq!(d.sender, None);
    }

    #[test]
    fn test_vote_counts_once_per_participant() {
        let mut d = deal();
        let alice = UserId(10);
        let bob = UserId(11);

        assert_eq!(d.register_vote(alice), VoteOutcome::Counted { votes: 1 });
        assert_eq!(d.register_vote(alice), VoteOutcome::Duplicate);
        assert_eq!(d.register_vote(bob), VoteOutcome::Counted { votes: 2 });

        d.reset_votes();
        assert_eq!(d.register_vote(alice), VoteOutcome::Counted { votes: 1 });
    }

    #[test]
    fn test_amounts_from_fiat() {
        let amounts = DealAmounts::from_fiat(100.0, 50.0);
        assert_eq!(amounts.crypto, 2.0);
        assert_eq!(amounts.rate, 50.0);
        assert_eq!(amounts.fiat, 100.0);
    }

    #[test]
    fn test_step_deadline_only_for_interactive_stages() {
        let now = SystemTime::now();
        let mut d = deal();
        d.deadline = now - Duration::from_secs(1);

        for (stage, expired) in [
            (DealStage::Created, true),
            (DealStage::RoleSelection, true),
            (DealStage::AmountConfirmation, true),
            (DealStage::AwaitingPayment, false),
            (DealStage::AwaitingRelease, false),
            (DealStage::AddressConfirmation, false),
            (DealStage::Released, false),
        ] {
            d.stage = stage;
            assert_eq!(d.step_expired(now), expired, "stage {:?}", stage);
        }
    }

    #[test]
    fn test_terminal_stages() {
        assert!(DealStage::Released.is_terminal());
        assert!(DealStage::Cancelled.is_terminal());
        assert!(DealStage::TimedOut.is_terminal());
        assert!(!DealStage::AwaitingPayment.is_terminal());
        assert!(!DealStage::Created.is_terminal());
    }
}
