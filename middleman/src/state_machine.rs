// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! The deal state machine.
//!
//! Every mutation of a `Deal` happens here, under that deal's mutex, so
//! concurrent interactions, monitor ticks and timeouts apply in a serial
//! order: the first transition wins and the loser fails its stage check as
//! stale. Funds can only move after a payment was observed on chain and —
//! outside the logged owner override — after explicit release confirmation
//! on a validated address.
//!
//! Stage graph:
//!
//! ```text
//! Created -> RoleSelection -> RoleConfirmation -> AmountEntry
//!   -> AmountConfirmation -> AwaitingPayment -> AwaitingRelease
//!   -> AddressConfirmation -> Released
//! ```
//!
//! with `Cancelled`/`TimedOut` reachable from every non-terminal stage and
//! the confirmation rejects stepping back one sub-stage.

use crate::error::{MiddlemanError, MiddlemanResult};
use crate::metrics::MiddlemanMetrics;
use crate::notify::{DealNotice, NotificationChannel};
use crate::rates::PriceOracle;
use crate::store::DealStore;
use crate::types::{
    Deal, DealAmounts, DealStage, PaymentMatch, Role, TicketId, UserId, VoteOutcome,
};
use crate::wallet::WalletSigner;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Tunables for deal coordination, fixed at startup.
#[derive(Debug, Clone)]
pub struct DealPolicy {
    /// How long a deal may sit in `AwaitingPayment` before it times out.
    pub deal_timeout: Duration,
    /// Response deadline for each interactive step.
    pub step_timeout: Duration,
    /// Delay between a terminal transition and deal removal.
    pub grace_delay: Duration,
    /// Tolerance when matching an on-chain value against the expected
    /// deposit.
    pub payment_tolerance: f64,
    /// Escrow deposit address shown on the invoice.
    pub deposit_address: String,
}

impl Default for DealPolicy {
    fn default() -> Self {
        Self {
            deal_timeout: Duration::from_secs(3600),
            step_timeout: Duration::from_secs(300),
            grace_delay: Duration::from_secs(10),
            payment_tolerance: 1e-8,
            deposit_address: String::new(),
        }
    }
}

/// Result of one payment-monitor observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTickOutcome {
    Matched,
    StillWaiting,
    TimedOut,
}

/// Syntactic litecoin address check: recognized prefix and plausible
/// length. This is a cheap shape test, not checksum validation — it gates
/// obvious garbage before anything reaches the wallet.
pub fn validate_payout_address(address: &str) -> MiddlemanResult<()> {
    let len = address.len();
    let prefix_ok =
        address.starts_with('L') || address.starts_with('M') || address.starts_with("ltc1");
    let shape_ok = (26..=48).contains(&len)
        && prefix_ok
        && address.chars().all(|c| c.is_ascii_alphanumeric());
    if !shape_ok {
        return Err(MiddlemanError::Validation(
            "invalid LTC address format".to_string(),
        ));
    }
    Ok(())
}

pub struct DealStateMachine {
    store: Arc<DealStore>,
    oracle: Arc<dyn PriceOracle>,
    signer: Arc<dyn WalletSigner>,
    channel: Arc<dyn NotificationChannel>,
    policy: DealPolicy,
    metrics: Arc<MiddlemanMetrics>,
}

impl DealStateMachine {
    pub fn new(
        store: Arc<DealStore>,
        oracle: Arc<dyn PriceOracle>,
        signer: Arc<dyn WalletSigner>,
        channel: Arc<dyn NotificationChannel>,
        policy: DealPolicy,
        metrics: Arc<MiddlemanMetrics>,
    ) -> Self {
        Self {
            store,
            oracle,
            signer,
            channel,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &DealPolicy {
        &self.policy
    }

    /// A new ticket: create the deal and ask for the counterparty.
    pub async fn open_ticket(&self, ticket: TicketId, opener: UserId) -> MiddlemanResult<()> {
        let deal = Deal::new(ticket, opener, SystemTime::now(), self.policy.step_timeout);
        let code = deal.code.clone();
        self.store.create(deal).await?;
        self.metrics.deals_opened.inc();
        info!("[DealStateMachine] deal opened for ticket {}", ticket);

        self.notify(ticket, DealNotice::CounterpartyPrompt { code })
            .await;
        Ok(())
    }

    /// Bind the second party supplied during intake and start role
    /// selection.
    pub async fn bind_counterparty(
        &self,
        ticket: TicketId,
        counterparty: UserId,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        self.guard_deadline(&mut deal, "the counterparty id").await?;
        expect_stage(&deal, DealStage::Created, "add a counterparty")?;
        if counterparty == deal.opener {
            return Err(MiddlemanError::Validation(
                "you cannot open a deal with yourself".to_string(),
            ));
        }

        deal.counterparty = Some(counterparty);
        deal.stage = DealStage::RoleSelection;
        deal.touch(SystemTime::now(), self.policy.step_timeout);

        self.notify(ticket, DealNotice::CounterpartyAdded { user: counterparty })
            .await;
        self.notify(ticket, DealNotice::Welcome).await;
        self.notify(
            ticket,
            DealNotice::RolePrompt {
                sender: None,
                receiver: None,
            },
        )
        .await;
        Ok(())
    }

    /// Bind `user` to a role slot. Reassignment is idempotent; filling both
    /// slots auto-advances to role confirmation.
    pub async fn assign_role(
        &self,
        ticket: TicketId,
        user: UserId,
        role: Role,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        self.guard_deadline(&mut deal, "role selection").await?;
        expect_stage(&deal, DealStage::RoleSelection, "select a role")?;
        if user != deal.opener && deal.counterparty != Some(user) {
            return Err(MiddlemanError::Authorization("select a role"));
        }

        deal.take_role(user, role);
        deal.touch(SystemTime::now(), self.policy.step_timeout);
        self.notify(ticket, DealNotice::RoleTaken { user, role }).await;

        if let Some((sender, receiver)) = deal.participants() {
            deal.stage = DealStage::RoleConfirmation;
            deal.reset_votes();
            self.notify(ticket, DealNotice::RoleConfirmPrompt { sender, receiver })
                .await;
        } else {
            self.notify(
                ticket,
                DealNotice::RolePrompt {
                    sender: deal.sender,
                    receiver: deal.receiver,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Dual confirmation of the role assignment. Either participant
    /// rejecting resets role selection entirely.
    pub async fn confirm_roles(
        &self,
        ticket: TicketId,
        user: UserId,
        approve: bool,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        self.guard_deadline(&mut deal, "role confirmation").await?;
        expect_stage(&deal, DealStage::RoleConfirmation, "confirm roles")?;
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("confirm the deal roles"));
        }

        if !approve {
            self.notify(ticket, DealNotice::VoteRegistered { user, approve })
                .await;
            deal.clear_roles();
            deal.reset_votes();
            deal.stage = DealStage::RoleSelection;
            deal.touch(SystemTime::now(), self.policy.step_timeout);
            self.notify(ticket, DealNotice::RolesReset).await;
            self.notify(
                ticket,
                DealNotice::RolePrompt {
                    sender: None,
                    receiver: None,
                },
            )
            .await;
            return Ok(());
        }

        match deal.register_vote(user) {
            VoteOutcome::Duplicate => {
                // Counts once; the repeat press is ignored.
                debug!(
                    "[DealStateMachine] duplicate role vote by {} on ticket {}",
                    user, ticket
                );
            }
            VoteOutcome::Counted { votes } => {
                self.notify(ticket, DealNotice::VoteRegistered { user, approve })
                    .await;
                if votes >= 2 {
                    deal.reset_votes();
                    deal.stage = DealStage::AmountEntry;
                    deal.touch(SystemTime::now(), self.policy.step_timeout);
                    self.notify(ticket, DealNotice::AmountPrompt).await;
                }
            }
        }
        Ok(())
    }

    /// Sender supplies the fiat amount. The conversion rate is fetched at
    /// entry time and recorded with the amounts.
    pub async fn enter_amount(
        &self,
        ticket: TicketId,
        user: UserId,
        text: &str,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        self.guard_deadline(&mut deal, "the deal amount").await?;
        expect_stage(&deal, DealStage::AmountEntry, "enter the amount")?;
        if deal.sender != Some(user) {
            return Err(MiddlemanError::Authorization("enter the deal amount"));
        }

        let fiat: f64 = text
            .trim()
            .parse()
            .map_err(|_| MiddlemanError::Validation("amount must be a number".to_string()))?;
        if !fiat.is_finite() || fiat <= 0.0 {
            return Err(MiddlemanError::Validation(
                "amount must be a positive number".to_string(),
            ));
        }

        // Oracle failure blocks the step; the deal stays in AmountEntry and
        // the sender can retry.
        let rate = self
            .oracle
            .rate()
            .await
            .map_err(|e| MiddlemanError::external("price oracle", e))?;

        let amounts = DealAmounts::from_fiat(fiat, rate);
        deal.amounts = Some(amounts);
        deal.stage = DealStage::AmountConfirmation;
        deal.reset_votes();
        deal.touch(SystemTime::now(), self.policy.step_timeout);

        self.notify(ticket, DealNotice::AmountConfirmPrompt { amounts })
            .await;
        Ok(())
    }

    /// Dual confirmation of the amount. Reject clears it and returns to
    /// amount entry; dual accept opens the payment watch and presents the
    /// invoice.
    pub async fn confirm_amount(
        &self,
        ticket: TicketId,
        user: UserId,
        approve: bool,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        self.guard_deadline(&mut deal, "amount confirmation").await?;
        expect_stage(&deal, DealStage::AmountConfirmation, "confirm the amount")?;
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("confirm the deal amount"));
        }

        if !approve {
            self.notify(ticket, DealNotice::VoteRegistered { user, approve })
                .await;
            deal.amounts = None;
            deal.reset_votes();
            deal.stage = DealStage::AmountEntry;
            deal.touch(SystemTime::now(), self.policy.step_timeout);
            self.notify(ticket, DealNotice::AmountReset).await;
            self.notify(ticket, DealNotice::AmountPrompt).await;
            return Ok(());
        }

        match deal.register_vote(user) {
            VoteOutcome::Duplicate => {
                // Counts once; the repeat press is ignored.
                debug!(
                    "[DealStateMachine] duplicate amount vote by {} on ticket {}",
                    user, ticket
                );
            }
            VoteOutcome::Counted { votes } => {
                self.notify(ticket, DealNotice::VoteRegistered { user, approve })
                    .await;
                if votes >= 2 {
                    let amounts = deal
                        .amounts
                        .ok_or_else(|| internal_stage_error("confirm the amount", &deal))?;
                    deal.reset_votes();
                    deal.stage = DealStage::AwaitingPayment;

                    // Display-only refresh; the stored amounts never move.
                    let display_rate = self.oracle.rate().await.unwrap_or(amounts.rate);
                    self.notify(
                        ticket,
                        DealNotice::Invoice {
                            address: self.policy.deposit_address.clone(),
                            amounts,
                            display_rate,
                        },
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Called by the payment monitor with the result of one chain lookup.
    /// Only meaningful in `AwaitingPayment`; the stage check is what makes
    /// a duplicate match a no-op.
    pub async fn observe_payment_tick(
        &self,
        ticket: TicketId,
        matched: Option<PaymentMatch>,
    ) -> MiddlemanResult<PaymentTickOutcome> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        expect_stage(&deal, DealStage::AwaitingPayment, "observe a payment")?;

        if let Some(payment) = matched {
            let crypto = deal
                .amounts
                .ok_or_else(|| internal_stage_error("observe a payment", &deal))?
                .crypto;
            deal.txid = Some(payment.txid.clone());
            deal.stage = DealStage::AwaitingRelease;
            self.metrics.payments_matched.inc();
            info!(
                "[DealStateMachine] payment detected for ticket {}: txid={}",
                ticket, payment.txid
            );
            self.notify(
                ticket,
                DealNotice::PaymentReceived {
                    crypto,
                    txid: payment.txid,
                },
            )
            .await;
            return Ok(PaymentTickOutcome::Matched);
        }

        if deal.age(SystemTime::now()) > self.policy.deal_timeout {
            self.expire(&mut deal).await;
            return Ok(PaymentTickOutcome::TimedOut);
        }
        Ok(PaymentTickOutcome::StillWaiting)
    }

    /// A participant pressed the release control: ask them for the
    /// destination address.
    pub async fn prompt_release_address(
        &self,
        ticket: TicketId,
        user: UserId,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let deal = handle.lock().await;
        if deal.stage != DealStage::AwaitingRelease && deal.stage != DealStage::AddressConfirmation
        {
            return Err(MiddlemanError::InvalidTransition {
                operation: "start a release",
                stage: deal.stage,
            });
        }
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("release funds"));
        }

        self.notify(ticket, DealNotice::AddressPrompt).await;
        Ok(())
    }

    /// A participant proposes the payout destination.
    pub async fn request_release(
        &self,
        ticket: TicketId,
        user: UserId,
        address: &str,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        if deal.stage != DealStage::AwaitingRelease && deal.stage != DealStage::AddressConfirmation
        {
            return Err(MiddlemanError::InvalidTransition {
                operation: "provide a release address",
                stage: deal.stage,
            });
        }
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("release funds"));
        }

        let address = address.trim();
        validate_payout_address(address)?;

        deal.payout_address = Some(address.to_string());
        deal.stage = DealStage::AddressConfirmation;
        self.notify(
            ticket,
            DealNotice::AddressConfirmPrompt {
                address: address.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Back out of a pending address without abandoning the deal.
    pub async fn cancel_release(&self, ticket: TicketId, user: UserId) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        expect_stage(&deal, DealStage::AddressConfirmation, "cancel the release")?;
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("cancel the release"));
        }

        deal.payout_address = None;
        deal.stage = DealStage::AwaitingRelease;
        self.notify(ticket, DealNotice::ReleaseCancelled).await;
        Ok(())
    }

    /// Final confirmation: broadcast the payout. The wallet is invoked
    /// under the deal mutex, so at most one broadcast can happen per
    /// approved release; a failed payout leaves the deal in
    /// `AddressConfirmation` for retry.
    pub async fn confirm_release(&self, ticket: TicketId, user: UserId) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        expect_stage(&deal, DealStage::AddressConfirmation, "confirm the release")?;
        if !deal.is_participant(user) {
            return Err(MiddlemanError::Authorization("confirm the release"));
        }

        self.execute_payout(&mut deal, false).await
    }

    /// Owner override: bypasses dual confirmation but not payment
    /// detection — the deal must already hold an observed payment.
    pub async fn force_release(
        &self,
        ticket: TicketId,
        operator: UserId,
        address: &str,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        if deal.stage != DealStage::AwaitingRelease && deal.stage != DealStage::AddressConfirmation
        {
            return Err(MiddlemanError::InvalidTransition {
                operation: "force a release",
                stage: deal.stage,
            });
        }

        let address = address.trim();
        validate_payout_address(address)?;
        deal.payout_address = Some(address.to_string());

        warn!(
            "[DealStateMachine] OWNER OVERRIDE release on ticket {} by operator {} to {}",
            ticket, operator, address
        );
        self.metrics.override_releases.inc();
        self.execute_payout(&mut deal, true).await
    }

    async fn execute_payout(&self, deal: &mut Deal, via_override: bool) -> MiddlemanResult<()> {
        let address = deal
            .payout_address
            .clone()
            .ok_or_else(|| internal_stage_error("confirm the release", deal))?;
        let amounts = deal
            .amounts
            .ok_or_else(|| internal_stage_error("confirm the release", deal))?;

        match self.signer.send_payout(&address, amounts.crypto).await {
            Ok(txid) => {
                self.metrics.payouts_submitted.inc();
                self.metrics.deals_released.inc();
                deal.payout_txid = Some(txid.clone());
                info!(
                    "[DealStateMachine] released {:.8} LTC for ticket {}: txid={}",
                    amounts.crypto, deal.id, txid
                );
                self.finish(
                    deal,
                    DealStage::Released,
                    DealNotice::Released {
                        crypto: amounts.crypto,
                        address,
                        txid,
                        via_override,
                    },
                )
                .await;
                Ok(())
            }
            Err(e) => {
                // No txid means the payout did NOT happen. Keep the stage so
                // the release can be retried after the wallet recovers.
                self.metrics.payout_errors.inc();
                warn!(
                    "[DealStateMachine] payout failed for ticket {}: {}",
                    deal.id, e
                );
                self.notify(
                    deal.id,
                    DealNotice::ReleaseFailed {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(MiddlemanError::external("wallet", e))
            }
        }
    }

    /// Abandon the deal from any non-terminal stage.
    pub async fn cancel(&self, ticket: TicketId, reason: &str) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        if deal.stage.is_terminal() {
            return Err(MiddlemanError::InvalidTransition {
                operation: "cancel the deal",
                stage: deal.stage,
            });
        }

        self.metrics.deals_cancelled.inc();
        info!(
            "[DealStateMachine] deal cancelled for ticket {}: {}",
            ticket, reason
        );
        self.finish(
            &mut deal,
            DealStage::Cancelled,
            DealNotice::Cancelled {
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Fire the interactive-step timeout if this deal's deadline passed.
    /// Returns whether the deal was timed out. Deals without a step
    /// deadline (payment watch, release stages, terminal) are untouched.
    pub async fn sweep_step_deadline(&self, ticket: TicketId) -> MiddlemanResult<bool> {
        let handle = self.store.require(ticket).await?;
        let mut deal = handle.lock().await;
        if !deal.step_expired(SystemTime::now()) {
            return Ok(false);
        }
        self.expire(&mut deal).await;
        Ok(true)
    }

    /// Lazy deadline check for interactive operations: once the step
    /// deadline has passed, the timeout deterministically wins and the late
    /// action is rejected, even if the background sweep has not fired yet.
    async fn guard_deadline(
        &self,
        deal: &mut Deal,
        waiting_for: &'static str,
    ) -> MiddlemanResult<()> {
        if !deal.step_expired(SystemTime::now()) {
            return Ok(());
        }
        self.expire(deal).await;
        Err(MiddlemanError::TimeoutExpired(waiting_for))
    }

    async fn expire(&self, deal: &mut Deal) {
        self.metrics.deals_timed_out.inc();
        info!(
            "[DealStateMachine] deal timed out for ticket {} in stage {}",
            deal.id, deal.stage
        );
        self.finish(deal, DealStage::TimedOut, DealNotice::TimedOut)
            .await;
    }

    /// Terminal transition: set the stage, broadcast, and schedule the
    /// grace-delayed teardown exactly once.
    async fn finish(&self, deal: &mut Deal, stage: DealStage, notice: DealNotice) {
        deal.stage = stage;
        self.notify(deal.id, notice).await;
        if !deal.teardown_scheduled {
            deal.teardown_scheduled = true;
            self.store.schedule_teardown(deal.id, self.policy.grace_delay);
        }
    }

    async fn notify(&self, ticket: TicketId, notice: DealNotice) {
        if let Err(e) = self.channel.broadcast(ticket, notice).await {
            self.metrics.notify_failures.inc();
            warn!(
                "[DealStateMachine] failed to notify ticket {}: {}",
                ticket, e
            );
        }
    }
}

fn expect_stage(deal: &Deal, stage: DealStage, operation: &'static str) -> MiddlemanResult<()> {
    if deal.stage != stage {
        return Err(MiddlemanError::InvalidTransition {
            operation,
            stage: deal.stage,
        });
    }
    Ok(())
}

// A required field was missing in a stage that guarantees it. Reported as a
// stale transition rather than panicking.
fn internal_stage_error(operation: &'static str, deal: &Deal) -> MiddlemanError {
    warn!(
        "[DealStateMachine] inconsistent deal state for ticket {} in stage {}",
        deal.id, deal.stage
    );
    MiddlemanError::InvalidTransition {
        operation,
        stage: deal.stage,
    }
}
