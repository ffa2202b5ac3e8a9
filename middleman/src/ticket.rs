// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ticket interaction router.
//!
//! Stateless dispatch: every event looks the deal up by ticket id and is
//! mapped onto a state machine operation based on the deal's current
//! stage. Rejections are answered privately (or as a button toast); they
//! never mutate the deal. Free-form chatter that does not match the stage
//! the deal is waiting on is ignored.

use crate::error::{MiddlemanError, MiddlemanResult};
use crate::gateway::TicketEvent;
use crate::metrics::MiddlemanMetrics;
use crate::notify::{buttons, NotificationChannel};
use crate::state_machine::DealStateMachine;
use crate::store::DealStore;
use crate::types::{DealStage, Role, TicketId, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TicketRouter {
    machine: Arc<DealStateMachine>,
    store: Arc<DealStore>,
    channel: Arc<dyn NotificationChannel>,
    metrics: Arc<MiddlemanMetrics>,
    owner: UserId,
}

impl TicketRouter {
    pub fn new(
        machine: Arc<DealStateMachine>,
        store: Arc<DealStore>,
        channel: Arc<dyn NotificationChannel>,
        metrics: Arc<MiddlemanMetrics>,
        owner: UserId,
    ) -> Self {
        Self {
            machine,
            store,
            channel,
            metrics,
            owner,
        }
    }

    /// Consume gateway events until the channel closes or shutdown.
    pub fn start(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TicketEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[TicketRouter] started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[TicketRouter] stopped");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => self.handle(event).await,
                        None => {
                            info!("[TicketRouter] event channel closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn handle(&self, event: TicketEvent) {
        match event {
            TicketEvent::Opened { ticket, opener } => {
                if let Err(e) = self.machine.open_ticket(ticket, opener).await {
                    warn!("[TicketRouter] failed to open ticket {}: {}", ticket, e);
                }
            }
            TicketEvent::Text { ticket, user, text } => {
                self.handle_text(ticket, user, &text).await;
            }
            TicketEvent::Button {
                ticket,
                user,
                data,
                interaction_id,
            } => {
                self.handle_button(ticket, user, &data, &interaction_id).await;
            }
            TicketEvent::Command {
                ticket,
                user,
                command,
                args,
            } => {
                self.handle_command(ticket, user, &command, &args).await;
            }
        }
    }

    async fn handle_text(&self, ticket: TicketId, user: UserId, text: &str) {
        let Some(handle) = self.store.get(ticket).await else {
            return;
        };
        let stage = handle.lock().await.stage;
        let trimmed = text.trim();

        match stage {
            DealStage::Created => {
                if trimmed.eq_ignore_ascii_case("cancel") {
                    if let Err(e) = self.machine.cancel(ticket, "cancelled during intake").await {
                        debug!("[TicketRouter] intake cancel on {}: {}", ticket, e);
                    }
                    return;
                }
                // Anything that is not a user id keeps the intake waiting.
                let Ok(counterparty) = trimmed.parse::<i64>() else {
                    return;
                };
                if let Err(e) = self
                    .machine
                    .bind_counterparty(ticket, UserId(counterparty))
                    .await
                {
                    self.reject_privately(user, &e).await;
                }
            }
            DealStage::AmountEntry => {
                // Only numeric messages are amount submissions.
                if trimmed.parse::<f64>().is_err() {
                    return;
                }
                match self.machine.enter_amount(ticket, user, trimmed).await {
                    Ok(()) => {}
                    // Non-sender chatter that happens to be numeric.
                    Err(MiddlemanError::Authorization(_))
                    | Err(MiddlemanError::InvalidTransition { .. }) => {}
                    Err(e) => self.reject_privately(user, &e).await,
                }
            }
            DealStage::AwaitingRelease | DealStage::AddressConfirmation => {
                // Modal replacement: a lone address-shaped token from a
                // participant is the proposed payout destination.
                if !looks_like_address_attempt(trimmed) {
                    return;
                }
                match self.machine.request_release(ticket, user, trimmed).await {
                    Ok(()) => {}
                    Err(MiddlemanError::Authorization(_))
                    | Err(MiddlemanError::InvalidTransition { .. }) => {}
                    Err(e) => self.reject_privately(user, &e).await,
                }
            }
            _ => {}
        }
    }

    async fn handle_button(
        &self,
        ticket: TicketId,
        user: UserId,
        data: &str,
        interaction_id: &str,
    ) {
        let result: MiddlemanResult<()> = match data {
            buttons::ROLE_SENDER => self.machine.assign_role(ticket, user, Role::Sender).await,
            buttons::ROLE_RECEIVER => self.machine.assign_role(ticket, user, Role::Receiver).await,
            buttons::CONFIRM_YES | buttons::CONFIRM_NO => {
                let approve = data == buttons::CONFIRM_YES;
                self.route_confirmation(ticket, user, approve).await
            }
            buttons::RELEASE => self.machine.prompt_release_address(ticket, user).await,
            buttons::PASTE_ADDRESS => {
                let address = self.machine.policy().deposit_address.clone();
                let _ = self.channel.ack_interaction(interaction_id, &address).await;
                return;
            }
            other => {
                debug!("[TicketRouter] unknown button '{}' on {}", other, ticket);
                return;
            }
        };

        match result {
            Ok(()) => {
                let _ = self.channel.ack_interaction(interaction_id, "").await;
            }
            Err(e) => {
                self.note_rejection(&e);
                let _ = self
                    .channel
                    .ack_interaction(interaction_id, &user_message(&e))
                    .await;
            }
        }
    }

    /// Confirm/reject buttons are shared across the three confirmation
    /// prompts; the deal's stage decides which round the vote belongs to.
    async fn route_confirmation(
        &self,
        ticket: TicketId,
        user: UserId,
        approve: bool,
    ) -> MiddlemanResult<()> {
        let handle = self.store.require(ticket).await?;
        let stage = handle.lock().await.stage;
        match stage {
            DealStage::RoleConfirmation => self.machine.confirm_roles(ticket, user, approve).await,
            DealStage::AmountConfirmation => {
                self.machine.confirm_amount(ticket, user, approve).await
            }
            DealStage::AddressConfirmation => {
                if approve {
                    self.machine.confirm_release(ticket, user).await
                } else {
                    self.machine.cancel_release(ticket, user).await
                }
            }
            stage => Err(MiddlemanError::InvalidTransition {
                operation: "confirm",
                stage,
            }),
        }
    }

    async fn handle_command(&self, ticket: TicketId, user: UserId, command: &str, args: &[String]) {
        match command {
            // Owner override: force the payout past dual confirmation.
            "release" => {
                if user != self.owner {
                    self.note_rejection(&MiddlemanError::Authorization("force a release"));
                    self.reply(user, "\u{274c} You are not authorized to force a release.")
                        .await;
                    return;
                }
                let Some(address) = args.first() else {
                    self.reply(user, "Usage: /release <receiver LTC address>").await;
                    return;
                };
                match self.machine.force_release(ticket, user, address).await {
                    Ok(()) => {}
                    // Wallet failures were already broadcast into the
                    // ticket by the payout path.
                    Err(MiddlemanError::ExternalService { .. }) => {}
                    Err(MiddlemanError::DealNotFound(_)) => {
                        self.reply(user, "No active deal in this channel!").await;
                    }
                    Err(e) => {
                        self.reply(user, &user_message(&e)).await;
                    }
                }
            }
            other => {
                debug!("[TicketRouter] ignoring command '{}' on {}", other, ticket);
            }
        }
    }

    async fn reject_privately(&self, user: UserId, error: &MiddlemanError) {
        self.note_rejection(error);
        self.reply(user, &user_message(error)).await;
    }

    async fn reply(&self, user: UserId, text: &str) {
        if let Err(e) = self.channel.reply_private(user, text).await {
            warn!("[TicketRouter] failed to reply to {}: {}", user, e);
        }
    }

    fn note_rejection(&self, error: &MiddlemanError) {
        self.metrics
            .rejected_actions
            .with_label_values(&[error.error_type()])
            .inc();
    }
}

/// A lone whitespace-free token with a recognized prefix; everything else
/// in the release stages is chatter.
fn looks_like_address_attempt(text: &str) -> bool {
    text.split_whitespace().count() == 1
        && (text.starts_with('L') || text.starts_with('M') || text.starts_with("ltc1"))
}

fn user_message(error: &MiddlemanError) -> String {
    match error {
        MiddlemanError::Authorization(action) => {
            format!("\u{274c} Only deal participants can {}!", action)
        }
        MiddlemanError::InvalidTransition { .. } => {
            "This step has already been resolved.".to_string()
        }
        MiddlemanError::Validation(message) => format!("\u{274c} {}", message),
        MiddlemanError::ExternalService { service, .. } => {
            format!("\u{26a0} The {} is unavailable, please try again.", service)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::DealPolicy;
    use crate::test_utils::{MockChannel, MockOracle, MockSigner};

    const TICKET: TicketId = TicketId(-700);
    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);
    const OWNER: UserId = UserId(50);
    const GOOD_ADDR: &str = "LVg2kJoFNg45Nbpy53h7Fe1wKyeXVRhMH9";

    struct Fixture {
        router: TicketRouter,
        store: Arc<DealStore>,
        channel: Arc<MockChannel>,
        signer: Arc<MockSigner>,
        machine: Arc<DealStateMachine>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(DealStore::new());
        let channel = Arc::new(MockChannel::new());
        let signer = Arc::new(MockSigner::succeeding("payout-tx"));
        let metrics = Arc::new(MiddlemanMetrics::new_for_test());
        let machine = Arc::new(DealStateMachine::new(
            store.clone(),
            Arc::new(MockOracle::with_rate(50.0)),
            signer.clone(),
            channel.clone(),
            DealPolicy {
                deposit_address: "LhK2kQwiaAvhjWY799cZvMyYwnQAcxkarr".to_string(),
                grace_delay: std::time::Duration::from_secs(60),
                ..DealPolicy::default()
            },
            metrics.clone(),
        ));
        let router = TicketRouter::new(
            machine.clone(),
            store.clone(),
            channel.clone(),
            metrics,
            OWNER,
        );
        Fixture {
            router,
            store,
            channel,
            signer,
            machine,
        }
    }

    async fn stage_of(f: &Fixture) -> DealStage {
        f.store.get(TICKET).await.unwrap().lock().await.stage
    }

    fn text(user: UserId, s: &str) -> TicketEvent {
        TicketEvent::Text {
            ticket: TICKET,
            user,
            text: s.to_string(),
        }
    }

    fn button(user: UserId, data: &str) -> TicketEvent {
        TicketEvent::Button {
            ticket: TICKET,
            user,
            data: data.to_string(),
            interaction_id: format!("cbq-{}-{}", user, data),
        }
    }

    #[tokio::test]
    async fn test_full_deal_through_router_events() {
        let f = fixture();

        let script = vec![
            TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            },
            text(ALICE, "2"),
            button(ALICE, buttons::ROLE_SENDER),
            button(BOB, buttons::ROLE_RECEIVER),
            button(ALICE, buttons::CONFIRM_YES),
            button(BOB, buttons::CONFIRM_YES),
            text(ALICE, "100"),
            button(ALICE, buttons::CONFIRM_YES),
            button(BOB, buttons::CONFIRM_YES),
        ];
        for event in script {
            f.router.handle(event).await;
        }
        assert_eq!(stage_of(&f).await, DealStage::AwaitingPayment);

        // Payment lands out of band, then the release flow runs.
        f.machine
            .observe_payment_tick(
                TICKET,
                Some(crate::types::PaymentMatch {
                    txid: "deposit-tx".to_string(),
                    value: 2.0,
                    confirmations: 1,
                }),
            )
            .await
            .unwrap();

        for event in [
            button(BOB, buttons::RELEASE),
            text(BOB, GOOD_ADDR),
            button(BOB, buttons::CONFIRM_YES),
        ] {
            f.router.handle(event).await;
        }

        assert_eq!(stage_of(&f).await, DealStage::Released);
        assert_eq!(f.signer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_intake_cancel_text() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router.handle(text(ALICE, "cancel")).await;
        assert_eq!(stage_of(&f).await, DealStage::Cancelled);
    }

    #[tokio::test]
    async fn test_intake_ignores_chatter() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router.handle(text(ALICE, "hello there")).await;
        assert_eq!(stage_of(&f).await, DealStage::Created);
    }

    #[tokio::test]
    async fn test_text_for_unknown_ticket_is_ignored() {
        let f = fixture();
        // No deal exists; nothing should panic or notify.
        f.router.handle(text(ALICE, "100")).await;
        assert!(f.channel.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outsider_button_gets_ephemeral_rejection() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router.handle(text(ALICE, "2")).await;
        f.router.handle(button(CAROL, buttons::ROLE_SENDER)).await;

        assert_eq!(stage_of(&f).await, DealStage::RoleSelection);
        let acks = f.channel.acks.lock().unwrap();
        assert!(acks.iter().any(|(_, text)| text.contains("participants")));
    }

    #[tokio::test]
    async fn test_stale_button_press_is_acked_quietly() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router.handle(text(ALICE, "2")).await;
        f.router.handle(button(ALICE, buttons::ROLE_SENDER)).await;
        f.router.handle(button(BOB, buttons::ROLE_RECEIVER)).await;
        f.router.handle(button(ALICE, buttons::CONFIRM_YES)).await;
        f.router.handle(button(BOB, buttons::CONFIRM_YES)).await;
        assert_eq!(stage_of(&f).await, DealStage::AmountEntry);

        // A late press on the resolved roles prompt changes nothing.
        f.router.handle(button(BOB, buttons::CONFIRM_YES)).await;
        assert_eq!(stage_of(&f).await, DealStage::AmountEntry);
        let acks = f.channel.acks.lock().unwrap();
        assert!(acks
            .iter()
            .any(|(_, text)| text.contains("already been resolved")));
    }

    #[tokio::test]
    async fn test_amount_chatter_from_receiver_is_ignored() {
        let f = fixture();
        for event in [
            TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            },
            text(ALICE, "2"),
            button(ALICE, buttons::ROLE_SENDER),
            button(BOB, buttons::ROLE_RECEIVER),
            button(ALICE, buttons::CONFIRM_YES),
            button(BOB, buttons::CONFIRM_YES),
            // Bob is the receiver; his number must not set the amount.
            text(BOB, "999"),
        ] {
            f.router.handle(event).await;
        }
        assert_eq!(stage_of(&f).await, DealStage::AmountEntry);
    }

    #[tokio::test]
    async fn test_force_release_requires_owner() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router
            .handle(TicketEvent::Command {
                ticket: TICKET,
                user: ALICE,
                command: "release".to_string(),
                args: vec![GOOD_ADDR.to_string()],
            })
            .await;

        assert_eq!(f.signer.call_count(), 0);
        let privates = f.channel.privates.lock().unwrap();
        assert!(privates
            .iter()
            .any(|(user, text)| *user == ALICE && text.contains("not authorized")));
    }

    #[tokio::test]
    async fn test_owner_force_release_after_payment() {
        let f = fixture();
        for event in [
            TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            },
            text(ALICE, "2"),
            button(ALICE, buttons::ROLE_SENDER),
            button(BOB, buttons::ROLE_RECEIVER),
            button(ALICE, buttons::CONFIRM_YES),
            button(BOB, buttons::CONFIRM_YES),
            text(ALICE, "100"),
            button(ALICE, buttons::CONFIRM_YES),
            button(BOB, buttons::CONFIRM_YES),
        ] {
            f.router.handle(event).await;
        }
        f.machine
            .observe_payment_tick(
                TICKET,
                Some(crate::types::PaymentMatch {
                    txid: "deposit-tx".to_string(),
                    value: 2.0,
                    confirmations: 1,
                }),
            )
            .await
            .unwrap();

        f.router
            .handle(TicketEvent::Command {
                ticket: TICKET,
                user: OWNER,
                command: "release".to_string(),
                args: vec![GOOD_ADDR.to_string()],
            })
            .await;

        assert_eq!(stage_of(&f).await, DealStage::Released);
        assert_eq!(f.signer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_owner_force_release_without_deal() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Command {
                ticket: TICKET,
                user: OWNER,
                command: "release".to_string(),
                args: vec![GOOD_ADDR.to_string()],
            })
            .await;

        let privates = f.channel.privates.lock().unwrap();
        assert!(privates
            .iter()
            .any(|(_, text)| text.contains("No active deal")));
    }

    #[tokio::test]
    async fn test_paste_button_acks_deposit_address() {
        let f = fixture();
        f.router
            .handle(TicketEvent::Opened {
                ticket: TICKET,
                opener: ALICE,
            })
            .await;
        f.router
            .handle(button(ALICE, buttons::PASTE_ADDRESS))
            .await;

        let acks = f.channel.acks.lock().unwrap();
        assert!(acks
            .iter()
            .any(|(_, text)| text == "LhK2kQwiaAvhjWY799cZvMyYwnQAcxkarr"));
    }

    #[test]
    fn test_looks_like_address_attempt() {
        assert!(looks_like_address_attempt(GOOD_ADDR));
        assert!(looks_like_address_attempt("ltc1q5anyhzgdnvxf2ed5jxye8wyeu"));
        assert!(!looks_like_address_attempt("thanks, sending now"));
        assert!(!looks_like_address_attempt("L is my favorite letter btw"));
    }
}
