// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Periodic payment watcher.
//!
//! Each tick scans the store, feeds `AwaitingPayment` deals the result of
//! an explorer lookup, and fires the per-step deadline sweep for
//! interactive stages. A failing lookup is logged and surfaced as "no
//! match this tick" — it never kills the loop or stalls other deals.

use crate::chain::{ChainTx, ChainWatcher};
use crate::metrics::MiddlemanMetrics;
use crate::state_machine::DealStateMachine;
use crate::store::DealStore;
use crate::types::{DealStage, PaymentMatch};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PaymentMonitor {
    store: Arc<DealStore>,
    watcher: Arc<dyn ChainWatcher>,
    machine: Arc<DealStateMachine>,
    metrics: Arc<MiddlemanMetrics>,
    poll_interval: Duration,
}

impl PaymentMonitor {
    pub fn new(
        store: Arc<DealStore>,
        watcher: Arc<dyn ChainWatcher>,
        machine: Arc<DealStateMachine>,
        metrics: Arc<MiddlemanMetrics>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            watcher,
            machine,
            metrics,
            poll_interval,
        }
    }

    /// Spawn the poll loop. Runs until the token is cancelled.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[PaymentMonitor] started (poll_interval={:?})",
                self.poll_interval
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[PaymentMonitor] stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One poll cycle over every deal in the store.
    pub async fn tick(&self) {
        self.metrics
            .active_deals
            .set(self.store.len().await as i64);

        let now = SystemTime::now();
        for ticket in self.store.tickets().await {
            let Some(handle) = self.store.get(ticket).await else {
                continue;
            };

            // Snapshot under the lock, then release it for the slow lookup;
            // the state machine re-checks the stage when the result lands.
            let (stage, expected, step_expired) = {
                let deal = handle.lock().await;
                (
                    deal.stage,
                    deal.amounts.map(|a| a.crypto),
                    deal.step_expired(now),
                )
            };

            if step_expired {
                if let Err(e) = self.machine.sweep_step_deadline(ticket).await {
                    debug!("[PaymentMonitor] deadline sweep on {}: {}", ticket, e);
                }
                continue;
            }

            if stage != DealStage::AwaitingPayment {
                continue;
            }
            let Some(expected) = expected else {
                continue;
            };

            self.metrics.payment_lookups.inc();
            let deposit_address = &self.machine.policy().deposit_address;
            let matched = match self.watcher.lookup(deposit_address).await {
                Ok(txs) => find_match(&txs, expected, self.machine.policy().payment_tolerance),
                Err(e) => {
                    // Retried next tick; a lookup failure is never fatal.
                    self.metrics.payment_lookup_errors.inc();
                    warn!("[PaymentMonitor] lookup failed for {}: {}", ticket, e);
                    None
                }
            };

            if let Err(e) = self.machine.observe_payment_tick(ticket, matched).await {
                debug!("[PaymentMonitor] stale tick for {}: {}", ticket, e);
            }
        }
    }
}

/// Pick the first transaction whose value is within `tolerance` of the
/// expected deposit.
pub fn find_match(txs: &[ChainTx], expected: f64, tolerance: f64) -> Option<PaymentMatch> {
    txs.iter()
        .find(|tx| (tx.value - expected).abs() < tolerance)
        .map(|tx| PaymentMatch {
            txid: tx.txid.clone(),
            value: tx.value,
            confirmations: tx.confirmations,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::state_machine::DealPolicy;
    use crate::test_utils::{MockChannel, MockOracle, MockSigner, MockWatcher};
    use crate::types::{Role, TicketId, UserId};

    const TICKET: TicketId = TicketId(900);
    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    fn tx(txid: &str, value: f64) -> ChainTx {
        ChainTx {
            txid: txid.to_string(),
            value,
            confirmations: 1,
        }
    }

    #[test]
    fn test_find_match_within_tolerance() {
        let txs = vec![tx("a", 0.5), tx("b", 2.000000005), tx("c", 9.0)];
        let matched = find_match(&txs, 2.0, 1e-8).unwrap();
        assert_eq!(matched.txid, "b");
    }

    #[test]
    fn test_find_match_outside_tolerance() {
        let txs = vec![tx("a", 2.00000002)];
        assert!(find_match(&txs, 2.0, 1e-8).is_none());
    }

    #[test]
    fn test_find_match_empty_list() {
        assert!(find_match(&[], 2.0, 1e-8).is_none());
    }

    struct Fixture {
        monitor: Arc<PaymentMonitor>,
        machine: Arc<DealStateMachine>,
        store: Arc<DealStore>,
        watcher: Arc<MockWatcher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(DealStore::new());
        let watcher = Arc::new(MockWatcher::new());
        let metrics = Arc::new(MiddlemanMetrics::new_for_test());
        let machine = Arc::new(DealStateMachine::new(
            store.clone(),
            Arc::new(MockOracle::with_rate(50.0)),
            Arc::new(MockSigner::succeeding("payout-tx")),
            Arc::new(MockChannel::new()),
            DealPolicy {
                deposit_address: "LhK2kQwiaAvhjWY799cZvMyYwnQAcxkarr".to_string(),
                grace_delay: Duration::from_secs(60),
                ..DealPolicy::default()
            },
            metrics.clone(),
        ));
        let monitor = Arc::new(PaymentMonitor::new(
            store.clone(),
            watcher.clone(),
            machine.clone(),
            metrics,
            Duration::from_millis(10),
        ));
        Fixture {
            monitor,
            machine,
            store,
            watcher,
        }
    }

    async fn drive_to_awaiting_payment(f: &Fixture, ticket: TicketId) {
        f.machine.open_ticket(ticket, ALICE).await.unwrap();
        f.machine.bind_counterparty(ticket, BOB).await.unwrap();
        f.machine
            .assign_role(ticket, ALICE, Role::Sender)
            .await
            .unwrap();
        f.machine
            .assign_role(ticket, BOB, Role::Receiver)
            .await
            .unwrap();
        f.machine.confirm_roles(ticket, ALICE, true).await.unwrap();
        f.machine.confirm_roles(ticket, BOB, true).await.unwrap();
        f.machine.enter_amount(ticket, ALICE, "100").await.unwrap();
        f.machine.confirm_amount(ticket, ALICE, true).await.unwrap();
        f.machine.confirm_amount(ticket, BOB, true).await.unwrap();
    }

    async fn stage_of(f: &Fixture, ticket: TicketId) -> DealStage {
        f.store.get(ticket).await.unwrap().lock().await.stage
    }

    #[tokio::test]
    async fn test_tick_advances_deal_on_match() {
        let f = fixture();
        drive_to_awaiting_payment(&f, TICKET).await;
        f.watcher.push(Ok(vec![tx("deposit-tx", 2.0)]));

        f.monitor.tick().await;
        assert_eq!(stage_of(&f, TICKET).await, DealStage::AwaitingRelease);
        assert_eq!(f.watcher.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_error_is_survivable() {
        let f = fixture();
        drive_to_awaiting_payment(&f, TICKET).await;

        f.watcher
            .push(Err(ChainError::Transport("explorer down".to_string())));
        f.monitor.tick().await;
        assert_eq!(stage_of(&f, TICKET).await, DealStage::AwaitingPayment);

        // Next tick succeeds; the earlier failure cost nothing but time.
        f.watcher.push(Ok(vec![tx("deposit-tx", 2.0)]));
        f.monitor.tick().await;
        assert_eq!(stage_of(&f, TICKET).await, DealStage::AwaitingRelease);
    }

    #[tokio::test]
    async fn test_value_outside_tolerance_does_not_transition() {
        let f = fixture();
        drive_to_awaiting_payment(&f, TICKET).await;
        f.watcher.push(Ok(vec![tx("close-but-no", 2.00000002)]));

        f.monitor.tick().await;
        assert_eq!(stage_of(&f, TICKET).await, DealStage::AwaitingPayment);
    }

    #[tokio::test]
    async fn test_tick_ignores_deals_not_awaiting_payment() {
        let f = fixture();
        f.machine.open_ticket(TICKET, ALICE).await.unwrap();

        f.monitor.tick().await;
        assert_eq!(f.watcher.lookup_count(), 0);
        assert_eq!(stage_of(&f, TICKET).await, DealStage::Created);
    }

    #[tokio::test]
    async fn test_tick_sweeps_expired_interactive_deal() {
        let f = fixture();
        f.machine.open_ticket(TICKET, ALICE).await.unwrap();
        {
            let deal = f.store.get(TICKET).await.unwrap();
            let mut deal = deal.lock().await;
            deal.deadline = SystemTime::now() - Duration::from_secs(1);
        }

        f.monitor.tick().await;
        assert_eq!(stage_of(&f, TICKET).await, DealStage::TimedOut);
    }

    #[tokio::test]
    async fn test_one_failing_deal_does_not_block_others() {
        let f = fixture();
        let other = TicketId(901);
        drive_to_awaiting_payment(&f, TICKET).await;
        drive_to_awaiting_payment(&f, other).await;

        // Queue one error and one match; whichever deal draws the error
        // stays put, the loop still finishes the scan.
        f.watcher
            .push(Err(ChainError::Transport("explorer down".to_string())));
        f.watcher.push(Ok(vec![tx("deposit-tx", 2.0)]));
        f.monitor.tick().await;

        assert_eq!(f.watcher.lookup_count(), 2);
        let stages = [stage_of(&f, TICKET).await, stage_of(&f, other).await];
        assert!(stages.contains(&DealStage::AwaitingRelease));
        assert!(stages.contains(&DealStage::AwaitingPayment));
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = f.monitor.clone().start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
