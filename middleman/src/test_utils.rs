// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mock collaborators for unit tests.

use crate::chain::{ChainError, ChainTx, ChainWatcher};
use crate::notify::{DealNotice, NotificationChannel, NotifyError};
use crate::rates::{OracleError, PriceOracle};
use crate::types::{TicketId, UserId};
use crate::wallet::{WalletError, WalletSigner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Price oracle returning a programmable rate or error.
pub struct MockOracle {
    result: Mutex<Result<f64, OracleError>>,
}

impl MockOracle {
    pub fn with_rate(rate: f64) -> Self {
        Self {
            result: Mutex::new(Ok(rate)),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: Mutex::new(Err(OracleError::Transport("mock outage".to_string()))),
        }
    }

    pub fn set_rate(&self, rate: f64) {
        *self.result.lock().unwrap() = Ok(rate);
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn rate(&self) -> Result<f64, OracleError> {
        self.result.lock().unwrap().clone()
    }
}

/// Wallet signer that counts invocations.
pub struct MockSigner {
    pub calls: AtomicUsize,
    result: Mutex<Result<String, WalletError>>,
}

impl MockSigner {
    pub fn succeeding(txid: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            result: Mutex::new(Ok(txid.to_string())),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            result: Mutex::new(Err(WalletError::Transport("mock outage".to_string()))),
        }
    }

    pub fn set_result(&self, result: Result<String, WalletError>) {
        *self.result.lock().unwrap() = result;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletSigner for MockSigner {
    async fn send_payout(&self, _address: &str, _amount: f64) -> Result<String, WalletError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().unwrap().clone()
    }
}

/// Notification channel that records everything it is asked to send.
#[derive(Default)]
pub struct MockChannel {
    pub broadcasts: Mutex<Vec<(TicketId, DealNotice)>>,
    pub privates: Mutex<Vec<(UserId, String)>>,
    pub acks: Mutex<Vec<(String, String)>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast_notices(&self) -> Vec<DealNotice> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn count_matching(&self, predicate: impl Fn(&DealNotice) -> bool) -> usize {
        self.broadcast_notices()
            .iter()
            .filter(|n| predicate(n))
            .count()
    }
}

#[async_trait]
impl NotificationChannel for MockChannel {
    async fn broadcast(&self, ticket: TicketId, notice: DealNotice) -> Result<(), NotifyError> {
        self.broadcasts.lock().unwrap().push((ticket, notice));
        Ok(())
    }

    async fn reply_private(&self, user: UserId, text: &str) -> Result<(), NotifyError> {
        self.privates
            .lock()
            .unwrap()
            .push((user, text.to_string()));
        Ok(())
    }

    async fn ack_interaction(&self, interaction_id: &str, text: &str) -> Result<(), NotifyError> {
        self.acks
            .lock()
            .unwrap()
            .push((interaction_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Chain watcher replaying queued responses; an empty queue yields an empty
/// transaction list.
pub struct MockWatcher {
    responses: Mutex<VecDeque<Result<Vec<ChainTx>, ChainError>>>,
    pub lookups: AtomicUsize,
}

impl MockWatcher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: Result<Vec<ChainTx>, ChainError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for MockWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainWatcher for MockWatcher {
    async fn lookup(&self, _address: &str) -> Result<Vec<ChainTx>, ChainError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![]))
    }
}
