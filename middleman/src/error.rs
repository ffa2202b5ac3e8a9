// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for deal coordination.
//!
//! Validation and authorization failures are handled at the interaction
//! boundary and never mutate a deal. External service failures during
//! payout are hard failures: the absence of a returned txid must never be
//! read as success.

use crate::types::{DealStage, TicketId};
use thiserror::Error;

pub type MiddlemanResult<T> = Result<T, MiddlemanError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MiddlemanError {
    #[error("no active deal for ticket {0}")]
    DealNotFound(TicketId),

    #[error("a deal already exists for ticket {0}")]
    DealExists(TicketId),

    /// The operation arrived while the deal was in a stage that does not
    /// accept it. Covers stale button presses and races lost against a
    /// timeout: the deal state is left untouched.
    #[error("'{operation}' is not valid while the deal is in the {stage} stage")]
    InvalidTransition {
        operation: &'static str,
        stage: DealStage,
    },

    #[error("{0}")]
    Validation(String),

    #[error("only deal participants can {0}")]
    Authorization(&'static str),

    #[error("{service} request failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("timed out waiting for {0}")]
    TimeoutExpired(&'static str),
}

impl MiddlemanError {
    /// Short stable label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            MiddlemanError::DealNotFound(_) => "deal_not_found",
            MiddlemanError::DealExists(_) => "deal_exists",
            MiddlemanError::InvalidTransition { .. } => "invalid_transition",
            MiddlemanError::Validation(_) => "validation",
            MiddlemanError::Authorization(_) => "authorization",
            MiddlemanError::ExternalService { .. } => "external_service",
            MiddlemanError::TimeoutExpired(_) => "timeout_expired",
        }
    }

    pub fn external(service: &'static str, err: impl std::fmt::Display) -> Self {
        MiddlemanError::ExternalService {
            service,
            message: err.to_string(),
        }
    }
}
