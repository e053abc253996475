//! # error
//!
//! Centralised application error type.
//!
//! Every fallible stage of the pipeline returns `Result<_, BotError>`.  The
//! engine loop is the single place that catches these — a failed TR query or
//! Telegram delivery is logged and absorbed there, it never takes the worker
//! down with it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    /// The brokerage bridge rejected or failed a TR query.
    #[error("Bridge query failed: {0}")]
    Bridge(String),

    /// The outbound notification channel failed.
    #[error("Notifier error: {0}")]
    Notifier(String),
}
