// SPDX-License-Identifier: Apache-2.0

/// Result of a ticker operation, as delivered to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Failure = 1,
    Busy = 2,
}

/// Errors reported synchronously by the ticker API.
///
/// Anything that depends on the state of the node table is reported later
/// through the operation's completion callback instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TickerError {
    #[error("ticker instance is not initialized")]
    NotInitialized,
    #[error("user {0} is not configured")]
    InvalidUser(u8),
    #[error("node, user and operation tables do not add up")]
    InvalidConfig,
    /// The user's operation ring is full, or the node table is in use by
    /// the worker or job. Retry after the job has run.
    #[error("ticker is busy")]
    Busy,
}
