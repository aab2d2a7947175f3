//! Error types for queue operations.

use thiserror::Error;

use super::item::QueueStatus;

/// Errors returned by [`QueueManager`](super::QueueManager) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// No item exists with the given id.
    #[error("queue item {0} not found")]
    ItemNotFound(u64),

    /// The queue is at its configured capacity.
    #[error("queue is full (limit {limit})")]
    QueueFull {
        /// The configured size limit.
        limit: usize,
    },

    /// The requested status change violates the transition table.
    #[error("illegal transition {from} -> {to} for item {id}")]
    InvalidTransition {
        /// Item whose transition was refused.
        id: u64,
        /// Status the item was in.
        from: QueueStatus,
        /// Status that was requested.
        to: QueueStatus,
    },

    /// A terminal item was mutated through anything other than retry.
    #[error("item {id} is terminal ({status}); only retry may leave a terminal status")]
    TerminalImmutable {
        /// Item id.
        id: u64,
        /// Its terminal status.
        status: QueueStatus,
    },

    /// Retry was requested for an item that is not terminal.
    #[error("item {id} is {status}, not terminal; nothing to retry")]
    NotTerminal {
        /// Item id.
        id: u64,
        /// Its current status.
        status: QueueStatus,
    },

    /// Swap positions were invalid or an endpoint is running.
    #[error("cannot swap positions {i} and {j}: {reason}")]
    SwapRefused {
        /// First position.
        i: usize,
        /// Second position.
        j: usize,
        /// Why the swap was refused.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        assert!(
            QueueError::ItemNotFound(7).to_string().contains('7')
        );
        assert!(
            QueueError::QueueFull { limit: 1000 }
                .to_string()
                .contains("1000")
        );

        let msg = QueueError::InvalidTransition {
            id: 3,
            from: QueueStatus::Queued,
            to: QueueStatus::Completed,
        }
        .to_string();
        assert!(msg.contains("queued"));
        assert!(msg.contains("completed"));
    }
}
