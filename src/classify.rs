use crate::error::SendError;

/// How a completed send attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Throttling or a broken link; expected to clear on retry.
    Transient,
    /// Any other failure. Still retried, but reported at error level.
    Failed,
}

pub fn classify(result: &Result<(), SendError>) -> SendOutcome {
    match result {
        Ok(()) => SendOutcome::Delivered,
        Err(e) if e.is_transient() => SendOutcome::Transient,
        Err(_) => SendOutcome::Failed,
    }
}
