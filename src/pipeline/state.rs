//! Pipeline state machine

use std::fmt;

/// Lifecycle state of a message as it moves through the pipeline
///
/// Inbound messages walk the full machine. Outbound replies are created in
/// `Delivering` and end in `Delivered` or `Failed`.
///
/// ```text
/// RECEIVED -> DEDUP_CHECKED -> (TRANSCRIBING) -> CONTEXT_BUILT
///          -> COMPLETING -> DELIVERING -> DELIVERED
/// RECEIVED -> IGNORED
/// any non-terminal -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Received,
    DedupChecked,
    Transcribing,
    ContextBuilt,
    Completing,
    Delivering,
    Delivered,
    Ignored,
    Failed,
}

impl PipelineState {
    /// Every state, in pipeline order
    pub const ALL: [Self; 9] = [
        Self::Received,
        Self::DedupChecked,
        Self::Transcribing,
        Self::ContextBuilt,
        Self::Completing,
        Self::Delivering,
        Self::Delivered,
        Self::Ignored,
        Self::Failed,
    ];

    /// Storage identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::DedupChecked => "dedup_checked",
            Self::Transcribing => "transcribing",
            Self::ContextBuilt => "context_built",
            Self::Completing => "completing",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage identifier
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Terminal states accept no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Ignored | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`
    ///
    /// Re-entering the same non-terminal state is allowed so that a resumed
    /// pipeline can re-persist the checkpoint it crashed in.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Failed) {
            return true;
        }
        if self as u8 == next as u8 {
            return true;
        }

        matches!(
            (self, next),
            (Self::Received, Self::DedupChecked | Self::Ignored)
                | (Self::DedupChecked, Self::Transcribing | Self::ContextBuilt)
                | (Self::Transcribing, Self::ContextBuilt)
                | (Self::ContextBuilt, Self::Completing)
                | (Self::Completing, Self::Delivering)
                | (Self::Delivering, Self::Delivered)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}
