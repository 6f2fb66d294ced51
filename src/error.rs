use thiserror::Error;

/// Fatal wiring error: the encoder's output width or the action set size does
/// not match what the network was configured for. Raised at construction time
/// and never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("configuration mismatch: {what} is {got}, expected {expected}")]
pub struct ConfigMismatch {
    pub what: &'static str,
    pub expected: usize,
    pub got: usize,
}
