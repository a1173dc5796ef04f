//! Buffer error types.

/// Errors surfaced by buffer index and capacity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Fewer readable bytes than the operation requires.
    #[error("insufficient readable bytes: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },

    /// Growing past the buffer's maximum capacity.
    #[error("capacity {requested} exceeds maximum {max}")]
    CapacityExceeded { requested: usize, max: usize },

    /// An index outside the valid range for the operation.
    #[error("index {index} out of bounds (limit {limit})")]
    OutOfBounds { index: usize, limit: usize },
}
