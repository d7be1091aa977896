//! Public error codes.
//!
//! The closed set every caller-facing operation can return. Constraint
//! failures (alignment, boundary, fragmentation) normally route through
//! the bounce path internally and only surface here when bouncing itself
//! is impossible.

/// DMA core errors surfaced at the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Zero length, stale handle, or otherwise malformed request.
    InvalidParam,
    /// Global policy forbids DMA; use the device's PIO path.
    DmaForbidden,
    /// Target device has been disabled by the recovery layer.
    DeviceDisabled,
    /// Request exceeds the device's maximum transfer or a bounce slot.
    BufferTooLarge,
    /// No bounce slot came free within the retry budget.
    BounceExhausted,
    /// Virtual DMA services are required but not usable.
    VdsUnavailable,
    /// Physical layout is fragmented and the device needs one run.
    NonContiguous,
    /// A segment crosses a 64 KB boundary the device cannot.
    BoundaryViolation,
    /// A segment start misses the device's alignment.
    AlignmentViolation,
    /// A bounded wait expired.
    Timeout,
    /// The device failed and recovery could not bring it back.
    HardwareFailure,
    /// Canary or checksum mismatch on a protected structure.
    IntegrityViolation,
}

impl From<etherlink_platform::WaitTimeout> for Error {
    fn from(_: etherlink_platform::WaitTimeout) -> Self {
        Error::Timeout
    }
}

/// Result alias for DMA core operations.
pub type Result<T> = core::result::Result<T, Error>;
