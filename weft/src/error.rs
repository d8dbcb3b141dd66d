//! Error types surfaced by the portal API.

/// Errors returned synchronously from portal operations.
///
/// Internal protocol failures (malformed frames, unknown sublinks, failed
/// bypass authentication) never surface here; they deactivate the offending
/// node link, which the application observes as peer closure through portal
/// status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PortalError {
    /// The caller violated a documented precondition.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the call.
        reason: &'static str,
    },

    /// The operation would exceed queue limits supplied by the caller, or
    /// allocator capacity is exhausted.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The object is not in a state that permits the operation.
    #[error("failed precondition: {reason}")]
    FailedPrecondition {
        /// Which state requirement failed.
        reason: &'static str,
    },

    /// A two-phase operation is already in progress on this portal.
    #[error("operation already in progress")]
    AlreadyExists,

    /// The route is closed and every parcel it will ever carry has been
    /// retrieved.
    #[error("route closed and drained")]
    NotFound,

    /// No parcel is available right now; one may arrive later.
    #[error("no parcel available")]
    Unavailable,

    /// The requested surface is reserved but not supported.
    #[error("unimplemented")]
    Unimplemented,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = PortalError::InvalidArgument {
            reason: "empty span",
        };
        assert!(err.to_string().contains("invalid argument"));
        assert!(err.to_string().contains("empty span"));
        assert_eq!(PortalError::Unavailable.to_string(), "no parcel available");
    }
}
