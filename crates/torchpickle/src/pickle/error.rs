use thiserror::Error;

/// Everything that can go wrong while interpreting a pickle stream.
///
/// The set is closed; callers discriminate on the variant, never on the
/// rendered message. Nothing is recovered locally: any of these aborts the
/// load and leaves the machine terminated.
#[derive(Debug, Error)]
pub enum UnpickleError {
    #[error("The byte source was exhausted before a STOP opcode.")]
    Eof,

    #[error("A read crossed the boundary of the current frame.")]
    FrameExhausted,

    #[error(
        "A new frame was declared while the current frame still holds \
        unread bytes."
    )]
    UnexpectedFrameState,

    #[error("Protocol version {0} is outside the supported range 0..=5.")]
    UnsupportedProtocol(u8),

    #[error("The persistent-id record is malformed or of an unknown kind.")]
    UnsupportedPersistentId,

    #[error("A length operand was negative where a count is required.")]
    NegativeByteCount,

    #[error("A length or integer operand exceeds the host integer capacity.")]
    ExceedsMaxSize,

    #[error("Memo slot {0} was read before being written.")]
    MemoNotFound(i64),

    #[error("A memo store was given a negative index.")]
    NegativeArgument,

    #[error("Extension code {0} has no registered (module, class) pair.")]
    UnregisteredExtension(i64),

    #[error("No instantiator is registered for the referenced class.")]
    ClassCouldNotBeInstantiated,

    #[error("Unknown opcode 0x{0:02x}.")]
    UnknownOpcode(u8),

    #[error("Malformed pickle stream: {0}.")]
    Malformed(String),
}

impl UnpickleError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        UnpickleError::Malformed(detail.into())
    }
}
