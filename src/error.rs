use core::fmt;

/// Crate-wide error type.
///
/// Authentication failures are deliberately coarse: a failed signature and a
/// failed HMAC both surface as `InvalidSignature`/`Crypto` with no further
/// detail, and callers drop the offending packet without informing the peer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CoreError {
    /// A destination name component is empty or contains a dot.
    InvalidName,
    /// A field had the wrong length for its wire type.
    InvalidLength,
    /// A fixed-capacity buffer could not hold the requested write.
    BufferOverflow,
    /// The serialized packet would exceed the interface MTU.
    MtuExceeded,
    /// The operation needs key material this object does not hold.
    MissingKey,
    /// Encryption or decryption failed.
    Crypto,
    /// A signature did not verify.
    InvalidSignature,
    /// A frame or payload could not be parsed.
    Malformed,
    /// No attached interface could carry the packet.
    NoInterface,
    /// The peer asked for something this implementation does not do.
    Unsupported,
    /// Filesystem-level persistence failure.
    Io,
    /// A deadline elapsed before the expected event.
    Timeout,
    /// The object was cancelled or torn down.
    Cancelled,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CoreError::InvalidName => "invalid destination name",
            CoreError::InvalidLength => "invalid field length",
            CoreError::BufferOverflow => "buffer overflow",
            CoreError::MtuExceeded => "packet exceeds MTU",
            CoreError::MissingKey => "missing key material",
            CoreError::Crypto => "cryptographic failure",
            CoreError::InvalidSignature => "invalid signature",
            CoreError::Malformed => "malformed data",
            CoreError::NoInterface => "no usable interface",
            CoreError::Unsupported => "unsupported operation",
            CoreError::Io => "persistence failure",
            CoreError::Timeout => "timed out",
            CoreError::Cancelled => "cancelled",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for CoreError {}
