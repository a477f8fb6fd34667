use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error plumbing: `Wait` signals "nothing to do yet, retry on the next pass"
/// and is folded away by the service loop, `Fatal` carries a condition the caller must
/// act on.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorType {
    // Protocol errors. These drop the offending datagram and bump a counter.
    MagicMismatch,
    VersionMismatch,
    ChannelMismatch,
    MalformedCommand,
    PayloadTooLarge,
    Decompression,
    DecompressionOverflow,
    Crypto,

    // Resource errors.
    TableFull,

    // Application misuse. Fail fast on the offending call.
    InvalidArgument,
    StaleHandle,
    NotConnected,
    Terminated,

    // Transport errors.
    AddrParse,
    ResolveFailure,
    Unbound,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                NetworkError::Wait
            }
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the
/// destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized wire objects. Implementors must validate the remaining
/// free capacity in the stream upfront and only write if the whole object fits.
///
/// Should return `NetworkError::Wait` in case there is not enough capacity in the stream.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()>;
}

/// Trait for manually deserialized wire objects.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self>;
}

/// Signed distance between two 16 bit sequence numbers. Positive when `a` is newer
/// than `b`, handling wrap-around.
#[inline]
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Reconstructs the full 64 bit counter value nearest to `expected` whose low bits
/// match `wire`. `window` is the wire field's modulus and must be a power of two.
/// Keeping counters extended internally makes wrap-around comparisons ordinary
/// integer comparisons and keeps AEAD nonces unique past the wire wrap.
#[inline]
pub fn extend_nearest(expected: u64, wire: u64, window: u64) -> u64 {
    debug_assert!(window.is_power_of_two());

    let wire = wire & (window - 1);
    let base = expected & !(window - 1);
    let candidate = base | wire;

    if candidate + window / 2 < expected {
        candidate + window
    } else if candidate >= expected + window / 2 && candidate >= window {
        candidate - window
    } else {
        candidate
    }
}
