//! ## QUIC wire format (version-independent properties and draft-23)
//!
//! [RFC8999]: https://tools.ietf.org/html/rfc8999
//! [draft-23]: https://tools.ietf.org/html/draft-ietf-quic-transport-23
//!
//! An endpoint that demultiplexes an unauthenticated UDP stream can only
//! rely on the version-independent properties of QUIC [RFC8999]: the
//! header form bit, the version field of long headers, and the two
//! connection IDs. Everything else is version specific. This crate
//! implements the invariant header parse, the draft-23 details the
//! binding layer needs (long packet types, the Initial token field), and
//! the three stateless datagrams a server may emit before any
//! per-connection state exists: Version Negotiation, Retry, and
//! Stateless Reset, together with the Retry-token AEAD and the
//! reset-token keyed hash.

pub mod builder;
pub mod crypto;
pub mod header;

use std::array::TryFromSliceError;

/// QUIC draft-23, the version the reference build targets.
pub const QUIC_VERSION_DRAFT_23: u32 = 0xff00_0017;

/// The version field of a Version Negotiation packet.
pub const QUIC_VERSION_NEGOTIATION: u32 = 0;

/// Versions this build accepts, in preference order.
pub const SUPPORTED_VERSIONS: [u32; 1] = [QUIC_VERSION_DRAFT_23];

/// Largest connection ID either header form can carry.
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Smallest Dest-CID a shared binding accepts on a long header.
pub const MIN_INITIAL_CONNECTION_ID_LENGTH: usize = 8;

/// Length of every locally generated (server-chosen) connection ID.
pub const SERVER_CHOSEN_CID_LENGTH: usize = 8;

/// A datagram carrying an Initial packet must be at least this large.
pub const MIN_INITIAL_PACKET_LENGTH: usize = 1200;

pub const MIN_STATELESS_RESET_PACKET_LENGTH: usize = 39;
pub const RECOMMENDED_STATELESS_RESET_PACKET_LENGTH: usize = 42;
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    CidTooLong,
    CryptoFailed,
    InvalidToken,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Whether this build speaks the given version.
pub fn is_version_supported(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Whether a version matches the reserved (GREASE) pattern.
///
/// # Test
///
/// ```
/// use quic_endpoint_codec::is_reserved_version;
///
/// assert!(is_reserved_version(0x0a0a0a0a));
/// assert!(is_reserved_version(0x1a2a3a4a));
/// assert!(!is_reserved_version(0xff000017));
/// ```
pub fn is_reserved_version(version: u32) -> bool {
    version & 0x0f0f0f0f == 0x0a0a0a0a
}

/// Force a random value into the reserved-version pattern.
///
/// Advertising a reserved version first in every Version Negotiation
/// exercises the client's requirement to ignore versions it does not
/// know.
///
/// # Test
///
/// ```
/// use quic_endpoint_codec::{is_reserved_version, reserved_version};
///
/// assert!(is_reserved_version(reserved_version(0xdeadbeef)));
/// assert!(is_reserved_version(reserved_version(0)));
/// ```
pub fn reserved_version(random: u32) -> u32 {
    (random & !0x0f0f0f0f) | 0x0a0a0a0a
}

/// Decode a variable-length integer, returning the value and the number
/// of bytes consumed.
///
/// # Test
///
/// ```
/// use quic_endpoint_codec::decode_varint;
///
/// assert_eq!(decode_varint(&[0x25]).unwrap(), (37, 1));
/// assert_eq!(decode_varint(&[0x7b, 0xbd]).unwrap(), (15293, 2));
/// assert_eq!(
///     decode_varint(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(),
///     (494878333, 4),
/// );
/// assert_eq!(
///     decode_varint(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]).unwrap(),
///     (151288809941952652, 8),
/// );
///
/// assert!(decode_varint(&[]).is_err());
/// assert!(decode_varint(&[0x7b]).is_err());
/// ```
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), Error> {
    let first = *bytes.first().ok_or(Error::InvalidInput)?;
    let size = 1usize << (first >> 6);
    if bytes.len() < size {
        return Err(Error::InvalidInput);
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &bytes[1..size] {
        value = (value << 8) | *byte as u64;
    }

    Ok((value, size))
}
