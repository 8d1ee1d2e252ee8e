use bytes::{BufMut, BytesMut};

use crate::{
    MAX_CONNECTION_ID_LENGTH, MIN_STATELESS_RESET_PACKET_LENGTH, STATELESS_RESET_TOKEN_LENGTH,
    SUPPORTED_VERSIONS,
    header::{FIXED_BIT, FORM_BIT, KEY_PHASE_BIT, LongType},
};

/// Largest Version Negotiation datagram this build can emit: header,
/// two maximum connection IDs, the reserved version and the supported
/// list.
pub const VERSION_NEGOTIATION_MAX_LENGTH: usize =
    1 + 4 + 1 + MAX_CONNECTION_ID_LENGTH + 1 + MAX_CONNECTION_ID_LENGTH + 4 * (1 + SUPPORTED_VERSIONS.len());

// A Version Negotiation must fit a single MTU with headroom for the
// IP + UDP headers.
const _: () = assert!(VERSION_NEGOTIATION_MAX_LENGTH <= 1500 - 48);

/// Encode a Version Negotiation packet.
///
/// The connection IDs are swapped: the peer's Source-CID becomes the
/// Dest-CID of the response and vice versa, so the client can route the
/// packet back to its half-open attempt. The version list leads with a
/// reserved (GREASE) version.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use quic_endpoint_codec::builder::version_negotiation;
///
/// let result = [
///     0xaa, 0x00, 0x00, 0x00, 0x00, 0x04, 0xa1, 0xa2, 0xa3, 0xa4, 0x08,
///     0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x1a, 0x2a, 0x3a,
///     0x4a, 0xff, 0x00, 0x00, 0x17,
/// ];
///
/// let mut bytes = BytesMut::with_capacity(1500);
/// version_negotiation(
///     &mut bytes,
///     0x2a,
///     &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
///     &[0xa1, 0xa2, 0xa3, 0xa4],
///     0x1a2a3a4a,
///     &[0xff000017],
/// );
///
/// assert_eq!(&bytes[..], &result);
/// ```
pub fn version_negotiation(
    bytes: &mut BytesMut,
    random: u8,
    peer_dest_cid: &[u8],
    peer_source_cid: &[u8],
    reserved: u32,
    versions: &[u32],
) {
    bytes.clear();
    bytes.put_u8(FORM_BIT | (random & 0x7f));
    bytes.put_u32(0);

    bytes.put_u8(peer_source_cid.len() as u8);
    bytes.put(peer_source_cid);
    bytes.put_u8(peer_dest_cid.len() as u8);
    bytes.put(peer_dest_cid);

    bytes.put_u32(reserved);
    for version in versions {
        bytes.put_u32(*version);
    }
}

/// Encode a draft-23 Retry packet.
///
/// The Dest-CID is the client's Source-CID, the Source-CID is the fresh
/// server-chosen ID the client must address its next Initial to, and
/// the original Dest-CID rides in the ODCID field so the client can
/// verify the Retry belongs to its attempt. At this draft there is no
/// integrity tag; the token itself is the proof.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use quic_endpoint_codec::builder::retry;
///
/// let result = [
///     0xf7, 0xff, 0x00, 0x00, 0x17, 0x04, 0xa1, 0xa2, 0xa3, 0xa4, 0x08,
///     0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x08, 0x01, 0x02,
///     0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xaa, 0xbb,
/// ];
///
/// let mut bytes = BytesMut::with_capacity(1500);
/// retry(
///     &mut bytes,
///     0x07,
///     0xff000017,
///     &[0xa1, 0xa2, 0xa3, 0xa4],
///     &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18],
///     &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
///     &[0xaa, 0xbb],
/// );
///
/// assert_eq!(&bytes[..], &result);
/// ```
pub fn retry(
    bytes: &mut BytesMut,
    random: u8,
    version: u32,
    peer_source_cid: &[u8],
    server_cid: &[u8],
    orig_dest_cid: &[u8],
    token: &[u8],
) {
    bytes.clear();
    bytes.put_u8(FORM_BIT | FIXED_BIT | ((LongType::Retry as u8) << 4) | (random & 0x0f));
    bytes.put_u32(version);

    bytes.put_u8(peer_source_cid.len() as u8);
    bytes.put(peer_source_cid);
    bytes.put_u8(server_cid.len() as u8);
    bytes.put(server_cid);
    bytes.put_u8(orig_dest_cid.len() as u8);
    bytes.put(orig_dest_cid);

    bytes.put(token);
}

/// Encode a Stateless Reset over a caller-provided random fill.
///
/// The random bytes define the packet, including its length; only three
/// header bits and the trailing token are fixed up afterwards, so the
/// result is indistinguishable from a short-header packet: the form bit
/// is cleared, the fixed bit forced on, and the key-phase bit copied
/// from the packet that triggered the reset.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use quic_endpoint_codec::builder::stateless_reset;
///
/// let token = [0xddu8; 16];
/// let mut bytes = BytesMut::with_capacity(1500);
/// stateless_reset(&mut bytes, &[0u8; 42], true, &token);
///
/// assert_eq!(bytes.len(), 42);
/// assert_eq!(bytes[0], 0x44);
/// assert_eq!(&bytes[26..], &token);
/// ```
pub fn stateless_reset(
    bytes: &mut BytesMut,
    random: &[u8],
    key_phase: bool,
    token: &[u8; STATELESS_RESET_TOKEN_LENGTH],
) {
    debug_assert!(random.len() >= MIN_STATELESS_RESET_PACKET_LENGTH);

    bytes.clear();
    bytes.put(random);

    let mut first = bytes[0] & !(FORM_BIT | FIXED_BIT | KEY_PHASE_BIT);
    first |= FIXED_BIT;
    if key_phase {
        first |= KEY_PHASE_BIT;
    }

    bytes[0] = first;

    let offset = bytes.len() - STATELESS_RESET_TOKEN_LENGTH;
    bytes[offset..].copy_from_slice(token);
}
