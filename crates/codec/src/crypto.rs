use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, NONCE_LEN, UnboundKey},
    hmac,
};

use crate::{Error, MAX_CONNECTION_ID_LENGTH, STATELESS_RESET_TOKEN_LENGTH, header::Cid};

pub const RETRY_KEY_LENGTH: usize = 32;
pub const RESET_KEY_LENGTH: usize = 32;

/// Serialized size of the token plaintext: address family, port, a
/// 16-byte address, the original connection ID and its length.
pub const RETRY_TOKEN_PLAIN_LENGTH: usize = 1 + 2 + 16 + MAX_CONNECTION_ID_LENGTH + 1;

/// Size of the sealed blob carried on the wire, plaintext plus the
/// AES-GCM tag. Tokens of any other length are rejected before the
/// AEAD is consulted.
pub const RETRY_TOKEN_LENGTH: usize = RETRY_TOKEN_PLAIN_LENGTH + 16;

/// The claim a Retry token proves: this remote address once sent an
/// Initial with this Dest-CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryToken {
    pub remote: SocketAddr,
    pub orig_cid: Cid,
}

impl RetryToken {
    fn encode(&self) -> [u8; RETRY_TOKEN_PLAIN_LENGTH] {
        let mut bytes = [0u8; RETRY_TOKEN_PLAIN_LENGTH];
        bytes[1..3].copy_from_slice(&self.remote.port().to_be_bytes());

        match self.remote.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = 4;
                bytes[3..7].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                bytes[0] = 6;
                bytes[3..19].copy_from_slice(&ip.octets());
            }
        }

        bytes[19..19 + self.orig_cid.len()].copy_from_slice(self.orig_cid.as_slice());
        bytes[RETRY_TOKEN_PLAIN_LENGTH - 1] = self.orig_cid.len() as u8;
        bytes
    }

    fn decode(bytes: &[u8; RETRY_TOKEN_PLAIN_LENGTH]) -> Result<Self, Error> {
        let port = u16::from_be_bytes(bytes[1..3].try_into()?);
        let ip = match bytes[0] {
            4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[3..7])?)),
            6 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[3..19])?)),
            _ => return Err(Error::InvalidToken),
        };

        let length = bytes[RETRY_TOKEN_PLAIN_LENGTH - 1] as usize;
        if length > MAX_CONNECTION_ID_LENGTH {
            return Err(Error::InvalidToken);
        }

        Ok(Self {
            remote: SocketAddr::new(ip, port),
            orig_cid: Cid::from_slice(&bytes[19..19 + length])?,
        })
    }
}

/// Process-wide AEAD key sealing Retry tokens.
///
/// The IV is the server-chosen Dest-CID zero-extended to the nonce
/// length, so IV uniqueness is exactly CID randomness. Do not change
/// the construction without a formal argument.
pub struct RetryKey(LessSafeKey);

impl RetryKey {
    pub fn new(key: &[u8; RETRY_KEY_LENGTH]) -> Result<Self, Error> {
        Ok(Self(LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, key).map_err(|_| Error::CryptoFailed)?,
        )))
    }

    /// Seal a token under the IV derived from `server_cid`.
    ///
    /// # Test
    ///
    /// ```
    /// use quic_endpoint_codec::crypto::{RetryKey, RetryToken, RETRY_TOKEN_LENGTH};
    /// use quic_endpoint_codec::header::Cid;
    ///
    /// let key = RetryKey::new(&[7; 32]).unwrap();
    /// let server_cid = Cid::from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();
    ///
    /// let token = RetryToken {
    ///     remote: "127.0.0.1:443".parse().unwrap(),
    ///     orig_cid: Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
    /// };
    ///
    /// let sealed = key.seal(&server_cid, &token).unwrap();
    /// assert_eq!(sealed.len(), RETRY_TOKEN_LENGTH);
    ///
    /// let opened = key.open(&server_cid, &sealed).unwrap();
    /// assert_eq!(opened, token);
    /// ```
    pub fn seal(
        &self,
        server_cid: &Cid,
        token: &RetryToken,
    ) -> Result<[u8; RETRY_TOKEN_LENGTH], Error> {
        let mut bytes = [0u8; RETRY_TOKEN_LENGTH];
        bytes[..RETRY_TOKEN_PLAIN_LENGTH].copy_from_slice(&token.encode());

        let tag = self
            .0
            .seal_in_place_separate_tag(
                nonce(server_cid),
                Aad::empty(),
                &mut bytes[..RETRY_TOKEN_PLAIN_LENGTH],
            )
            .map_err(|_| Error::CryptoFailed)?;

        bytes[RETRY_TOKEN_PLAIN_LENGTH..].copy_from_slice(tag.as_ref());
        Ok(bytes)
    }

    /// Open a sealed token the peer echoed back.
    ///
    /// Fails on any length other than [`RETRY_TOKEN_LENGTH`], on an
    /// authentication failure, and on malformed plaintext.
    ///
    /// # Test
    ///
    /// ```
    /// use quic_endpoint_codec::crypto::{RetryKey, RetryToken};
    /// use quic_endpoint_codec::header::Cid;
    ///
    /// let key = RetryKey::new(&[7; 32]).unwrap();
    /// let server_cid = Cid::from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();
    ///
    /// let token = RetryToken {
    ///     remote: "[::1]:4433".parse().unwrap(),
    ///     orig_cid: Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
    /// };
    ///
    /// let mut sealed = key.seal(&server_cid, &token).unwrap();
    ///
    /// // Sealed under a different IV, the token does not open.
    /// let other_cid = Cid::from_slice(&[0; 8]).unwrap();
    /// assert!(key.open(&other_cid, &sealed).is_err());
    ///
    /// // A flipped bit does not open either.
    /// sealed[0] ^= 1;
    /// assert!(key.open(&server_cid, &sealed).is_err());
    /// ```
    pub fn open(&self, server_cid: &Cid, sealed: &[u8]) -> Result<RetryToken, Error> {
        if sealed.len() != RETRY_TOKEN_LENGTH {
            return Err(Error::InvalidToken);
        }

        let mut bytes = [0u8; RETRY_TOKEN_LENGTH];
        bytes.copy_from_slice(sealed);

        let plain = self
            .0
            .open_in_place(nonce(server_cid), Aad::empty(), &mut bytes)
            .map_err(|_| Error::InvalidToken)?;

        RetryToken::decode(&<[u8; RETRY_TOKEN_PLAIN_LENGTH]>::try_from(&*plain)?)
    }
}

fn nonce(cid: &Cid) -> Nonce {
    let mut iv = [0u8; NONCE_LEN];
    let length = cid.len().min(NONCE_LEN);
    iv[..length].copy_from_slice(&cid.as_slice()[..length]);
    Nonce::assume_unique_for_key(iv)
}

/// Per-binding keyed hash deriving stateless reset tokens.
///
/// The salt is drawn once at binding initialization, so tokens are
/// stable for the binding's lifetime and differ across bindings for the
/// same connection ID.
pub struct ResetKey(hmac::Key);

impl ResetKey {
    pub fn new(salt: &[u8; RESET_KEY_LENGTH]) -> Self {
        Self(hmac::Key::new(hmac::HMAC_SHA256, salt))
    }

    /// The reset token for a connection ID: the leading bytes of the
    /// keyed SHA-256 over the ID.
    ///
    /// # Test
    ///
    /// ```
    /// use quic_endpoint_codec::crypto::ResetKey;
    ///
    /// let key = ResetKey::new(&[1; 32]);
    ///
    /// let token = key.token(&[1, 2, 3, 4, 5, 6, 7, 8]);
    /// assert_eq!(token, key.token(&[1, 2, 3, 4, 5, 6, 7, 8]));
    ///
    /// let other = ResetKey::new(&[2; 32]);
    /// assert_ne!(token, other.token(&[1, 2, 3, 4, 5, 6, 7, 8]));
    /// ```
    pub fn token(&self, cid: &[u8]) -> [u8; STATELESS_RESET_TOKEN_LENGTH] {
        let tag = hmac::sign(&self.0, cid);

        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&tag.as_ref()[..STATELESS_RESET_TOKEN_LENGTH]);
        token
    }
}
