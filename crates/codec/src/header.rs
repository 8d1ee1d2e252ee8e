use num_enum::TryFromPrimitive;

use crate::{Error, MAX_CONNECTION_ID_LENGTH, decode_varint};

/// Header form bit. Set on long headers, clear on short headers.
pub const FORM_BIT: u8 = 0x80;

/// Fixed bit. Set on every packet of the supported versions.
pub const FIXED_BIT: u8 = 0x40;

/// Key-phase bit of a draft-23 short header.
pub const KEY_PHASE_BIT: u8 = 0x04;

/// A connection ID held by value.
///
/// Lookups happen on every received datagram, so the ID is a fixed
/// array rather than an allocation; unused tail bytes are zeroed, which
/// keeps the derived equality and hash honest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cid {
    len: u8,
    bytes: [u8; MAX_CONNECTION_ID_LENGTH],
}

impl Cid {
    /// The zero-length connection ID of an exclusive binding.
    pub const EMPTY: Cid = Cid {
        len: 0,
        bytes: [0; MAX_CONNECTION_ID_LENGTH],
    };

    /// # Test
    ///
    /// ```
    /// use quic_endpoint_codec::header::Cid;
    ///
    /// let cid = Cid::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    ///
    /// assert_eq!(cid.len(), 8);
    /// assert_eq!(cid.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    /// assert!(Cid::from_slice(&[0; 21]).is_err());
    /// ```
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(Error::CidTooLong);
        }

        let mut bytes = [0; MAX_CONNECTION_ID_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            len: slice.len() as u8,
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The leading byte, or zero for the empty ID. Partition hints are
    /// derived from it.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

/// Long-header packet types of draft-23, taken from bits 4-5 of the
/// first byte. Only meaningful once the version is known supported.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum LongType {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    Retry = 3,
}

/// The decoded invariant header of one datagram.
///
/// Borrows from the datagram; never outlives it.
#[derive(Debug)]
pub enum Header<'a> {
    Long {
        first: u8,
        version: u32,
        dest_cid: &'a [u8],
        source_cid: &'a [u8],
        /// Everything after the Source-CID, version specific.
        payload: &'a [u8],
    },
    Short {
        first: u8,
        dest_cid: &'a [u8],
    },
}

impl<'a> Header<'a> {
    /// Decode the version-independent header fields.
    ///
    /// Short headers do not carry a Dest-CID length on the wire; the
    /// binding knows the length of the IDs it hands out and passes it
    /// in as `local_cid_length`.
    ///
    /// # Test
    ///
    /// ```
    /// use quic_endpoint_codec::header::Header;
    ///
    /// let buffer = [
    ///     0xc3, 0xff, 0x00, 0x00, 0x17, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05,
    ///     0x06, 0x07, 0x08, 0x04, 0xa1, 0xa2, 0xa3, 0xa4, 0x00, 0x41, 0x00,
    /// ];
    ///
    /// let header = Header::decode(&buffer, 0).unwrap();
    /// match header {
    ///     Header::Long {
    ///         version,
    ///         dest_cid,
    ///         source_cid,
    ///         payload,
    ///         ..
    ///     } => {
    ///         assert_eq!(version, 0xff000017);
    ///         assert_eq!(dest_cid, &[1, 2, 3, 4, 5, 6, 7, 8]);
    ///         assert_eq!(source_cid, &[0xa1, 0xa2, 0xa3, 0xa4]);
    ///         assert_eq!(payload, &[0x00, 0x41, 0x00]);
    ///     }
    ///     _ => panic!("expected long header"),
    /// }
    ///
    /// let buffer = [0x41, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xff];
    /// let header = Header::decode(&buffer, 8).unwrap();
    /// match header {
    ///     Header::Short { dest_cid, .. } => {
    ///         assert_eq!(dest_cid, &[1, 2, 3, 4, 5, 6, 7, 8]);
    ///     }
    ///     _ => panic!("expected short header"),
    /// }
    /// ```
    pub fn decode(bytes: &'a [u8], local_cid_length: usize) -> Result<Self, Error> {
        let first = *bytes.first().ok_or(Error::InvalidInput)?;

        if first & FORM_BIT == 0 {
            if bytes.len() < 1 + local_cid_length {
                return Err(Error::InvalidInput);
            }

            return Ok(Self::Short {
                first,
                dest_cid: &bytes[1..1 + local_cid_length],
            });
        }

        if bytes.len() < 6 {
            return Err(Error::InvalidInput);
        }

        let version = u32::from_be_bytes(bytes[1..5].try_into()?);

        let dest_cid_length = bytes[5] as usize;
        if dest_cid_length > MAX_CONNECTION_ID_LENGTH {
            return Err(Error::CidTooLong);
        }

        let mut offset = 6;
        if bytes.len() < offset + dest_cid_length + 1 {
            return Err(Error::InvalidInput);
        }

        let dest_cid = &bytes[offset..offset + dest_cid_length];
        offset += dest_cid_length;

        let source_cid_length = bytes[offset] as usize;
        if source_cid_length > MAX_CONNECTION_ID_LENGTH {
            return Err(Error::CidTooLong);
        }

        offset += 1;
        if bytes.len() < offset + source_cid_length {
            return Err(Error::InvalidInput);
        }

        let source_cid = &bytes[offset..offset + source_cid_length];
        offset += source_cid_length;

        Ok(Self::Long {
            first,
            version,
            dest_cid,
            source_cid,
            payload: &bytes[offset..],
        })
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long { .. })
    }

    pub fn dest_cid(&self) -> &'a [u8] {
        match *self {
            Self::Long { dest_cid, .. } | Self::Short { dest_cid, .. } => dest_cid,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            Self::Long { version, .. } => Some(*version),
            Self::Short { .. } => None,
        }
    }

    /// The long-header packet type bits. The caller is responsible for
    /// only trusting them on a supported version.
    pub fn long_type(&self) -> Option<LongType> {
        match self {
            Self::Long { first, .. } => LongType::try_from((first >> 4) & 0x3).ok(),
            Self::Short { .. } => None,
        }
    }

    /// The key-phase bit of a short header, false for long headers.
    pub fn key_phase(&self) -> bool {
        match self {
            Self::Short { first, .. } => first & KEY_PHASE_BIT != 0,
            Self::Long { .. } => false,
        }
    }
}

/// Extract the token field of a draft-23 Initial packet from the
/// payload that follows the Source-CID.
///
/// # Test
///
/// ```
/// use quic_endpoint_codec::header::initial_token;
///
/// assert_eq!(initial_token(&[0x00, 0x41, 0x00]).unwrap(), &[] as &[u8]);
/// assert_eq!(
///     initial_token(&[0x03, 0xaa, 0xbb, 0xcc, 0x41, 0x00]).unwrap(),
///     &[0xaa, 0xbb, 0xcc],
/// );
/// assert!(initial_token(&[0x03, 0xaa]).is_err());
/// ```
pub fn initial_token(payload: &[u8]) -> Result<&[u8], Error> {
    let (length, consumed) = decode_varint(payload)?;
    let length = length as usize;
    if payload.len() < consumed + length {
        return Err(Error::InvalidInput);
    }

    Ok(&payload[consumed..consumed + length])
}
