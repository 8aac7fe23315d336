//! Request/response wire headers.
//!
//! Multi-byte fields are network byte order. The optional 16-bit checksum
//! covers every preceding header byte; whether it is present is a class-level
//! option and must match on both sides.

use bitflags::bitflags;

use crate::error::{Error, RetCode, Result};

/// Identification byte pair, first on the wire.
pub(crate) const MAGIC: [u8; 2] = *b"hs";

pub(crate) const PROTOCOL_VERSION: u8 = 1;

bitflags! {
    /// Flags byte carried by request and response headers.
    pub struct MsgFlags: u8 {
        /// The caller opted out of a response.
        const NO_RESPONSE = 1 << 0;
        /// Supplemental payload must be acquired out of band.
        const MORE_DATA = 1 << 1;
        /// Request was forwarded over the loopback path.
        const SELF_FORWARD = 1 << 3;
    }
}

impl Default for MsgFlags {
    fn default() -> Self {
        MsgFlags::empty()
    }
}

/// Request header: magic, version, RPC id, flags, cookie, checksum?.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RequestHeader {
    pub id: u64,
    pub flags: MsgFlags,
    pub cookie: u8,
}

/// Response header: return code, flags, cookie, checksum?.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseHeader {
    pub ret_code: RetCode,
    pub flags: MsgFlags,
    pub cookie: u16,
}

impl Default for ResponseHeader {
    fn default() -> Self {
        ResponseHeader {
            ret_code: RetCode::SUCCESS,
            flags: MsgFlags::empty(),
            cookie: 0,
        }
    }
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(RequestHeader::BASE_SIZE, 13);
    const_assert_eq!(ResponseHeader::BASE_SIZE, 4);
}

#[inline]
fn crc16(bytes: &[u8]) -> u16 {
    (crc32fast::hash(bytes) & 0xffff) as u16
}

impl RequestHeader {
    pub const BASE_SIZE: usize = 2 + 1 + 8 + 1 + 1;

    #[inline]
    pub fn size(checksum: bool) -> usize {
        Self::BASE_SIZE + if checksum { 2 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8], checksum: bool) -> Result<usize> {
        let need = Self::size(checksum);
        if buf.len() < need {
            return Err(Error::Overflow("request header buffer"));
        }
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = PROTOCOL_VERSION;
        buf[3..11].copy_from_slice(&self.id.to_be_bytes());
        buf[11] = self.flags.bits();
        buf[12] = self.cookie;
        if checksum {
            let sum = crc16(&buf[..Self::BASE_SIZE]);
            buf[13..15].copy_from_slice(&sum.to_be_bytes());
        }
        Ok(need)
    }

    pub fn decode(buf: &[u8], checksum: bool) -> Result<RequestHeader> {
        let need = Self::size(checksum);
        if buf.len() < need {
            return Err(Error::Overflow("request header buffer"));
        }
        if buf[0..2] != MAGIC {
            return Err(Error::Protocol(format!(
                "invalid identification bytes {:02x}{:02x}",
                buf[0], buf[1]
            )));
        }
        if buf[2] != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "protocol version {} not supported",
                buf[2]
            )));
        }
        if checksum {
            let expected = crc16(&buf[..Self::BASE_SIZE]);
            let actual = u16::from_be_bytes([buf[13], buf[14]]);
            if expected != actual {
                return Err(Error::Checksum { expected, actual });
            }
        }
        Ok(RequestHeader {
            id: u64::from_be_bytes(buf[3..11].try_into().unwrap()),
            flags: MsgFlags::from_bits_truncate(buf[11]),
            cookie: buf[12],
        })
    }
}

impl ResponseHeader {
    pub const BASE_SIZE: usize = 1 + 1 + 2;

    #[inline]
    pub fn size(checksum: bool) -> usize {
        Self::BASE_SIZE + if checksum { 2 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8], checksum: bool) -> Result<usize> {
        let need = Self::size(checksum);
        if buf.len() < need {
            return Err(Error::Overflow("response header buffer"));
        }
        buf[0] = self.ret_code.0 as u8;
        buf[1] = self.flags.bits();
        buf[2..4].copy_from_slice(&self.cookie.to_be_bytes());
        if checksum {
            let sum = crc16(&buf[..Self::BASE_SIZE]);
            buf[4..6].copy_from_slice(&sum.to_be_bytes());
        }
        Ok(need)
    }

    pub fn decode(buf: &[u8], checksum: bool) -> Result<ResponseHeader> {
        let need = Self::size(checksum);
        if buf.len() < need {
            return Err(Error::Overflow("response header buffer"));
        }
        if checksum {
            let expected = crc16(&buf[..Self::BASE_SIZE]);
            let actual = u16::from_be_bytes([buf[4], buf[5]]);
            if expected != actual {
                return Err(Error::Checksum { expected, actual });
            }
        }
        Ok(ResponseHeader {
            ret_code: RetCode(buf[0] as i8),
            flags: MsgFlags::from_bits_truncate(buf[1]),
            cookie: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let hdr = RequestHeader {
            id: 0xdead_beef_0042,
            flags: MsgFlags::NO_RESPONSE,
            cookie: 3,
        };
        for checksum in [false, true] {
            let mut buf = [0u8; 32];
            let n = hdr.encode(&mut buf, checksum).unwrap();
            assert_eq!(n, RequestHeader::size(checksum));
            let back = RequestHeader::decode(&buf, checksum).unwrap();
            assert_eq!(back, hdr);
        }
    }

    #[test]
    fn response_roundtrip() {
        let hdr = ResponseHeader {
            ret_code: RetCode::CANCELED,
            flags: MsgFlags::MORE_DATA,
            cookie: 0x0102,
        };
        for checksum in [false, true] {
            let mut buf = [0u8; 32];
            hdr.encode(&mut buf, checksum).unwrap();
            let back = ResponseHeader::decode(&buf, checksum).unwrap();
            assert_eq!(back, hdr);
        }
    }

    #[test]
    fn corrupted_checksum_detected() {
        let hdr = RequestHeader {
            id: 7,
            flags: MsgFlags::empty(),
            cookie: 0,
        };
        let mut buf = [0u8; 32];
        hdr.encode(&mut buf, true).unwrap();
        buf[5] ^= 0xff;
        assert!(matches!(
            RequestHeader::decode(&buf, true),
            Err(Error::Checksum { .. })
        ));
    }

    #[test]
    fn bad_magic_and_version() {
        let hdr = RequestHeader {
            id: 7,
            flags: MsgFlags::empty(),
            cookie: 0,
        };
        let mut buf = [0u8; 32];
        hdr.encode(&mut buf, false).unwrap();
        let mut bad = buf;
        bad[0] = b'x';
        assert!(matches!(
            RequestHeader::decode(&bad, false),
            Err(Error::Protocol(_))
        ));
        let mut bad = buf;
        bad[2] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            RequestHeader::decode(&bad, false),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn short_buffer_is_overflow() {
        assert!(matches!(
            RequestHeader::decode(&[0u8; 4], false),
            Err(Error::Overflow(_))
        ));
        assert!(matches!(
            ResponseHeader::decode(&[0u8; 2], false),
            Err(Error::Overflow(_))
        ));
    }
}
