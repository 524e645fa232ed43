//! Minimal RTP fixed-header parsing.
//!
//! Only the 12-byte fixed header is interpreted; payloads are forwarded
//! untouched.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::domain::Ssrc;

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION: u8 = 2;

/// RTCP packet types share the second byte with marker+PT in RTP.
const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=204;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtpError {
    #[error("datagram too short for an RTP header: {0} bytes")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("RTCP packet type {0}")]
    Rtcp(u8),
    #[error("header claims {needed} bytes but datagram has {len}")]
    Truncated { needed: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: Ssrc,
}

impl RtpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, RtpError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(RtpError::TooShort(buf.len()));
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }
        if RTCP_PACKET_TYPES.contains(&buf[1]) {
            return Err(RtpError::Rtcp(buf[1]));
        }

        let csrc_count = buf[0] & 0x0F;
        let needed = RTP_HEADER_LEN + 4 * csrc_count as usize;
        if buf.len() < needed {
            return Err(RtpError::Truncated {
                needed,
                len: buf.len(),
            });
        }

        Ok(Self {
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: Ssrc(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])),
        })
    }

    /// Write the fixed header (without CSRCs) into `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        let mut b0 = RTP_VERSION << 6;
        if self.padding {
            b0 |= 0x20;
        }
        if self.extension {
            b0 |= 0x10;
        }
        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        out.put_u8(b0);
        out.put_u8(b1);
        out.put_u16(self.sequence);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc.value());
    }

    /// Build a complete packet with this header and `payload`.
    pub fn packet(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        RtpHeader {
            csrc_count: 0,
            ..*self
        }
        .write_to(&mut out);
        out.extend_from_slice(payload);
        out.freeze()
    }
}

/// SSRC of a datagram if it carries a valid RTP header.
pub fn peek_ssrc(buf: &[u8]) -> Option<Ssrc> {
    RtpHeader::parse(buf).ok().map(|h| h.ssrc)
}
