//! RTP fixed header state (RFC 3550 §5.1).

/// Size of the fixed header; no CSRCs or extensions are ever written.
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// Per-stream RTP header state.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// |                           Timestamp                           |
/// |                             SSRC                              |
/// ```
///
/// The sequence number advances with every written header and wraps at
/// `u16::MAX`. The timestamp is set once per access unit by the caller.
#[derive(Debug)]
pub struct RtpHeader {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        tracing::debug!(
            payload_type,
            ssrc = format_args!("{ssrc:#010X}"),
            "RTP stream state created"
        );
        Self {
            payload_type: payload_type & 0x7f,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Same as [`new`](Self::new) with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(payload_type: u8) -> Self {
        Self::new(payload_type, rand::random())
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next header will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Serialize the next header. `marker` flags the last packet of an
    /// access unit.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut out = [0u8; RTP_HEADER_LEN];
        out[0] = RTP_VERSION << 6;
        out[1] = (u8::from(marker) << 7) | self.payload_type;
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        out
    }
}
