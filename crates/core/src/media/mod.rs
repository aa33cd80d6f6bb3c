//! RTP packetization of encoded video.

pub mod h264;
pub mod rtp;

/// Turns encoded access units into RTP packets for one stream.
pub trait Packetizer: Send {
    /// Split one access unit into complete RTP packets, all stamped with
    /// `rtp_timestamp`. The last packet carries the marker bit.
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>>;

    fn clock_rate(&self) -> u32;

    fn payload_type(&self) -> u8;

    /// `a=rtpmap` and `a=fmtp` lines, in that order.
    fn sdp_attributes(&self) -> Vec<String>;

    /// Sequence number of the next packet, for `RTP-Info`.
    fn next_sequence(&self) -> u16;

    /// Timestamp of the last packetized access unit, for `RTP-Info`.
    fn next_rtp_timestamp(&self) -> u32;
}
