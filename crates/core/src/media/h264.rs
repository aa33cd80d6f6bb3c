//! H.264 over RTP (RFC 6184), non-interleaved mode.
//!
//! NAL units that fit the MTU go out as single NAL unit packets. Larger ones
//! are split into FU-A fragments:
//!
//! ```text
//! FU indicator:  [F|NRI|Type=28]
//! FU header:     [S|E|R|NAL type]
//! ```

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Packetizer;
use super::rtp::{RTP_HEADER_LEN, RtpHeader};

const DEFAULT_MTU: usize = 1400;
const CLOCK_RATE: u32 = 90_000;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_FU_A: u8 = 28;

fn nal_type(nal: &[u8]) -> u8 {
    nal[0] & 0x1f
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0, 0, 1])
}

/// NAL units of an Annex B bitstream, borrowed from it.
///
/// Accepts 3- and 4-byte start codes. Bytes before the first start code are
/// skipped.
pub fn nal_units(bitstream: &[u8]) -> NalUnits<'_> {
    let rest = match find_start_code(bitstream) {
        Some(at) => &bitstream[at + 3..],
        None => &[],
    };
    NalUnits { rest }
}

pub struct NalUnits<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while !self.rest.is_empty() {
            let nal = match find_start_code(self.rest) {
                Some(at) => {
                    // Zeros before a start code belong to it (4-byte form or
                    // trailing_zero_8bits), never to the NAL unit.
                    let body = &self.rest[..at];
                    self.rest = &self.rest[at + 3..];
                    let end = body.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                    &body[..end]
                }
                None => std::mem::take(&mut self.rest),
            };
            if !nal.is_empty() {
                return Some(nal);
            }
        }
        None
    }
}

/// SPS and PPS seen in the bitstream, advertised in the SDP `fmtp` line.
#[derive(Debug, Default)]
struct ParameterSets {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl ParameterSets {
    fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Keep the first SPS and PPS; later ones repeat ahead of every IDR.
    fn capture(&mut self, nal: &[u8]) {
        let slot = match nal_type(nal) {
            NAL_TYPE_SPS => &mut self.sps,
            NAL_TYPE_PPS => &mut self.pps,
            _ => return,
        };
        if slot.is_none() {
            tracing::debug!(nal_type = nal_type(nal), bytes = nal.len(), "H.264 parameter set captured");
            *slot = Some(nal.to_vec());
        }
    }

    fn fmtp_params(&self) -> String {
        let mut params = String::new();
        if let Some(sps) = self.sps.as_deref().filter(|sps| sps.len() >= 4) {
            params.push_str(&format!(";profile-level-id={:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]));
        }
        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            params.push_str(&format!(
                ";sprop-parameter-sets={},{}",
                BASE64_STANDARD.encode(sps),
                BASE64_STANDARD.encode(pps)
            ));
        }
        params
    }
}

/// RFC 6184 packetizer for one H.264 stream.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    params: ParameterSets,
}

impl H264Packetizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self::from_header(RtpHeader::new(payload_type, ssrc))
    }

    pub fn with_random_ssrc(payload_type: u8) -> Self {
        Self::from_header(RtpHeader::with_random_ssrc(payload_type))
    }

    fn from_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            params: ParameterSets::default(),
        }
    }

    fn packet(&mut self, marker: bool, prefix: &[u8], body: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + prefix.len() + body.len());
        packet.extend_from_slice(&self.header.write(marker));
        packet.extend_from_slice(prefix);
        packet.extend_from_slice(body);
        packet
    }

    fn push_nal(&mut self, nal: &[u8], last_in_frame: bool, out: &mut Vec<Vec<u8>>) {
        if nal.len() <= self.mtu {
            let packet = self.packet(last_in_frame, &[], nal);
            out.push(packet);
            return;
        }

        let fu_indicator = (nal[0] & 0x60) | NAL_TYPE_FU_A;
        let payload = &nal[1..];
        let fragments = payload.chunks(self.mtu - 2);
        let count = fragments.len();
        for (i, fragment) in fragments.enumerate() {
            let end = i + 1 == count;
            let mut fu_header = nal_type(nal);
            if i == 0 {
                fu_header |= 0x80;
            }
            if end {
                fu_header |= 0x40;
            }
            let packet = self.packet(last_in_frame && end, &[fu_indicator, fu_header], fragment);
            out.push(packet);
        }
        tracing::trace!(nal_type = nal_type(nal), bytes = nal.len(), fragments = count, "NAL unit fragmented");
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, access_unit: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        let nals: Vec<&[u8]> = nal_units(access_unit).collect();
        if !self.params.is_complete() {
            for nal in &nals {
                self.params.capture(nal);
            }
        }

        self.header.set_timestamp(rtp_timestamp);
        let mut packets = Vec::with_capacity(nals.len());
        for (i, nal) in nals.iter().enumerate() {
            self.push_nal(nal, i + 1 == nals.len(), &mut packets);
        }

        tracing::trace!(
            nals = nals.len(),
            packets = packets.len(),
            bytes = access_unit.len(),
            rtp_ts = rtp_timestamp,
            "access unit packetized"
        );
        packets
    }

    fn clock_rate(&self) -> u32 {
        CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.payload_type()
    }

    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.payload_type();
        vec![
            format!("a=rtpmap:{pt} H264/{CLOCK_RATE}"),
            format!("a=fmtp:{pt} packetization-mode=1{}", self.params.fmtp_params()),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    fn nals(data: &[u8]) -> Vec<&[u8]> {
        nal_units(data).collect()
    }

    fn marker(packet: &[u8]) -> bool {
        packet[1] & 0x80 != 0
    }

    #[test]
    fn nal_units_with_either_start_code() {
        assert_eq!(nals(&[0, 0, 0, 1, 0x65, 0xAA, 0xBB]), [&[0x65, 0xAA, 0xBB][..]]);
        assert_eq!(nals(&[0, 0, 1, 0x67, 0x42, 0x00]), [&[0x67, 0x42, 0x00][..]]);

        let mixed = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65];
        assert_eq!(nals(&mixed), [&[0x67, 0x42][..], &[0x68, 0xCE], &[0x65]]);
    }

    #[test]
    fn nal_units_without_start_code() {
        assert!(nals(&[]).is_empty());
        assert!(nals(&[0xFF, 0xFE]).is_empty());
        assert!(nals(&[0, 0, 0, 1]).is_empty());
    }

    #[test]
    fn small_nal_is_one_packet() {
        let mut p = H264Packetizer::new(96, 0xAABB_CCDD);
        let packets = p.packetize(&[0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC], 3000);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), RTP_HEADER_LEN + 4);
        assert_eq!(packets[0][RTP_HEADER_LEN..], [0x65, 0xAA, 0xBB, 0xCC]);
        assert!(marker(&packets[0]));
    }

    #[test]
    fn large_nal_is_fragmented() {
        let mut p = H264Packetizer::new(96, 0x1122_3344);
        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend(vec![0xAA; DEFAULT_MTU + 500]);
        let packets = p.packetize(&frame, 0);
        assert_eq!(packets.len(), 2);

        let (first, last) = (&packets[0], &packets[1]);
        assert_eq!(first[12], 0x60 | NAL_TYPE_FU_A);
        assert_eq!(first[13], 0x80 | 5);
        assert!(!marker(first));
        assert_eq!(last[13], 0x40 | 5);
        assert!(marker(last));

        let payload: usize = packets.iter().map(|p| p.len() - RTP_HEADER_LEN - 2).sum();
        assert_eq!(payload, DEFAULT_MTU + 500);
    }

    #[test]
    fn every_packet_of_a_frame_shares_its_timestamp() {
        let mut p = H264Packetizer::new(96, 1);
        let mut frame = [&[0, 0, 0, 1][..], &SPS, &[0, 0, 0, 1, 0x65]].concat();
        frame.extend(vec![0xAB; DEFAULT_MTU * 2]);

        let packets = p.packetize(&frame, 90_000);
        assert!(packets.len() > 2);
        assert!(packets.iter().all(|pkt| pkt[4..8] == 90_000u32.to_be_bytes()));
        assert_eq!(packets.iter().filter(|pkt| marker(pkt)).count(), 1);
        assert_eq!(p.next_rtp_timestamp(), 90_000);
        assert_eq!(p.next_sequence(), packets.len() as u16);
    }

    #[test]
    fn sdp_without_parameter_sets() {
        let p = H264Packetizer::new(96, 1);
        assert_eq!(p.clock_rate(), 90_000);
        assert_eq!(
            p.sdp_attributes(),
            ["a=rtpmap:96 H264/90000", "a=fmtp:96 packetization-mode=1"]
        );
    }

    #[test]
    fn parameter_sets_are_captured_for_sdp() {
        let mut p = H264Packetizer::new(96, 1);
        let frame = [&[0, 0, 0, 1][..], &SPS, &[0, 0, 0, 1], &PPS, &[0, 0, 0, 1, 0x65, 0x88]].concat();
        p.packetize(&frame, 0);

        let attrs = p.sdp_attributes();
        assert_eq!(
            attrs[1],
            format!(
                "a=fmtp:96 packetization-mode=1;profile-level-id=42001e;sprop-parameter-sets={},{}",
                BASE64_STANDARD.encode(SPS),
                BASE64_STANDARD.encode(PPS)
            )
        );
    }
}
