use parking_lot::Mutex;

use crate::frame::EncodedFrame;
use crate::media::Packetizer;
use crate::server::ServerHandle;

/// Control attribute of the single video track (`a=control:track1`).
pub const VIDEO_TRACK_CONTROL: &str = "track1";

/// Maps encoder presentation timestamps onto an RTP media clock.
///
/// Starts from a random base (RFC 3550 §5.1). Presentation timestamps are
/// only non-decreasing within one encoder session; when they go backwards
/// the encoder was restarted, and the clock continues one frame interval
/// after the last timestamp it produced so the RTP timeline never rewinds.
#[derive(Debug)]
pub struct MediaClock {
    clock_rate: u32,
    base: u32,
    origin_us: Option<u64>,
    last_pts_us: u64,
    last_ts: u32,
}

impl MediaClock {
    pub fn new(clock_rate: u32, base: u32) -> Self {
        Self {
            clock_rate,
            base,
            origin_us: None,
            last_pts_us: 0,
            last_ts: base,
        }
    }

    pub fn with_random_base(clock_rate: u32) -> Self {
        Self::new(clock_rate, rand::random::<u32>())
    }

    pub fn rtp_timestamp(&mut self, pts_us: u64) -> u32 {
        let origin = match self.origin_us {
            Some(origin) if pts_us >= self.last_pts_us => origin,
            Some(_) => {
                self.base = self.last_ts.wrapping_add(self.clock_rate / 30);
                self.origin_us = Some(pts_us);
                tracing::debug!(pts_us, base = self.base, "presentation clock restarted");
                pts_us
            }
            None => {
                self.origin_us = Some(pts_us);
                pts_us
            }
        };

        let ticks = u128::from(pts_us - origin) * u128::from(self.clock_rate) / 1_000_000;
        let ts = self.base.wrapping_add(ticks as u32);
        self.last_pts_us = pts_us;
        self.last_ts = ts;
        ts
    }
}

/// The server-side half of a media subsession.
///
/// Owns the codec packetizer and the media clock, and pushes every encoded
/// frame to the playing sessions of the server it was created for.
pub struct Track {
    control: String,
    packetizer: Mutex<Box<dyn Packetizer>>,
    clock: Mutex<MediaClock>,
    server: ServerHandle,
}

impl Track {
    pub fn new(packetizer: Box<dyn Packetizer>, server: ServerHandle) -> Self {
        let clock = MediaClock::with_random_base(packetizer.clock_rate());
        Self {
            control: VIDEO_TRACK_CONTROL.to_string(),
            packetizer: Mutex::new(packetizer),
            clock: Mutex::new(clock),
            server,
        }
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    /// Packetize one access unit and send it to every playing session.
    /// Returns the number of RTP packets sent.
    pub fn deliver(&self, frame: &EncodedFrame<'_>) -> usize {
        let ts = self.clock.lock().rtp_timestamp(frame.presentation_time_us);
        let packets = self.packetizer.lock().packetize(frame.data, ts);

        let mut sent = 0;
        for packet in &packets {
            sent += self.server.broadcast(packet);
        }

        tracing::trace!(
            bytes = frame.size(),
            pts = frame.presentation_time_us,
            rtp_ts = ts,
            packets = packets.len(),
            sent,
            "frame delivered"
        );
        sent
    }

    /// RTP payload type from the underlying packetizer.
    pub fn payload_type(&self) -> u8 {
        self.packetizer.lock().payload_type()
    }

    /// SDP media-level attributes: the codec lines, then `a=control`.
    pub fn sdp_attributes(&self) -> Vec<String> {
        let mut attrs = self.packetizer.lock().sdp_attributes();
        attrs.push(format!("a=control:{}", self.control));
        attrs
    }

    /// Codec clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.packetizer.lock().clock_rate()
    }

    /// Next RTP sequence number (for RTP-Info header).
    pub fn next_sequence(&self) -> u16 {
        self.packetizer.lock().next_sequence()
    }

    /// Most recent RTP timestamp (for RTP-Info header).
    pub fn next_rtp_timestamp(&self) -> u32 {
        self.packetizer.lock().next_rtp_timestamp()
    }
}
