//! Software H.264 encoder backed by OpenH264.
//!
//! The codec lives on its own delivery thread for as long as the encoder is
//! running. `queue_input_frame` hands frames to that thread over a bounded
//! channel and declines when the channel is full, so the capture side never
//! waits on the codec.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use openh264::OpenH264API;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use parking_lot::{Mutex, RwLock};

use super::{
    EncoderFormat, EncoderSettings, EncoderState, MIME_AVC, QueueResult, Rotation, VideoEncoder,
    bitrate_for, validate_dimensions, yuv,
};
use crate::capture::pool::FrameRecycler;
use crate::error::{Result, StreamError};
use crate::frame::{EncodedFrame, FrameSource, OutputListener, RawFrame, Size};

type SharedListener = Arc<RwLock<Option<Arc<dyn OutputListener>>>>;

/// H.264 [`VideoEncoder`] producing Annex B access units.
pub struct H264Encoder {
    settings: EncoderSettings,
    inner: Mutex<Inner>,
    listener: SharedListener,
}

enum Inner {
    Uninitialized,
    Configured(EncoderFormat),
    Running(Running),
}

struct Running {
    format: EncoderFormat,
    input: SyncSender<Input>,
    stop: Arc<AtomicBool>,
    key_frame: Arc<AtomicBool>,
    worker: JoinHandle<()>,
    epoch: Instant,
    last_pts: u64,
}

struct Input {
    frame: RawFrame,
    recycler: FrameRecycler,
    pts: u64,
}

impl H264Encoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner::Uninitialized),
            listener: Arc::new(RwLock::new(None)),
        }
    }

    fn spawn(&self, format: EncoderFormat) -> Result<Running> {
        let (input, rx) = mpsc::sync_channel::<Input>(self.settings.input_queue.max(1));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let key_frame = Arc::new(AtomicBool::new(false));

        let worker = {
            let signals = Signals {
                stop: stop.clone(),
                key_frame: key_frame.clone(),
            };
            let listener = self.listener.clone();
            thread::Builder::new()
                .name("h264-encoder".into())
                .spawn(move || run_encoder(format, rx, signals, listener, ready_tx))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(StreamError::Codec("encoder thread exited during start".into()));
            }
        }

        tracing::info!(
            width = format.output_size().width,
            height = format.output_size().height,
            rotation = format.rotation.degrees(),
            bitrate = format.bitrate,
            fps = format.frame_rate,
            "H.264 encoder started"
        );

        Ok(Running {
            format,
            input,
            stop,
            key_frame,
            worker,
            epoch: Instant::now(),
            last_pts: 0,
        })
    }
}

impl FrameSource for H264Encoder {
    fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let format = match &*inner {
            Inner::Uninitialized => {
                return Err(StreamError::EncoderConfig(
                    "start called before init_resolution".into(),
                ));
            }
            Inner::Running(_) => return Ok(()),
            Inner::Configured(format) => *format,
        };
        *inner = Inner::Running(self.spawn(format)?);
        Ok(())
    }

    fn stop(&self) {
        let running = {
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut *inner, Inner::Uninitialized) {
                Inner::Running(running) => {
                    *inner = Inner::Configured(running.format);
                    running
                }
                other => {
                    *inner = other;
                    return;
                }
            }
        };

        running.halt();
    }

    fn set_output_listener(&self, listener: Option<Arc<dyn OutputListener>>) {
        *self.listener.write() = listener;
    }

    fn request_key_frame(&self) {
        if let Inner::Running(running) = &*self.inner.lock() {
            running.key_frame.store(true, Ordering::SeqCst);
            tracing::debug!("key frame requested");
        }
    }
}

impl VideoEncoder for H264Encoder {
    fn mime(&self) -> &'static str {
        MIME_AVC
    }

    fn bitrate(&self) -> u32 {
        self.format().map_or(0, |f| f.bitrate)
    }

    fn init_resolution(&self, size: Size, rotation: Rotation) -> Result<()> {
        validate_dimensions(size)?;

        let out = if rotation.swaps_dimensions() {
            Size::new(size.height, size.width)
        } else {
            size
        };
        let format = EncoderFormat {
            size,
            rotation,
            bitrate: bitrate_for(out),
            frame_rate: self.settings.frame_rate,
        };

        // Held across the restart so a concurrent start or stop sees either
        // the old codec or the new one.
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut *inner, Inner::Configured(format)) {
            Inner::Running(running) if running.format == format => {
                *inner = Inner::Running(running);
                return Ok(());
            }
            Inner::Running(running) => {
                tracing::debug!(%size, %rotation, "reconfiguring running encoder");
                running.halt();
                *inner = Inner::Running(self.spawn(format)?);
            }
            Inner::Uninitialized | Inner::Configured(_) => {}
        }

        tracing::debug!(%size, %rotation, bitrate = format.bitrate, "encoder resolution set");
        Ok(())
    }

    fn queue_input_frame(&self, frame: RawFrame, recycler: &FrameRecycler) -> QueueResult {
        let mut inner = self.inner.lock();
        let Inner::Running(running) = &mut *inner else {
            return QueueResult::Declined(frame);
        };

        if frame.size != running.format.size || !frame.is_complete() {
            let err = StreamError::EncoderConfig(format!(
                "frame {} ({} bytes) does not match encoder input {}",
                frame.size,
                frame.data.len(),
                running.format.size
            ));
            return QueueResult::Failed(frame, err);
        }

        let pts = (running.epoch.elapsed().as_micros() as u64).max(running.last_pts);
        running.last_pts = pts;

        let input = Input {
            frame,
            recycler: recycler.clone(),
            pts,
        };
        match running.input.try_send(input) {
            Ok(()) => QueueResult::Accepted,
            Err(TrySendError::Full(input)) => QueueResult::Declined(input.frame),
            Err(TrySendError::Disconnected(input)) => QueueResult::Failed(
                input.frame,
                StreamError::Codec("encoder thread is gone".into()),
            ),
        }
    }

    fn state(&self) -> EncoderState {
        match &*self.inner.lock() {
            Inner::Uninitialized => EncoderState::Uninitialized,
            Inner::Configured(_) => EncoderState::Configured,
            Inner::Running(_) => EncoderState::Running,
        }
    }

    fn format(&self) -> Option<EncoderFormat> {
        match &*self.inner.lock() {
            Inner::Uninitialized => None,
            Inner::Configured(format) => Some(*format),
            Inner::Running(running) => Some(running.format),
        }
    }
}

impl Running {
    /// Stop the codec thread and wait for it unless called from it.
    fn halt(self) {
        let Running {
            input, stop, worker, ..
        } = self;
        stop.store(true, Ordering::SeqCst);
        drop(input);

        if worker.thread().id() != thread::current().id() && worker.join().is_err() {
            tracing::warn!("encoder thread panicked");
        }
        tracing::info!("H.264 encoder stopped");
    }
}

impl Drop for H264Encoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_codec(format: &EncoderFormat) -> Result<Encoder> {
    let config = EncoderConfig::new()
        .bitrate(BitRate::from_bps(format.bitrate))
        .max_frame_rate(FrameRate::from_hz(format.frame_rate as f32))
        .rate_control_mode(RateControlMode::Bitrate);

    let api = OpenH264API::from_source();
    let mut encoder = Encoder::with_api_config(api, config)
        .map_err(|e| StreamError::Codec(format!("failed to create encoder: {e}")))?;
    encoder.force_intra_frame();
    Ok(encoder)
}

struct Signals {
    stop: Arc<AtomicBool>,
    key_frame: Arc<AtomicBool>,
}

fn run_encoder(
    format: EncoderFormat,
    rx: Receiver<Input>,
    signals: Signals,
    listener: SharedListener,
    ready: SyncSender<Result<()>>,
) {
    let mut codec = match open_codec(&format) {
        Ok(codec) => {
            let _ = ready.send(Ok(()));
            codec
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut i420 = Vec::new();
    let mut encoded: u64 = 0;

    while let Ok(Input {
        frame,
        recycler,
        pts,
    }) = rx.recv()
    {
        if signals.stop.load(Ordering::SeqCst) {
            recycler.recycle(frame);
            continue;
        }
        if signals.key_frame.swap(false, Ordering::SeqCst) {
            codec.force_intra_frame();
        }

        let out = yuv::nv21_to_i420(&frame.data, frame.size, format.rotation, &mut i420);
        recycler.recycle(frame);

        let (w, h) = (out.width as usize, out.height as usize);
        let (y_plane, chroma) = i420.split_at(w * h);
        let (u_plane, v_plane) = chroma.split_at(w * h / 4);
        let source = YUVSlices::new((y_plane, u_plane, v_plane), (w, h), (w, w / 2, w / 2));

        let data = match codec.encode(&source) {
            Ok(bitstream) => bitstream.to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, pts, "encode failed, dropping frame");
                continue;
            }
        };

        if data.is_empty() {
            tracing::trace!(pts, "encoder skipped frame");
            continue;
        }

        encoded += 1;
        tracing::trace!(pts, bytes = data.len(), "access unit encoded");

        let listener = listener.read().clone();
        if let Some(listener) = listener {
            listener.on_frame_output(&EncodedFrame {
                data: &data,
                presentation_time_us: pts,
            });
        }
    }

    tracing::debug!(encoded, "encoder thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::FrameBufferPool;
    use crate::frame::PixelFormat;
    use std::time::Duration;

    const QCIF: Size = Size::new(176, 144);

    fn encoder() -> H264Encoder {
        H264Encoder::new(EncoderSettings::default())
    }

    fn collect_output(encoder: &H264Encoder) -> mpsc::Receiver<(Vec<u8>, u64)> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        encoder.set_output_listener(Some(Arc::new(move |f: &EncodedFrame<'_>| {
            let _ = tx.lock().send((f.data.to_vec(), f.presentation_time_us));
        })));
        rx
    }

    #[test]
    fn declines_until_running() {
        let encoder = encoder();
        let pool = FrameBufferPool::new(PixelFormat::Nv21, QCIF, 1);
        let recycler = pool.recycler();

        let frame = pool.acquire().unwrap();
        let frame = match encoder.queue_input_frame(frame, &recycler) {
            QueueResult::Declined(f) => f,
            other => panic!("expected Declined, got {other:?}"),
        };

        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        assert_eq!(encoder.state(), EncoderState::Configured);
        assert!(matches!(
            encoder.queue_input_frame(frame, &recycler),
            QueueResult::Declined(_)
        ));
    }

    #[test]
    fn start_requires_resolution() {
        let encoder = encoder();
        assert!(matches!(encoder.start(), Err(StreamError::EncoderConfig(_))));
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
        assert_eq!(encoder.bitrate(), 0);
        assert_eq!(encoder.mime(), "video/avc");
    }

    #[test]
    fn invalid_resolution_keeps_previous_state() {
        let encoder = encoder();
        assert!(encoder.init_resolution(Size::new(175, 144), Rotation::Deg0).is_err());
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
    }

    #[test]
    fn encodes_annex_b_with_monotonic_pts() {
        let encoder = encoder();
        let output = collect_output(&encoder);
        encoder.init_resolution(QCIF, Rotation::Deg90).unwrap();
        assert_eq!(encoder.bitrate(), bitrate_for(Size::new(144, 176)));
        encoder.start().unwrap();

        let pool = FrameBufferPool::new(PixelFormat::Nv21, QCIF, 2);
        let recycler = pool.recycler();
        let mut received = Vec::new();

        for _ in 0..100 {
            if let Some(frame) = pool.acquire() {
                if let QueueResult::Declined(f) | QueueResult::Failed(f, _) =
                    encoder.queue_input_frame(frame, &recycler)
                {
                    recycler.recycle(f);
                }
            }
            while let Ok(out) = output.try_recv() {
                received.push(out);
            }
            if received.len() >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        encoder.stop();
        assert_eq!(encoder.state(), EncoderState::Configured);
        assert!(received.len() >= 3, "got {} access units", received.len());

        let (first, _) = &received[0];
        assert!(first.starts_with(&[0, 0, 0, 1]) || first.starts_with(&[0, 0, 1]));
        assert!(received.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn stop_then_start_again() {
        let encoder = encoder();
        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        encoder.start().unwrap();
        encoder.start().unwrap();
        assert_eq!(encoder.state(), EncoderState::Running);

        encoder.stop();
        encoder.stop();
        assert_eq!(encoder.state(), EncoderState::Configured);

        encoder.start().unwrap();
        assert_eq!(encoder.state(), EncoderState::Running);
        assert_eq!(encoder.format().unwrap().size, QCIF);
    }

    #[test]
    fn mismatched_frame_fails_without_consuming_it() {
        let encoder = encoder();
        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        encoder.start().unwrap();

        let wrong = Size::new(320, 240);
        let pool = FrameBufferPool::new(PixelFormat::Nv21, wrong, 1);
        let frame = pool.acquire().unwrap();
        match encoder.queue_input_frame(frame, &pool.recycler()) {
            QueueResult::Failed(f, StreamError::EncoderConfig(_)) => assert_eq!(f.size, wrong),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn reconfigure_while_running_restarts() {
        let encoder = encoder();
        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        encoder.start().unwrap();

        encoder.init_resolution(Size::new(320, 240), Rotation::Deg0).unwrap();
        assert_eq!(encoder.state(), EncoderState::Running);
        assert_eq!(encoder.format().unwrap().size, Size::new(320, 240));
    }

    fn has_idr(access_unit: &[u8]) -> bool {
        access_unit
            .windows(4)
            .any(|w| w[..3] == [0, 0, 1] && w[3] & 0x1f == 5)
    }

    fn pump(
        encoder: &H264Encoder,
        pool: &FrameBufferPool,
        output: &mpsc::Receiver<(Vec<u8>, u64)>,
        want: usize,
    ) -> Vec<Vec<u8>> {
        let recycler = pool.recycler();
        let mut received = Vec::new();
        for _ in 0..200 {
            if let Some(frame) = pool.acquire()
                && let QueueResult::Declined(f) | QueueResult::Failed(f, _) =
                    encoder.queue_input_frame(frame, &recycler)
            {
                recycler.recycle(f);
            }
            while let Ok((data, _)) = output.try_recv() {
                received.push(data);
            }
            if received.len() >= want {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        received
    }

    #[test]
    fn key_frame_request_forces_idr() {
        let encoder = encoder();
        let output = collect_output(&encoder);
        encoder.request_key_frame();
        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        encoder.start().unwrap();
        let pool = FrameBufferPool::new(PixelFormat::Nv21, QCIF, 2);

        let warmup = pump(&encoder, &pool, &output, 3);
        assert!(warmup.len() >= 3);
        assert!(has_idr(&warmup[0]));

        encoder.request_key_frame();
        let after = pump(&encoder, &pool, &output, 4);
        encoder.stop();
        assert!(after.iter().any(|au| has_idr(au)), "no IDR after request");
    }

    #[test]
    fn reconfigure_races_with_start() {
        let encoder = Arc::new(encoder());
        encoder.init_resolution(QCIF, Rotation::Deg0).unwrap();
        encoder.start().unwrap();

        let starter = {
            let encoder = encoder.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    encoder.start().unwrap();
                }
            })
        };
        encoder
            .init_resolution(Size::new(320, 240), Rotation::Deg0)
            .unwrap();
        starter.join().unwrap();

        assert_eq!(encoder.state(), EncoderState::Running);
        assert_eq!(encoder.format().unwrap().size, Size::new(320, 240));
        encoder.stop();
    }
}
