//! Local capture, remote playback and the G.711 codec used on the wire

use crate::error::Result;
use crate::ringtone::ToneSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Voice runs at narrowband G.711 rate.
pub const SAMPLE_RATE: u32 = 8_000;
/// Samples in one 20 ms frame.
pub const FRAME_SAMPLES: usize = 160;

const MAX_BUFFERED: usize = SAMPLE_RATE as usize * 2;

pub type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

// ============================================================================
// Local stream
// ============================================================================

/// Something that holds an input or output device open until dropped.
pub type DeviceGuard = Box<dyn Send>;

pub struct AudioTrack {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
    capture: Option<SampleQueue>,
    device: Mutex<Option<DeviceGuard>>,
}

impl AudioTrack {
    /// Track fed from `capture`; `device` is released by [`AudioTrack::stop`].
    pub fn new(
        id: impl Into<String>,
        capture: Option<SampleQueue>,
        device: Option<DeviceGuard>,
    ) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            capture,
            device: Mutex::new(device),
        }
    }

    /// A live track that only ever yields silence.
    pub fn silent(id: impl Into<String>) -> Self {
        Self::new(id, None, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Ends the track and releases the capture device right away.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("Stopping track {}", self.id);
        }
        self.device.lock().take();
    }

    /// Next 20 ms of captured audio. Muted or ended tracks yield silence.
    pub fn next_frame(&self) -> Vec<i16> {
        let mut frame = vec![0i16; FRAME_SAMPLES];
        if !self.is_enabled() || !self.is_live() {
            return frame;
        }
        if let Some(capture) = &self.capture {
            let mut queue = capture.lock();
            for sample in frame.iter_mut() {
                match queue.pop_front() {
                    Some(v) => *sample = v,
                    None => break,
                }
            }
        }
        frame
    }
}

/// Microphone capture owned by the active call.
#[derive(Clone)]
pub struct LocalStream {
    tracks: Vec<Arc<AudioTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<AudioTrack>) -> Self {
        Self {
            tracks: tracks.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn tracks(&self) -> &[Arc<AudioTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&Arc<AudioTrack>> {
        self.tracks.first()
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

// ============================================================================
// Remote stream
// ============================================================================

/// Decoded audio arriving from the remote peer.
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    queue: SampleQueue,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn push_samples(&self, samples: &[i16]) {
        let mut queue = self.queue.lock();
        queue.extend(samples.iter().copied());
        while queue.len() > MAX_BUFFERED {
            queue.pop_front();
        }
    }

    pub fn pop_sample(&self) -> Option<i16> {
        self.queue.lock().pop_front()
    }

    pub fn buffered(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream").field("id", &self.id).finish_non_exhaustive()
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Keeps a sound playing; dropping it stops the output.
pub struct PlaybackHandle {
    _guard: Box<dyn Send>,
}

impl PlaybackHandle {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_microphone(&self, constraints: &AudioConstraints) -> Result<LocalStream>;
}

pub trait AudioOutput: Send + Sync {
    /// Routes remote audio to the speaker. Fails with
    /// [`crate::Error::PlaybackBlocked`] when output is refused.
    fn play_remote(&self, stream: &RemoteStream) -> Result<PlaybackHandle>;

    fn open_tone(&self, tone: ToneSource) -> Result<PlaybackHandle>;
}

/// Silent microphone and a speaker that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevices;

#[async_trait]
impl MediaDevices for NullDevices {
    async fn acquire_microphone(&self, _constraints: &AudioConstraints) -> Result<LocalStream> {
        Ok(LocalStream::new(vec![AudioTrack::silent(format!(
            "null-mic-{}",
            rand::random::<u32>()
        ))]))
    }
}

impl AudioOutput for NullDevices {
    fn play_remote(&self, stream: &RemoteStream) -> Result<PlaybackHandle> {
        tracing::debug!("Discarding remote audio of {}", stream.id());
        Ok(PlaybackHandle::new(()))
    }

    fn open_tone(&self, _tone: ToneSource) -> Result<PlaybackHandle> {
        Ok(PlaybackHandle::new(()))
    }
}

/// Waits on a device thread's answer. On a multi-thread runtime the worker
/// hands its other tasks off first.
#[cfg(any(feature = "audio", test))]
fn wait_ready<T>(
    rx: &std::sync::mpsc::Receiver<T>,
) -> std::result::Result<T, std::sync::mpsc::RecvError> {
    use tokio::runtime::{Handle, RuntimeFlavor};

    let on_worker =
        Handle::try_current().is_ok_and(|h| h.runtime_flavor() == RuntimeFlavor::MultiThread);
    if on_worker {
        tokio::task::block_in_place(|| rx.recv())
    } else {
        rx.recv()
    }
}

#[cfg(feature = "audio")]
pub use system::SystemAudio;

#[cfg(feature = "audio")]
mod system {
    use super::*;
    use crate::error::Error;
    use crate::ringtone::TONE_SAMPLE_RATE;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Default input and output devices of the host.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemAudio;

    #[async_trait]
    impl MediaDevices for SystemAudio {
        async fn acquire_microphone(&self, constraints: &AudioConstraints) -> Result<LocalStream> {
            tracing::info!(
                "Opening microphone (aec={}, ns={}, agc={})",
                constraints.echo_cancellation,
                constraints.noise_suppression,
                constraints.auto_gain_control
            );
            let capture: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();

            let queue = capture.clone();
            std::thread::Builder::new()
                .name("mic-capture".into())
                .spawn(move || match open_input(queue) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;

            match ready_rx.await {
                Ok(Ok(())) => {
                    let guard: DeviceGuard = Box::new(stop_tx);
                    Ok(LocalStream::new(vec![AudioTrack::new(
                        "default-mic",
                        Some(capture),
                        Some(guard),
                    )]))
                }
                Ok(Err(e)) => Err(Error::Media(e)),
                Err(_) => Err(Error::Media("capture thread exited".into())),
            }
        }
    }

    impl AudioOutput for SystemAudio {
        fn play_remote(&self, stream: &RemoteStream) -> Result<PlaybackHandle> {
            let source = RemoteSource(stream.clone());
            spawn_sink("remote-playback", source)
        }

        fn open_tone(&self, tone: ToneSource) -> Result<PlaybackHandle> {
            spawn_sink("ringtone", ToneSamples(tone))
        }
    }

    fn open_input(queue: SampleQueue) -> std::result::Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| "no input audio device available".to_string())?;
        let cfg = device
            .default_input_config()
            .map_err(|e| format!("input config error: {e}"))?;
        let channels = cfg.channels() as usize;
        let mut down = Downsampler::new(cfg.sample_rate().0, queue);

        let stream = match cfg.sample_format() {
            cpal::SampleFormat::I16 => device.build_input_stream(
                &cfg.config(),
                move |data: &[i16], _| down.push_interleaved(data, channels, |s| s),
                |e| tracing::warn!("Capture error: {}", e),
                None,
            ),
            cpal::SampleFormat::U16 => device.build_input_stream(
                &cfg.config(),
                move |data: &[u16], _| {
                    down.push_interleaved(data, channels, |s| (s as i32 - 32_768) as i16)
                },
                |e| tracing::warn!("Capture error: {}", e),
                None,
            ),
            cpal::SampleFormat::F32 => device.build_input_stream(
                &cfg.config(),
                move |data: &[f32], _| {
                    down.push_interleaved(data, channels, |s| {
                        (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                    })
                },
                |e| tracing::warn!("Capture error: {}", e),
                None,
            ),
            other => return Err(format!("unsupported input sample format: {other:?}")),
        }
        .map_err(|e| format!("build input stream failed: {e}"))?;

        stream
            .play()
            .map_err(|e| format!("start input stream failed: {e}"))?;
        Ok(stream)
    }

    /// Mixes interleaved device audio to mono and decimates it to 8 kHz.
    struct Downsampler {
        step: f64,
        pos: f64,
        queue: SampleQueue,
    }

    impl Downsampler {
        fn new(device_rate: u32, queue: SampleQueue) -> Self {
            Self {
                step: device_rate as f64 / SAMPLE_RATE as f64,
                pos: 0.0,
                queue,
            }
        }

        fn push_interleaved<T: Copy>(
            &mut self,
            data: &[T],
            channels: usize,
            to_i16: impl Fn(T) -> i16,
        ) {
            let mut queue = self.queue.lock();
            for frame in data.chunks(channels.max(1)) {
                self.pos += 1.0;
                if self.pos < self.step {
                    continue;
                }
                self.pos -= self.step;
                let sum: i32 = frame.iter().map(|s| to_i16(*s) as i32).sum();
                queue.push_back((sum / frame.len() as i32) as i16);
            }
            while queue.len() > MAX_BUFFERED {
                queue.pop_front();
            }
        }
    }

    fn spawn_sink<S>(name: &str, source: S) -> Result<PlaybackHandle>
    where
        S: rodio::Source + Send + 'static,
        S::Item: rodio::Sample + Send,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let opened = rodio::OutputStream::try_default()
                    .map_err(|e| e.to_string())
                    .and_then(|(stream, handle)| {
                        rodio::Sink::try_new(&handle)
                            .map(|sink| (stream, sink))
                            .map_err(|e| e.to_string())
                    });
                match opened {
                    Ok((_stream, sink)) => {
                        sink.append(source);
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        sink.stop();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match wait_ready(&ready_rx) {
            Ok(Ok(())) => Ok(PlaybackHandle::new(stop_tx)),
            Ok(Err(e)) => Err(Error::PlaybackBlocked(e)),
            Err(_) => Err(Error::PlaybackBlocked(format!("{} thread exited", name))),
        }
    }

    struct RemoteSource(RemoteStream);

    impl Iterator for RemoteSource {
        type Item = i16;

        fn next(&mut self) -> Option<i16> {
            Some(self.0.pop_sample().unwrap_or(0))
        }
    }

    impl rodio::Source for RemoteSource {
        fn current_frame_len(&self) -> Option<usize> {
            None
        }

        fn channels(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }

        fn total_duration(&self) -> Option<Duration> {
            None
        }
    }

    struct ToneSamples(ToneSource);

    impl Iterator for ToneSamples {
        type Item = f32;

        fn next(&mut self) -> Option<f32> {
            self.0.next()
        }
    }

    impl rodio::Source for ToneSamples {
        fn current_frame_len(&self) -> Option<usize> {
            None
        }

        fn channels(&self) -> u16 {
            1
        }

        fn sample_rate(&self) -> u32 {
            TONE_SAMPLE_RATE
        }

        fn total_duration(&self) -> Option<Duration> {
            None
        }
    }
}

// ============================================================================
// G.711 µ-law
// ============================================================================

pub mod g711 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    pub fn encode_sample(pcm: i16) -> u8 {
        let mut s = pcm as i32;
        let sign = if s < 0 {
            s = -s;
            0x80
        } else {
            0
        };
        s = s.min(CLIP) + BIAS;

        let mut exponent = 7;
        let mut mask = 0x4000;
        while exponent > 0 && s & mask == 0 {
            exponent -= 1;
            mask >>= 1;
        }
        let mantissa = (s >> (exponent + 3)) & 0x0F;
        (!(sign | (exponent << 4) | mantissa) & 0xFF) as u8
    }

    pub fn decode_sample(ulaw: u8) -> i16 {
        let u = !ulaw as i32 & 0xFF;
        let exponent = (u >> 4) & 0x07;
        let mantissa = u & 0x0F;
        let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
        if u & 0x80 != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        }
    }

    pub fn encode(pcm: &[i16]) -> Vec<u8> {
        pcm.iter().map(|s| encode_sample(*s)).collect()
    }

    pub fn decode(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|b| decode_sample(*b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_device_wait_leaves_runtime_running() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let waiter = tokio::spawn(async move { wait_ready(&rx) });

        // Timers still fire while the only worker waits on the device.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(7).unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(7));

        let (tx, rx) = std::sync::mpsc::sync_channel::<u8>(1);
        drop(tx);
        let gone = tokio::spawn(async move { wait_ready(&rx) });
        assert!(gone.await.unwrap().is_err());
    }

    #[test]
    fn test_mulaw_within_quantization_error() {
        assert_eq!(g711::decode_sample(g711::encode_sample(0)), 0);
        for x in (-32_000i32..=32_000).step_by(97) {
            let back = g711::decode_sample(g711::encode_sample(x as i16)) as i32;
            let tolerance = (x.abs() + 132) / 32 + 1;
            assert!(
                (back - x).abs() <= tolerance,
                "{} decoded as {} (tolerance {})",
                x,
                back,
                tolerance
            );
            assert!(back.signum() * x.signum() >= 0);
        }
    }

    #[test]
    fn test_muted_track_yields_silence() {
        let capture: SampleQueue = Arc::new(Mutex::new((1..=400).collect()));
        let track = AudioTrack::new("mic", Some(capture), None);

        let frame = track.next_frame();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert_eq!(frame[0], 1);

        track.set_enabled(false);
        assert!(track.next_frame().iter().all(|s| *s == 0));

        track.set_enabled(true);
        assert_eq!(track.next_frame()[0], 161);
    }

    #[test]
    fn test_stop_releases_device() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let guard: DeviceGuard = Box::new(Flag(released.clone()));
        let stream = LocalStream::new(vec![AudioTrack::new("mic", None, Some(guard))]);

        assert!(stream.is_live());
        stream.stop_all();
        assert!(!stream.is_live());
        assert!(released.load(Ordering::SeqCst));
        stream.stop_all();
    }

    #[test]
    fn test_remote_buffer_is_bounded() {
        let remote = RemoteStream::new("r");
        remote.push_samples(&vec![1; MAX_BUFFERED + 500]);
        assert_eq!(remote.buffered(), MAX_BUFFERED);
        assert_eq!(remote.pop_sample(), Some(1));
    }
}
