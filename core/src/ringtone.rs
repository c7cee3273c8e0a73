//! Ringtones synthesized on the fly
//!
//! No audio assets: both cadences are a pure function of time.

use crate::error::Result;
use crate::media::{AudioOutput, PlaybackHandle};
use std::f64::consts::PI;
use std::sync::Arc;

pub const TONE_SAMPLE_RATE: u32 = 44_100;

const GAIN: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPattern {
    /// Someone is calling us: 600 Hz triangle, two short bursts every 2.5 s.
    Incoming,
    /// We are calling: 400 Hz sine, one long burst every 3 s.
    Outgoing,
}

impl RingPattern {
    pub fn period(self) -> f64 {
        match self {
            Self::Incoming => 2.5,
            Self::Outgoing => 3.0,
        }
    }

    pub fn frequency(self) -> f64 {
        match self {
            Self::Incoming => 600.0,
            Self::Outgoing => 400.0,
        }
    }

    pub fn is_sounding(self, t: f64) -> bool {
        let at = t.rem_euclid(self.period());
        match self {
            Self::Incoming => at < 0.4 || (0.6..1.0).contains(&at),
            Self::Outgoing => at < 1.2,
        }
    }
}

/// Sample value of `pattern` at `t` seconds after the tone started.
pub fn sample(pattern: RingPattern, t: f64) -> f32 {
    if !pattern.is_sounding(t) {
        return 0.0;
    }
    let cycle = (t * pattern.frequency()).rem_euclid(1.0);
    let wave = match pattern {
        RingPattern::Incoming => triangle(cycle),
        RingPattern::Outgoing => (2.0 * PI * cycle).sin(),
    };
    GAIN * wave as f32
}

fn triangle(cycle: f64) -> f64 {
    if cycle < 0.25 {
        4.0 * cycle
    } else if cycle < 0.75 {
        2.0 - 4.0 * cycle
    } else {
        4.0 * cycle - 4.0
    }
}

/// Endless sample iterator over [`sample`].
#[derive(Debug, Clone)]
pub struct ToneSource {
    pattern: RingPattern,
    sample_rate: u32,
    index: u64,
}

impl ToneSource {
    pub fn new(pattern: RingPattern) -> Self {
        Self::with_rate(pattern, TONE_SAMPLE_RATE)
    }

    pub fn with_rate(pattern: RingPattern, sample_rate: u32) -> Self {
        Self {
            pattern,
            sample_rate,
            index: 0,
        }
    }

    pub fn pattern(&self) -> RingPattern {
        self.pattern
    }
}

impl Iterator for ToneSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let t = self.index as f64 / self.sample_rate as f64;
        self.index += 1;
        Some(sample(self.pattern, t))
    }
}

/// Owned ringtone slot of an active call.
pub struct Ringtone {
    output: Arc<dyn AudioOutput>,
    playing: Option<(RingPattern, PlaybackHandle)>,
}

impl Ringtone {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            playing: None,
        }
    }

    /// Starts `pattern`; does nothing while a tone is already playing.
    pub fn start(&mut self, pattern: RingPattern) -> Result<()> {
        if self.playing.is_some() {
            return Ok(());
        }
        let handle = self.output.open_tone(ToneSource::new(pattern))?;
        tracing::debug!("Ringtone started: {:?}", pattern);
        self.playing = Some((pattern, handle));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some((pattern, _handle)) = self.playing.take() {
            tracing::debug!("Ringtone stopped: {:?}", pattern);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    pub fn pattern(&self) -> Option<RingPattern> {
        self.playing.as_ref().map(|(p, _)| *p)
    }
}
