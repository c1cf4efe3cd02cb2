//! ADSR Envelope
//!
//! A time-based envelope evaluated at absolute millisecond times rather than
//! stepped per sample, so a voice can ask for its level at any point in the
//! block (including the steal and fade paths).

use serde::{Deserialize, Serialize};

/// Shortest allowed stage, in milliseconds
pub const MIN_STAGE_MS: f64 = 1.0;

/// Envelope shape settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdsrParams {
    pub attack_ms: f64,
    pub decay_ms: f64,
    /// Sustain level relative to the peak, 0–1
    pub sustain: f64,
    pub release_ms: f64,
    /// Segment curvature, -1 (fast start) to 1 (slow start); 0 is linear
    pub curve: f64,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack_ms: 5.0,
            decay_ms: 100.0,
            sustain: 0.7,
            release_ms: 200.0,
            curve: 0.0,
        }
    }
}

/// Envelope lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    params: AdsrParams,
    start_time: Option<f64>,
    stop_time: Option<f64>,
    /// Level the attack starts from (nonzero on retrigger)
    start_level: f64,
    /// Level the release starts from
    stop_level: f64,
    peak: f64,
}

impl Envelope {
    pub fn new(params: AdsrParams) -> Self {
        Self {
            params,
            start_time: None,
            stop_time: None,
            start_level: 0.0,
            stop_level: 0.0,
            peak: 1.0,
        }
    }

    pub fn params(&self) -> &AdsrParams {
        &self.params
    }

    pub fn set_params(&mut self, params: AdsrParams) {
        self.params = params;
    }

    /// Begin the attack at `time`, continuing from the current level
    pub fn start(&mut self, time: f64, velocity: f64) {
        self.start_level = self.value(time);
        self.peak = velocity.clamp(0.0, 1.0);
        self.start_time = Some(time);
        self.stop_time = None;
    }

    /// Begin the release at `time`; ignored if not started or already released
    pub fn stop(&mut self, time: f64) {
        if self.start_time.is_some() && self.stop_time.is_none() {
            self.stop_level = self.value(time);
            self.stop_time = Some(time);
        }
    }

    pub fn clear(&mut self) {
        self.start_time = None;
        self.stop_time = None;
        self.start_level = 0.0;
        self.stop_level = 0.0;
    }

    fn shape(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        if self.params.curve == 0.0 {
            t
        } else {
            libm::pow(t, libm::exp2(self.params.curve.clamp(-1.0, 1.0) * 2.0))
        }
    }

    fn attack(&self) -> f64 {
        self.params.attack_ms.max(MIN_STAGE_MS)
    }

    fn decay(&self) -> f64 {
        self.params.decay_ms.max(MIN_STAGE_MS)
    }

    fn release(&self) -> f64 {
        self.params.release_ms.max(MIN_STAGE_MS)
    }

    fn sustain_level(&self) -> f64 {
        self.params.sustain.clamp(0.0, 1.0) * self.peak
    }

    /// Envelope level at `time`
    pub fn value(&self, time: f64) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };

        if let Some(stop) = self.stop_time {
            if time >= stop {
                let t = (time - stop) / self.release();
                return self.stop_level * (1.0 - self.shape(t));
            }
        }

        let since = time - start;
        if since < 0.0 {
            return self.start_level;
        }
        if since < self.attack() {
            let t = self.shape(since / self.attack());
            return self.start_level + (self.peak - self.start_level) * t;
        }
        let since = since - self.attack();
        if since < self.decay() {
            let t = self.shape(since / self.decay());
            return self.peak + (self.sustain_level() - self.peak) * t;
        }
        self.sustain_level()
    }

    pub fn stage(&self, time: f64) -> EnvelopeStage {
        let Some(start) = self.start_time else {
            return EnvelopeStage::Idle;
        };
        if let Some(stop) = self.stop_time {
            if time >= stop + self.release() {
                return EnvelopeStage::Idle;
            }
            if time >= stop {
                return EnvelopeStage::Release;
            }
        }
        let since = time - start;
        if since < self.attack() {
            EnvelopeStage::Attack
        } else if since < self.attack() + self.decay() {
            EnvelopeStage::Decay
        } else {
            EnvelopeStage::Sustain
        }
    }

    /// Whether the release has fully finished (or the envelope never started)
    pub fn is_done(&self, time: f64) -> bool {
        match (self.start_time, self.stop_time) {
            (None, _) => true,
            (Some(_), Some(stop)) => time >= stop + self.release(),
            (Some(_), None) => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.stop_time.is_some()
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(AdsrParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn env() -> Envelope {
        Envelope::new(AdsrParams {
            attack_ms: 10.0,
            decay_ms: 10.0,
            sustain: 0.5,
            release_ms: 20.0,
            curve: 0.0,
        })
    }

    #[test]
    fn test_stages() {
        let mut e = env();
        assert_eq!(e.stage(0.0), EnvelopeStage::Idle);
        e.start(100.0, 1.0);
        assert_eq!(e.stage(105.0), EnvelopeStage::Attack);
        assert_eq!(e.stage(115.0), EnvelopeStage::Decay);
        assert_eq!(e.stage(150.0), EnvelopeStage::Sustain);
        e.stop(200.0);
        assert_eq!(e.stage(210.0), EnvelopeStage::Release);
        assert_eq!(e.stage(220.0), EnvelopeStage::Idle);
    }

    #[test]
    fn test_linear_values() {
        let mut e = env();
        e.start(0.0, 1.0);
        assert_relative_eq!(e.value(5.0), 0.5);
        assert_relative_eq!(e.value(10.0), 1.0);
        assert_relative_eq!(e.value(15.0), 0.75);
        assert_relative_eq!(e.value(50.0), 0.5);
        e.stop(50.0);
        assert_relative_eq!(e.value(60.0), 0.25);
        assert_relative_eq!(e.value(70.0), 0.0);
    }

    #[test]
    fn test_velocity_scales_peak() {
        let mut e = env();
        e.start(0.0, 0.5);
        assert_relative_eq!(e.value(10.0), 0.5);
        assert_relative_eq!(e.value(100.0), 0.25);
    }

    #[test]
    fn test_retrigger_starts_from_current_level() {
        let mut e = env();
        e.start(0.0, 1.0);
        e.stop(50.0);
        // Halfway through release, level 0.25
        e.start(60.0, 1.0);
        assert_relative_eq!(e.value(60.0), 0.25);
        assert!(!e.is_released());
    }

    #[test]
    fn test_is_done_only_after_release() {
        let mut e = env();
        assert!(e.is_done(0.0));
        e.start(0.0, 1.0);
        assert!(!e.is_done(1000.0));
        e.stop(1000.0);
        assert!(!e.is_done(1019.0));
        assert!(e.is_done(1020.0));
    }

    #[test]
    fn test_zero_length_stages_use_minimum() {
        let mut e = Envelope::new(AdsrParams {
            attack_ms: 0.0,
            decay_ms: 0.0,
            sustain: 1.0,
            release_ms: 0.0,
            curve: 0.0,
        });
        e.start(0.0, 1.0);
        assert_relative_eq!(e.value(0.5), 0.5);
        e.stop(10.0);
        assert!(e.is_done(10.0 + MIN_STAGE_MS));
    }

    #[test]
    fn test_curve_stays_in_range() {
        let mut e = Envelope::new(AdsrParams {
            curve: 1.0,
            ..AdsrParams::default()
        });
        e.start(0.0, 1.0);
        let v = e.value(2.5);
        assert!(v > 0.0 && v < 0.5);
    }
}
