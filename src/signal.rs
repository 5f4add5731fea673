//! Output waveform generation and per-mode signal descriptors.
//!
//! Every generator is a pure function of its arguments. `phase` is counted in
//! samples and `period` is the number of samples in one cycle; a period that
//! does not evenly divide `n` simply truncates the last cycle.

use std::f64::consts::PI;

use crate::error::{Error, Result};

/// Tag shared by every mode token handed across the C ABI.
pub const MODE_TOKEN_BASE: u32 = 0x40000;

/// Source/measure configuration of one channel.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Output disabled, channel floats.
    HiZ,
    /// Source voltage, measure current.
    Svmi,
    /// Source current, measure voltage.
    Simv,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::HiZ
    }
}

impl Mode {
    /// Value written to the firmware's mode register.
    pub fn firmware_code(self) -> u16 {
        match self {
            Mode::HiZ => 0,
            Mode::Svmi => 1,
            Mode::Simv => 2,
        }
    }

    /// Opaque token identifying this mode to foreign callers.
    pub fn token(self) -> u32 {
        MODE_TOKEN_BASE + u32::from(self.firmware_code())
    }

    /// Only tokens produced by [`Mode::token`] are accepted. A bare ordinal
    /// such as `1` is rejected even though it matches `Svmi`'s register value.
    pub fn from_token(token: u32) -> Result<Mode> {
        match token.checked_sub(MODE_TOKEN_BASE) {
            Some(0) => Ok(Mode::HiZ),
            Some(1) => Ok(Mode::Svmi),
            Some(2) => Ok(Mode::Simv),
            _ => Err(Error::invalid(format!("invalid mode: {:#x}", token))),
        }
    }

    pub fn is_sourcing(self) -> bool {
        self != Mode::HiZ
    }

    /// Feedback potentiometer setting the firmware expects for this mode.
    pub(crate) fn potentiometer(self) -> u16 {
        match self {
            Mode::HiZ => 0x3000,
            Mode::Svmi => 0x0000,
            Mode::Simv => 0x7f7f,
        }
    }
}

/// Static description of one measurable signal.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SignalInfo {
    pub label: &'static str,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
}

pub const VOLTAGE: SignalInfo = SignalInfo {
    label: "Voltage",
    min: 0.0,
    max: 5.0,
    resolution: 5.0 / 65536.0,
};

pub const CURRENT: SignalInfo = SignalInfo {
    label: "Current",
    min: -0.2,
    max: 0.2,
    resolution: 0.4 / 65536.0,
};

impl SignalInfo {
    /// The signal a channel sources in `mode`; a floating channel reports
    /// the voltage it measures.
    pub fn for_mode(mode: Mode) -> SignalInfo {
        match mode {
            Mode::Simv => CURRENT,
            Mode::HiZ | Mode::Svmi => VOLTAGE,
        }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.max(self.min as f32).min(self.max as f32)
    }
}

/// Parameterized periodic or constant waveform.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Waveform {
    Constant(f32),
    Square {
        low: f32,
        high: f32,
        period: f64,
        phase: f64,
        duty: f64,
    },
    Sawtooth { low: f32, high: f32, period: f64, phase: f64 },
    Stairstep { low: f32, high: f32, period: f64, phase: f64 },
    Sine { low: f32, high: f32, period: f64, phase: f64 },
    Triangle { low: f32, high: f32, period: f64, phase: f64 },
}

impl Waveform {
    pub fn generate(&self, n: usize) -> Result<Vec<f32>> {
        match *self {
            Waveform::Constant(value) => Ok(constant(n, value)),
            Waveform::Square {
                low,
                high,
                period,
                phase,
                duty,
            } => square(n, low, high, period, phase, duty),
            Waveform::Sawtooth { low, high, period, phase } => sawtooth(n, low, high, period, phase),
            Waveform::Stairstep { low, high, period, phase } => stairstep(n, low, high, period, phase),
            Waveform::Sine { low, high, period, phase } => sine(n, low, high, period, phase),
            Waveform::Triangle { low, high, period, phase } => triangle(n, low, high, period, phase),
        }
    }

    /// Number of samples in a single cycle, at least one.
    pub fn cycle_len(&self) -> usize {
        match *self {
            Waveform::Constant(_) => 1,
            Waveform::Square { period, .. }
            | Waveform::Sawtooth { period, .. }
            | Waveform::Stairstep { period, .. }
            | Waveform::Sine { period, .. }
            | Waveform::Triangle { period, .. } => period.round().max(1.0) as usize,
        }
    }
}

pub fn constant(n: usize, value: f32) -> Vec<f32> {
    vec![value; n]
}

pub fn square(n: usize, low: f32, high: f32, period: f64, phase: f64, duty: f64) -> Result<Vec<f32>> {
    check_period(period, phase)?;
    if !(0.0..=1.0).contains(&duty) {
        return Err(Error::invalid(format!("duty cycle {} outside [0, 1]", duty)));
    }
    Ok((0..n)
        .map(|i| {
            if normalized_phase(period, phase, i) < duty {
                low
            } else {
                high
            }
        })
        .collect())
}

pub fn sawtooth(n: usize, low: f32, high: f32, period: f64, phase: f64) -> Result<Vec<f32>> {
    check_period(period, phase)?;
    let span = f64::from(high - low);
    let int_period = period.trunc();
    let frac_period = period - int_period;
    Ok((0..n)
        .map(|i| {
            let p = (phase + i as f64) % period;
            let int_phase = p.trunc();
            let frac_phase = p - int_phase;
            // Highest whole phase the ramp reaches within one period.
            let last = if frac_period <= frac_phase {
                int_period - 1.0
            } else {
                int_period
            };
            let mut norm = if last > 0.0 { int_phase / last } else { 0.0 };
            if norm < 0.0 {
                norm += 1.0;
            }
            (f64::from(high) - norm * span) as f32
        })
        .collect())
}

pub fn stairstep(n: usize, low: f32, high: f32, period: f64, phase: f64) -> Result<Vec<f32>> {
    check_period(period, phase)?;
    let span = f64::from(high - low);
    Ok((0..n)
        .map(|i| {
            let step = (normalized_phase(period, phase, i) * 10.0).floor();
            (f64::from(high) - step * span / 9.0) as f32
        })
        .collect())
}

pub fn sine(n: usize, low: f32, high: f32, period: f64, phase: f64) -> Result<Vec<f32>> {
    check_period(period, phase)?;
    let span = f64::from(high - low);
    Ok((0..n)
        .map(|i| {
            let norm = normalized_phase(period, phase, i);
            (f64::from(low) + (1.0 + (norm * 2.0 * PI).cos()) * span / 2.0) as f32
        })
        .collect())
}

pub fn triangle(n: usize, low: f32, high: f32, period: f64, phase: f64) -> Result<Vec<f32>> {
    check_period(period, phase)?;
    let span = f64::from(high - low);
    Ok((0..n)
        .map(|i| {
            let norm = normalized_phase(period, phase, i);
            (f64::from(low) + (1.0 - norm * 2.0).abs() * span) as f32
        })
        .collect())
}

fn check_period(period: f64, phase: f64) -> Result<()> {
    if !period.is_finite() || period <= 0.0 {
        return Err(Error::invalid(format!("period must be positive, got {}", period)));
    }
    if !phase.is_finite() {
        return Err(Error::invalid("phase must be finite"));
    }
    Ok(())
}

/// Position of sample `i` within its cycle, in [0, 1).
fn normalized_phase(period: f64, phase: f64, i: usize) -> f64 {
    let norm = ((phase + i as f64) % period) / period;
    if norm < 0.0 {
        norm + 1.0
    } else {
        norm
    }
}
