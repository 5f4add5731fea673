//! Per-device calibration coefficients, their EEPROM image and the text
//! format calibration rigs produce.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::ChannelId;

pub const CAL_ROWS: usize = 8;

/// Marker word the firmware stores in front of a valid calibration image.
pub const EEPROM_VALID: u32 = 0x01ee_02dd;

/// Size of the calibration image: magic plus three rows of f32.
pub const EEPROM_SIZE: usize = 4 + CAL_ROWS * 3 * 4;

/// Which of a channel's four calibration rows applies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalKind {
    MeasureVoltage,
    MeasureCurrent,
    SourceVoltage,
    SourceCurrent,
}

impl CalKind {
    pub fn row(self, channel: ChannelId) -> usize {
        let offset = match self {
            CalKind::MeasureVoltage => 0,
            CalKind::MeasureCurrent => 1,
            CalKind::SourceVoltage => 2,
            CalKind::SourceCurrent => 3,
        };
        channel.index() * 4 + offset
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub offset: [f32; CAL_ROWS],
    pub gain_p: [f32; CAL_ROWS],
    pub gain_n: [f32; CAL_ROWS],
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            offset: [0.0; CAL_ROWS],
            gain_p: [1.0; CAL_ROWS],
            gain_n: [1.0; CAL_ROWS],
        }
    }
}

impl Calibration {
    pub fn identity() -> Calibration {
        Calibration::default()
    }

    pub fn is_identity(&self) -> bool {
        *self == Calibration::identity()
    }

    /// `[offset, positive gain, negative gain]` for each of the 8 rows.
    pub fn rows(&self) -> Vec<[f32; 3]> {
        (0..CAL_ROWS)
            .map(|i| [self.offset[i], self.gain_p[i], self.gain_n[i]])
            .collect()
    }

    /// Parses a calibration file. Every section sits between a `</>` line
    /// and a `<\>` line and lists `<reference, measured>` points, the first
    /// of which fixes the offset.
    pub fn parse(text: &str) -> Result<Calibration> {
        let mut cal = Calibration::identity();
        let mut row = 0;
        let mut section: Option<Vec<(f32, f32)>> = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.starts_with("</>") {
                section = Some(Vec::new());
                continue;
            }
            let points = match section.as_mut() {
                Some(points) => points,
                None => continue,
            };
            if line.starts_with("<\\>") {
                if points.is_empty() {
                    return Err(malformed(format!("empty section ending on line {}", lineno + 1)));
                }
                if row >= CAL_ROWS {
                    return Err(malformed(format!("more than {} sections", CAL_ROWS)));
                }
                fit_row(&mut cal, row, points)?;
                row += 1;
                section = None;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let point = parse_point(line)
                .ok_or_else(|| malformed(format!("bad point on line {}: {:?}", lineno + 1, line)))?;
            points.push(point);
        }

        if row != CAL_ROWS {
            return Err(malformed(format!("expected {} sections, found {}", CAL_ROWS, row)));
        }
        Ok(cal)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Calibration> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::device(
                format!("failed reading calibration file {}: {}", path.display(), e),
                e.raw_os_error().unwrap_or(libc::ENOENT),
            )
        })?;
        debug!("parsing calibration file {}", path.display());
        Calibration::parse(&text)
    }

    pub fn to_eeprom(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EEPROM_SIZE);
        buf.extend_from_slice(&EEPROM_VALID.to_le_bytes());
        for table in [&self.offset, &self.gain_p, &self.gain_n].iter() {
            for v in table.iter() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf
    }

    /// Decodes an EEPROM image. Anything short or without the marker word
    /// reads as identity.
    pub fn from_eeprom(buf: &[u8]) -> Calibration {
        if buf.len() < EEPROM_SIZE || read_u32(buf, 0) != EEPROM_VALID {
            return Calibration::identity();
        }
        let mut cal = Calibration::identity();
        for i in 0..CAL_ROWS {
            cal.offset[i] = read_f32(buf, 4 + i * 4);
            cal.gain_p[i] = read_f32(buf, 4 + (CAL_ROWS + i) * 4);
            cal.gain_n[i] = read_f32(buf, 4 + (2 * CAL_ROWS + i) * 4);
        }
        cal
    }

    pub fn correct_voltage(&self, channel: ChannelId, v: f32) -> f32 {
        let row = CalKind::MeasureVoltage.row(channel);
        (v - self.offset[row]) * self.gain_p[row]
    }

    pub fn correct_current(&self, channel: ChannelId, i: f32) -> f32 {
        let row = CalKind::MeasureCurrent.row(channel);
        (i - self.offset[row]) * self.signed_gain(row, i)
    }

    /// Maps a requested output value onto what the DAC must be told.
    pub fn source_voltage(&self, channel: ChannelId, v: f32) -> f32 {
        let row = CalKind::SourceVoltage.row(channel);
        (v - self.offset[row]) * self.gain_p[row]
    }

    pub fn source_current(&self, channel: ChannelId, i: f32) -> f32 {
        let row = CalKind::SourceCurrent.row(channel);
        (i - self.offset[row]) * self.signed_gain(row, i)
    }

    fn signed_gain(&self, row: usize, v: f32) -> f32 {
        if v > 0.0 {
            self.gain_p[row]
        } else {
            self.gain_n[row]
        }
    }
}

fn fit_row(cal: &mut Calibration, row: usize, points: &[(f32, f32)]) -> Result<()> {
    let offset = points[0].1 - points[0].0;
    let (mut sum_p, mut cnt_p, mut sum_n, mut cnt_n) = (0.0f32, 0, 0.0f32, 0);
    for &(reference, measured) in &points[1..] {
        let gain = reference / (measured - offset);
        if !gain.is_finite() {
            return Err(malformed(format!("degenerate point <{}, {}> in section {}", reference, measured, row + 1)));
        }
        if reference > 0.0 {
            sum_p += gain;
            cnt_p += 1;
        } else {
            sum_n += gain;
            cnt_n += 1;
        }
    }
    cal.offset[row] = offset;
    cal.gain_p[row] = if cnt_p > 0 { sum_p / cnt_p as f32 } else { 1.0 };
    cal.gain_n[row] = if cnt_n > 0 { sum_n / cnt_n as f32 } else { 1.0 };
    Ok(())
}

fn parse_point(line: &str) -> Option<(f32, f32)> {
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    let mut parts = inner.split(',');
    let reference = parts.next()?.trim().parse().ok()?;
    let measured = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((reference, measured))
}

fn malformed(message: String) -> Error {
    Error::device(format!("invalid calibration file: {}", message), libc::EINVAL)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_bits(read_u32(buf, at))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Calibration text with an offset of 0.01 and unity gains everywhere.
    pub(crate) fn sample_file() -> String {
        let mut text = String::new();
        for i in 0..CAL_ROWS {
            text.push_str(&format!("# row {}\n</>\n", i));
            text.push_str("<0.0000, 0.0100>\n<1.0000, 1.0100>\n<-1.0000, -0.9900>\n<\\>\n\n");
        }
        text
    }

    #[test]
    fn test_identity() {
        let cal = Calibration::identity();
        assert!(cal.is_identity());
        assert_eq!(cal.rows(), vec![[0.0, 1.0, 1.0]; CAL_ROWS]);
    }

    #[test]
    fn test_parse_offsets_and_gains() {
        let cal = Calibration::parse(&sample_file()).unwrap();
        for row in cal.rows() {
            assert!((row[0] - 0.01).abs() < 1e-6);
            assert!((row[1] - 1.0).abs() < 1e-5);
            assert!((row[2] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_parse_rejects_wrong_section_count() {
        let text: String = sample_file().lines().take(12).collect::<Vec<_>>().join("\n");
        let err = Calibration::parse(&text).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_parse_rejects_garbage_points() {
        let text = sample_file().replacen("<1.0000, 1.0100>", "<one, 1.01>", 1);
        assert!(Calibration::parse(&text).is_err());
    }

    #[test]
    fn test_eeprom_image() {
        let mut cal = Calibration::identity();
        cal.offset[3] = 0.25;
        cal.gain_n[7] = 0.5;
        let image = cal.to_eeprom();
        assert_eq!(image.len(), EEPROM_SIZE);
        assert_eq!(Calibration::from_eeprom(&image), cal);
        assert!(Calibration::from_eeprom(&[0u8; EEPROM_SIZE]).is_identity());
    }

    #[test]
    fn test_current_gain_follows_sign() {
        let mut cal = Calibration::identity();
        let row = CalKind::MeasureCurrent.row(ChannelId::B);
        assert_eq!(row, 5);
        cal.gain_p[row] = 2.0;
        cal.gain_n[row] = 0.5;
        assert_eq!(cal.correct_current(ChannelId::B, 0.1), 0.2);
        assert_eq!(cal.correct_current(ChannelId::B, -0.1), -0.05);
        assert_eq!(cal.correct_current(ChannelId::A, 0.1), 0.1);
    }
}
