use anyhow::Result;
use rstar::{RTreeObject, AABB};

pub const CLASS_UNCLASSIFIED: u8 = 1;
pub const CLASS_GROUND: u8 = 2;
pub const CLASS_NOISE: u8 = 7;

/// GPS times closer than this (seconds) belong to the same emission event.
const PULSE_TIME_TOLERANCE: f64 = 1e-6;

/// One LiDAR return.
///
/// `classification` and `number_of_returns` are the only mutable attributes;
/// both are corrected in place during ground classification. The pulse id and
/// buffer flag are derived, never persisted.
#[derive(Debug, Clone)]
pub struct LidarPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub classification: u8,
    /// GPS time of the emission, NaN when the source format carries none.
    pub gps_time: f64,
}

/// Map las classification enum to the numeric ASPRS code.
fn classification_to_u8(c: &las::point::Classification) -> u8 {
    match c {
        las::point::Classification::CreatedNeverClassified => 0,
        las::point::Classification::Unclassified => CLASS_UNCLASSIFIED,
        las::point::Classification::Ground => CLASS_GROUND,
        las::point::Classification::LowVegetation => 3,
        las::point::Classification::MediumVegetation => 4,
        las::point::Classification::HighVegetation => 5,
        las::point::Classification::Building => 6,
        las::point::Classification::LowPoint => CLASS_NOISE,
        las::point::Classification::ModelKeyPoint => 8,
        las::point::Classification::Water => 9,
        _ => CLASS_UNCLASSIFIED,
    }
}

impl LidarPoint {
    pub fn from_las(p: &las::Point) -> Self {
        LidarPoint {
            x: p.x,
            y: p.y,
            z: p.z,
            return_number: p.return_number,
            number_of_returns: p.number_of_returns,
            classification: classification_to_u8(&p.classification),
            gps_time: p.gps_time.unwrap_or(f64::NAN),
        }
    }

    /// Convert back to a las point (point format 1, GPS time carried).
    pub fn to_las(&self) -> Result<las::Point> {
        let mut p = las::Point {
            x: self.x,
            y: self.y,
            z: self.z,
            ..Default::default()
        };
        p.return_number = self.return_number.clamp(1, 7);
        p.number_of_returns = self.number_of_returns.clamp(1, 7);
        p.classification = las::point::Classification::new(self.classification)?;
        p.gps_time = Some(if self.gps_time.is_finite() {
            self.gps_time
        } else {
            0.0
        });
        Ok(p)
    }

    pub fn is_last_return(&self) -> bool {
        self.return_number >= self.number_of_returns
    }

    pub fn is_ground(&self) -> bool {
        self.classification == CLASS_GROUND
    }

    pub fn is_noise(&self) -> bool {
        self.classification == CLASS_NOISE
    }

    pub fn has_finite_coords(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl RTreeObject for LidarPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

/// Rebuild pulse groupings and repair `number_of_returns`.
///
/// Consecutive points sharing a GPS time form one pulse; the grouping is
/// deliberately independent of the (possibly unreliable) return numbering.
/// Every member's `number_of_returns` is overwritten with the maximum
/// `return_number` observed in its pulse, which the ground filter requires
/// for correct last-return identification. Points without GPS time degrade
/// to single-point pulses.
///
/// Returns the number of pulses found.
pub fn regroup_pulses(points: &mut [LidarPoint]) -> usize {
    let len = points.len();
    let mut pulses = 0;
    let mut start = 0;
    while start < len {
        let t = points[start].gps_time;
        let mut end = start + 1;
        if t.is_finite() {
            while end < len
                && points[end].gps_time.is_finite()
                && (points[end].gps_time - t).abs() <= PULSE_TIME_TOLERANCE
            {
                end += 1;
            }
        }
        let max_rn = points[start..end]
            .iter()
            .map(|p| p.return_number)
            .max()
            .unwrap_or(1)
            .max(1);
        for p in &mut points[start..end] {
            p.number_of_returns = max_rn;
        }
        pulses += 1;
        start = end;
    }
    pulses
}
