//! Zone bounds and grade evaluation on the 0-100 track

use serde::{Deserialize, Serialize};

use super::types::{QteGrade, QteInput};

/// Zones are centred on the middle of the track
pub const TRACK_CENTER: f64 = 50.0;

/// Inclusive start/end of the hit and perfect zones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneBounds {
    pub hit_zone_start: f64,
    pub hit_zone_end: f64,
    pub perfect_zone_start: f64,
    pub perfect_zone_end: f64,
}

impl ZoneBounds {
    /// Expand both zones symmetrically around the track centre. The perfect
    /// zone never exceeds the hit zone.
    pub fn from_sizes(hit_zone_size: f64, perfect_zone_size: f64) -> Self {
        let hit = hit_zone_size.max(0.0);
        let perfect = perfect_zone_size.max(0.0).min(hit);

        Self {
            hit_zone_start: TRACK_CENTER - hit / 2.0,
            hit_zone_end: TRACK_CENTER + hit / 2.0,
            perfect_zone_start: TRACK_CENTER - perfect / 2.0,
            perfect_zone_end: TRACK_CENTER + perfect / 2.0,
        }
    }

    pub fn in_perfect(&self, position: f64) -> bool {
        position >= self.perfect_zone_start && position <= self.perfect_zone_end
    }

    pub fn in_hit(&self, position: f64) -> bool {
        position >= self.hit_zone_start && position <= self.hit_zone_end
    }
}

/// Grade a reported marker position. Timing-agnostic: callers decide whether
/// the response arrived inside its window.
pub fn evaluate_grade(input: QteInput, position: f64, zones: &ZoneBounds) -> QteGrade {
    if input == QteInput::None {
        return QteGrade::Fail;
    }
    if zones.in_perfect(position) {
        QteGrade::Perfect
    } else if zones.in_hit(position) {
        QteGrade::Hit
    } else {
        QteGrade::Fail
    }
}
