//! Position signals available before an image has been reconstructed.

use glam::DVec3;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Geographic coordinate as captured in photo metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

/// Maps geographic coordinates into the main reconstruction frame.
///
/// Uses a local tangent plane at `origin`: x east, y up, z north, divided by
/// `meters_per_unit`. Adequate for tiles a few kilometres across.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFrame {
    pub origin: GeoCoord,
    pub meters_per_unit: f64,
}

impl GeoFrame {
    pub fn to_local(&self, coord: &GeoCoord) -> DVec3 {
        let lat0 = self.origin.latitude.to_radians();
        let d_lat = (coord.latitude - self.origin.latitude).to_radians();
        let d_lon = (coord.longitude - self.origin.longitude).to_radians();

        let east = d_lon * lat0.cos() * EARTH_RADIUS_METERS;
        let north = d_lat * EARTH_RADIUS_METERS;
        let up = match (coord.altitude, self.origin.altitude) {
            (Some(alt), Some(alt0)) => alt - alt0,
            _ => 0.0,
        };

        DVec3::new(east, up, north) / self.meters_per_unit
    }
}

/// Where an image is believed to be before reconstruction says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PositionSignal {
    #[default]
    None,
    /// Already expressed in the main reconstruction frame.
    Local(DVec3),
    Geographic(GeoCoord),
}

impl PositionSignal {
    /// Resolves the signal into the main frame. Geographic signals need a frame.
    pub fn resolve(&self, geo_frame: Option<&GeoFrame>) -> Option<DVec3> {
        match self {
            PositionSignal::None => None,
            PositionSignal::Local(position) => Some(*position),
            PositionSignal::Geographic(coord) => geo_frame.map(|frame| frame.to_local(coord)),
        }
    }
}
