use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEGREE: f64 = 111.0;
const MIN_LON_SCALE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        haversine_km(self.lat, self.lon, other.lat, other.lon)
    }
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let p1 = lat1.to_radians();
    let p2 = lat2.to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewbox {
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub min_lat: f64,
}

impl Viewbox {
    // Longitude scale is clamped so boxes near the poles stay finite.
    pub fn around(center: Coordinate, radius_km: f64) -> Self {
        let d_lat = radius_km / KM_PER_DEGREE;
        let lon_scale = center.lat.to_radians().cos().max(MIN_LON_SCALE);
        let d_lon = radius_km / (KM_PER_DEGREE * lon_scale);
        Self {
            min_lon: center.lon - d_lon,
            max_lat: center.lat + d_lat,
            max_lon: center.lon + d_lon,
            min_lat: center.lat - d_lat,
        }
    }

    pub fn to_query_value(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.max_lat, self.max_lon, self.min_lat
        )
    }
}
