use geo::{Coord, Point, Rect};
use serde::Serialize;

/// A known congestion site as loaded from the input CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BottleneckRecord {
    pub area: String,
    pub signal_junction: String,
    pub landmark: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl BottleneckRecord {
    // geo convention: x = longitude, y = latitude
    pub fn center(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

pub type VehicleCount = u32;

/// A record paired with its synthetic load. This is one row of the table view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountedRecord {
    #[serde(flatten)]
    pub record: BottleneckRecord,
    pub vehicle_count: VehicleCount,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionZone {
    pub bounds: Rect<f64>,
}

impl CongestionZone {
    pub fn around(center: Point<f64>, half_size: f64) -> Self {
        let bounds = Rect::new(
            Coord { x: center.x() - half_size, y: center.y() - half_size },
            Coord { x: center.x() + half_size, y: center.y() + half_size },
        );
        Self { bounds }
    }

    /// South-west corner as (lat, lon).
    pub fn south_west(&self) -> (f64, f64) {
        (self.bounds.min().y, self.bounds.min().x)
    }

    /// North-east corner as (lat, lon).
    pub fn north_east(&self) -> (f64, f64) {
        (self.bounds.max().y, self.bounds.max().x)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerPopup {
    pub area: String,
    pub landmark: String,
    pub vehicles: VehicleCount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub location: Point<f64>,
    pub popup: MarkerPopup,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehiclePoint {
    pub point: Point<f64>,
}

/// Everything drawn on the map for a single bottleneck.
#[derive(Debug, Clone)]
pub struct GeometryBundle {
    pub zone: CongestionZone,
    pub marker: Marker,
    pub vehicles: Vec<VehiclePoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapView {
    pub center: Point<f64>,
    pub zoom_start: u8,
    pub tile_url: String,
    pub disable_clustering_at_zoom: u8,
}

/// Output of one pipeline pass, ready for the presentation layer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<CountedRecord>,
    pub bundles: Vec<GeometryBundle>,
    pub view: MapView,
}

impl Snapshot {
    pub fn total_vehicles(&self) -> usize {
        self.bundles.iter().map(|b| b.vehicles.len()).sum()
    }
}
