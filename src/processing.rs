use crate::config::{AppConfig, GenerationConfig};
use crate::error::PipelineError;
use crate::types::{
    BottleneckRecord, CongestionZone, CountedRecord, GeometryBundle, MapView, Marker, MarkerPopup,
    Snapshot, VehicleCount, VehiclePoint,
};
use anyhow::Result;
use geo::Point;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::info;

/// Draws one count per record, in order, from a single shared stream.
///
/// The generator is handed back so callers can keep drawing from the same stream.
pub fn assign_counts(
    records: &[BottleneckRecord],
    mut rng: StdRng,
    range: RangeInclusive<VehicleCount>,
) -> (Vec<VehicleCount>, StdRng) {
    let counts = records
        .iter()
        .map(|_| rng.gen_range(range.clone()))
        .collect();
    (counts, rng)
}

/// Builds the zone, marker and vehicle scatter for one bottleneck.
pub fn compose<R: Rng + ?Sized>(
    record: &BottleneckRecord,
    count: VehicleCount,
    generation: &GenerationConfig,
    rng: &mut R,
) -> GeometryBundle {
    let center = record.center();
    let zone = CongestionZone::around(center, generation.zone_half_size);

    let marker = Marker {
        location: center,
        popup: MarkerPopup {
            area: record.area.clone(),
            landmark: record.landmark.clone(),
            vehicles: count,
        },
    };

    let spread = generation.vehicle_spread;
    let vehicles = (0..count)
        .map(|_| {
            let dy: f64 = StandardNormal.sample(rng);
            let dx: f64 = StandardNormal.sample(rng);
            let lat = center.y() + dy * spread;
            let lon = center.x() + dx * spread;
            VehiclePoint { point: Point::new(lon, lat) }
        })
        .collect();

    GeometryBundle { zone, marker, vehicles }
}

/// Mean coordinate of all records, or `None` when there are none.
pub fn map_center(records: &[BottleneckRecord]) -> Option<Point<f64>> {
    if records.is_empty() {
        return None;
    }
    let n = records.len() as f64;
    let lat = records.iter().map(|r| r.latitude).sum::<f64>() / n;
    let lon = records.iter().map(|r| r.longitude).sum::<f64>() / n;
    Some(Point::new(lon, lat))
}

/// Runs counts, geometry and map view over an already loaded dataset.
pub fn build_snapshot(
    config: &AppConfig,
    source: &Path,
    records: &[BottleneckRecord],
) -> Result<Snapshot> {
    config.validate()?;
    let center = map_center(records).ok_or_else(|| PipelineError::EmptyDataset {
        path: source.to_path_buf(),
    })?;

    let generation = &config.generation;
    let rng = StdRng::seed_from_u64(generation.seed);
    let range = generation.min_vehicles..=generation.max_vehicles;
    let (counts, _rng) = assign_counts(records, rng, range);

    info!("Composing geometry for {} bottlenecks...", records.len());

    let bundles: Vec<GeometryBundle> = records
        .par_iter()
        .zip(counts.par_iter())
        .map(|(record, &count)| compose(record, count, generation, &mut rand::thread_rng()))
        .collect();

    let rows = records
        .iter()
        .zip(&counts)
        .map(|(record, &vehicle_count)| CountedRecord {
            record: record.clone(),
            vehicle_count,
        })
        .collect();

    let snapshot = Snapshot {
        rows,
        bundles,
        view: MapView {
            center,
            zoom_start: config.map.zoom_start,
            tile_url: config.map.tile_url.clone(),
            disable_clustering_at_zoom: config.map.disable_clustering_at_zoom,
        },
    };

    info!("Generated {} vehicles total.", snapshot.total_vehicles());
    Ok(snapshot)
}
