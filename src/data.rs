use crate::error::PipelineError;
use crate::types::BottleneckRecord;
use anyhow::Result;
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const REQUIRED_COLUMNS: [&str; 5] = [
    "area",
    "signal_junction",
    "landmark",
    "latitude",
    "longitude",
];

struct ColumnIndices {
    area: usize,
    signal_junction: usize,
    landmark: usize,
    latitude: usize,
    longitude: usize,
}

impl ColumnIndices {
    fn from_headers(path: &Path, headers: &StringRecord) -> Result<Self, PipelineError> {
        let find = |name: &str| {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                PipelineError::data_source(path, format!("column '{}' not found in CSV", name))
            })
        };
        Ok(Self {
            area: find(REQUIRED_COLUMNS[0])?,
            signal_junction: find(REQUIRED_COLUMNS[1])?,
            landmark: find(REQUIRED_COLUMNS[2])?,
            latitude: find(REQUIRED_COLUMNS[3])?,
            longitude: find(REQUIRED_COLUMNS[4])?,
        })
    }
}

/// Loads bottleneck rows, dropping any whose coordinates are not usable numbers.
pub fn load_data(path: &Path) -> Result<Vec<BottleneckRecord>> {
    info!("Loading bottleneck data from {:?}...", path);

    let file = File::open(path).map_err(|e| PipelineError::data_source(path, e))?;
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(file);
    let headers = rdr.headers().map_err(|e| PipelineError::data_source(path, e))?.clone();
    let columns = ColumnIndices::from_headers(path, &headers)?;

    let mut records = Vec::new();
    let mut dropped = 0usize;

    for result in rdr.records() {
        let row = result.map_err(|e| PipelineError::data_source(path, e))?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let field = |idx: usize| row.get(idx).unwrap_or("").trim();

        let latitude = match parse_coordinate(field(columns.latitude), 90.0) {
            Some(v) => v,
            None => {
                warn!(
                    line,
                    field = "latitude",
                    value = field(columns.latitude),
                    "Dropping row with invalid coordinate"
                );
                dropped += 1;
                continue;
            }
        };
        let longitude = match parse_coordinate(field(columns.longitude), 180.0) {
            Some(v) => v,
            None => {
                warn!(
                    line,
                    field = "longitude",
                    value = field(columns.longitude),
                    "Dropping row with invalid coordinate"
                );
                dropped += 1;
                continue;
            }
        };

        records.push(BottleneckRecord {
            area: field(columns.area).to_string(),
            signal_junction: field(columns.signal_junction).to_string(),
            landmark: field(columns.landmark).to_string(),
            latitude,
            longitude,
        });
    }

    info!("Loaded {} bottlenecks ({} rows dropped)", records.len(), dropped);
    Ok(records)
}

fn parse_coordinate(raw: &str, limit: f64) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    (value.is_finite() && value.abs() <= limit).then_some(value)
}

/// Process-wide memo of loaded datasets, keyed on the canonical source path.
/// Failed loads are not cached, so a fixed file is picked up on the next call.
#[derive(Default)]
pub struct DatasetCache {
    entries: Mutex<HashMap<PathBuf, Arc<Vec<BottleneckRecord>>>>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, path: &Path) -> Result<Arc<Vec<BottleneckRecord>>> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if let Some(cached) = self.lock().get(&key) {
            debug!("Dataset cache hit for {:?}", key);
            return Ok(Arc::clone(cached));
        }

        let records = Arc::new(load_data(path)?);
        let mut entries = self.lock();
        let entry = entries.entry(key).or_insert(records);
        Ok(Arc::clone(entry))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<Vec<BottleneckRecord>>>> {
        // Entries are only ever inserted whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
