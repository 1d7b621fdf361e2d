use crate::config::AppConfig;
use crate::data::DatasetCache;
use crate::processing::build_snapshot;
use crate::render;
use crate::types::{CongestionZone, CountedRecord, Snapshot};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use geojson::FeatureCollection;
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

// Wrapper for RTree indexing
struct ZoneEntry {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl ZoneEntry {
    fn new(index: usize, zone: &CongestionZone) -> Self {
        let (min, max) = (zone.bounds.min(), zone.bounds.max());
        Self {
            index,
            aabb: AABB::from_corners([min.x, min.y], [max.x, max.y]),
        }
    }
}

impl RTreeObject for ZoneEntry {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub cache: DatasetCache,
    pub rows: Vec<CountedRecord>,
    tree: RTree<ZoneEntry>,
}

impl AppState {
    /// Loads the dataset once up front so a bad source aborts startup.
    pub fn new(config: AppConfig) -> Result<Self> {
        let cache = DatasetCache::new();
        let records = cache.get_or_load(&config.input.data_csv)?;
        let snapshot = build_snapshot(&config, &config.input.data_csv, &records)?;

        info!("Building spatial index for {} congestion zones...", snapshot.bundles.len());
        let entries: Vec<ZoneEntry> = snapshot
            .bundles
            .iter()
            .enumerate()
            .map(|(i, bundle)| ZoneEntry::new(i, &bundle.zone))
            .collect();
        let tree = RTree::bulk_load(entries);

        Ok(Self {
            config,
            cache,
            rows: snapshot.rows,
            tree,
        })
    }

    /// One full pipeline pass: cached records, reproducible counts, fresh jitter.
    pub fn fresh_snapshot(&self) -> Result<Snapshot> {
        let source = &self.config.input.data_csv;
        let records = self.cache.get_or_load(source)?;
        build_snapshot(&self.config, source, &records)
    }

    /// First bottleneck (in load order) whose congestion zone covers the point.
    pub fn zone_at(&self, lat: f64, lon: f64) -> Option<&CountedRecord> {
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.index)
            .min()
            .and_then(|index| self.rows.get(index))
    }
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let port = config.server.port;
    let output_dir = config.output.dir.clone();
    let state = Arc::new(tokio::task::spawn_blocking(move || AppState::new(config)).await??);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let app = router(state, ServeDir::new(output_dir));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>, output_service: ServeDir) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/api/bottlenecks", get(bottlenecks_handler))
        .route("/api/bottlenecks.csv", get(table_csv_handler))
        .route("/api/map", get(map_handler))
        .route("/api/query", get(query_handler))
        .nest_service("/output", output_service)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn snapshot_for(state: &Arc<AppState>) -> Result<Snapshot, AppError> {
    let state = Arc::clone(state);
    let snapshot = tokio::task::spawn_blocking(move || state.fresh_snapshot()).await??;
    Ok(snapshot)
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Result<Html<String>, AppError> {
    let snapshot = snapshot_for(&state).await?;
    Ok(Html(render::render_html(&snapshot, &state.config.map.title)?))
}

async fn bottlenecks_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CountedRecord>> {
    Json(state.rows.clone())
}

async fn table_csv_handler(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let bytes = render::table_csv_bytes(&state.rows)?;
    Ok(([(header::CONTENT_TYPE, "text/csv")], bytes).into_response())
}

async fn map_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FeatureCollection>, AppError> {
    let snapshot = snapshot_for(&state).await?;
    Ok(Json(render::to_geojson(&snapshot)))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<CountedRecord>> {
    Json(state.zone_at(params.lat, params.lon).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::fs;

    fn state_with(dir: &tempfile::TempDir, body: &str) -> Result<AppState> {
        let path = dir.path().join("gps_data.csv");
        fs::write(&path, body).expect("write csv");
        let mut config = AppConfig::default();
        config.input.data_csv = path;
        config.output.dir = dir.path().join("output");
        AppState::new(config)
    }

    const DATA: &str = "area,signal_junction,landmark,latitude,longitude\n\
                        Ameerpet,Ameerpet X Roads,Metro Station,17.4375,78.4483\n\
                        Begumpet,Begumpet Signal,Airport Road,17.4440,78.4630\n\
                        Broken,Nowhere,Nothing,north,78.0\n";

    #[test]
    fn query_finds_covering_zone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_with(&dir, DATA).expect("state");

        assert_eq!(state.rows.len(), 2);
        let hit = state.zone_at(17.4380, 78.4480).expect("inside Ameerpet zone");
        assert_eq!(hit.record.area, "Ameerpet");
        let hit = state.zone_at(17.4440 + 0.0039, 78.4630 - 0.0039).expect("near Begumpet corner");
        assert_eq!(hit.record.area, "Begumpet");
        assert!(state.zone_at(17.40, 78.40).is_none());
    }

    #[test]
    fn empty_dataset_aborts_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = state_with(&dir, "area,signal_junction,landmark,latitude,longitude\n")
            .err()
            .expect("empty dataset must fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyDataset { .. })
        ));
    }

    #[tokio::test]
    async fn dashboard_counts_are_stable_across_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(state_with(&dir, DATA).expect("state"));

        let Json(rows) = bottlenecks_handler(State(Arc::clone(&state))).await;
        let first = snapshot_for(&state).await.ok().expect("first pass");
        let second = snapshot_for(&state).await.ok().expect("second pass");

        let counts = |s: &Snapshot| s.rows.iter().map(|r| r.vehicle_count).collect::<Vec<_>>();
        assert_eq!(counts(&first), counts(&second));
        assert_eq!(counts(&first), rows.iter().map(|r| r.vehicle_count).collect::<Vec<_>>());

        let Html(page) = dashboard_handler(State(Arc::clone(&state))).await.ok().expect("page");
        assert!(page.contains("<td>Begumpet Signal</td>"));
    }

    #[tokio::test]
    async fn query_handler_returns_null_outside_zones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(state_with(&dir, DATA).expect("state"));

        let Json(hit) = query_handler(
            State(Arc::clone(&state)),
            Query(QueryParams { lat: 17.4375, lon: 78.4483 }),
        )
        .await;
        assert_eq!(hit.map(|r| r.record.area), Some("Ameerpet".to_string()));

        let Json(miss) =
            query_handler(State(state), Query(QueryParams { lat: 0.0, lon: 0.0 })).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn table_csv_handler_serves_rows_as_csv() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(state_with(&dir, DATA).expect("state"));

        let response = table_csv_handler(State(Arc::clone(&state))).await.ok().expect("csv");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"text/csv"[..])
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("area,signal_junction,landmark,latitude,longitude,vehicle_count")
        );
        let first = format!(
            "Ameerpet,Ameerpet X Roads,Metro Station,17.4375,78.4483,{}",
            state.rows[0].vehicle_count
        );
        assert_eq!(lines.next(), Some(first.as_str()));
        assert_eq!(lines.count(), 1);
    }

    #[tokio::test]
    async fn map_handler_emits_every_vehicle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(state_with(&dir, DATA).expect("state"));

        let Json(collection) = map_handler(State(Arc::clone(&state))).await.ok().expect("map");
        let total: u32 = state.rows.iter().map(|r| r.vehicle_count).sum();
        // two zones, two markers, then one point per vehicle
        assert_eq!(collection.features.len(), 4 + total as usize);
    }
}
