use crate::config::AppConfig;
use crate::types::{CountedRecord, GeometryBundle, Snapshot};
use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const HTML_FILE: &str = "index.html";
pub const GEOJSON_FILE: &str = "bottlenecks.geojson";
pub const TABLE_FILE: &str = "bottlenecks.csv";

const TABLE_COLUMNS: [&str; 6] = [
    "area",
    "signal_junction",
    "landmark",
    "latitude",
    "longitude",
    "vehicle_count",
];

const LEAFLET_CDN: &str = "https://unpkg.com/leaflet@1.9.4/dist";
const MARKERCLUSTER_CDN: &str = "https://unpkg.com/leaflet.markercluster@1.5.3/dist";

pub fn write_outputs(config: &AppConfig, snapshot: &Snapshot) -> Result<()> {
    let out_dir = &config.output.dir;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", out_dir))?;

    let html_path = out_dir.join(HTML_FILE);
    fs::write(&html_path, render_html(snapshot, &config.map.title)?)
        .with_context(|| format!("Failed to write {:?}", html_path))?;

    let geojson_path = out_dir.join(GEOJSON_FILE);
    let geojson = serde_json::to_string(&to_geojson(snapshot)).context("Failed to encode GeoJSON")?;
    fs::write(&geojson_path, geojson)
        .with_context(|| format!("Failed to write {:?}", geojson_path))?;

    let table_path = out_dir.join(TABLE_FILE);
    write_table_csv(&table_path, &snapshot.rows)?;

    info!("Wrote dashboard to {:?}", out_dir);
    Ok(())
}

pub fn write_table_csv(path: &Path, rows: &[CountedRecord]) -> Result<()> {
    let mut wtr =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    write_table_rows(&mut wtr, rows)?;
    wtr.flush()?;
    Ok(())
}

/// Used by the server to send the table without touching disk.
pub fn table_csv_bytes(rows: &[CountedRecord]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    write_table_rows(&mut wtr, rows)?;
    wtr.into_inner().map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))
}

fn write_table_rows<W: Write>(wtr: &mut csv::Writer<W>, rows: &[CountedRecord]) -> Result<()> {
    wtr.write_record(TABLE_COLUMNS)?;
    for row in rows {
        let r = &row.record;
        wtr.write_record([
            r.area.as_str(),
            r.signal_junction.as_str(),
            r.landmark.as_str(),
            &r.latitude.to_string(),
            &r.longitude.to_string(),
            &row.vehicle_count.to_string(),
        ])?;
    }
    Ok(())
}

/// Zones as polygons, bottleneck markers and vehicles as points.
pub fn to_geojson(snapshot: &Snapshot) -> FeatureCollection {
    let mut features = Vec::with_capacity(snapshot.bundles.len() * 2 + snapshot.total_vehicles());

    for bundle in &snapshot.bundles {
        let popup = &bundle.marker.popup;

        let mut zone_props = JsonObject::new();
        zone_props.insert("kind".to_string(), json!("congestion_zone"));
        zone_props.insert("area".to_string(), json!(popup.area));
        features.push(feature(Value::from(&bundle.zone.bounds.to_polygon()), zone_props));

        let mut marker_props = JsonObject::new();
        marker_props.insert("kind".to_string(), json!("bottleneck"));
        marker_props.insert("area".to_string(), json!(popup.area));
        marker_props.insert("landmark".to_string(), json!(popup.landmark));
        marker_props.insert("vehicle_count".to_string(), json!(popup.vehicles));
        features.push(feature(Value::from(&bundle.marker.location), marker_props));

        for vehicle in &bundle.vehicles {
            let mut props = JsonObject::new();
            props.insert("kind".to_string(), json!("vehicle"));
            props.insert("area".to_string(), json!(popup.area));
            features.push(feature(Value::from(&vehicle.point), props));
        }
    }

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn feature(value: Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn render_html(snapshot: &Snapshot, title: &str) -> Result<String> {
    let view = &snapshot.view;
    let map_data = json!({
        "center": [view.center.y(), view.center.x()],
        "zoom": view.zoom_start,
        "tileUrl": view.tile_url,
        "disableClusteringAtZoom": view.disable_clustering_at_zoom,
        "bottlenecks": snapshot.bundles.iter().map(bundle_json).collect::<Vec<_>>(),
    });
    // A literal "</" inside the JSON would close the script element early.
    let map_data = serde_json::to_string(&map_data)
        .context("Failed to encode map data")?
        .replace("</", "<\\/");

    Ok(PAGE_TEMPLATE
        .replace("{{LEAFLET}}", LEAFLET_CDN)
        .replace("{{MARKERCLUSTER}}", MARKERCLUSTER_CDN)
        .replace("{{TITLE}}", &escape_html(title))
        .replace("{{TABLE}}", &render_table(&snapshot.rows))
        .replace("{{MAP_DATA}}", &map_data))
}

fn bundle_json(bundle: &GeometryBundle) -> serde_json::Value {
    let (south, west) = bundle.zone.south_west();
    let (north, east) = bundle.zone.north_east();
    let popup = &bundle.marker.popup;
    json!({
        "bounds": [[south, west], [north, east]],
        "marker": [bundle.marker.location.y(), bundle.marker.location.x()],
        "popup": format!(
            "<b>{}</b><br>Landmark: {}<br>Vehicles: {}",
            escape_html(&popup.area),
            escape_html(&popup.landmark),
            popup.vehicles
        ),
        "vehicles": bundle.vehicles.iter().map(|v| [v.point.y(), v.point.x()]).collect::<Vec<_>>(),
    })
}

fn render_table(rows: &[CountedRecord]) -> String {
    let mut html = String::from("<table>\n<thead><tr>");
    for column in TABLE_COLUMNS {
        html.push_str(&format!("<th>{}</th>", column));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        let r = &row.record;
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&r.area),
            escape_html(&r.signal_junction),
            escape_html(&r.landmark),
            r.latitude,
            r.longitude,
            row.vehicle_count
        ));
    }
    html.push_str("</tbody>\n</table>");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{TITLE}}</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<link rel="stylesheet" href="{{LEAFLET}}/leaflet.css">
<link rel="stylesheet" href="{{MARKERCLUSTER}}/MarkerCluster.css">
<link rel="stylesheet" href="{{MARKERCLUSTER}}/MarkerCluster.Default.css">
<style>
  body { font-family: sans-serif; margin: 0 1.5rem 2rem; }
  #map { width: 100%; height: 650px; }
  table { width: 100%; border-collapse: collapse; font-size: 0.9rem; }
  th, td { border-bottom: 1px solid #ddd; padding: 0.3rem 0.5rem; text-align: left; }
  .bottleneck-marker {
    width: 18px; height: 18px; border-radius: 50%;
    background: #d63e2a; border: 2px solid #fff; box-shadow: 0 0 3px rgba(0, 0, 0, 0.6);
  }
</style>
</head>
<body>
<h1>{{TITLE}}</h1>
<p>Traffic congestion visualization from GPS bottleneck data.</p>
<h2>Major Traffic Bottlenecks</h2>
{{TABLE}}
<h2>City-Scale Traffic Map (5&ndash;10 km)</h2>
<div id="map"></div>
<script src="{{LEAFLET}}/leaflet.js"></script>
<script src="{{MARKERCLUSTER}}/leaflet.markercluster.js"></script>
<script>
const data = {{MAP_DATA}};
const map = L.map("map").setView(data.center, data.zoom);
L.tileLayer(data.tileUrl, { attribution: "&copy; OpenStreetMap contributors" }).addTo(map);
L.control.scale().addTo(map);

const redIcon = L.divIcon({
  className: "",
  html: '<div class="bottleneck-marker"></div>',
  iconSize: [22, 22],
  iconAnchor: [11, 11],
  popupAnchor: [0, -11]
});
const vehicles = L.markerClusterGroup({ disableClusteringAtZoom: data.disableClusteringAtZoom });

for (const b of data.bottlenecks) {
  L.rectangle(b.bounds, { color: "red", fill: true, fillOpacity: 0.25, weight: 2 }).addTo(map);
  L.marker(b.marker, { icon: redIcon }).bindPopup(b.popup).addTo(map);
  for (const v of b.vehicles) {
    vehicles.addLayer(L.circleMarker(v, {
      radius: 2, color: "blue", fill: true, fillColor: "blue", fillOpacity: 0.9
    }));
  }
}
vehicles.addTo(map);
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::build_snapshot;
    use crate::types::BottleneckRecord;

    fn snapshot() -> Snapshot {
        let records = vec![
            BottleneckRecord {
                area: "Ameerpet".to_string(),
                signal_junction: "Ameerpet X Roads".to_string(),
                landmark: "Metro Station".to_string(),
                latitude: 17.4375,
                longitude: 78.4483,
            },
            BottleneckRecord {
                area: "<script>alert(1)</script>".to_string(),
                signal_junction: "Tank & Bund".to_string(),
                landmark: "\"Lake\"".to_string(),
                latitude: 17.4239,
                longitude: 78.4738,
            },
        ];
        build_snapshot(&AppConfig::default(), Path::new("gps_data.csv"), &records)
            .expect("snapshot")
    }

    #[test]
    fn html_uses_one_cluster_layer_and_escapes_text() {
        let snapshot = snapshot();
        let html = render_html(&snapshot, "Traffic & Roads").expect("render");

        assert_eq!(html.matches("markerClusterGroup(").count(), 1);
        assert!(html.contains("<title>Traffic &amp; Roads</title>"));
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(html.contains("Tank &amp; Bund"));
        assert!(!html.contains("<script>alert(1)"));
        assert!(html.contains("disableClusteringAtZoom\":15"));
        assert!(html.contains("L.divIcon("));
        assert!(!html.contains("hue-rotate"));
        let head_end = html.find("</head>").expect("head");
        let marker_css = html.find(".bottleneck-marker {").expect("marker css");
        assert!(marker_css < head_end);
        assert!(html.rfind("<style>").expect("style") < head_end);
        for column in TABLE_COLUMNS {
            assert!(html.contains(&format!("<th>{}</th>", column)));
        }
    }

    #[test]
    fn table_rows_follow_load_order() {
        let snapshot = snapshot();
        let html = render_html(&snapshot, "t").expect("render");
        let first = html.find("<td>Ameerpet</td>").expect("first row");
        let second = html.find("<td>Tank &amp; Bund</td>").expect("second row");
        assert!(first < second);
        assert!(html.contains(&format!("<td>{}</td></tr>", snapshot.rows[0].vehicle_count)));
    }

    #[test]
    fn geojson_has_zone_marker_and_every_vehicle() {
        let snapshot = snapshot();
        let collection = to_geojson(&snapshot);
        let kinds = |kind: &str| {
            collection
                .features
                .iter()
                .filter(|f| f.property("kind").and_then(|k| k.as_str()) == Some(kind))
                .count()
        };

        assert_eq!(kinds("congestion_zone"), 2);
        assert_eq!(kinds("bottleneck"), 2);
        assert_eq!(kinds("vehicle"), snapshot.total_vehicles());

        let marker = collection
            .features
            .iter()
            .find(|f| f.property("kind").and_then(|k| k.as_str()) == Some("bottleneck"))
            .expect("marker");
        assert_eq!(
            marker.property("vehicle_count").and_then(|v| v.as_u64()),
            Some(snapshot.rows[0].vehicle_count as u64)
        );
        match marker.geometry.as_ref().map(|g| &g.value) {
            Some(Value::Point(coords)) => assert_eq!(coords, &vec![78.4483, 17.4375]),
            other => panic!("unexpected marker geometry: {:?}", other),
        }
    }

    #[test]
    fn writes_all_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.output.dir = dir.path().join("out");
        let snapshot = snapshot();

        write_outputs(&config, &snapshot).expect("write");

        for name in [HTML_FILE, GEOJSON_FILE, TABLE_FILE] {
            assert!(config.output.dir.join(name).is_file(), "{} missing", name);
        }
        let table = fs::read_to_string(config.output.dir.join(TABLE_FILE)).expect("table");
        let mut lines = table.lines();
        assert_eq!(
            lines.next(),
            Some("area,signal_junction,landmark,latitude,longitude,vehicle_count")
        );
        assert_eq!(
            lines.next(),
            Some(
                format!(
                    "Ameerpet,Ameerpet X Roads,Metro Station,17.4375,78.4483,{}",
                    snapshot.rows[0].vehicle_count
                )
                .as_str()
            )
        );
        assert_eq!(table_csv_bytes(&snapshot.rows).expect("bytes"), table.into_bytes());
    }
}
