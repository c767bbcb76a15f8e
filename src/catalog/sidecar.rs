// Takeout JSON sidecar parsing
//
// Item sidecars carry the capture time, GPS, description and the original
// file name ("title"). Album directories carry a metadata.json whose title is
// the album's real name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::constants::SUPPLEMENTAL_MARKER;
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Name-derived matching key of a sidecar file.
/// `IMG.jpg(1).json` -> base `IMG.jpg`, counter `(1)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SidecarKey {
    pub base: String,
    pub counter: Option<String>,
}

impl SidecarKey {
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let ext_start = file_name.len().checked_sub(".json".len())?;
        if !file_name.is_char_boundary(ext_start) || !file_name[ext_start..].eq_ignore_ascii_case(".json") {
            return None;
        }
        let stem = &file_name[..ext_start];
        let (rest, counter) = split_counter(stem);
        Some(Self {
            base: strip_supplemental(rest).to_string(),
            counter: counter.map(str::to_string),
        })
    }

    /// Key as a single string, counter last.
    pub fn joined(&self) -> String {
        match &self.counter {
            Some(c) => format!("{}{}", self.base, c),
            None => self.base.clone(),
        }
    }
}

/// Split a trailing "(n)" counter off a name.
pub(crate) fn split_counter(name: &str) -> (&str, Option<&str>) {
    if !name.ends_with(')') {
        return (name, None);
    }
    match name.rfind('(') {
        Some(open) if open > 0 => {
            let digits = &name[open + 1..name.len() - 1];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                (&name[..open], Some(&name[open..]))
            } else {
                (name, None)
            }
        }
        _ => (name, None),
    }
}

/// Remove a possibly truncated ".supplemental-metadata" segment.
fn strip_supplemental(name: &str) -> &str {
    let Some(dot) = name.rfind('.') else {
        return name;
    };
    let segment = name[dot + 1..].to_lowercase();
    if segment.is_empty() || SUPPLEMENTAL_MARKER.starts_with(&segment) {
        &name[..dot]
    } else {
        name
    }
}

/// Parsed item sidecar. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarRecord {
    /// Stable identifier of the sidecar file
    pub unit: String,
    pub file_name: String,
    pub key: SidecarKey,
    /// Original file name as recorded by the export
    pub title: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub gps: Option<GeoPoint>,
    pub description: Option<String>,
    pub albums: Vec<String>,
}

impl SidecarRecord {
    /// True when there is at least one field worth embedding.
    pub fn has_embeddable_fields(&self) -> bool {
        self.taken_at.is_some() || self.gps.is_some() || self.description.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SidecarContent {
    Item(SidecarRecord),
    Album { title: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSidecar {
    title: Option<String>,
    description: Option<String>,
    photo_taken_time: Option<RawTime>,
    geo_data: Option<RawGeo>,
    geo_data_exif: Option<RawGeo>,
    #[serde(default)]
    albums: Vec<RawAlbumRef>,
}

#[derive(Debug, Deserialize)]
struct RawTime {
    timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawGeo {
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAlbumRef {
    Name(String),
    Titled { title: String },
}

/// Parse a sidecar JSON. `album_metadata_name` marks files named like an
/// album's metadata.json; those become `Album` unless they carry a capture time.
pub fn parse_sidecar(unit: &str, file_name: &str, bytes: &[u8], album_metadata_name: bool) -> Result<SidecarContent> {
    let raw: RawSidecar = serde_json::from_slice(bytes)?;

    if album_metadata_name && raw.photo_taken_time.is_none() {
        let title = raw.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        return Ok(SidecarContent::Album { title });
    }

    let key = SidecarKey::from_file_name(file_name)
        .ok_or_else(|| MigrateError::InvalidPath(format!("not a sidecar name: {}", file_name)))?;

    let taken_at = raw.photo_taken_time
        .and_then(|t| t.timestamp)
        .and_then(|v| timestamp_value(&v))
        .filter(|ts| *ts > 0)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    let gps = raw.geo_data
        .and_then(to_geo_point)
        .or_else(|| raw.geo_data_exif.and_then(to_geo_point));

    let description = raw.description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    let title = raw.title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let albums = raw.albums
        .into_iter()
        .map(|a| match a {
            RawAlbumRef::Name(n) => n,
            RawAlbumRef::Titled { title } => title,
        })
        .filter(|n| !n.trim().is_empty())
        .collect();

    Ok(SidecarContent::Item(SidecarRecord {
        unit: unit.to_string(),
        file_name: file_name.to_string(),
        key,
        title,
        taken_at,
        gps,
        description,
        albums,
    }))
}

/// Takeout writes epoch seconds as a string; accept numbers too.
fn timestamp_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// (0, 0) is how the export says "no location".
fn to_geo_point(geo: RawGeo) -> Option<GeoPoint> {
    let latitude = geo.latitude?;
    let longitude = geo.longitude?;
    if latitude == 0.0 && longitude == 0.0 {
        return None;
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(GeoPoint {
        latitude,
        longitude,
        altitude: geo.altitude.filter(|a| *a != 0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "title": "IMG_20230101_120000.jpg",
        "description": "  New year  ",
        "imageViews": "3",
        "creationTime": {"timestamp": "1672600000", "formatted": "..."},
        "photoTakenTime": {"timestamp": "1672574400", "formatted": "..."},
        "geoData": {"latitude": 0.0, "longitude": 0.0, "altitude": 0.0},
        "geoDataExif": {"latitude": 47.3769, "longitude": 8.5417, "altitude": 408.0},
        "url": "https://photos.google.com/photo/x"
    }"#;

    #[test]
    fn test_parse_item_sidecar() {
        let content = parse_sidecar("a.zip/x.jpg.json", "IMG_20230101_120000.jpg.json", FULL.as_bytes(), false).unwrap();
        let SidecarContent::Item(record) = content else {
            panic!("expected item sidecar");
        };
        assert_eq!(record.title.as_deref(), Some("IMG_20230101_120000.jpg"));
        assert_eq!(record.description.as_deref(), Some("New year"));
        assert_eq!(record.taken_at.unwrap().timestamp(), 1672574400);
        // geoData was (0,0), so geoDataExif wins
        let gps = record.gps.unwrap();
        assert_eq!(gps.latitude, 47.3769);
        assert_eq!(gps.altitude, Some(408.0));
        assert!(record.has_embeddable_fields());
    }

    #[test]
    fn test_numeric_timestamp_and_missing_fields() {
        let json = r#"{"title": "a.jpg", "photoTakenTime": {"timestamp": 1600000000}}"#;
        let SidecarContent::Item(record) = parse_sidecar("u", "a.jpg.json", json.as_bytes(), false).unwrap() else {
            panic!("expected item sidecar");
        };
        assert_eq!(record.taken_at.unwrap().timestamp(), 1600000000);
        assert!(record.gps.is_none());
        assert!(record.description.is_none());

        let json = r#"{"title": "b.jpg", "photoTakenTime": {"timestamp": "0"}}"#;
        let SidecarContent::Item(record) = parse_sidecar("u", "b.jpg.json", json.as_bytes(), false).unwrap() else {
            panic!("expected item sidecar");
        };
        assert!(!record.has_embeddable_fields());
    }

    #[test]
    fn test_album_references() {
        let json = r#"{"title": "a.jpg", "albums": ["Trip", {"title": "Family"}, " "]}"#;
        let SidecarContent::Item(record) = parse_sidecar("u", "a.jpg.json", json.as_bytes(), false).unwrap() else {
            panic!("expected item sidecar");
        };
        assert_eq!(record.albums, vec!["Trip".to_string(), "Family".to_string()]);
    }

    #[test]
    fn test_album_metadata_file() {
        let json = r#"{"title": "Urlaub: Italien", "description": "", "access": "protected"}"#;
        let content = parse_sidecar("u", "metadata.json", json.as_bytes(), true).unwrap();
        assert_eq!(content, SidecarContent::Album { title: Some("Urlaub: Italien".to_string()) });
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(parse_sidecar("u", "a.jpg.json", b"{not json", false).is_err());
    }

    #[test]
    fn test_sidecar_keys() {
        let k = SidecarKey::from_file_name("IMG_0001.jpg.json").unwrap();
        assert_eq!(k.joined(), "IMG_0001.jpg");

        let k = SidecarKey::from_file_name("IMG_0001.jpg(1).json").unwrap();
        assert_eq!(k.base, "IMG_0001.jpg");
        assert_eq!(k.counter.as_deref(), Some("(1)"));

        let k = SidecarKey::from_file_name("IMG_0001.jpg.supplemental-metadata.json").unwrap();
        assert_eq!(k.joined(), "IMG_0001.jpg");

        let k = SidecarKey::from_file_name("IMG_20230101_123456_long_name.jpg.supplemen.json").unwrap();
        assert_eq!(k.joined(), "IMG_20230101_123456_long_name.jpg");

        let k = SidecarKey::from_file_name("IMG_0001.jpg.supplemental-metadata(2).json").unwrap();
        assert_eq!(k.joined(), "IMG_0001.jpg(2)");

        let k = SidecarKey::from_file_name("IMG_0001.JSON").unwrap();
        assert_eq!(k.joined(), "IMG_0001");

        assert!(SidecarKey::from_file_name("IMG_0001.jpg").is_none());
    }

    #[test]
    fn test_split_counter() {
        assert_eq!(split_counter("IMG(12)"), ("IMG", Some("(12)")));
        assert_eq!(split_counter("IMG(a)"), ("IMG(a)", None));
        assert_eq!(split_counter("(1)"), ("(1)", None));
        assert_eq!(split_counter("IMG"), ("IMG", None));
    }
}
