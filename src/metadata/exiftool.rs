// ExifTool argument contract for writing sidecar metadata into media files
//
// Photos get EXIF/IPTC tags, videos get QuickTime/Keys tags. Times are written
// as local wall-clock time in the configured offset; for videos exiftool is
// told to store QuickTime dates as UTC.

use std::path::Path;
use chrono::{DateTime, FixedOffset, Local, Utc};
use crate::catalog::sidecar::SidecarRecord;
use crate::constants::TOOL_OUTPUT_EXCERPT;
use crate::error::{MigrateError, Result};
use crate::tools::CommandRunner;

/// Format used by EXIF date tags.
pub const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Capture time in the offset the tags are written in.
pub fn local_capture_time(taken_at: DateTime<Utc>, offset: Option<FixedOffset>) -> DateTime<FixedOffset> {
    match offset {
        Some(offset) => taken_at.with_timezone(&offset),
        None => taken_at.with_timezone(&Local).fixed_offset(),
    }
}

/// Tag assignments for one record, without the target path.
/// Empty when the record has nothing to embed.
pub fn tag_args(record: &SidecarRecord, is_video: bool, offset: Option<FixedOffset>) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(taken_at) = record.taken_at {
        let local = local_capture_time(taken_at, offset);
        let date = local.format(EXIF_DATE_FORMAT).to_string();
        if is_video {
            let with_zone = format!("{}{}", date, local.format("%:z"));
            args.push(format!("-QuickTime:CreateDate={}", with_zone));
            args.push(format!("-QuickTime:ModifyDate={}", with_zone));
            args.push(format!("-Keys:CreationDate={}", with_zone));
        } else {
            args.push(format!("-DateTimeOriginal={}", date));
            args.push(format!("-CreateDate={}", date));
            args.push(format!("-ModifyDate={}", date));
            args.push(format!("-OffsetTimeOriginal={}", local.format("%:z")));
        }
    }

    if let Some(gps) = record.gps {
        if is_video {
            let alt = gps.altitude.unwrap_or(0.0);
            args.push(format!("-Keys:GPSCoordinates={}, {}, {}", gps.latitude, gps.longitude, alt));
        } else {
            let lat_ref = if gps.latitude >= 0.0 { "N" } else { "S" };
            let lon_ref = if gps.longitude >= 0.0 { "E" } else { "W" };
            args.push(format!("-GPSLatitude={}", gps.latitude.abs()));
            args.push(format!("-GPSLatitudeRef={}", lat_ref));
            args.push(format!("-GPSLongitude={}", gps.longitude.abs()));
            args.push(format!("-GPSLongitudeRef={}", lon_ref));
            if let Some(alt) = gps.altitude {
                args.push(format!("-GPSAltitude={}", alt.abs()));
                args.push(format!("-GPSAltitudeRef={}", if alt >= 0.0 { 0 } else { 1 }));
            }
        }
    }

    if let Some(description) = &record.description {
        if is_video {
            args.push(format!("-Keys:Description={}", description));
        } else {
            args.push(format!("-ImageDescription={}", description));
            args.push(format!("-Caption-Abstract={}", description));
            args.push(format!("-XMP-dc:Description={}", description));
        }
    }

    args
}

/// Full argument list for an in-place write of `target`.
pub fn build_args(target: &Path, tags: &[String], is_video: bool) -> Vec<String> {
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-P".to_string(),
        "-charset".to_string(),
        "iptc=UTF8".to_string(),
    ];
    if is_video {
        args.push("-api".to_string());
        args.push("QuickTimeUTC".to_string());
    }
    args.extend(tags.iter().cloned());
    args.push(target.to_string_lossy().to_string());
    args
}

/// Run exiftool. A non-zero exit becomes `Embed` with the tool's diagnostic.
pub fn write_tags(runner: &dyn CommandRunner, exiftool: &Path, args: &[String]) -> Result<()> {
    let output = runner
        .run(exiftool, args)
        .map_err(|e| MigrateError::Embed(format!("Failed to run exiftool: {}", e)))?;

    if !output.success() {
        return Err(MigrateError::Embed(excerpt(&output.combined())));
    }
    Ok(())
}

/// First part of a tool's output, for error records.
pub fn excerpt(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return "no output".to_string();
    }
    trimmed.chars().take(TOOL_OUTPUT_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sidecar::{GeoPoint, SidecarKey};

    fn record() -> SidecarRecord {
        SidecarRecord {
            unit: "a.zip/x.jpg.json".to_string(),
            file_name: "x.jpg.json".to_string(),
            key: SidecarKey { base: "x.jpg".to_string(), counter: None },
            title: Some("x.jpg".to_string()),
            taken_at: DateTime::<Utc>::from_timestamp(1672574400, 0),
            gps: Some(GeoPoint { latitude: -33.8688, longitude: 151.2093, altitude: Some(-5.0) }),
            description: Some("Harbour".to_string()),
            albums: vec![],
        }
    }

    fn utc_plus_one() -> Option<FixedOffset> {
        FixedOffset::east_opt(3600)
    }

    #[test]
    fn test_photo_tags() {
        let args = tag_args(&record(), false, utc_plus_one());
        // 2023-01-01 12:00:00 UTC
        assert!(args.contains(&"-DateTimeOriginal=2023:01:01 13:00:00".to_string()));
        assert!(args.contains(&"-CreateDate=2023:01:01 13:00:00".to_string()));
        assert!(args.contains(&"-OffsetTimeOriginal=+01:00".to_string()));
        assert!(args.contains(&"-GPSLatitude=33.8688".to_string()));
        assert!(args.contains(&"-GPSLatitudeRef=S".to_string()));
        assert!(args.contains(&"-GPSLongitudeRef=E".to_string()));
        assert!(args.contains(&"-GPSAltitudeRef=1".to_string()));
        assert!(args.contains(&"-ImageDescription=Harbour".to_string()));
        assert!(args.contains(&"-Caption-Abstract=Harbour".to_string()));
    }

    #[test]
    fn test_video_tags() {
        let args = tag_args(&record(), true, utc_plus_one());
        assert!(args.contains(&"-QuickTime:CreateDate=2023:01:01 13:00:00+01:00".to_string()));
        assert!(args.contains(&"-Keys:GPSCoordinates=-33.8688, 151.2093, -5".to_string()));
        assert!(args.contains(&"-Keys:Description=Harbour".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-DateTimeOriginal")));

        let full = build_args(Path::new("/out/v.mp4"), &args, true);
        assert_eq!(&full[..2], &["-overwrite_original".to_string(), "-P".to_string()]);
        assert!(full.windows(2).any(|w| w[0] == "-api" && w[1] == "QuickTimeUTC"));
        assert_eq!(full.last().unwrap(), "/out/v.mp4");
    }

    #[test]
    fn test_empty_record_has_no_tags() {
        let mut r = record();
        r.taken_at = None;
        r.gps = None;
        r.description = None;
        assert!(tag_args(&r, false, None).is_empty());
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(500);
        assert_eq!(excerpt(&long).len(), TOOL_OUTPUT_EXCERPT);
        assert_eq!(excerpt("  \n"), "no output");
    }
}
