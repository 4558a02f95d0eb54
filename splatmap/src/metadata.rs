//! Capture metadata read from EXIF: GPS position and original capture time.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use exif::{Exif, In, Rational, Reader, Tag, Value};
use tracing::debug;

use crate::geo::GeoCoord;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureMetadata {
    pub captured_at: Option<DateTime<Utc>>,
    pub geo: Option<GeoCoord>,
}

impl CaptureMetadata {
    /// Files without readable EXIF give empty metadata.
    pub fn read(path: &Path) -> Self {
        match read_exif(path) {
            Ok(exif) => Self::from_exif(&exif),
            Err(err) => {
                debug!("No EXIF in {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn from_exif(exif: &Exif) -> Self {
        Self {
            captured_at: capture_time(exif),
            geo: gps(exif),
        }
    }
}

fn read_exif(path: &Path) -> Result<Exif, exif::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    Reader::new().read_from_container(&mut reader)
}

fn value(exif: &Exif, tag: Tag) -> Option<&Value> {
    exif.get_field(tag, In::PRIMARY).map(|field| &field.value)
}

fn ascii(exif: &Exif, tag: Tag) -> Option<&[u8]> {
    match value(exif, tag)? {
        Value::Ascii(values) => values.first().map(Vec::as_slice),
        _ => None,
    }
}

fn rationals(exif: &Exif, tag: Tag) -> Option<&[Rational]> {
    match value(exif, tag)? {
        Value::Rational(values) => Some(values.as_slice()),
        _ => None,
    }
}

/// Degrees, minutes and seconds as signed decimal degrees.
fn coordinate(exif: &Exif, tag: Tag, reference: Tag, negative: u8) -> Option<f64> {
    let dms = rationals(exif, tag)?;
    if dms.len() < 3 || dms.iter().any(|part| part.denom == 0) {
        return None;
    }
    let degrees = dms[0].to_f64() + dms[1].to_f64() / 60.0 + dms[2].to_f64() / 3600.0;

    match ascii(exif, reference) {
        Some(r) if r.first() == Some(&negative) => Some(-degrees),
        _ => Some(degrees),
    }
}

fn gps(exif: &Exif) -> Option<GeoCoord> {
    let latitude = coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S')?;
    let longitude = coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W')?;

    let below_sea_level = matches!(
        value(exif, Tag::GPSAltitudeRef),
        Some(Value::Byte(bytes)) if bytes.first() == Some(&1)
    );
    let altitude = rationals(exif, Tag::GPSAltitude)
        .and_then(|values| values.first())
        .filter(|altitude| altitude.denom != 0)
        .map(|altitude| {
            if below_sea_level {
                -altitude.to_f64()
            } else {
                altitude.to_f64()
            }
        });

    Some(GeoCoord {
        latitude,
        longitude,
        altitude,
    })
}

fn capture_time(exif: &Exif) -> Option<DateTime<Utc>> {
    let raw = ascii(exif, Tag::DateTimeOriginal).or_else(|| ascii(exif, Tag::DateTime))?;
    let stamp = exif::DateTime::from_ascii(raw).ok()?;

    let naive = NaiveDate::from_ymd_opt(stamp.year.into(), stamp.month.into(), stamp.day.into())?
        .and_hms_nano_opt(
            stamp.hour.into(),
            stamp.minute.into(),
            stamp.second.into(),
            stamp.nanosecond.unwrap_or(0),
        )?;
    // camera clocks without an offset tag are taken as UTC
    let offset = FixedOffset::east_opt(i32::from(stamp.offset.unwrap_or(0)) * 60)?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|time| time.with_timezone(&Utc))
}
