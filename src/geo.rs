//! Offline IP geolocation.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2, Reader};
use tracing::debug;

use crate::error::DatabaseError;
use crate::models::GeoLocation;

const LANGUAGE: &str = "en";

/// Resolves addresses to locations. Implementations must never fail: an
/// unknown address resolves to `GeoLocation::default()`.
pub trait Resolve: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> GeoLocation;
}

/// A MaxMind City database opened from disk.
pub struct GeoDatabase {
    reader: Reader<Vec<u8>>,
}

impl GeoDatabase {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let reader = Reader::open_readfile(path)?;
        debug!(path = %path.display(), "opened geolocation database");
        Ok(Self { reader })
    }
}

impl Resolve for GeoDatabase {
    fn resolve(&self, ip: IpAddr) -> GeoLocation {
        location_from_record(self.reader.lookup::<geoip2::City>(ip).ok())
    }
}

fn location_from_record(record: Option<geoip2::City<'_>>) -> GeoLocation {
    let Some(record) = record else {
        return GeoLocation::default();
    };

    let country_name = record
        .country
        .and_then(|country| country.names)
        .and_then(|names| names.get(LANGUAGE).map(|name| name.to_string()))
        .unwrap_or_default();
    let city_name = record
        .city
        .and_then(|city| city.names)
        .and_then(|names| names.get(LANGUAGE).map(|name| name.to_string()))
        .unwrap_or_default();
    let (longitude, latitude) = record
        .location
        .map(|location| {
            (
                location.longitude.unwrap_or_default(),
                location.latitude.unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    GeoLocation {
        country_name,
        city_name,
        longitude,
        latitude,
    }
}

/// Resolver used when no database is loaded.
pub struct Unresolved;

impl Resolve for Unresolved {
    fn resolve(&self, _ip: IpAddr) -> GeoLocation {
        GeoLocation::default()
    }
}
