//! Presence check and download of the offline geolocation database.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::DatabaseError;

pub const DATABASE_SUFFIX: &str = ".mmdb";

/// True when no database exists at `path` and one has to be downloaded.
pub fn needs_download(path: &Path) -> bool {
    fs::metadata(path).is_err()
}

/// Download the `.tar.gz` archive at `url` and extract its database to `path`.
pub async fn download(url: &str, license_key: &str, path: &Path) -> Result<(), DatabaseError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let url = with_license_key(url, license_key)?;
    info!(url = %redacted(&url), "downloading geolocation database");

    let archive = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    debug!(bytes = archive.len(), "downloaded geolocation archive");

    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_database(archive.as_ref(), &path))
        .await
        .map_err(|e| DatabaseError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn with_license_key(url: &str, license_key: &str) -> Result<reqwest::Url, DatabaseError> {
    let mut url = reqwest::Url::parse(url).map_err(|e| DatabaseError::InvalidUrl(e.to_string()))?;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "license_key")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("license_key", license_key);

    Ok(url)
}

fn redacted(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// Extract the first archive member ending in `.mmdb` to `destination`.
pub fn extract_database<R: Read>(gzipped_tar: R, destination: &Path) -> Result<(), DatabaseError> {
    let mut archive = tar::Archive::new(GzDecoder::new(gzipped_tar));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_database = entry
            .path()?
            .to_string_lossy()
            .ends_with(DATABASE_SUFFIX);
        if !is_database {
            continue;
        }

        let mut out = File::create(destination)?;
        io::copy(&mut entry, &mut out)?;
        info!(path = %destination.display(), "extracted geolocation database");

        return Ok(());
    }

    Err(DatabaseError::NotInArchive)
}
