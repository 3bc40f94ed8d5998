//! Turning raw catalog records into a payload snapshot.
//!
//! # Overview
//!
//! [`build`] reads CMR UMM-JSON granule records and produces a fresh
//! [`PayloadSnapshot`] with one pending [`Asset`] per granule. Only
//! downloadable `https://` related URLs survive:
//!
//! | UMM `Type` | [`LinkRole`] |
//! |------------|--------------|
//! | `GET DATA` | `PrimaryData` |
//! | `VIEW RELATED INFORMATION` | `RelatedInfo` |
//! | `GET RELATED VISUALIZATION` | `Visualization` |
//!
//! DOI landing pages and S3 credential endpoints are dropped, duplicate
//! URLs are collapsed in first-seen order, and a granule left with no link
//! is skipped with a warning. Expected sizes come from
//! `DataGranule.ArchiveAndDistributionInformation[].SizeInBytes`, matched by
//! file name.
//!
//! # Example
//!
//! ```
//! use granule_core::catalog::{self, CollectionKey};
//! use serde_json::json;
//!
//! let records = vec![json!({
//!     "umm": {
//!         "GranuleUR": "G1",
//!         "RelatedUrls": [{ "URL": "https://data.example.com/g1.h5", "Type": "GET DATA" }]
//!     }
//! })];
//! let snapshot = catalog::build(&CollectionKey::new("GEDI02_B", "002"), &records).unwrap();
//! assert_eq!(snapshot.len(), 1);
//! ```

mod error;
mod key;
mod link;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::download::filename::filename_for_url;
use crate::store::{Asset, PayloadSnapshot};

pub use error::CatalogError;
pub use key::{CollectionKey, TemporalRange};
pub use link::{DownloadLink, LinkRole};

/// URL fragments that never point at a downloadable object.
const EXCLUDED_URL_FRAGMENTS: &[&str] = &["doi.org", "s3credentials"];

/// Builds a snapshot from raw granule records, stamped with the current time.
///
/// # Errors
///
/// Returns [`CatalogError::NotAnObject`] or [`CatalogError::MissingIdentifier`]
/// for structurally unusable records.
pub fn build(collection: &CollectionKey, records: &[Value]) -> Result<PayloadSnapshot, CatalogError> {
    build_at(collection, records, Utc::now())
}

/// Builds a snapshot with an explicit creation time.
///
/// # Errors
///
/// Same as [`build`].
pub fn build_at(
    collection: &CollectionKey,
    records: &[Value],
    created_at: DateTime<Utc>,
) -> Result<PayloadSnapshot, CatalogError> {
    let mut snapshot = PayloadSnapshot::new(collection.clone(), created_at);
    let mut linkless = 0usize;
    let mut duplicates = 0usize;

    for (index, record) in records.iter().enumerate() {
        if !record.is_object() {
            return Err(CatalogError::NotAnObject { index });
        }
        let id = granule_id(record).ok_or(CatalogError::MissingIdentifier { index })?;
        let links = extract_links(record);

        if links.is_empty() {
            warn!(granule = %id, "granule has no downloadable links, skipping");
            linkless += 1;
            continue;
        }
        if !snapshot.push(Asset::new(id, links)) {
            warn!(granule = %id, "duplicate granule identifier, keeping first record");
            duplicates += 1;
        }
    }

    info!(
        collection = %collection,
        records = records.len(),
        assets = snapshot.len(),
        linkless,
        duplicates,
        "catalog built"
    );
    Ok(snapshot)
}

fn granule_id(record: &Value) -> Option<&str> {
    record
        .pointer("/umm/GranuleUR")
        .and_then(non_empty_str)
        .or_else(|| record.pointer("/meta/native-id").and_then(non_empty_str))
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn extract_links(record: &Value) -> Vec<DownloadLink> {
    let Some(related) = record.pointer("/umm/RelatedUrls").and_then(Value::as_array) else {
        return Vec::new();
    };
    let sizes = archive_sizes(record);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for entry in related {
        let Some(url) = entry.get("URL").and_then(Value::as_str).map(str::trim) else {
            continue;
        };
        let Some(role) = entry
            .get("Type")
            .and_then(Value::as_str)
            .and_then(LinkRole::from_umm_type)
        else {
            continue;
        };
        if !url.starts_with("https://") {
            debug!(url = %url, "skipping non-https link");
            continue;
        }
        if EXCLUDED_URL_FRAGMENTS.iter().any(|f| url.contains(f)) {
            debug!(url = %url, "skipping non-downloadable link");
            continue;
        }
        if !seen.insert(url.to_string()) {
            continue;
        }

        let link = match sizes.get(filename_for_url(url).as_str()) {
            Some(&bytes) => DownloadLink::with_expected_size(url, role, bytes),
            None => DownloadLink::new(url, role),
        };
        links.push(link);
    }
    links
}

fn archive_sizes(record: &Value) -> HashMap<String, u64> {
    record
        .pointer("/umm/DataGranule/ArchiveAndDistributionInformation")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("Name")?.as_str()?;
                    let bytes = entry.get("SizeInBytes")?.as_u64()?;
                    Some((name.to_string(), bytes))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::AssetStatus;

    fn key() -> CollectionKey {
        CollectionKey::new("GEDI02_B", "002")
    }

    fn record(id: &str, urls: &[(&str, &str)]) -> Value {
        let related: Vec<Value> = urls
            .iter()
            .map(|(url, kind)| json!({ "URL": url, "Type": kind }))
            .collect();
        json!({ "umm": { "GranuleUR": id, "RelatedUrls": related } })
    }

    #[test]
    fn test_build_keeps_supported_https_links_in_order() {
        let records = vec![record(
            "G1",
            &[
                ("https://h/g1.h5", "GET DATA"),
                ("https://h/g1.xml", "VIEW RELATED INFORMATION"),
                ("https://h/g1.png", "GET RELATED VISUALIZATION"),
                ("https://h/g1.opendap", "USE SERVICE API"),
                ("s3://bucket/g1.h5", "GET DATA"),
                ("http://h/g1.h5", "GET DATA"),
            ],
        )];

        let snapshot = build(&key(), &records).unwrap();
        let asset = snapshot.get("G1").unwrap();
        let roles: Vec<_> = asset.links().iter().map(DownloadLink::role).collect();
        assert_eq!(
            roles,
            vec![
                LinkRole::PrimaryData,
                LinkRole::RelatedInfo,
                LinkRole::Visualization
            ]
        );
        assert_eq!(asset.status(), AssetStatus::Pending);
        assert_eq!(snapshot.source_query_fingerprint(), key().fingerprint());
    }

    #[test]
    fn test_build_drops_doi_and_credential_links_and_dedups() {
        let records = vec![record(
            "G1",
            &[
                ("https://doi.org/10.5067/X", "VIEW RELATED INFORMATION"),
                ("https://h/s3credentials", "VIEW RELATED INFORMATION"),
                ("https://h/g1.h5", "GET DATA"),
                ("https://h/g1.h5", "GET DATA"),
            ],
        )];

        let snapshot = build(&key(), &records).unwrap();
        let urls: Vec<_> = snapshot.get("G1").unwrap().links().iter().map(DownloadLink::url).collect();
        assert_eq!(urls, vec!["https://h/g1.h5"]);
    }

    #[test]
    fn test_build_excludes_zero_link_granules() {
        let records = vec![
            record("G1", &[("https://doi.org/10.5067/X", "GET DATA")]),
            json!({ "umm": { "GranuleUR": "G2" } }),
            record("G3", &[("https://h/g3.h5", "GET DATA")]),
        ];

        let snapshot = build(&key(), &records).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("G3").is_some());
        assert!(snapshot.assets().iter().all(|a| !a.links().is_empty()));
    }

    #[test]
    fn test_build_keeps_first_of_duplicate_ids() {
        let records = vec![
            record("G1", &[("https://h/first.h5", "GET DATA")]),
            record("G1", &[("https://h/second.h5", "GET DATA")]),
        ];

        let snapshot = build(&key(), &records).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get("G1").unwrap().links()[0].url(),
            "https://h/first.h5"
        );
    }

    #[test]
    fn test_build_falls_back_to_native_id() {
        let records = vec![json!({
            "meta": { "native-id": "N1" },
            "umm": { "RelatedUrls": [{ "URL": "https://h/n1.h5", "Type": "GET DATA" }] }
        })];
        let snapshot = build(&key(), &records).unwrap();
        assert!(snapshot.get("N1").is_some());
    }

    #[test]
    fn test_build_rejects_records_without_identifier_or_object() {
        let missing = vec![json!({ "umm": { "RelatedUrls": [] } })];
        assert!(matches!(
            build(&key(), &missing),
            Err(CatalogError::MissingIdentifier { index: 0 })
        ));

        let scalar = vec![record("G1", &[]), json!("G2")];
        assert!(matches!(
            build(&key(), &scalar),
            Err(CatalogError::NotAnObject { index: 1 })
        ));
    }

    #[test]
    fn test_build_reads_expected_size_by_file_name() {
        let records = vec![json!({
            "umm": {
                "GranuleUR": "G1",
                "RelatedUrls": [
                    { "URL": "https://h/path/g1.h5", "Type": "GET DATA" },
                    { "URL": "https://h/path/g1.xml", "Type": "VIEW RELATED INFORMATION" }
                ],
                "DataGranule": {
                    "ArchiveAndDistributionInformation": [
                        { "Name": "g1.h5", "SizeInBytes": 1234, "Size": 1.2, "SizeUnit": "KB" }
                    ]
                }
            }
        })];

        let snapshot = build(&key(), &records).unwrap();
        let links = snapshot.get("G1").unwrap().links();
        assert_eq!(links[0].expected_size_bytes(), Some(1234));
        assert_eq!(links[1].expected_size_bytes(), None);
    }

    #[test]
    fn test_build_empty_input_gives_empty_snapshot() {
        let snapshot = build(&key(), &[]).unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.collection(), &key());
    }
}
