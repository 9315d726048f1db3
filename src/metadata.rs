// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The Snapshot Metadata envelope that travels through the pipeline from
//! Build through Validate, and the snapshot-variant policy table.
//!
//! Field names are kept byte-for-byte identical to
//! `roles/forest_snapshots/files/snapshot.py`'s Pydantic aliases, so the
//! JSON on the wire is unchanged in shape from the system this replaces.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use lazy_regex::regex_captures;
use serde::{Deserialize, Serialize};

/// One of the four fixed-policy snapshot variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotVariant {
    Lite,
    Diff,
    LatestV1,
    LatestV2,
}

/// Depth/state-roots/folder/prefix policy for a variant, as specified in the
/// variant table (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct VariantPolicy {
    pub depth: i64,
    pub state_roots: i64,
    pub folder: &'static str,
}

impl SnapshotVariant {
    pub const fn policy(self) -> VariantPolicy {
        match self {
            SnapshotVariant::Lite => VariantPolicy {
                depth: 30_000,
                state_roots: 900,
                folder: "lite",
            },
            SnapshotVariant::Diff => VariantPolicy {
                depth: 3_000,
                state_roots: 3_000,
                folder: "diff",
            },
            SnapshotVariant::LatestV1 => VariantPolicy {
                depth: 2_000,
                state_roots: 2_000,
                folder: "latest",
            },
            SnapshotVariant::LatestV2 => VariantPolicy {
                depth: 2_000,
                state_roots: 2_000,
                folder: "latest-v2",
            },
        }
    }

    /// Which bucket this variant's artifacts are uploaded to (Testable
    /// Property 7: lite/diff → archive, latest-* → latest).
    pub fn is_latest(self) -> bool {
        matches!(self, SnapshotVariant::LatestV1 | SnapshotVariant::LatestV2)
    }
}

/// `Head Tipset` is a single CID string in older archives, an array of CID
/// strings in newer ones. Model both without forcing a normalization the
/// source data doesn't agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeadTipset {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Snapshot version")]
    pub snapshot_version: String,
    #[serde(rename = "Head Tipset")]
    pub head_tipset: HeadTipset,
    #[serde(rename = "F3 data", skip_serializing_if = "Option::is_none", default)]
    pub f3_data: Option<String>,
    #[serde(
        rename = "F3 snapshot version",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub f3_snapshot_version: Option<String>,
    #[serde(
        rename = "F3 snapshot first instance",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub f3_snapshot_first_instance: Option<i64>,
    #[serde(
        rename = "F3 snapshot last instance",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub f3_snapshot_last_instance: Option<i64>,
    #[serde(rename = "CAR format")]
    pub car_format: String,
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "Epoch")]
    pub epoch: i64,
    #[serde(rename = "State-roots")]
    pub state_roots: i64,
    #[serde(rename = "Sha256", skip_serializing_if = "Option::is_none", default)]
    pub sha256: Option<String>,
    #[serde(rename = "Messages sets")]
    pub messages_sets: i64,
    #[serde(rename = "Index size")]
    pub index_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(rename = "Success", default)]
    pub success: bool,
    #[serde(rename = "Forest version", default = "unknown_version")]
    pub forest_version: String,
    #[serde(rename = "Lotus version", default = "unknown_version")]
    pub lotus_version: String,
    #[serde(
        rename = "Validation date",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub validation_date: Option<DateTime<Utc>>,
}

fn unknown_version() -> String {
    "unknown".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInformation {
    #[serde(rename = "Epoch", default)]
    pub epoch: i64,
    #[serde(
        rename = "Epoch date",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub epoch_date: Option<DateTime<Utc>>,
    #[serde(rename = "Build path", default)]
    pub build_path: String,
    /// The Slack message timestamp that anchors this artifact's notification
    /// thread end-to-end (Build posts it, Upload/Validate reply on it). Kept
    /// as an opaque string, not a duration.
    #[serde(rename = "Build timestamp", default)]
    pub build_timestamp: String,
    #[serde(
        rename = "Build date",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub build_date: Option<DateTime<Utc>>,
    #[serde(rename = "Validation", default)]
    pub validation: Validation,
}

impl Default for BuildInformation {
    fn default() -> Self {
        BuildInformation {
            epoch: 0,
            epoch_date: None,
            build_path: String::new(),
            build_timestamp: String::new(),
            build_date: None,
            validation: Validation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(rename = "Snapshot")]
    pub snapshot: Snapshot,
    #[serde(rename = "Build Information", default)]
    pub build_information: BuildInformation,
}

impl SnapshotMetadata {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Parse `height_<digits>` out of a snapshot basename (Testable Property 3 /
/// spec.md §6 filename grammar). Falls back to `None` on miss, matching the
/// "default on miss" parsing rule.
pub fn parse_epoch_from_filename(basename: &str) -> Option<i64> {
    let (_, digits) = regex_captures!(r"height_(\d+)", basename)?;
    digits.parse().ok()
}

/// UTC calendar date for an epoch, given a network's genesis timestamp and
/// seconds-per-epoch constant (matches `build_snapshots.py::epoch_to_date`).
pub fn epoch_to_date(genesis_timestamp: i64, seconds_per_epoch: i64, epoch: i64) -> DateTime<Utc> {
    let secs = genesis_timestamp + epoch * seconds_per_epoch;
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| {
        // Saturate rather than panic on pathological (negative/overflowing)
        // input; callers only ever pass real chain epochs.
        if secs < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        }
    })
}

/// Build the canonical basename for a variant at a given epoch, as specified
/// in spec.md §3's filename-prefix column.
pub fn snapshot_filename(
    variant: SnapshotVariant,
    network: &str,
    date: DateTime<Utc>,
    epoch: i64,
) -> String {
    let date = date.format("%Y-%m-%d");
    match variant {
        SnapshotVariant::Diff => {
            let depth = variant.policy().depth;
            format!("forest_diff_{network}_{date}_height_{epoch}+{depth}.forest.car.zst")
        }
        _ => format!("forest_snapshot_{network}_{date}_height_{epoch}.forest.car.zst"),
    }
}

/// Object-store key for an artifact, per spec.md §6's layout:
/// `<network>/<folder>/<basename>`.
pub fn object_store_key(network: &str, folder: &str, basename: &str) -> String {
    format!("{network}/{folder}/{basename}")
}

/// Resolve the actual on-disk snapshot path produced by the chain tool by
/// scanning its output folder for a file matching `height_<epoch>` with the
/// expected extension — tool-chosen suffixes (e.g. a `+3000` diff marker)
/// are tolerated. Mirrors `build_snapshots.py::_resolve_snapshot_path`.
pub fn resolve_snapshot_path(folder: &Path, epoch: i64) -> std::io::Result<Option<std::path::PathBuf>> {
    let needle = format!("height_{epoch}");
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains(&needle) && name.ends_with(".forest.car.zst") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SnapshotMetadata {
        SnapshotMetadata {
            snapshot: Snapshot {
                snapshot_version: "1".into(),
                head_tipset: HeadTipset::Many(vec!["bafy1".into(), "bafy2".into()]),
                f3_data: None,
                f3_snapshot_version: None,
                f3_snapshot_first_instance: None,
                f3_snapshot_last_instance: None,
                car_format: "v1".into(),
                network: "calibnet".into(),
                epoch: 123_000,
                state_roots: 900,
                sha256: Some("deadbeef".into()),
                messages_sets: 42,
                index_size: "12 MiB".into(),
            },
            build_information: BuildInformation {
                epoch: 123_000,
                epoch_date: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
                build_path: "/data/snapshots-archive/lite/forest_snapshot_calibnet_2023-11-14_height_123000.forest.car.zst".into(),
                build_timestamp: "1700000000.123456".into(),
                build_date: Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap()),
                validation: Validation::default(),
            },
        }
    }

    #[test]
    fn round_trip_preserves_json_value() {
        let m = sample();
        let json1 = serde_json::to_value(&m).unwrap();
        let back: SnapshotMetadata = serde_json::from_value(json1.clone()).unwrap();
        let json2 = serde_json::to_value(&back).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn uses_canonical_pydantic_aliases() {
        let m = sample();
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("Snapshot").is_some());
        assert!(v["Snapshot"].get("Head Tipset").is_some());
        assert!(v.get("Build Information").is_some());
        assert!(v["Build Information"].get("Build timestamp").is_some());
        assert!(v["Build Information"]["Validation"].get("Success").is_some());
    }

    #[test]
    fn validation_defaults_match_original() {
        let v = Validation::default();
        assert!(!v.success);
        assert_eq!(v.forest_version, "unknown");
        assert_eq!(v.lotus_version, "unknown");
    }

    #[rstest::rstest]
    #[case("forest_snapshot_mainnet_2024-01-01_height_30000.forest.car.zst", Some(30000))]
    #[case("forest_diff_mainnet_2024-01-01_height_27000+3000.forest.car.zst", Some(27000))]
    #[case("forest_snapshot_mainnet_2024-01-01_height_2000000.forest.car.zst", Some(2000000))]
    #[case("not-a-snapshot.car.zst", None)]
    fn filename_epoch_parsing(#[case] name: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_epoch_from_filename(name), expected);
    }

    #[test]
    fn filename_grammar_matches_variant_table() {
        let date = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            snapshot_filename(SnapshotVariant::Lite, "mainnet", date, 30000),
            "forest_snapshot_mainnet_2023-11-14_height_30000.forest.car.zst"
        );
        assert_eq!(
            snapshot_filename(SnapshotVariant::Diff, "mainnet", date, 27000),
            "forest_diff_mainnet_2023-11-14_height_27000+3000.forest.car.zst"
        );
        assert_eq!(
            snapshot_filename(SnapshotVariant::LatestV2, "mainnet", date, 500),
            "forest_snapshot_mainnet_2023-11-14_height_500.forest.car.zst"
        );
    }

    #[test]
    fn bucket_routing_by_variant() {
        assert!(!SnapshotVariant::Lite.is_latest());
        assert!(!SnapshotVariant::Diff.is_latest());
        assert!(SnapshotVariant::LatestV1.is_latest());
        assert!(SnapshotVariant::LatestV2.is_latest());
    }

    #[test]
    fn object_store_key_layout() {
        assert_eq!(
            object_store_key("mainnet", "lite", "forest_snapshot_mainnet_2024-01-01_height_30000.forest.car.zst"),
            "mainnet/lite/forest_snapshot_mainnet_2024-01-01_height_30000.forest.car.zst"
        );
    }

    #[test]
    fn epoch_to_date_matches_genesis_arithmetic() {
        let genesis = 1_598_306_400; // calibnet-ish genesis
        let date = epoch_to_date(genesis, 30, 100_000);
        assert_eq!(date.format("%Y-%m-%d").to_string(), "2020-09-28");
    }
}
