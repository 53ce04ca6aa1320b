//! Data set manifest model and validating parser
//!
//! One manifest XML object describes one batch of RIF files deposited by the
//! CCW. Manifests are immutable once parsed and are totally ordered by
//! `(timestamp, sequence_id)`; that ordering is the pipeline's processing
//! order invariant.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rif_common::RifFileType;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::s3::{S3_PREFIX_PENDING_DATA_SETS, S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS};

/// Matches manifest keys under either pending prefix, capturing the
/// timestamp text and sequence id.
static REGEX_PENDING_MANIFEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^({}|{})/(.*)/([0-9]+)_manifest\\.xml$",
        S3_PREFIX_PENDING_DATA_SETS, S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS
    ))
    .expect("static regex must compile")
});

/// Identity of one data set manifest: `(timestamp, sequence_id)`.
///
/// The original timestamp text from the S3 key is carried along so keys can
/// be recomputed byte-for-byte, but equality and ordering consider only the
/// parsed instant and the sequence id.
#[derive(Debug, Clone)]
pub struct ManifestId {
    timestamp_text: String,
    timestamp: DateTime<Utc>,
    sequence_id: u32,
}

impl ManifestId {
    pub fn new(timestamp: DateTime<Utc>, sequence_id: u32) -> Self {
        Self {
            timestamp_text: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            timestamp,
            sequence_id,
        }
    }

    /// Rebuilds an id from a stored timestamp string, preserving the
    /// original text so S3 keys recompute exactly.
    pub(crate) fn from_timestamp_text(
        timestamp_text: &str,
        sequence_id: u32,
    ) -> PipelineResult<Self> {
        let timestamp = DateTime::parse_from_rfc3339(timestamp_text)
            .map_err(|e| {
                PipelineError::Config(format!("invalid stored timestamp '{timestamp_text}': {e}"))
            })?
            .with_timezone(&Utc);
        Ok(Self {
            timestamp_text: timestamp_text.to_string(),
            timestamp,
            sequence_id,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_text(&self) -> &str {
        &self.timestamp_text
    }

    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    /// True when this manifest's timestamp is at or beyond `now`. Future
    /// manifests hold pre-staged synthetic data and are never eligible.
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.timestamp >= now
    }

    /// The S3 key of this manifest under the given location prefix, e.g.
    /// `Incoming/2024-01-19T16:16:38Z/0_manifest.xml`.
    pub fn compute_s3_key(&self, s3_prefix: &str) -> String {
        format!(
            "{}/{}/{}_manifest.xml",
            s3_prefix, self.timestamp_text, self.sequence_id
        )
    }

    /// Parses a manifest id from an S3 key, returning `None` for keys that
    /// are not pending manifests (wrong prefix, unparseable timestamp).
    pub fn parse_from_s3_key(s3_key: &str) -> Option<ManifestId> {
        let captures = REGEX_PENDING_MANIFEST.captures(s3_key)?;
        let timestamp_text = captures.get(2)?.as_str();
        let timestamp = DateTime::parse_from_rfc3339(timestamp_text)
            .ok()?
            .with_timezone(&Utc);
        let sequence_id = captures.get(3)?.as_str().parse().ok()?;
        Some(ManifestId {
            timestamp_text: timestamp_text.to_string(),
            timestamp,
            sequence_id,
        })
    }
}

impl PartialEq for ManifestId {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sequence_id == other.sequence_id
    }
}

impl Eq for ManifestId {}

impl std::hash::Hash for ManifestId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.timestamp.hash(state);
        self.sequence_id.hash(state);
    }
}

impl PartialOrd for ManifestId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ManifestId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence_id.cmp(&other.sequence_id))
    }
}

impl std::fmt::Display for ManifestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.timestamp_text, self.sequence_id)
    }
}

/// One file entry within a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifestEntry {
    pub name: String,
    pub file_type: RifFileType,
}

/// Optional pre-validation metadata carried by synthetic manifests. The id
/// ranges let a validator check for downstream key-constraint collisions
/// before any row is inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreValidationProperties {
    pub bene_id_start: i64,
    pub bene_id_end: i64,
    pub clm_grp_id_start: i64,
    pub clm_grp_id_end: i64,
}

/// An immutable, validated description of one data set batch.
#[derive(Debug, Clone)]
pub struct DataSetManifest {
    id: ManifestId,
    synthetic_data: bool,
    entries: Vec<DataSetManifestEntry>,
    pre_validation: Option<PreValidationProperties>,
    incoming_location: String,
    done_location: String,
}

impl DataSetManifest {
    /// Reassembles a manifest from previously validated parts, e.g. rows
    /// read back from the tracking tables. Locations follow from the
    /// synthetic flag.
    pub(crate) fn from_parts(
        id: ManifestId,
        synthetic_data: bool,
        entries: Vec<DataSetManifestEntry>,
        pre_validation: Option<PreValidationProperties>,
    ) -> Self {
        let (incoming_location, done_location) = if synthetic_data {
            (
                S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS.to_string(),
                crate::s3::S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS.to_string(),
            )
        } else {
            (
                S3_PREFIX_PENDING_DATA_SETS.to_string(),
                crate::s3::S3_PREFIX_COMPLETED_DATA_SETS.to_string(),
            )
        };
        Self {
            id,
            synthetic_data,
            entries,
            pre_validation,
            incoming_location,
            done_location,
        }
    }

    pub fn id(&self) -> &ManifestId {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.id.timestamp()
    }

    pub fn timestamp_text(&self) -> &str {
        self.id.timestamp_text()
    }

    pub fn sequence_id(&self) -> u32 {
        self.id.sequence_id()
    }

    pub fn is_synthetic_data(&self) -> bool {
        self.synthetic_data
    }

    pub fn entries(&self) -> &[DataSetManifestEntry] {
        &self.entries
    }

    pub fn pre_validation(&self) -> Option<&PreValidationProperties> {
        self.pre_validation.as_ref()
    }

    /// The pending-prefix this manifest was discovered under.
    pub fn incoming_location(&self) -> &str {
        &self.incoming_location
    }

    /// The completed-prefix this manifest's objects move to after load.
    pub fn done_location(&self) -> &str {
        &self.done_location
    }

    /// The S3 key of the manifest object itself under its incoming prefix.
    pub fn incoming_s3_key(&self) -> String {
        self.id.compute_s3_key(&self.incoming_location)
    }

    /// The S3 key of a data file entry under the given location prefix.
    pub fn entry_s3_key(&self, entry_name: &str, location: &str) -> String {
        format!("{}/{}/{}", location, self.id.timestamp_text(), entry_name)
    }
}

impl std::fmt::Display for DataSetManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DataSetManifest[id={}, synthetic={}, entries={}]",
            self.id,
            self.synthetic_data,
            self.entries.len()
        )
    }
}

/// Raw deserialization target for the manifest XML. Values are kept as
/// strings here; [`ManifestParser`] performs schema-level validation during
/// conversion to the domain model.
#[derive(Debug, Deserialize)]
struct XmlManifest {
    #[serde(rename = "@timestamp")]
    timestamp: Option<String>,
    #[serde(rename = "@sequenceId")]
    sequence_id: Option<String>,
    #[serde(rename = "@syntheticData", default)]
    synthetic_data: Option<bool>,
    #[serde(rename = "entry", alias = "bbr:entry", default)]
    entries: Vec<XmlEntry>,
    #[serde(
        rename = "preValidationProperties",
        alias = "bbr:preValidationProperties",
        default
    )]
    pre_validation: Option<XmlPreValidationProperties>,
}

#[derive(Debug, Deserialize)]
struct XmlEntry {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@type")]
    file_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlPreValidationProperties {
    #[serde(rename = "bene_id_start", alias = "bbr:bene_id_start")]
    bene_id_start: Option<i64>,
    #[serde(rename = "bene_id_end", alias = "bbr:bene_id_end")]
    bene_id_end: Option<i64>,
    #[serde(rename = "clm_grp_id_start", alias = "bbr:clm_grp_id_start")]
    clm_grp_id_start: Option<i64>,
    #[serde(rename = "clm_grp_id_end", alias = "bbr:clm_grp_id_end")]
    clm_grp_id_end: Option<i64>,
}

/// Validating parser for data set manifests.
///
/// Explicitly constructed and injected into whichever component parses
/// manifests, so tests get isolation and there is no hidden global state.
/// Well-formed XML is necessary but not sufficient: required attributes,
/// entry uniqueness, and known file types are checked here too, mirroring
/// what XSD validation enforced upstream.
#[derive(Debug, Default, Clone)]
pub struct ManifestParser;

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses and validates manifest XML discovered at `s3_key`.
    ///
    /// The incoming/done locations of the resulting manifest are derived
    /// from the key's prefix (production vs. synthetic tree).
    pub fn parse(&self, s3_key: &str, xml: &[u8]) -> PipelineResult<DataSetManifest> {
        let invalid = |message: String| PipelineError::InvalidManifest {
            s3_key: s3_key.to_string(),
            message,
        };

        let text = std::str::from_utf8(xml)
            .map_err(|e| invalid(format!("manifest is not valid UTF-8: {e}")))?;
        let raw: XmlManifest = quick_xml::de::from_str(text)
            .map_err(|e| invalid(format!("malformed manifest XML: {e}")))?;

        let timestamp_text = raw
            .timestamp
            .ok_or_else(|| invalid("missing required attribute 'timestamp'".to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp_text)
            .map_err(|e| invalid(format!("invalid timestamp '{timestamp_text}': {e}")))?
            .with_timezone(&Utc);

        let sequence_text = raw
            .sequence_id
            .ok_or_else(|| invalid("missing required attribute 'sequenceId'".to_string()))?;
        let sequence_id: u32 = sequence_text
            .parse()
            .map_err(|_| invalid(format!("invalid sequenceId '{sequence_text}'")))?;

        let mut entries = Vec::with_capacity(raw.entries.len());
        for entry in raw.entries {
            let name = entry
                .name
                .filter(|n| !n.is_empty())
                .ok_or_else(|| invalid("entry missing required attribute 'name'".to_string()))?;
            let type_text = entry
                .file_type
                .ok_or_else(|| invalid(format!("entry '{name}' missing attribute 'type'")))?;
            let file_type: RifFileType = type_text
                .parse()
                .map_err(|_| invalid(format!("entry '{name}' has unknown type '{type_text}'")))?;
            if entries.iter().any(|e: &DataSetManifestEntry| e.name == name) {
                return Err(invalid(format!("duplicate entry name '{name}'")));
            }
            entries.push(DataSetManifestEntry { name, file_type });
        }

        let pre_validation = match raw.pre_validation {
            None => None,
            Some(props) => Some(PreValidationProperties {
                bene_id_start: props.bene_id_start.ok_or_else(|| {
                    invalid("preValidationProperties missing 'bene_id_start'".to_string())
                })?,
                bene_id_end: props.bene_id_end.ok_or_else(|| {
                    invalid("preValidationProperties missing 'bene_id_end'".to_string())
                })?,
                clm_grp_id_start: props.clm_grp_id_start.ok_or_else(|| {
                    invalid("preValidationProperties missing 'clm_grp_id_start'".to_string())
                })?,
                clm_grp_id_end: props.clm_grp_id_end.ok_or_else(|| {
                    invalid("preValidationProperties missing 'clm_grp_id_end'".to_string())
                })?,
            }),
        };

        let (incoming_location, done_location) =
            if s3_key.starts_with(S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS) {
                (
                    S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS.to_string(),
                    crate::s3::S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS.to_string(),
                )
            } else {
                (
                    S3_PREFIX_PENDING_DATA_SETS.to_string(),
                    crate::s3::S3_PREFIX_COMPLETED_DATA_SETS.to_string(),
                )
            };

        // Prefer the timestamp text from the key so computed keys round-trip
        // even when the XML formats the instant differently. A key that
        // names a different instant or sequence than the XML is rejected:
        // keys recomputed from the XML would point at nonexistent objects.
        let id = match ManifestId::parse_from_s3_key(s3_key) {
            Some(key_id) if key_id.timestamp() == timestamp && key_id.sequence_id() == sequence_id => {
                key_id
            }
            Some(key_id) => {
                return Err(invalid(format!(
                    "timestamp/sequence ({}, {}) disagrees with S3 key ({}, {})",
                    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                    sequence_id,
                    key_id.timestamp_text(),
                    key_id.sequence_id(),
                )));
            }
            None => ManifestId {
                timestamp_text: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                timestamp,
                sequence_id,
            },
        };

        Ok(DataSetManifest {
            id,
            synthetic_data: raw.synthetic_data.unwrap_or(false),
            entries,
            pre_validation,
            incoming_location,
            done_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<bbr:dataSetManifest xmlns:bbr="http://cms.hhs.gov/bluebutton/api/schema/ccw-rif/v10" timestamp="2024-01-19T16:16:38Z" sequenceId="0">
  <bbr:entry name="beneficiary.rif" type="BENEFICIARY"/>
  <bbr:entry name="carrier.rif" type="CARRIER"/>
</bbr:dataSetManifest>
"#;

    const SAMPLE_KEY: &str = "Incoming/2024-01-19T16:16:38Z/0_manifest.xml";

    fn parse(key: &str, xml: &str) -> PipelineResult<DataSetManifest> {
        ManifestParser::new().parse(key, xml.as_bytes())
    }

    #[test]
    fn parses_sample_manifest() {
        let manifest = parse(SAMPLE_KEY, SAMPLE_MANIFEST).unwrap();
        assert_eq!(manifest.timestamp_text(), "2024-01-19T16:16:38Z");
        assert_eq!(manifest.sequence_id(), 0);
        assert!(!manifest.is_synthetic_data());
        assert_eq!(manifest.entries().len(), 2);
        assert_eq!(manifest.entries()[0].name, "beneficiary.rif");
        assert_eq!(manifest.entries()[0].file_type, RifFileType::Beneficiary);
        assert_eq!(manifest.incoming_s3_key(), SAMPLE_KEY);
    }

    #[test]
    fn parses_synthetic_manifest_with_pre_validation() {
        let xml = r#"<dataSetManifest timestamp="2024-01-19T16:16:38Z" sequenceId="3" syntheticData="true">
  <entry name="beneficiary.rif" type="BENEFICIARY"/>
  <preValidationProperties>
    <bene_id_start>-1000</bene_id_start>
    <bene_id_end>-2000</bene_id_end>
    <clm_grp_id_start>-100</clm_grp_id_start>
    <clm_grp_id_end>-200</clm_grp_id_end>
  </preValidationProperties>
</dataSetManifest>"#;
        let key = "Synthetic/Incoming/2024-01-19T16:16:38Z/3_manifest.xml";
        let manifest = parse(key, xml).unwrap();
        assert!(manifest.is_synthetic_data());
        assert_eq!(manifest.incoming_location(), "Synthetic/Incoming");
        assert_eq!(manifest.done_location(), "Synthetic/Done");
        let props = manifest.pre_validation().unwrap();
        assert_eq!(props.bene_id_start, -1000);
        assert_eq!(props.clm_grp_id_end, -200);
    }

    #[test]
    fn rejects_malformed_xml() {
        let result = parse(SAMPLE_KEY, "<dataSetManifest timestamp=");
        assert!(matches!(
            result,
            Err(PipelineError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn rejects_missing_timestamp() {
        let xml = r#"<dataSetManifest sequenceId="0"><entry name="a.rif" type="PDE"/></dataSetManifest>"#;
        let err = parse(SAMPLE_KEY, xml).unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn rejects_unknown_entry_type() {
        let xml = r#"<dataSetManifest timestamp="2024-01-19T16:16:38Z" sequenceId="0">
  <entry name="a.rif" type="MYSTERY"/>
</dataSetManifest>"#;
        let err = parse(SAMPLE_KEY, xml).unwrap_err();
        assert!(err.to_string().contains("MYSTERY"));
    }

    #[test]
    fn rejects_timestamp_disagreeing_with_key() {
        // Same manifest body, but stored under a key naming a different
        // instant. Computed keys would miss the real objects.
        let key = "Incoming/2024-01-19T17:00:00Z/0_manifest.xml";
        let err = parse(key, SAMPLE_MANIFEST).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidManifest { .. }));
        assert!(err.to_string().contains("disagrees"));
    }

    #[test]
    fn key_timestamp_text_wins_for_equal_instants() {
        // The XML spells out milliseconds; the key does not. Same instant,
        // so the key's text is kept and keys round-trip.
        let xml = SAMPLE_MANIFEST.replace("2024-01-19T16:16:38Z", "2024-01-19T16:16:38.000Z");
        let manifest = parse(SAMPLE_KEY, &xml).unwrap();
        assert_eq!(manifest.incoming_s3_key(), SAMPLE_KEY);
    }

    #[test]
    fn rejects_duplicate_entry_names() {
        let xml = r#"<dataSetManifest timestamp="2024-01-19T16:16:38Z" sequenceId="0">
  <entry name="a.rif" type="PDE"/>
  <entry name="a.rif" type="CARRIER"/>
</dataSetManifest>"#;
        let err = parse(SAMPLE_KEY, xml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn manifest_ids_order_by_timestamp_then_sequence() {
        let t1 = "2024-01-19T16:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let t2 = "2024-01-19T17:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut ids = vec![
            ManifestId::new(t2, 0),
            ManifestId::new(t1, 5),
            ManifestId::new(t1, 1),
        ];
        ids.sort();
        assert_eq!(ids[0], ManifestId::new(t1, 1));
        assert_eq!(ids[1], ManifestId::new(t1, 5));
        assert_eq!(ids[2], ManifestId::new(t2, 0));
    }

    #[test]
    fn future_manifests_are_detected() {
        let now = "2024-01-19T16:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let past = ManifestId::new(now - chrono::Duration::seconds(1), 0);
        let future = ManifestId::new(now + chrono::Duration::days(30), 0);
        assert!(!past.is_future(now));
        assert!(future.is_future(now));
        // A timestamp exactly at "now" is treated as future.
        assert!(ManifestId::new(now, 0).is_future(now));
    }

    #[test]
    fn s3_key_round_trips() {
        let id = ManifestId::parse_from_s3_key(SAMPLE_KEY).unwrap();
        assert_eq!(id.timestamp_text(), "2024-01-19T16:16:38Z");
        assert_eq!(id.sequence_id(), 0);
        assert_eq!(id.compute_s3_key("Incoming"), SAMPLE_KEY);
    }

    #[test]
    fn non_manifest_keys_are_ignored() {
        assert!(ManifestId::parse_from_s3_key("not a valid key").is_none());
        assert!(ManifestId::parse_from_s3_key("Done/2024-01-19T16:16:38Z/0_manifest.xml").is_none());
        assert!(
            ManifestId::parse_from_s3_key("Incoming/not-a-timestamp/0_manifest.xml").is_none()
        );
    }
}
