//! Core domain model for the MEDES facility-enrichment pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "medes-core";

/// Canonical list-valued column together with the raw source spelling it may
/// arrive under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListField {
    pub name: &'static str,
    pub raw_alias: Option<&'static str>,
}

/// Columns that must be sequence-typed on every canonical record.
pub const LIST_FIELDS: [ListField; 8] = [
    ListField { name: "specialties", raw_alias: None },
    ListField { name: "procedures", raw_alias: Some("procedure") },
    ListField { name: "equipment", raw_alias: None },
    ListField { name: "capability", raw_alias: None },
    ListField { name: "phone_numbers", raw_alias: None },
    ListField { name: "websites", raw_alias: None },
    ListField { name: "countries", raw_alias: None },
    ListField { name: "affiliation_type_ids", raw_alias: Some("affiliationTypeIds") },
];

/// One facility after deterministic normalization, before any LLM enrichment.
///
/// Named fields cover the columns the pipeline reads directly; everything
/// else from the source row rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub unique_id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "missionStatement")]
    pub mission_statement: Option<String>,
    #[serde(default, alias = "organizationDescription")]
    pub organization_description: Option<String>,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub specialties: Vec<Value>,
    #[serde(default)]
    pub procedures: Vec<Value>,
    #[serde(default)]
    pub equipment: Vec<Value>,
    #[serde(default)]
    pub capability: Vec<Value>,
    #[serde(default)]
    pub phone_numbers: Vec<Value>,
    #[serde(default)]
    pub websites: Vec<Value>,
    #[serde(default)]
    pub countries: Vec<Value>,
    #[serde(default)]
    pub affiliation_type_ids: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Trust grade assigned by the reliability auditor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    High,
    Moderate,
    Low,
}

impl FromStr for Reliability {
    type Err = UnknownGrade;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            g if g.eq_ignore_ascii_case("high") => Ok(Self::High),
            g if g.eq_ignore_ascii_case("moderate") => Ok(Self::Moderate),
            g if g.eq_ignore_ascii_case("low") => Ok(Self::Low),
            other => Err(UnknownGrade(other.to_string())),
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "High",
            Self::Moderate => "Moderate",
            Self::Low => "Low",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownGrade(pub String);

impl fmt::Display for UnknownGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized reliability grade {:?}", self.0)
    }
}

impl std::error::Error for UnknownGrade {}

/// The evolving publish-schema record, one per input row.
///
/// Composite fields hold string-encoded JSON so the batch can be inserted
/// row-wise into a tabular store without further transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedRecord {
    pub id: Option<Value>,
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub description: Option<String>,
    pub mission_statement: Option<String>,
    pub organization_description: Option<String>,
    pub organization_info: String,
    pub location_info: String,
    pub contact_info: String,
    pub medical_details: String,
    pub client_capability: Option<String>,
    pub reliability: Option<Reliability>,
    pub reliability_reasons: String,
    pub stats: String,
    pub social_media_links: Option<String>,
    pub embedding: Option<String>,
    pub created_at: Option<String>,
}

impl TranslatedRecord {
    /// Full publish schema with deterministic defaults; the five passthrough
    /// scalars and the id are copied straight from the canonical record.
    pub fn skeleton(canonical: &CanonicalRecord) -> Self {
        Self {
            id: canonical.id.clone(),
            name: canonical.name.clone(),
            source_url: canonical.source_url.clone(),
            description: canonical.description.clone(),
            mission_statement: canonical.mission_statement.clone(),
            organization_description: canonical.organization_description.clone(),
            organization_info: "{}".to_string(),
            location_info: "{}".to_string(),
            contact_info: "{}".to_string(),
            medical_details: "{}".to_string(),
            client_capability: None,
            reliability: None,
            reliability_reasons: "[]".to_string(),
            stats: "{}".to_string(),
            social_media_links: None,
            embedding: None,
            created_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reliability_grades_parse_case_insensitively() {
        assert_eq!("High".parse::<Reliability>().unwrap(), Reliability::High);
        assert_eq!("moderate".parse::<Reliability>().unwrap(), Reliability::Moderate);
        assert_eq!(" LOW ".parse::<Reliability>().unwrap(), Reliability::Low);
        assert!("Questionable".parse::<Reliability>().is_err());
    }

    #[test]
    fn canonical_record_accepts_raw_camel_case_aliases() {
        let record: CanonicalRecord = serde_json::from_value(json!({
            "name": "Ridge Hospital",
            "missionStatement": "Care for all",
            "organizationDescription": "Regional referral hospital",
        }))
        .unwrap();
        assert_eq!(record.mission_statement.as_deref(), Some("Care for all"));
        assert_eq!(
            record.organization_description.as_deref(),
            Some("Regional referral hospital")
        );
    }

    #[test]
    fn unknown_columns_land_in_the_extra_map() {
        let record: CanonicalRecord = serde_json::from_value(json!({
            "name": "Ridge Hospital",
            "yearEstablished": 1962,
            "address_city": "Accra",
        }))
        .unwrap();
        assert_eq!(record.extra.get("yearEstablished"), Some(&json!(1962)));
        assert_eq!(record.extra.get("address_city"), Some(&json!("Accra")));
    }

    #[test]
    fn skeleton_initializes_composites_as_valid_json_strings() {
        let canonical = CanonicalRecord {
            name: Some("Test Hospital".to_string()),
            source_url: Some("https://example.org".to_string()),
            ..Default::default()
        };
        let t = TranslatedRecord::skeleton(&canonical);
        assert_eq!(t.name.as_deref(), Some("Test Hospital"));
        assert_eq!(t.contact_info, "{}");
        assert_eq!(t.medical_details, "{}");
        assert_eq!(t.reliability_reasons, "[]");
        assert!(t.reliability.is_none());
        assert!(t.created_at.is_none());
        for composite in [&t.organization_info, &t.location_info, &t.stats] {
            serde_json::from_str::<Value>(composite).expect("composite must be valid JSON");
        }
    }
}
