//! Upstream source contracts + fixture-backed sources for CRM entities.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldmap_core::{FieldDefinition, RawRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fieldmap-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Deals,
    Persons,
    Organizations,
    Products,
    Activities,
}

impl Entity {
    pub const ALL: [Entity; 5] = [
        Entity::Deals,
        Entity::Persons,
        Entity::Organizations,
        Entity::Products,
        Entity::Activities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Deals => "deals",
            Entity::Persons => "persons",
            Entity::Organizations => "organizations",
            Entity::Products => "products",
            Entity::Activities => "activities",
        }
    }

    /// CRM endpoint serving this entity's field definitions.
    pub fn fields_endpoint(self) -> &'static str {
        match self {
            Entity::Deals => "dealFields",
            Entity::Persons => "personFields",
            Entity::Organizations => "organizationFields",
            Entity::Products => "productFields",
            Entity::Activities => "activityFields",
        }
    }

    /// Key under which this entity's mapping state is persisted.
    pub fn state_key(self) -> String {
        format!("{}_custom_fields_mapping", self.as_str())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Entity::ALL
            .into_iter()
            .find(|e| e.as_str() == needle || e.fields_endpoint().eq_ignore_ascii_case(&needle))
            .ok_or_else(|| format!("unknown entity {s:?}"))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source for {expected} was given a bundle for {actual}")]
    EntityMismatch { expected: Entity, actual: Entity },
    #[error("{endpoint} page {page} reported success=false")]
    Unsuccessful { endpoint: String, page: usize },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub more_items_in_collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdditionalData {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// One page as the CRM API returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct PageEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Vec<T>>,
    #[serde(default)]
    pub additional_data: Option<AdditionalData>,
}

impl<T> PageEnvelope<T> {
    pub fn has_more(&self) -> bool {
        self.additional_data
            .as_ref()
            .and_then(|d| d.pagination.as_ref())
            .is_some_and(|p| p.more_items_in_collection)
    }
}

impl<T: Clone> PageEnvelope<T> {
    /// Page items; `data: null` is an empty page.
    pub fn items(&self, endpoint: &str, page: usize) -> Result<Vec<T>, SourceError> {
        if !self.success {
            return Err(SourceError::Unsuccessful {
                endpoint: endpoint.to_string(),
                page,
            });
        }
        Ok(self.data.clone().unwrap_or_default())
    }
}

/// A page file is either a full envelope or a bare array of items.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PageFile<T> {
    Envelope(PageEnvelope<T>),
    Bare(Vec<T>),
}

pub fn load_page_file<T: DeserializeOwned + Clone>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let endpoint = path.display().to_string();
    match read_json_file::<PageFile<T>>(path)? {
        PageFile::Envelope(envelope) => Ok(envelope.items(&endpoint, 0)?),
        PageFile::Bare(items) => Ok(items),
    }
}

/// Captured responses for one entity: its field pages and its record pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub entity: Entity,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub field_pages: Vec<PageEnvelope<FieldDefinition>>,
    #[serde(default)]
    pub record_pages: Vec<PageEnvelope<RawRecord>>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
pub trait EntitySource: Send + Sync {
    fn entity(&self) -> Entity;

    /// Field-definition pages, in fetch order.
    async fn field_pages(&self) -> Result<Vec<Vec<FieldDefinition>>, SourceError>;

    /// Raw record pages, in fetch order.
    async fn record_pages(&self) -> Result<Vec<Vec<RawRecord>>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    entity: Entity,
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(entity: Entity, bundle: FixtureBundle) -> Result<Self, SourceError> {
        if bundle.entity != entity {
            return Err(SourceError::EntityMismatch {
                expected: entity,
                actual: bundle.entity,
            });
        }
        Ok(Self { entity, bundle })
    }

    pub fn from_path(entity: Entity, path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Self::new(entity, load_fixture_bundle(path)?)
    }
}

/// Whether the capture stopped while the CRM still reported more items.
pub fn is_truncated<T>(envelopes: &[PageEnvelope<T>]) -> bool {
    envelopes.last().is_some_and(PageEnvelope::has_more)
}

fn collect_pages<T: Clone>(
    envelopes: &[PageEnvelope<T>],
    endpoint: &str,
) -> Result<Vec<Vec<T>>, SourceError> {
    if is_truncated(envelopes) {
        warn!(endpoint, pages = envelopes.len(), "last captured page reports more items");
    }
    envelopes
        .iter()
        .enumerate()
        .map(|(page, envelope)| envelope.items(endpoint, page))
        .collect()
}

#[async_trait]
impl EntitySource for FixtureSource {
    fn entity(&self) -> Entity {
        self.entity
    }

    async fn field_pages(&self) -> Result<Vec<Vec<FieldDefinition>>, SourceError> {
        collect_pages(&self.bundle.field_pages, self.entity.fields_endpoint())
    }

    async fn record_pages(&self) -> Result<Vec<Vec<RawRecord>>, SourceError> {
        collect_pages(&self.bundle.record_pages, self.entity.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldmap_core::FieldType;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_bundle_path(entity: Entity) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(entity.as_str())
            .join("sample")
            .join("bundle.json")
    }

    #[test]
    fn entity_names_and_endpoints() {
        assert_eq!("deals".parse::<Entity>().unwrap(), Entity::Deals);
        assert_eq!("personFields".parse::<Entity>().unwrap(), Entity::Persons);
        assert!("leads".parse::<Entity>().is_err());
        assert_eq!(Entity::Organizations.fields_endpoint(), "organizationFields");
        assert_eq!(Entity::Deals.state_key(), "deals_custom_fields_mapping");
    }

    #[tokio::test]
    async fn deals_fixture_serves_pages_in_order() {
        let source =
            FixtureSource::from_path(Entity::Deals, fixture_bundle_path(Entity::Deals)).unwrap();
        assert!(!is_truncated(&source.bundle.field_pages));
        assert!(!is_truncated(&source.bundle.record_pages));
        let field_pages = source.field_pages().await.unwrap();
        assert_eq!(field_pages.len(), 2);
        assert_eq!(field_pages[0][0].key, "title");
        assert!(field_pages[0].iter().any(|d| d.field_type == FieldType::Set && d.edit_flag));

        let record_pages = source.record_pages().await.unwrap();
        assert_eq!(record_pages.len(), 2);
        assert_eq!(record_pages[0][0]["id"], json!(1));
    }

    #[test]
    fn bundle_for_another_entity_is_rejected() {
        let err = FixtureSource::from_path(Entity::Persons, fixture_bundle_path(Entity::Deals))
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::EntityMismatch {
                expected: Entity::Persons,
                actual: Entity::Deals
            }
        ));
    }

    #[test]
    fn envelopes_with_null_data_are_empty_and_failures_are_errors() {
        let empty: PageEnvelope<RawRecord> = serde_json::from_value(json!({
            "success": true,
            "data": null,
            "additional_data": {
                "pagination": {"start": 0, "limit": 100, "more_items_in_collection": false}
            }
        }))
        .unwrap();
        assert!(empty.items("deals", 0).unwrap().is_empty());
        assert!(!empty.has_more());

        let failed: PageEnvelope<RawRecord> =
            serde_json::from_value(json!({"success": false, "error": "unauthorized"})).unwrap();
        assert!(matches!(
            failed.items("deals", 3),
            Err(SourceError::Unsuccessful { page: 3, .. })
        ));
    }

    #[tokio::test]
    async fn truncated_capture_is_detected_and_still_served() {
        let bundle: FixtureBundle = serde_json::from_value(json!({
            "fixture_id": "deals-partial",
            "entity": "deals",
            "captured_from_url": "https://api.pipedrive.com/v1/deals",
            "fetched_at": "2026-02-24T12:00:00Z",
            "record_pages": [
                {
                    "success": true,
                    "data": [{"id": 1}],
                    "additional_data": {
                        "pagination": {"start": 0, "limit": 1, "more_items_in_collection": true}
                    }
                }
            ]
        }))
        .unwrap();
        assert!(is_truncated(&bundle.record_pages));
        assert!(!is_truncated(&bundle.field_pages));

        let source = FixtureSource::new(Entity::Deals, bundle).unwrap();
        let pages = source.record_pages().await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0][0]["id"], json!(1));
    }
}
