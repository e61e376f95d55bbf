//! Owner custom resources: `Atom` and the `OwnerInfo` object it references.

#![forbid(unsafe_code)]

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::AtomStatus;

/// Desired state of an Atom download service.
#[derive(CustomResource, JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[kube(
    group = "pdok.nl",
    version = "v2beta1",
    kind = "Atom",
    namespaced,
    status = "AtomStatus",
    shortname = "atom",
    printcolumn = r#"{"name":"Reconciled","type":"string","jsonPath":".status.conditions[?(@.type=='Reconciled')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AtomSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    pub service: AtomService,
    #[serde(default)]
    pub dataset_feeds: Vec<DatasetFeed>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_in_days: Option<i32>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AtomService {
    /// Public URL of the service; its path is the routing prefix.
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stylesheet: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// Name of the `OwnerInfo` object in the same namespace.
    pub owner_info_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_metadata_links: Option<MetadataLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataLink {
    pub metadata_identifier: String,
    #[serde(default)]
    pub templates: Vec<String>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub email: String,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFeed {
    /// Used in feed URLs; must be unique within the Atom.
    pub technical_name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_metadata_links: Option<MetadataLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_dataset_identifier_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_dataset_identifier_namespace: Option<String>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub technical_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<Srs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Polygon>,
    #[serde(default)]
    pub download_links: Vec<DownloadLink>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Srs {
    pub uri: String,
    pub name: String,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Polygon {
    pub bbox: BBox,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BBox {
    pub minx: String,
    pub miny: String,
    pub maxx: String,
    pub maxy: String,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    /// `<storage prefix>/<file>`, e.g. `public/owner/dataset/file.gpkg`.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

impl DownloadLink {
    /// Storage prefix (everything before the last `/`), or `None` for a bare file name.
    pub fn blob_prefix(&self) -> Option<&str> {
        self.data.rsplit_once('/').map(|(prefix, _)| prefix)
    }

    /// File name (last path segment).
    pub fn file_name(&self) -> &str {
        match self.data.rsplit_once('/') {
            Some((_, file)) => file,
            None => &self.data,
        }
    }
}

/// Organisation metadata referenced by `spec.service.ownerInfoRef`.
#[derive(CustomResource, JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[kube(group = "pdok.nl", version = "v1beta1", kind = "OwnerInfo", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct OwnerInfoSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_urls: Option<MetadataUrls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom: Option<OwnerAtom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_site: Option<ProviderSite>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csw: Option<MetadataUrlTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<MetadataUrlTemplate>,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUrlTemplate {
    pub href_template: String,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OwnerAtom {
    pub author: Author,
}

#[derive(JsonSchema, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSite {
    #[serde(rename = "type")]
    pub type_: String,
    pub href: String,
}
