//! Generated configuration document for the atom generator.
//!
//! The engine only needs [`SpecTranslator`]; [`YamlTranslator`] is the
//! default used by the operator binary.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use atom_core::crd::{Author, BBox, DatasetFeed, Entry, MetadataLink};
use atom_core::{Atom, OwnerInfo};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid atom: {0}")]
    Invalid(String),
    #[error("rendering document: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Must be deterministic: identical inputs yield byte-identical documents.
pub trait SpecTranslator: Send + Sync {
    fn translate(&self, atom: &Atom, owner_info: &OwnerInfo) -> Result<String, TranslateError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlTranslator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratorConfig<'a> {
    service: ServiceDoc<'a>,
    datasets: Vec<DatasetDoc<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDoc<'a> {
    id: String,
    base_url: &'a str,
    lang: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stylesheet: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rights: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a Author>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    links: Vec<LinkDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetDoc<'a> {
    id: String,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spatial_dataset_identifier_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spatial_dataset_identifier_namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    links: Vec<LinkDoc>,
    entries: Vec<EntryDoc<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryDoc<'a> {
    id: String,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    polygon: Option<&'a BBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    srs: Option<&'a atom_core::crd::Srs>,
    links: Vec<DownloadDoc<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkDoc {
    rel: String,
    href: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadDoc<'a> {
    href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bbox: Option<&'a BBox>,
}

fn metadata_links(owner_info: &OwnerInfo, link: Option<&MetadataLink>) -> Vec<LinkDoc> {
    let (link, urls) = match (link, owner_info.spec.metadata_urls.as_ref()) {
        (Some(l), Some(u)) => (l, u),
        _ => return Vec::new(),
    };
    let mut out = Vec::new();
    for template in &link.templates {
        let tpl = match template.as_str() {
            "csw" => urls.csw.as_ref(),
            "html" => urls.html.as_ref(),
            _ => None,
        };
        if let Some(tpl) = tpl {
            out.push(LinkDoc {
                rel: "describedby".into(),
                href: tpl.href_template.replace("{{identifier}}", &link.metadata_identifier),
            });
        }
    }
    out
}

fn entry_doc<'a>(base_url: &str, entry: &'a Entry) -> EntryDoc<'a> {
    EntryDoc {
        id: format!("{}/{}", base_url, entry.technical_name),
        title: entry.title.as_deref().unwrap_or(&entry.technical_name),
        content: entry.content.as_deref(),
        updated: entry.updated.as_deref(),
        polygon: entry.polygon.as_ref().map(|p| &p.bbox),
        srs: entry.srs.as_ref(),
        links: entry
            .download_links
            .iter()
            .map(|l| DownloadDoc {
                href: format!("{}/downloads/{}", base_url, l.file_name()),
                rel: l.rel.as_deref(),
                time: l.time.as_deref(),
                version: l.version.as_deref(),
                bbox: l.bbox.as_ref(),
            })
            .collect(),
    }
}

fn dataset_doc<'a>(base_url: &str, owner_info: &'a OwnerInfo, feed: &'a DatasetFeed) -> DatasetDoc<'a> {
    DatasetDoc {
        id: format!("{}/{}.xml", base_url, feed.technical_name),
        title: &feed.title,
        subtitle: feed.subtitle.as_deref(),
        author: feed.author.as_ref().or(owner_info.spec.atom.as_ref().map(|a| &a.author)),
        spatial_dataset_identifier_code: feed.spatial_dataset_identifier_code.as_deref(),
        spatial_dataset_identifier_namespace: feed.spatial_dataset_identifier_namespace.as_deref(),
        links: metadata_links(owner_info, feed.dataset_metadata_links.as_ref()),
        entries: feed.entries.iter().map(|e| entry_doc(base_url, e)).collect(),
    }
}

impl SpecTranslator for YamlTranslator {
    fn translate(&self, atom: &Atom, owner_info: &OwnerInfo) -> Result<String, TranslateError> {
        let service = &atom.spec.service;
        if service.title.trim().is_empty() {
            return Err(TranslateError::Invalid("service.title must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for feed in &atom.spec.dataset_feeds {
            if !seen.insert(feed.technical_name.as_str()) {
                return Err(TranslateError::Invalid(format!("duplicate dataset feed technicalName {:?}", feed.technical_name)));
            }
            for entry in &feed.entries {
                if entry.download_links.iter().any(|l| l.file_name().is_empty()) {
                    return Err(TranslateError::Invalid(format!(
                        "entry {:?} of feed {:?} has a download link without file name",
                        entry.technical_name, feed.technical_name
                    )));
                }
            }
        }
        let base_url = service.base_url.trim_end_matches('/');
        let doc = GeneratorConfig {
            service: ServiceDoc {
                id: format!("{}/index.xml", base_url),
                base_url,
                lang: service.lang.as_deref().unwrap_or("nl"),
                title: &service.title,
                subtitle: service.subtitle.as_deref(),
                stylesheet: service.stylesheet.as_deref(),
                rights: service.rights.as_deref(),
                author: owner_info.spec.atom.as_ref().map(|a| &a.author),
                links: metadata_links(owner_info, service.service_metadata_links.as_ref()),
            },
            datasets: atom.spec.dataset_feeds.iter().map(|f| dataset_doc(base_url, owner_info, f)).collect(),
        };
        Ok(serde_yaml::to_string(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atom_core::crd::{AtomService, DownloadLink, MetadataUrlTemplate, MetadataUrls, OwnerAtom};
    use atom_core::{AtomSpec, OwnerInfoSpec};

    fn atom() -> Atom {
        Atom::new(
            "dataset",
            AtomSpec {
                lifecycle: None,
                service: AtomService {
                    base_url: "https://service.example.com/owner/dataset/atom/".into(),
                    title: "Dataset".into(),
                    owner_info_ref: "owner".into(),
                    service_metadata_links: Some(MetadataLink { metadata_identifier: "abc".into(), templates: vec!["csw".into()] }),
                    ..Default::default()
                },
                dataset_feeds: vec![DatasetFeed {
                    technical_name: "feed".into(),
                    title: "Feed".into(),
                    entries: vec![Entry {
                        technical_name: "e1".into(),
                        download_links: vec![DownloadLink { data: "public/owner/file.gpkg".into(), ..Default::default() }],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
            },
        )
    }

    fn owner_info() -> OwnerInfo {
        OwnerInfo::new(
            "owner",
            OwnerInfoSpec {
                metadata_urls: Some(MetadataUrls {
                    csw: Some(MetadataUrlTemplate { href_template: "https://md.example.com/csw?id={{identifier}}".into() }),
                    html: None,
                }),
                atom: Some(OwnerAtom { author: Author { name: "Owner".into(), email: "owner@example.com".into() } }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn document_is_deterministic() {
        let a = YamlTranslator.translate(&atom(), &owner_info()).unwrap();
        let b = YamlTranslator.translate(&atom(), &owner_info()).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("https://service.example.com/owner/dataset/atom/downloads/file.gpkg"));
        assert!(a.contains("https://md.example.com/csw?id=abc"));
        assert!(a.contains("owner@example.com"));
    }

    #[test]
    fn duplicate_feed_names_are_rejected() {
        let mut a = atom();
        let dup = a.spec.dataset_feeds[0].clone();
        a.spec.dataset_feeds.push(dup);
        let err = YamlTranslator.translate(&a, &owner_info()).unwrap_err();
        assert!(err.to_string().contains("duplicate dataset feed"));
    }

    #[test]
    fn empty_title_is_rejected() {
        let mut a = atom();
        a.spec.service.title = "  ".into();
        assert!(matches!(YamlTranslator.translate(&a, &owner_info()), Err(TranslateError::Invalid(_))));
    }
}
