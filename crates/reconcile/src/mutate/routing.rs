use atom_apply::identity;
use atom_apply::ApplyError;
use atom_core::config::path_of;
use atom_core::traefik::{
    Headers, IngressRouteSpec, MiddlewareRef, MiddlewareSpec, ReplacePathRegex, Route, RouteService, StripPrefix,
};
use atom_core::{Atom, IngressRoute, Middleware, OperatorConfig};

use super::SERVICE_PORT;

/// Host and path prefix every rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInputs {
    pub host: String,
    /// Path of the atom's base URL without trailing `/`; empty for the root.
    pub path: String,
}

impl RouteInputs {
    pub fn new(atom: &Atom, cfg: &OperatorConfig) -> Result<Self, ApplyError> {
        let host = cfg.host().map_err(|e| ApplyError::Mutate(e.to_string()))?;
        let base_url = &atom.spec.service.base_url;
        let path = path_of(base_url)
            .ok_or_else(|| ApplyError::Mutate(format!("service.baseUrl {:?} is not an absolute url", base_url)))?;
        Ok(Self { host, path })
    }
}

/// Files served from one storage prefix, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadGroup {
    pub prefix: String,
    pub files: Vec<String>,
}

/// Group every download link by storage prefix, walking feeds, entries and
/// links in declaration order.
pub fn download_groups(atom: &Atom) -> Vec<DownloadGroup> {
    let mut groups: Vec<DownloadGroup> = Vec::new();
    let links = atom.spec.dataset_feeds.iter().flat_map(|f| f.entries.iter()).flat_map(|e| e.download_links.iter());
    for link in links {
        let prefix = link.blob_prefix().unwrap_or("");
        let file = link.file_name();
        let idx = match groups.iter().position(|g| g.prefix == prefix) {
            Some(i) => i,
            None => {
                groups.push(DownloadGroup { prefix: prefix.to_string(), files: Vec::new() });
                groups.len() - 1
            }
        };
        let files = &mut groups[idx].files;
        if !files.iter().any(|f| f == file) {
            files.push(file.to_string());
        }
    }
    groups
}

fn mw_ref(atom: &Atom, suffix: &str) -> MiddlewareRef {
    MiddlewareRef { name: identity::bare_name(atom, suffix), namespace: None }
}

fn rule(atom: &Atom, match_: String, middlewares: Vec<MiddlewareRef>) -> Route {
    Route {
        kind: "Rule".into(),
        match_,
        services: vec![RouteService { name: identity::bare_name(atom, identity::ATOM), port: SERVICE_PORT, kind: None }],
        middlewares,
    }
}

/// Index rule, one rule per dataset feed, then the downloads rule.
pub fn routing_rules(atom: &Atom, cfg: &OperatorConfig, inputs: &RouteInputs, groups: &[DownloadGroup], ir: &mut IngressRoute) {
    let RouteInputs { host, path } = inputs;
    let common = vec![mw_ref(atom, identity::CORS_HEADERS), mw_ref(atom, identity::PREFIX_STRIP)];

    let mut routes = vec![rule(atom, format!("Host(`{}`) && Path(`{}/index.xml`)", host, path), common.clone())];
    for feed in &atom.spec.dataset_feeds {
        routes.push(rule(atom, format!("Host(`{}`) && Path(`{}/{}.xml`)", host, path, feed.technical_name), common.clone()));
    }
    // rewrites run before the prefix strip, which then no longer matches
    let mut downloads = vec![mw_ref(atom, identity::CORS_HEADERS)];
    downloads.extend((0..groups.len()).map(|i| mw_ref(atom, &identity::downloads(i))));
    downloads.push(mw_ref(atom, identity::PREFIX_STRIP));
    routes.push(rule(atom, format!("Host(`{}`) && PathPrefix(`{}/downloads/`)", host, path), downloads));

    ir.spec = IngressRouteSpec { entry_points: cfg.entry_points.clone(), routes };
}

pub fn cors_headers(mw: &mut Middleware) {
    mw.spec = MiddlewareSpec {
        headers: Some(Headers {
            access_control_allow_methods: vec!["GET".into(), "HEAD".into(), "OPTIONS".into()],
            access_control_allow_origin_list: vec!["*".into()],
            access_control_allow_headers: Vec::new(),
            access_control_max_age: Some(100),
            add_vary_header: Some(true),
        }),
        ..MiddlewareSpec::default()
    };
}

pub fn prefix_strip(inputs: &RouteInputs, mw: &mut Middleware) {
    mw.spec = MiddlewareSpec { strip_prefix: Some(StripPrefix { prefixes: vec![inputs.path.clone()] }), ..MiddlewareSpec::default() };
}

/// `^<path>/downloads/(f1|f2|..)$` rewritten to `/<prefix>/$1`.
pub fn downloads_rewrite(inputs: &RouteInputs, group: &DownloadGroup, mw: &mut Middleware) {
    let alternatives: Vec<String> = group.files.iter().map(|f| regex::escape(f)).collect();
    let replacement = if group.prefix.is_empty() { "/$1".to_string() } else { format!("/{}/$1", group.prefix) };
    mw.spec = MiddlewareSpec {
        replace_path_regex: Some(ReplacePathRegex {
            regex: format!("^{}/downloads/({})$", regex::escape(&inputs.path), alternatives.join("|")),
            replacement,
        }),
        ..MiddlewareSpec::default()
    };
}
