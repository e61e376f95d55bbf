//! Content-hash naming for payload-immutable resources.
//!
//! A name is `<base>-<token>` where the token is derived from the object's
//! canonical form with `metadata.name = <base>`. Tokens use a 28-symbol
//! alphabet: lowercase alphanumerics without `0 1 i l o s u v`.

#![forbid(unsafe_code)]

use atom_kubehub::{kind_of, Managed};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::ApplyError;

pub const ALPHABET: &[u8; 28] = b"abcdefghjkmnpqrtwxyz23456789";
pub const SUFFIX_LEN: usize = 10;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)(?:-([abcdefghjkmnpqrtwxyz23456789]{10}))?$").expect("static regex"));

/// Server-populated metadata that never contributes to identity.
const VOLATILE_META: [&str; 8] =
    ["resourceVersion", "uid", "generation", "creationTimestamp", "managedFields", "ownerReferences", "deletionTimestamp", "selfLink"];

/// What the namer did to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// A suffix was appended.
    Suffixed,
    /// The existing suffix already matches the content.
    Verified,
}

/// Split `name` into base and optional hash suffix.
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match NAME_RE.captures(name) {
        Some(caps) => {
            let base = caps.get(1).map(|m| m.as_str()).unwrap_or(name);
            (base, caps.get(2).map(|m| m.as_str()))
        }
        None => (name, None),
    }
}

/// Sorted-key JSON with volatile metadata and status removed.
pub fn canonical<T: Serialize>(obj: &T) -> Result<Json, serde_json::Error> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in VOLATILE_META {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    Ok(sorted(v))
}

fn sorted(v: Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut entries: Vec<(String, Json)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, val) in entries {
                out.insert(k, sorted(val));
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Encode the first 8 digest bytes into `SUFFIX_LEN` alphabet symbols.
pub fn encode_token(digest: &[u8]) -> String {
    let mut head = [0u8; 8];
    for (dst, src) in head.iter_mut().zip(digest.iter()) {
        *dst = *src;
    }
    let mut n = u64::from_be_bytes(head);
    let radix = ALPHABET.len() as u64;
    let mut out = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        out.push(ALPHABET[(n % radix) as usize] as char);
        n /= radix;
    }
    out
}

/// Token for `obj` as if it were named `base`.
pub fn content_token<K: Managed>(obj: &K, base: &str) -> Result<String, ApplyError> {
    let mut basis = obj.clone();
    basis.meta_mut().name = Some(base.to_string());
    let bytes = serde_json::to_vec(&canonical(&basis)?)?;
    Ok(encode_token(&Sha256::digest(&bytes)))
}

/// Append the content token to an unsuffixed name, or verify an existing suffix.
///
/// A suffix that disagrees with the content is fatal: the payload of an
/// immutable resource changed in place, and renaming it would strand readers
/// pinned to the old name.
pub fn name_by_content<K: Managed>(obj: &mut K) -> Result<Naming, ApplyError> {
    let name = obj.meta().name.clone().unwrap_or_default();
    let (base, existing) = split_name(&name);
    let token = content_token(obj, base)?;
    match existing {
        None => {
            obj.meta_mut().name = Some(format!("{}-{}", base, token));
            Ok(Naming::Suffixed)
        }
        Some(suffix) if suffix == token => Ok(Naming::Verified),
        Some(suffix) => Err(ApplyError::HashMismatch {
            kind: kind_of::<K>(),
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: name.clone(),
            existing: suffix.to_string(),
            computed: token,
        }),
    }
}
