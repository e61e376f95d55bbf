use k8s_openapi::api::core::v1::ConfigMap;

/// Key of the generated document inside the config holder.
pub const DOCUMENT_KEY: &str = "values.yaml";

/// Config holder payload; immutable once written, rotated by content hash.
pub fn config_holder(document: &str, cm: &mut ConfigMap) {
    cm.data = Some([(DOCUMENT_KEY.to_string(), document.to_string())].into_iter().collect());
    cm.binary_data = None;
    cm.immutable = Some(true);
}
