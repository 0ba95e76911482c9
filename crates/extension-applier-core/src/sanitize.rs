//! Strips server-managed metadata from a manifest and applies the caller's
//! object labels, per §4.2 of the spec.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::constants::MAX_ANNOTATION_VALUE_BYTES;
use crate::kvp::KvMap;
use crate::object::Object;

/// Sanitizes `object` in place semantics (consumes and returns), per the
/// four-step contract in §4.2:
///
/// 1. Drop `status`, warning if it was present.
/// 2. Restrict `metadata` to `{annotations, labels, name, namespace}`,
///    warning about any other top-level metadata keys that were dropped.
/// 3. Merge `object_labels` into the object's labels, caller wins.
/// 4. Strip annotation values over [`MAX_ANNOTATION_VALUE_BYTES`] — a
///    purely-internal memory optimization that never fails the sanitize
///    call, per the spec's "any purely-internal failure is ignored".
pub fn sanitize(mut object: Object, object_labels: &BTreeMap<String, String>) -> Object {
    if object.has_status() {
        warn!(
            kind = object.kind(),
            name = object.metadata_name().unwrap_or_default(),
            "dropping status subtree present on incoming manifest"
        );
        object.drop_status();
    }

    let disallowed: Vec<String> = object
        .metadata_keys()
        .into_iter()
        .filter(|key| !Object::allowed_metadata_keys().contains(&key.as_str()))
        .collect();
    if !disallowed.is_empty() {
        warn!(
            kind = object.kind(),
            name = object.metadata_name().unwrap_or_default(),
            keys = ?disallowed,
            "dropping server-managed metadata keys"
        );
    }

    let mut view = object.metadata();
    let merged = KvMap::from(view.labels).merge(&KvMap::from(object_labels.clone()));
    view.labels = merged.into_inner();
    strip_large_annotations(&mut view.annotations);
    object.set_metadata(view);

    object
}

fn strip_large_annotations(annotations: &mut BTreeMap<String, String>) {
    let oversized: Vec<String> = annotations
        .iter()
        .filter(|(_, value)| value.len() > MAX_ANNOTATION_VALUE_BYTES)
        .map(|(key, _)| key.clone())
        .collect();

    for key in oversized {
        debug!(annotation = key, "stripping oversized annotation value");
        annotations.remove(&key);
    }
}
