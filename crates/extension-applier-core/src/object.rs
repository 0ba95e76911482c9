//! The dynamic object model: manifests are arbitrary trees with no
//! compile-time schema, so this module represents them as a small typed
//! projection (`MetadataView`, `ObjectIdentity`) over an opaque
//! [`serde_json::Value`] body, following the teacher's habit of modeling
//! loosely-typed Kubernetes resources as a typed surface plus an untyped
//! remainder (see `commons` throughout `stackable-operator`).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies an object by its API coordinates, used for phase
/// classification and for the canonical `(group, version, kind, namespace,
/// name)` sort order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// The subset of `metadata` the Sanitizer allows through: everything else
/// (finalizers, ownerReferences, creationTimestamp, uid, resourceVersion,
/// generation, managedFields, deletionTimestamp,
/// deletionGracePeriodSeconds, …) is server-managed and dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataView {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

const ALLOWED_METADATA_KEYS: [&str; 4] = ["annotations", "labels", "name", "namespace"];

/// A single Kubernetes manifest, represented as an opaque tree with a typed
/// metadata projection kept in sync on mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Object(Value);

impl Object {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or_default()
    }

    /// Splits `apiVersion` into `(group, version)`. Core resources have an
    /// empty group and `apiVersion == version` (e.g. `"v1"`).
    fn group_version(&self) -> (String, String) {
        match self.api_version().split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version().to_string()),
        }
    }

    pub fn identity(&self) -> ObjectIdentity {
        let (group, version) = self.group_version();
        ObjectIdentity {
            group,
            version,
            kind: self.kind().to_string(),
            namespace: self.metadata_namespace(),
            name: self.metadata_name(),
        }
    }

    pub fn metadata_name(&self) -> Option<String> {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn metadata_namespace(&self) -> Option<String> {
        self.0
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn has_status(&self) -> bool {
        self.0.get("status").is_some()
    }

    pub fn drop_status(&mut self) {
        if let Some(map) = self.0.as_object_mut() {
            map.remove("status");
        }
    }

    /// Top-level `metadata` keys currently present, whether or not they're
    /// in the allowed set. Used by the Sanitizer to decide whether a
    /// warn-log is warranted.
    pub fn metadata_keys(&self) -> Vec<String> {
        self.0
            .pointer("/metadata")
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> MetadataView {
        let string_map = |pointer: &str| -> BTreeMap<String, String> {
            self.0
                .pointer(pointer)
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };

        MetadataView {
            name: self.metadata_name(),
            namespace: self.metadata_namespace(),
            labels: string_map("/metadata/labels"),
            annotations: string_map("/metadata/annotations"),
        }
    }

    /// Replaces `metadata` wholesale with `view`, dropping every key not in
    /// [`ALLOWED_METADATA_KEYS`]. This is the core of the Sanitizer's
    /// metadata-restriction step.
    pub fn set_metadata(&mut self, view: MetadataView) {
        let mut metadata = serde_json::Map::new();
        if let Some(name) = view.name {
            metadata.insert("name".to_string(), Value::String(name));
        }
        if let Some(namespace) = view.namespace {
            metadata.insert("namespace".to_string(), Value::String(namespace));
        }
        if !view.labels.is_empty() {
            metadata.insert("labels".to_string(), map_to_value(view.labels));
        }
        if !view.annotations.is_empty() {
            metadata.insert("annotations".to_string(), map_to_value(view.annotations));
        }

        if let Some(object) = self.0.as_object_mut() {
            object.insert("metadata".to_string(), Value::Object(metadata));
        }
    }

    pub fn allowed_metadata_keys() -> &'static [&'static str] {
        &ALLOWED_METADATA_KEYS
    }
}

fn map_to_value(map: BTreeMap<String, String>) -> Value {
    Value::Object(
        map.into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    )
}

/// A tag on a [`RevisionObject`] controlling whether the apply path is
/// allowed to adopt a pre-existing cluster object with the same identity.
///
/// `None` is used for revisions produced by the Legacy Storage Migrator,
/// which must adopt the objects the legacy release already created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CollisionProtection {
    /// Adoption of a pre-existing object with the same identity is allowed.
    None,
    /// The default: server-side apply will not silently take over an
    /// object it doesn't already own. Serializes as the empty string to
    /// match the wire vocabulary external tooling already expects.
    #[default]
    #[serde(rename = "")]
    Strict,
}

/// An [`Object`] paired with its collision-protection tag, the unit the
/// Sanitizer/Phase Sorter and Revision Generator actually operate on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RevisionObject {
    pub object: Object,
    pub collision_protection: CollisionProtection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_splits_group_and_version() {
        let object = Object::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
        }));

        let identity = object.identity();
        assert_eq!(identity.group, "apps");
        assert_eq!(identity.version, "v1");
        assert_eq!(identity.kind, "Deployment");
        assert_eq!(identity.namespace.as_deref(), Some("default"));
        assert_eq!(identity.name.as_deref(), Some("web"));
    }

    #[test]
    fn identity_of_core_resource_has_empty_group() {
        let object = Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
        }));

        let identity = object.identity();
        assert_eq!(identity.group, "");
        assert_eq!(identity.version, "v1");
    }

    #[test]
    fn set_metadata_drops_disallowed_keys() {
        let mut object = Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "uid": "abc-123",
                "resourceVersion": "42",
            },
        }));

        let view = object.metadata();
        object.set_metadata(view);

        let keys: Vec<_> = object
            .as_value()
            .pointer("/metadata")
            .unwrap()
            .as_object()
            .unwrap()
            .keys()
            .collect();
        assert_eq!(keys, vec!["name"]);
    }
}
