// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{ImageSettings, Settings};

/// Image referenced by the upstream ext-authz sample.
pub const SAMPLE_IMAGE: &str = "gcr.io/istio-testing/ext-authz:latest";
/// Pull policy used by the upstream ext-authz sample.
pub const SAMPLE_PULL_POLICY: &str = "IfNotPresent";

const DISTROLESS_SUFFIX: &str = "-distroless";

/// Kinds that are not namespaced; they are applied as they are.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read manifest: {0}")]
    Read(anyhow::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("document {index}: {reason}")]
    InvalidObject { index: usize, reason: String },
}

/// A single Kubernetes object from a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// None for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// The full object, with metadata.namespace filled in for namespaced kinds.
    pub body: Value,
}

impl Object {
    /// Splits apiVersion into (group, version); the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{ns}/{}", self.kind, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// The image reference for the ext-authz server built from the test settings. Distroless
/// builds share a tag with the regular ones, so the suffix is dropped.
pub fn ext_authz_image(image: &ImageSettings) -> String {
    let tag = image
        .tag
        .strip_suffix(DISTROLESS_SUFFIX)
        .unwrap_or(&image.tag);
    format!("{}/ext-authz:{}", image.hub, tag)
}

/// Points the sample at the images under test.
pub fn substitute_image(yaml: &str, image: &ImageSettings) -> String {
    yaml.replace(SAMPLE_IMAGE, &ext_authz_image(image))
        .replace(SAMPLE_PULL_POLICY, &image.pull_policy)
}

/// Reads the ext-authz deployment manifest, with image and pull policy substituted.
pub async fn deployment_yaml(settings: &Settings) -> Result<String, Error> {
    let raw = settings
        .ext_authz_manifest
        .read_to_string()
        .await
        .map_err(Error::Read)?;
    Ok(substitute_image(&raw, &settings.image))
}

fn required<'a>(doc: &'a Value, pointer: &str, index: usize) -> Result<&'a str, Error> {
    doc.pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidObject {
            index,
            reason: format!("missing {pointer}"),
        })
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Returns the object's namespace, filling in `default` when it has none.
fn default_namespace(body: &mut Value, default: &str) -> String {
    let existing = body
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .filter(|ns| !ns.is_empty());
    if let Some(ns) = existing {
        return ns.to_string();
    }
    if let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert("namespace".to_string(), Value::String(default.to_string()));
    }
    default.to_string()
}

/// Parses a multi-document manifest. Namespaced objects without a namespace are placed in
/// `namespace`; cluster-scoped ones are left alone.
pub fn parse(yaml: &str, namespace: &str) -> Result<Vec<Object>, Error> {
    let mut objects = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let mut body = Value::deserialize(doc)?;
        if body.is_null() {
            continue;
        }
        if !body.is_object() {
            return Err(Error::InvalidObject {
                index,
                reason: "not a mapping".to_string(),
            });
        }
        let api_version = required(&body, "/apiVersion", index)?.to_string();
        let kind = required(&body, "/kind", index)?.to_string();
        let name = required(&body, "/metadata/name", index)?.to_string();
        let namespace = if is_cluster_scoped(&kind) {
            None
        } else {
            Some(default_namespace(&mut body, namespace))
        };
        debug!(%kind, %name, ?namespace, "parsed manifest object");
        objects.push(Object {
            api_version,
            kind,
            name,
            namespace,
            body,
        });
    }
    Ok(objects)
}
