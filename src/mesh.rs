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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_yaml::Mapping;
use tracing::{error, info};

use crate::cluster::{self, ClusterRef, Errors};
use crate::resource::{CleanupStrategy, Context};

/// Key of the mesh config within the config map.
pub const MESH_CONFIG_KEY: &str = "mesh";

/// The subset of MeshConfig this crate edits. Everything else is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_providers: Vec<ExtensionProvider>,
    #[serde(flatten)]
    pub other: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionProvider {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_ext_authz_http: Option<EnvoyExternalAuthorizationHttpProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_ext_authz_grpc: Option<EnvoyExternalAuthorizationGrpcProvider>,
    /// Other provider kinds (tracing, access logging, ...).
    #[serde(flatten)]
    pub other: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyExternalAuthorizationHttpProvider {
    pub service: String,
    pub port: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers_to_upstream_on_allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers_to_downstream_on_deny: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_request_headers_in_check: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub include_additional_headers_in_check: BTreeMap<String, String>,
    #[serde(flatten)]
    pub other: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyExternalAuthorizationGrpcProvider {
    pub service: String,
    pub port: u32,
    #[serde(flatten)]
    pub other: Mapping,
}

impl MeshConfig {
    pub fn from_yaml(yaml: &str) -> Result<MeshConfig, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(MeshConfig::default());
        }
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn provider(&self, name: &str) -> Option<&ExtensionProvider> {
        self.extension_providers.iter().find(|p| p.name == name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] cluster::Error),
    #[error("mesh config was missing in config map {0}")]
    Missing(String),
    #[error("invalid mesh config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("update rejected: {0}")]
    Update(String),
    #[error("{0}")]
    Clusters(Errors<Error>),
}

type Originals = Arc<Mutex<Vec<(ClusterRef, String)>>>;

/// Rewrites the mesh config of every cluster with `update`. The original config of each
/// cluster is restored when the context is closed, subject to `strategy`.
pub async fn update_mesh_config<F>(
    ctx: &Context,
    system_namespace: &str,
    clusters: &[ClusterRef],
    update: F,
    strategy: CleanupStrategy,
) -> Result<(), Error>
where
    F: Fn(&mut MeshConfig) -> Result<(), Error> + Sync,
{
    let cm_name = ctx.settings().mesh_config_map_name();
    let originals: Originals = Default::default();

    let res = cluster::fan_out(clusters, |c| {
        let (cm_name, originals, update) = (&cm_name, &originals, &update);
        async move {
            let mut cm = c.get_config_map(system_namespace, cm_name).await?;
            let data = cm.data.get_or_insert_with(Default::default);
            let original = data
                .get(MESH_CONFIG_KEY)
                .cloned()
                .ok_or_else(|| Error::Missing(format!("{system_namespace}/{cm_name}")))?;
            originals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((c.clone(), original.clone()));

            let mut mc = MeshConfig::from_yaml(&original)?;
            update(&mut mc)?;
            let patched = mc.to_yaml()?;
            data.insert(MESH_CONFIG_KEY.to_string(), patched.clone());
            c.update_config_map(system_namespace, &cm).await?;
            info!("patched {} meshconfig:\n{}", c.name(), patched);
            Ok(())
        }
    })
    .await;

    // Restore whatever was read, even if another cluster failed.
    let namespace = system_namespace.to_string();
    let name = format!("restore mesh config {cm_name}");
    ctx.cleanup(strategy, name, move || restore(namespace, cm_name, originals));

    res.map(|_| ()).map_err(Error::Clusters)
}

async fn restore(namespace: String, cm_name: String, originals: Originals) {
    let originals = {
        let mut originals = originals.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *originals)
    };
    let results = futures::future::join_all(originals.into_iter().map(|(c, original)| {
        let (namespace, cm_name) = (&namespace, &cm_name);
        async move {
            let mut cm = c.get_config_map(namespace, cm_name).await?;
            cm.data
                .get_or_insert_with(Default::default)
                .insert(MESH_CONFIG_KEY.to_string(), original);
            c.update_config_map(namespace, &cm).await?;
            Ok::<_, cluster::Error>(())
        }
    }))
    .await;
    for e in results.into_iter().filter_map(Result::err) {
        error!("failed cleaning up cluster-local config: {e}");
    }
}
