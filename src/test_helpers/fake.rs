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
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, EndpointAddress, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cluster::{Cluster, Error};
use crate::manifest::Object;

/// Endpoints with a single ready address.
pub fn ready_endpoints() -> Endpoints {
    Endpoints {
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.1".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn mesh_config_map(name: &str, mesh: Option<&str>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(
            mesh.map(|m| BTreeMap::from([("mesh".to_string(), m.to_string())]))
                .unwrap_or_default(),
        ),
        ..Default::default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeState {
    /// Namespace name to labels.
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
    /// Objects keyed by kind/namespace/name.
    pub objects: BTreeMap<String, Object>,
    /// Config maps keyed by namespace/name.
    pub config_maps: BTreeMap<String, ConfigMap>,
    /// Endpoints keyed by namespace/name.
    pub endpoints: BTreeMap<String, Endpoints>,
    pub endpoint_polls: usize,
    pub config_map_updates: usize,
}

/// An in-memory cluster. Applying a Service makes its endpoints ready immediately unless
/// disabled with `without_ready_endpoints`.
#[derive(Debug)]
pub struct FakeCluster {
    name: String,
    ready_on_apply: bool,
    reject_apply: Option<String>,
    reject_config_map_updates: Option<String>,
    state: Mutex<FakeState>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl FakeCluster {
    pub fn new(name: &str) -> FakeCluster {
        FakeCluster {
            name: name.to_string(),
            ready_on_apply: true,
            reject_apply: None,
            reject_config_map_updates: None,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn without_ready_endpoints(mut self) -> FakeCluster {
        self.ready_on_apply = false;
        self
    }

    pub fn reject_apply(mut self, reason: &str) -> FakeCluster {
        self.reject_apply = Some(reason.to_string());
        self
    }

    pub fn reject_config_map_updates(mut self, reason: &str) -> FakeCluster {
        self.reject_config_map_updates = Some(reason.to_string());
        self
    }

    pub fn with_config_map(self, namespace: &str, cm: ConfigMap) -> FakeCluster {
        let name = cm.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(key(namespace, &name), cm);
        self
    }

    pub fn set_endpoints(&self, namespace: &str, service: &str, eps: Endpoints) {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .insert(key(namespace, service), eps);
    }

    pub fn state(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    pub fn mesh_config(&self, namespace: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .and_then(|cm| cm.data.as_ref())
            .and_then(|d| d.get("mesh").cloned())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.namespaces.contains_key(name) {
            return Err(Error::Rejected(format!("namespace {name} already exists")));
        }
        state.namespaces.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.namespaces.remove(name);
        state
            .objects
            .retain(|_, o| o.namespace.as_deref() != Some(name));
        let prefix = format!("{name}/");
        state.endpoints.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn apply_manifest(&self, _namespace: &str, objects: &[Object]) -> Result<(), Error> {
        if let Some(reason) = &self.reject_apply {
            return Err(Error::Rejected(reason.clone()));
        }
        let mut state = self.state.lock().unwrap();
        for obj in objects {
            let ns = obj.namespace.as_deref().unwrap_or_default();
            if obj.namespace.is_some() && !state.namespaces.contains_key(ns) {
                return Err(Error::NotFound {
                    kind: "Namespace",
                    namespace: String::new(),
                    name: ns.to_string(),
                });
            }
            state.objects.insert(obj.key(), obj.clone());
            if self.ready_on_apply && obj.kind == "Service" {
                state
                    .endpoints
                    .insert(key(ns, &obj.name), ready_endpoints());
            }
        }
        Ok(())
    }

    async fn delete_manifest(&self, _namespace: &str, objects: &[Object]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        for obj in objects {
            state.objects.remove(&obj.key());
            if let (Some(ns), "Service") = (&obj.namespace, obj.kind.as_str()) {
                state.endpoints.remove(&key(ns, &obj.name));
            }
        }
        Ok(())
    }

    async fn service_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<Endpoints>, Error> {
        let mut state = self.state.lock().unwrap();
        state.endpoint_polls += 1;
        Ok(state.endpoints.get(&key(namespace, service)).cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, Error> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "ConfigMap",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        if let Some(reason) = &self.reject_config_map_updates {
            return Err(Error::Rejected(reason.clone()));
        }
        let name = config_map.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.config_map_updates += 1;
        state
            .config_maps
            .insert(key(namespace, &name), config_map.clone());
        Ok(())
    }
}
