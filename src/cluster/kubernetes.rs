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
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    PostParams,
};
use kube::client::Client;
use tracing::{debug, instrument};

use super::{Cluster, Error};
use crate::manifest::Object;

const FIELD_MANAGER: &str = "istio-test-framework";

/// A cluster reached through the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
}

impl fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeCluster")
            .field("name", &self.name)
            .finish()
    }
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, client: Client) -> KubeCluster {
        KubeCluster {
            name: name.into(),
            client,
        }
    }

    /// Connects using the ambient kubeconfig or in-cluster config.
    pub async fn try_default(name: impl Into<String>) -> Result<KubeCluster, Error> {
        Ok(KubeCluster::new(name, Client::try_default().await?))
    }

    fn dynamic_api(&self, obj: &Object) -> Api<DynamicObject> {
        let (group, version) = obj.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &obj.kind);
        let ar = ApiResource::from_gvk(&gvk);
        match &obj.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl Cluster for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(cluster = %self.name, namespace = name))]
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await?;
        debug!("created namespace");
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %self.name, namespace = name))]
    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, fields(cluster = %self.name, namespace = namespace))]
    async fn apply_manifest(&self, namespace: &str, objects: &[Object]) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for obj in objects {
            let dynamic: DynamicObject = serde_json::from_value(obj.body.clone())
                .map_err(|e| Error::InvalidObject(obj.key(), e.to_string()))?;
            self.dynamic_api(obj)
                .patch(&obj.name, &params, &Patch::Apply(&dynamic))
                .await?;
            debug!(kind = %obj.kind, name = %obj.name, "applied");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %self.name, namespace = namespace))]
    async fn delete_manifest(&self, namespace: &str, objects: &[Object]) -> Result<(), Error> {
        // Delete in reverse so dependents go before the things they depend on.
        for obj in objects.iter().rev() {
            let api = self.dynamic_api(obj);
            match api.delete(&obj.name, &DeleteParams::background()).await {
                Ok(_) => debug!(kind = %obj.kind, name = %obj.name, "deleted"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn service_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(service).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await?.ok_or_else(|| Error::NotFound {
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
        let Some(name) = config_map.metadata.name.as_deref() else {
            return Err(Error::InvalidObject(
                "ConfigMap".to_string(),
                "missing name".to_string(),
            ));
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), config_map).await?;
        Ok(())
    }
}
