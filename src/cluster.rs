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
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};

use crate::manifest::Object;

mod kubernetes;
pub use kubernetes::KubeCluster;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("invalid object {0}: {1}")]
    InvalidObject(String, String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// The operations the test framework needs from a cluster.
#[async_trait]
pub trait Cluster: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    /// Creates or updates all objects. Each object goes to its own namespace, which parsing
    /// sets to `namespace` unless the manifest names another; cluster-scoped objects have none.
    async fn apply_manifest(&self, namespace: &str, objects: &[Object]) -> Result<(), Error>;

    /// Deletes all objects; objects that are already gone are ignored.
    async fn delete_manifest(&self, namespace: &str, objects: &[Object]) -> Result<(), Error>;

    async fn service_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<Endpoints>, Error>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, Error>;

    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<(), Error>;
}

pub type ClusterRef = Arc<dyn Cluster>;

/// Errors from several clusters, each tagged with the cluster it came from.
#[derive(Debug)]
pub struct Errors<E>(pub Vec<(String, E)>);

impl<E> Errors<E> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &E)> {
        self.0.iter().map(|(c, e)| (c.as_str(), e))
    }
}

impl<E: fmt::Display> fmt::Display for Errors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [(cluster, e)] = self.0.as_slice() {
            return write!(f, "cluster {cluster}: {e}");
        }
        write!(f, "{} errors occurred:", self.0.len())?;
        for (cluster, e) in &self.0 {
            write!(f, "\n\t* cluster {cluster}: {e}")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Errors<E> {}

/// Runs `f` against every cluster concurrently and waits for all of them. Every failure is
/// reported, not just the first one.
pub async fn fan_out<T, E, F, Fut>(clusters: &[ClusterRef], f: F) -> Result<Vec<T>, Errors<E>>
where
    F: Fn(ClusterRef) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let results = futures::future::join_all(clusters.iter().map(|c| {
        let name = c.name().to_string();
        let fut = f(c.clone());
        async move { (name, fut.await) }
    }))
    .await;

    let mut ok = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for (name, res) in results {
        match res {
            Ok(v) => ok.push(v),
            Err(e) => errors.push((name, e)),
        }
    }
    if errors.is_empty() {
        Ok(ok)
    } else {
        Err(Errors(errors))
    }
}
