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

use tracing::{info, warn};

use super::{Error, Provider, SERVICE_NAME, template};
use crate::cluster;
use crate::manifest;
use crate::mesh::{self, MeshConfig};
use crate::namespace::Namespace;
use crate::readiness::{self, WaitOptions};
use crate::resource::{CleanupStrategy, Context, Resource, ResourceId};

/// An ext-authz server deployed in the test clusters and registered with the mesh.
#[derive(Debug, Clone)]
pub struct Server {
    id: ResourceId,
    namespace: Namespace,
    providers: Vec<Provider>,
}

impl Resource for Server {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Server {
    pub(super) fn new(ctx: &Context, namespace: Namespace) -> Server {
        let id = ctx.track_resource(format!("ext-authz server in {namespace}"));
        Server {
            id,
            namespace,
            providers: vec![Provider::http(), Provider::grpc()],
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The providers the server is registered as. The list is a copy; changing it has no
    /// effect on the server.
    pub fn providers(&self) -> Vec<Provider> {
        self.providers.clone()
    }

    pub(super) async fn deploy(&self, ctx: &Context) -> Result<(), Error> {
        let ns = self.namespace.name();
        let yaml = manifest::deployment_yaml(ctx.settings()).await?;
        let objects = manifest::parse(&yaml, ns)?;

        let applied = cluster::fan_out(ctx.clusters(), |c| {
            let objects = &objects;
            async move { c.apply_manifest(ns, objects).await }
        })
        .await;

        let clusters = ctx.clusters().to_vec();
        let namespace = ns.to_string();
        ctx.cleanup(
            CleanupStrategy::Conditionally,
            format!("delete ext-authz deployment in {ns}"),
            move || async move {
                let deleted = cluster::fan_out(&clusters, |c| {
                    let (namespace, objects) = (&namespace, &objects);
                    async move { c.delete_manifest(namespace, objects).await }
                })
                .await;
                if let Err(e) = deleted {
                    warn!("failed to delete ext-authz deployment: {e}");
                }
            },
        );
        applied.map_err(Error::Apply)?;

        readiness::wait_for_service_endpoints_all(
            ctx.clusters(),
            ns,
            SERVICE_NAME,
            WaitOptions::from(ctx.settings()),
        )
        .await
        .map_err(Error::Readiness)
    }

    /// Adds both providers to the mesh config of every cluster.
    pub(super) async fn install_providers(&self, ctx: &Context) -> Result<(), Error> {
        let fragment = template::provider_config(self.namespace.name())?;
        install_providers(ctx, fragment).await
    }
}

async fn install_providers(ctx: &Context, fragment: MeshConfig) -> Result<(), Error> {
    let names: Vec<_> = fragment
        .extension_providers
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    info!(providers = ?names, "installing extension providers");
    // Names are not checked for uniqueness; installing twice lists the providers twice.
    mesh::update_mesh_config(
        ctx,
        &ctx.settings().system_namespace,
        ctx.clusters(),
        |mc| {
            mc.extension_providers
                .extend(fragment.extension_providers.iter().cloned());
            Ok(())
        },
        CleanupStrategy::Conditionally,
    )
    .await?;
    Ok(())
}
