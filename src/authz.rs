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

//! Deploys the ext-authz test server and registers it as an extension provider of the mesh,
//! once over HTTP and once over gRPC.

use std::time::Instant;

use tracing::{error, info};

use crate::cluster::{self, Errors};
use crate::namespace::{self, Namespace, NamespaceConfig};
use crate::resource::Context;
use crate::{manifest, mesh, readiness};

mod provider;
mod server;
pub mod template;

pub use provider::*;
pub use server::Server;

pub const HTTP_NAME: &str = "ext-authz-http";
pub const GRPC_NAME: &str = "ext-authz-grpc";
pub const HTTP_PORT: u16 = 8000;
pub const GRPC_PORT: u16 = 9000;

/// Name of the Service (and Deployment) in the sample manifest.
pub const SERVICE_NAME: &str = "ext-authz";

const NAMESPACE_PREFIX: &str = "authz";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Namespace(#[from] namespace::Error),
    #[error("failed to load deployment: {0}")]
    Manifest(#[from] manifest::Error),
    #[error("failed to apply deployment: {0}")]
    Apply(Errors<cluster::Error>),
    #[error("ext-authz endpoints not ready: {0}")]
    Readiness(Errors<readiness::Error>),
    #[error("failed to render provider template: {0}")]
    Template(#[from] minijinja::Error),
    #[error("invalid provider config: {0}")]
    ProviderConfig(#[from] serde_yaml::Error),
    #[error("failed to update mesh config: {0}")]
    MeshConfig(#[from] mesh::Error),
}

/// Deploys the server into `namespace`, or into a fresh injected namespace if none is
/// given, waits for it in every cluster, and installs its providers into the mesh config.
///
/// Nothing is rolled back on failure; whatever was created is removed when the context
/// closes.
pub async fn new(ctx: &Context, namespace: Option<Namespace>) -> Result<Server, Error> {
    let start = Instant::now();
    info!("=== BEGIN: Deploy authz server ===");
    let res = deploy_and_register(ctx, namespace).await;
    match &res {
        Ok(_) => info!(
            "=== SUCCEEDED: Deploy authz server in {:?} ===",
            start.elapsed()
        ),
        Err(e) => {
            error!("=== FAILED: Deploy authz server ===");
            error!("{e}");
        }
    }
    res
}

async fn deploy_and_register(ctx: &Context, namespace: Option<Namespace>) -> Result<Server, Error> {
    let namespace = match namespace {
        Some(ns) => ns,
        None => {
            Namespace::create(
                ctx,
                NamespaceConfig {
                    prefix: NAMESPACE_PREFIX.to_string(),
                    inject: true,
                    ..Default::default()
                },
            )
            .await?
        }
    };

    let server = Server::new(ctx, namespace);
    server.deploy(ctx).await?;
    server.install_providers(ctx).await?;
    Ok(server)
}

/// Suite setup wrapper around [`new`].
pub async fn setup(ctx: &Context, namespace: Option<Namespace>) -> anyhow::Result<Server> {
    Ok(new(ctx, namespace).await?)
}
