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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::cluster::ClusterRef;
use crate::config::{ConfigSource, ImageSettings, Settings};
use crate::resource::Context;
use crate::test_helpers::fake::{FakeCluster, mesh_config_map};

pub mod fake;
pub mod helpers;

pub const SYSTEM_NAMESPACE: &str = "istio-system";

/// A mesh config as installed by default, with one unrelated provider already present.
pub const DEFAULT_MESH_CONFIG: &str = r#"accessLogFile: /dev/stdout
defaultConfig:
  discoveryAddress: istiod.istio-system.svc:15012
  proxyMetadata: {}
enablePrometheusMerge: true
extensionProviders:
- name: zipkin
  zipkin:
    service: zipkin.istio-system.svc.cluster.local
    port: 9411
rootNamespace: istio-system
trustDomain: cluster.local
"#;

static SAMPLE_MANIFEST: &[u8] = include_bytes!("../samples/extauthz/ext-authz.yaml");

pub fn test_settings() -> Settings {
    Settings {
        image: ImageSettings {
            hub: "localhost:5000".to_string(),
            tag: "1.99-dev-distroless".to_string(),
            pull_policy: "Never".to_string(),
        },
        source_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        ext_authz_manifest: ConfigSource::Static(Bytes::from_static(SAMPLE_MANIFEST)),
        system_namespace: SYSTEM_NAMESPACE.to_string(),
        revision: None,
        no_cleanup: false,
        readiness_timeout: Duration::from_secs(30),
        readiness_poll_interval: Duration::from_millis(100),
    }
}

/// A cluster with the default mesh config installed.
pub fn mesh_cluster(name: &str) -> Arc<FakeCluster> {
    let cm = mesh_config_map("istio", Some(DEFAULT_MESH_CONFIG));
    Arc::new(FakeCluster::new(name).with_config_map(SYSTEM_NAMESPACE, cm))
}

pub fn test_context(clusters: &[Arc<FakeCluster>]) -> Context {
    test_context_with(test_settings(), clusters)
}

pub fn test_context_with(settings: Settings, clusters: &[Arc<FakeCluster>]) -> Context {
    let clusters: Vec<ClusterRef> = clusters.iter().map(|c| c.clone() as ClusterRef).collect();
    Context::new(settings, clusters)
}

