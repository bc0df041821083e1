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
use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;

use ext_authz_testing::authz::{self, Api};
use ext_authz_testing::config::{ConfigSource, Settings};
use ext_authz_testing::mesh::MeshConfig;
use ext_authz_testing::namespace::{self, Namespace, NamespaceConfig};
use ext_authz_testing::protocol::Protocol;
use ext_authz_testing::resource::Resource;
use ext_authz_testing::test_helpers::fake::FakeCluster;
use ext_authz_testing::test_helpers::*;

const REJECTION: &str = "admission webhook denied the request";

fn labels(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

fn providers_in(cluster: &FakeCluster) -> Vec<String> {
    let mesh = cluster.mesh_config(SYSTEM_NAMESPACE, "istio").unwrap();
    MeshConfig::from_yaml(&mesh)
        .unwrap()
        .extension_providers
        .into_iter()
        .map(|p| p.name)
        .collect()
}

#[tokio::test]
async fn deploys_and_registers_in_every_cluster() {
    helpers::initialize_telemetry();
    let clusters = [mesh_cluster("primary"), mesh_cluster("remote")];
    let ctx = test_context(&clusters);

    let server = authz::new(&ctx, None).await.unwrap();
    let ns = server.namespace().name().to_string();
    assert!(ns.starts_with("authz-"), "{ns}");

    for c in &clusters {
        let state = c.state();
        assert_eq!(
            state.namespaces.get(&ns),
            Some(&labels(namespace::INJECTION_LABEL, "enabled"))
        );

        let deployment = &state.objects[&format!("Deployment/{ns}/ext-authz")];
        let container = &deployment.body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "localhost:5000/ext-authz:1.99-dev");
        assert_eq!(container["imagePullPolicy"], "Never");
        assert!(state.objects.contains_key(&format!("Service/{ns}/ext-authz")));

        assert_eq!(
            providers_in(c),
            vec!["zipkin", "ext-authz-http", "ext-authz-grpc"]
        );
        let yaml = c.mesh_config(SYSTEM_NAMESPACE, "istio").unwrap();
        let mc = MeshConfig::from_yaml(&yaml).unwrap();
        let fqdn = format!("ext-authz.{ns}.svc.cluster.local");
        let http = mc.provider("ext-authz-http").unwrap();
        let http = http.envoy_ext_authz_http.as_ref().unwrap();
        assert_eq!((http.service.as_str(), http.port), (fqdn.as_str(), 8000));
        let grpc = mc.provider("ext-authz-grpc").unwrap();
        let grpc = grpc.envoy_ext_authz_grpc.as_ref().unwrap();
        assert_eq!((grpc.service.as_str(), grpc.port), (fqdn.as_str(), 9000));
        assert!(mc.other.contains_key("defaultConfig"));
    }

    let providers = server.providers();
    let apis: Vec<_> = providers.iter().map(|p| (p.name(), p.api())).collect();
    assert_eq!(
        apis,
        vec![("ext-authz-http", Api::Http), ("ext-authz-grpc", Api::Grpc)]
    );
    assert!(!providers[0].is_protocol_supported(Protocol::Tcp));
    assert!(providers[1].is_protocol_supported(Protocol::Tcp));
    assert!(
        ctx.resources().iter().any(|(id, _)| *id == server.id()),
        "server is tracked"
    );

    ctx.close().await;
    for c in &clusters {
        let state = c.state();
        assert!(state.namespaces.is_empty());
        assert!(state.objects.is_empty());
        assert_eq!(
            c.mesh_config(SYSTEM_NAMESPACE, "istio").as_deref(),
            Some(DEFAULT_MESH_CONFIG)
        );
    }
}

#[tokio::test]
async fn providers_are_a_copy() {
    let clusters = [mesh_cluster("primary")];
    let ctx = test_context(&clusters);
    let server = authz::new(&ctx, None).await.unwrap();

    let mut providers = server.providers();
    providers.clear();
    assert_eq!(server.providers().len(), 2);
    ctx.close().await;
}

#[tokio::test]
async fn uses_given_namespace() {
    let clusters = [mesh_cluster("primary")];
    let ctx = test_context(&clusters);
    let ns = Namespace::create(
        &ctx,
        NamespaceConfig {
            prefix: "mine".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let server = authz::new(&ctx, Some(ns.clone())).await.unwrap();
    assert_eq!(server.namespace(), &ns);
    let state = clusters[0].state();
    assert_eq!(state.namespaces.len(), 1);
    let deployment = format!("Deployment/{}/ext-authz", ns.name());
    assert!(state.objects.contains_key(&deployment));
    ctx.close().await;
}

#[tokio::test(start_paused = true)]
async fn readiness_failures_are_combined() {
    let cm = fake::mesh_config_map("istio", Some(DEFAULT_MESH_CONFIG));
    let remote_1 = FakeCluster::new("remote-1")
        .without_ready_endpoints()
        .with_config_map(SYSTEM_NAMESPACE, cm);
    let clusters = [
        Arc::new(remote_1),
        mesh_cluster("primary"),
        Arc::new(FakeCluster::new("remote-2").without_ready_endpoints()),
    ];
    let settings = Settings {
        readiness_timeout: Duration::from_secs(5),
        ..test_settings()
    };
    let ctx = test_context_with(settings, &clusters);

    let err = authz::new(&ctx, None).await.unwrap_err();
    let authz::Error::Readiness(errs) = &err else {
        panic!("unexpected error: {err}");
    };
    let failed: Vec<_> = errs.iter().map(|(c, _)| c).collect();
    assert_eq!(failed, vec!["remote-1", "remote-2"]);
    assert!(err.to_string().contains("2 errors occurred"), "{err}");

    // Nothing was registered with the mesh.
    assert_eq!(providers_in(&clusters[1]), vec!["zipkin"]);
    assert_eq!(clusters[1].state().config_map_updates, 0);

    // The partial deployment is still cleaned up.
    ctx.close().await;
    assert!(clusters.iter().all(|c| c.state().objects.is_empty()));
}

#[tokio::test]
async fn apply_failure_surfaces() {
    let clusters = [Arc::new(FakeCluster::new("primary").reject_apply(REJECTION))];
    let ctx = test_context(&clusters);
    let err = authz::new(&ctx, None).await.unwrap_err();
    assert_matches!(err, authz::Error::Apply(_));
    assert!(err.to_string().contains(REJECTION), "{err}");
}

#[tokio::test]
async fn missing_manifest() {
    let clusters = [mesh_cluster("primary")];
    let settings = Settings {
        ext_authz_manifest: ConfigSource::File("/does/not/exist.yaml".into()),
        ..test_settings()
    };
    let ctx = test_context_with(settings, &clusters);
    let err = authz::new(&ctx, None).await.unwrap_err();
    assert_matches!(err, authz::Error::Manifest(_));
    assert!(clusters[0].state().objects.is_empty());
}

#[tokio::test]
async fn missing_mesh_config() {
    let clusters = [Arc::new(FakeCluster::new("primary"))];
    let ctx = test_context(&clusters);
    let err = authz::new(&ctx, None).await.unwrap_err();
    assert_matches!(err, authz::Error::MeshConfig(_));
}

#[tokio::test]
async fn revision_config_map() {
    let cm = fake::mesh_config_map("istio-canary", Some(DEFAULT_MESH_CONFIG));
    let cluster = Arc::new(FakeCluster::new("primary").with_config_map(SYSTEM_NAMESPACE, cm));
    let settings = Settings {
        revision: Some("canary".to_string()),
        ..test_settings()
    };
    let ctx = test_context_with(settings, &[cluster.clone()]);
    let server = authz::new(&ctx, None).await.unwrap();

    let state = cluster.state();
    assert_eq!(
        state.namespaces[server.namespace().name()],
        labels(namespace::REVISION_LABEL, "canary")
    );
    let mesh = cluster.mesh_config(SYSTEM_NAMESPACE, "istio-canary").unwrap();
    let mc = MeshConfig::from_yaml(&mesh).unwrap();
    assert_eq!(mc.extension_providers.len(), 3);
}

#[tokio::test]
async fn no_cleanup_keeps_everything() {
    let clusters = [mesh_cluster("primary")];
    let settings = Settings {
        no_cleanup: true,
        ..test_settings()
    };
    let ctx = test_context_with(settings, &clusters);
    let server = authz::new(&ctx, None).await.unwrap();
    ctx.close().await;

    let state = clusters[0].state();
    assert!(state.namespaces.contains_key(server.namespace().name()));
    assert_eq!(
        providers_in(&clusters[0]),
        vec!["zipkin", "ext-authz-http", "ext-authz-grpc"]
    );
}

#[tokio::test]
async fn installing_twice_duplicates_providers() {
    let clusters = [mesh_cluster("primary")];
    let ctx = test_context(&clusters);
    authz::new(&ctx, None).await.unwrap();
    authz::setup(&ctx, None).await.unwrap();
    assert_eq!(
        providers_in(&clusters[0]),
        vec![
            "zipkin",
            "ext-authz-http",
            "ext-authz-grpc",
            "ext-authz-http",
            "ext-authz-grpc",
        ]
    );

    // Restores unwind in reverse, ending at the original config.
    ctx.close().await;
    assert_eq!(
        clusters[0].mesh_config(SYSTEM_NAMESPACE, "istio").as_deref(),
        Some(DEFAULT_MESH_CONFIG)
    );
}
