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

use minijinja::Environment;

use super::{Error, GRPC_NAME, GRPC_PORT, HTTP_NAME, HTTP_PORT, SERVICE_NAME};
use crate::mesh::MeshConfig;

const PROVIDER_TEMPLATE: &str = r#"
extensionProviders:
- name: "{{ httpName }}"
  envoyExtAuthzHttp:
    service: "{{ fqdn }}"
    port: {{ httpPort }}
    headersToUpstreamOnAllow: ["x-ext-authz-*"]
    headersToDownstreamOnDeny: ["x-ext-authz-*"]
    includeRequestHeadersInCheck: ["x-ext-authz"]
    includeAdditionalHeadersInCheck:
      x-ext-authz-additional-header-new: additional-header-new-value
      x-ext-authz-additional-header-override: additional-header-override-value
- name: "{{ grpcName }}"
  envoyExtAuthzGrpc:
    service: "{{ fqdn }}"
    port: {{ grpcPort }}"#;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateArgs {
    pub fqdn: String,
    pub http_name: &'static str,
    pub grpc_name: &'static str,
    pub http_port: u16,
    pub grpc_port: u16,
}

impl TemplateArgs {
    pub fn for_namespace(namespace: &str) -> TemplateArgs {
        TemplateArgs {
            fqdn: service_fqdn(namespace),
            http_name: HTTP_NAME,
            grpc_name: GRPC_NAME,
            http_port: HTTP_PORT,
            grpc_port: GRPC_PORT,
        }
    }
}

pub fn service_fqdn(namespace: &str) -> String {
    format!("{SERVICE_NAME}.{namespace}.svc.cluster.local")
}

pub fn render(args: &TemplateArgs) -> Result<String, Error> {
    Ok(Environment::new().render_str(PROVIDER_TEMPLATE, args)?)
}

/// The mesh config fragment declaring both providers for the server in `namespace`.
pub fn provider_config(namespace: &str) -> Result<MeshConfig, Error> {
    let yaml = render(&TemplateArgs::for_namespace(namespace))?;
    Ok(MeshConfig::from_yaml(&yaml)?)
}
