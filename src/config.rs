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

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

const HUB: &str = "HUB";
const TAG: &str = "TAG";
const PULL_POLICY: &str = "PULL_POLICY";
const REPO_ROOT: &str = "REPO_ROOT";
const ISTIO_SYSTEM_NAMESPACE: &str = "ISTIO_SYSTEM_NAMESPACE";
const ISTIO_REVISION: &str = "ISTIO_REVISION";
const ISTIO_TEST_NO_CLEANUP: &str = "ISTIO_TEST_NO_CLEANUP";
const READINESS_TIMEOUT: &str = "READINESS_TIMEOUT";
const READINESS_POLL_INTERVAL: &str = "READINESS_POLL_INTERVAL";

const DEFAULT_HUB: &str = "gcr.io/istio-testing";
const DEFAULT_TAG: &str = "latest";
const DEFAULT_PULL_POLICY: &str = "Always";
const DEFAULT_SYSTEM_NAMESPACE: &str = "istio-system";
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Location of the ext-authz sample, relative to the source root.
pub const EXT_AUTHZ_MANIFEST_PATH: &str = "samples/extauthz/ext-authz.yaml";

/// Name of the mesh config map for the default revision.
const MESH_CONFIG_MAP: &str = "istio";

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

/// Image coordinates used to build the images of test workloads.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSettings {
    pub hub: String,
    pub tag: String,
    pub pull_policy: String,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub image: ImageSettings,

    /// Root of the Istio source tree; samples are resolved against it.
    pub source_root: PathBuf,
    /// Deployment manifest of the ext-authz server.
    #[serde(skip_serializing)]
    pub ext_authz_manifest: ConfigSource,

    /// Namespace of the control plane, holding the mesh config map.
    pub system_namespace: String,
    /// Control plane revision. Empty and "default" both select the default revision.
    pub revision: Option<String>,

    /// If true, conditional cleanups are skipped so state can be inspected after a run.
    pub no_cleanup: bool,

    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
}

impl Settings {
    /// The revision in effect, if it is not the default one.
    pub fn non_default_revision(&self) -> Option<&str> {
        self.revision
            .as_deref()
            .filter(|r| !r.is_empty() && *r != "default")
    }

    /// Name of the config map holding the mesh config for the configured revision.
    pub fn mesh_config_map_name(&self) -> String {
        match self.non_default_revision() {
            Some(rev) => format!("{MESH_CONFIG_MAP}-{rev}"),
            None => MESH_CONFIG_MAP.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
}

/// GoDuration wraps a Duration to accept golang style durations ("30s", "2m").
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(GoDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}

pub fn parse_settings() -> Result<Settings, Error> {
    let source_root = parse::<PathBuf>(REPO_ROOT)?
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    construct_settings(source_root)
}

pub fn construct_settings(source_root: impl AsRef<Path>) -> Result<Settings, Error> {
    let source_root = source_root.as_ref().to_path_buf();
    Ok(Settings {
        image: ImageSettings {
            hub: parse_default(HUB, DEFAULT_HUB.to_string())?,
            tag: parse_default(TAG, DEFAULT_TAG.to_string())?,
            pull_policy: parse_default(PULL_POLICY, DEFAULT_PULL_POLICY.to_string())?,
        },
        ext_authz_manifest: ConfigSource::File(source_root.join(EXT_AUTHZ_MANIFEST_PATH)),
        source_root,
        system_namespace: parse_default(
            ISTIO_SYSTEM_NAMESPACE,
            DEFAULT_SYSTEM_NAMESPACE.to_string(),
        )?,
        revision: empty_to_none(parse(ISTIO_REVISION)?),
        no_cleanup: parse_default(ISTIO_TEST_NO_CLEANUP, false)?,
        readiness_timeout: parse(READINESS_TIMEOUT)?
            .map(|gd: GoDuration| gd.0)
            .unwrap_or(DEFAULT_READINESS_TIMEOUT),
        readiness_poll_interval: parse(READINESS_POLL_INTERVAL)?
            .map(|gd: GoDuration| gd.0)
            .unwrap_or(DEFAULT_READINESS_POLL_INTERVAL),
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let cfg = construct_settings("/src/istio").unwrap();
        assert_eq!(
            cfg.ext_authz_manifest,
            ConfigSource::File("/src/istio/samples/extauthz/ext-authz.yaml".into())
        );
        assert_eq!(cfg.source_root, PathBuf::from("/src/istio"));
    }

    #[test]
    fn mesh_config_map_per_revision() {
        let mut cfg = construct_settings("/src/istio").unwrap();
        cfg.revision = None;
        assert_eq!(cfg.mesh_config_map_name(), "istio");
        cfg.revision = Some("default".to_string());
        assert_eq!(cfg.mesh_config_map_name(), "istio");
        cfg.revision = Some(String::new());
        assert_eq!(cfg.mesh_config_map_name(), "istio");
        cfg.revision = Some("canary".to_string());
        assert_eq!(cfg.mesh_config_map_name(), "istio-canary");
    }

    #[test]
    fn go_durations() {
        let d: GoDuration = "90s".parse().unwrap();
        assert_eq!(d.0, Duration::from_secs(90));
        let d: GoDuration = "2m".parse().unwrap();
        assert_eq!(d.0, Duration::from_secs(120));
        assert!("soon".parse::<GoDuration>().is_err());
    }

    #[tokio::test]
    async fn static_source() {
        let src = ConfigSource::Static(Bytes::from_static(b"kind: Service"));
        assert_eq!(src.read_to_string().await.unwrap(), "kind: Service");
    }
}
