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
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{info, warn};

use crate::cluster::{self, Errors};
use crate::resource::{CleanupStrategy, Context};

pub const INJECTION_LABEL: &str = "istio-injection";
pub const REVISION_LABEL: &str = "istio.io/rev";

/// Used when no prefix is given, so generated names always start with a letter.
pub const DEFAULT_PREFIX: &str = "test";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create namespace {name}: {source}")]
    Create {
        name: String,
        source: Errors<cluster::Error>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub prefix: String,
    /// Enable sidecar injection for workloads in the namespace.
    pub inject: bool,
    /// Revision to inject; defaults to the revision from the settings.
    pub revision: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        NamespaceConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            inject: false,
            revision: None,
            labels: BTreeMap::new(),
        }
    }
}

impl NamespaceConfig {
    fn labels(&self, default_revision: Option<&str>) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        if self.inject {
            let revision = self
                .revision
                .as_deref()
                .filter(|r| !r.is_empty() && *r != "default")
                .or(default_revision);
            match revision {
                Some(rev) => labels.insert(REVISION_LABEL.to_string(), rev.to_string()),
                None => labels.insert(INJECTION_LABEL.to_string(), "enabled".to_string()),
            };
        }
        labels
    }
}

/// A namespace present in every cluster of the test.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Namespace {
    name: String,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn generate_name(prefix: &str) -> String {
    let prefix = match prefix {
        "" => DEFAULT_PREFIX,
        p => p,
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let sfx: u32 = rand::rng().random_range(0..10000);
    format!("{prefix}-{now}-{sfx}")
}

impl Namespace {
    /// Refers to a namespace that already exists; nothing is created or cleaned up.
    pub fn claim(name: impl Into<String>) -> Namespace {
        Namespace { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a uniquely named namespace in every cluster. It is deleted when the context
    /// closes.
    pub async fn create(ctx: &Context, cfg: NamespaceConfig) -> Result<Namespace, Error> {
        let name = generate_name(&cfg.prefix);
        let labels = cfg.labels(ctx.settings().non_default_revision());

        let created = cluster::fan_out(ctx.clusters(), |c| {
            let name = &name;
            let labels = &labels;
            async move { c.create_namespace(name, labels).await }
        })
        .await;

        // Register cleanup regardless; some clusters may have succeeded.
        let clusters = ctx.clusters().to_vec();
        let ns = name.clone();
        ctx.cleanup(
            CleanupStrategy::Conditionally,
            format!("delete namespace {name}"),
            move || async move {
                let deleted = cluster::fan_out(&clusters, |c| {
                    let ns = &ns;
                    async move { c.delete_namespace(ns).await }
                })
                .await;
                if let Err(e) = deleted {
                    warn!("failed to delete namespace {ns}: {e}");
                }
            },
        );

        created.map_err(|source| Error::Create {
            name: name.clone(),
            source,
        })?;
        info!(namespace = %name, "created namespace");
        Ok(Namespace { name })
    }
}
