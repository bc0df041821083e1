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

use std::time::Duration;

use k8s_openapi::api::core::v1::Endpoints;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::{self, Cluster, ClusterRef, Errors};
use crate::config::Settings;

/// Why a service is not ready yet.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    #[error("{0}/{1} endpoint not ready: not found")]
    Missing(String, String),
    #[error("{0}/{1} endpoint not ready: no subsets")]
    NoSubsets(String, String),
    #[error("{0}/{1} endpoint not ready: no ready addresses")]
    NoReadyAddresses(String, String),
}

/// The outcome of the last readiness check before giving up.
#[derive(thiserror::Error, Debug)]
pub enum Pending {
    #[error(transparent)]
    NotReady(#[from] NotReady),
    #[error(transparent)]
    Api(#[from] cluster::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timed out after {timeout:?} waiting for endpoints: {last}")]
    Timeout { timeout: Duration, last: Pending },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl From<&Settings> for WaitOptions {
    fn from(s: &Settings) -> Self {
        WaitOptions {
            timeout: s.readiness_timeout,
            interval: s.readiness_poll_interval,
        }
    }
}

/// Endpoints are ready once some subset has addresses and none of them are pending.
pub fn endpoints_ready(
    namespace: &str,
    service: &str,
    endpoints: Option<Endpoints>,
) -> Result<Endpoints, NotReady> {
    let Some(endpoints) = endpoints else {
        return Err(NotReady::Missing(
            namespace.to_string(),
            service.to_string(),
        ));
    };
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();
    if subsets.is_empty() {
        return Err(NotReady::NoSubsets(
            namespace.to_string(),
            service.to_string(),
        ));
    }
    let ready = subsets.iter().any(|s| {
        let addresses = s.addresses.as_deref().unwrap_or_default();
        let not_ready = s.not_ready_addresses.as_deref().unwrap_or_default();
        !addresses.is_empty() && not_ready.is_empty()
    });
    if !ready {
        return Err(NotReady::NoReadyAddresses(
            namespace.to_string(),
            service.to_string(),
        ));
    }
    Ok(endpoints)
}

/// Polls the service's endpoints until they are ready. API errors are retried like any other
/// not-ready state; whatever was seen last is reported on timeout.
pub async fn wait_for_service_endpoints(
    cluster: &dyn Cluster,
    namespace: &str,
    service: &str,
    opts: WaitOptions,
) -> Result<Endpoints, Error> {
    let deadline = Instant::now() + opts.timeout;
    loop {
        let last: Pending = match cluster.service_endpoints(namespace, service).await {
            Ok(eps) => match endpoints_ready(namespace, service, eps) {
                Ok(eps) => {
                    info!(
                        cluster = cluster.name(),
                        "{namespace}/{service} endpoints ready"
                    );
                    return Ok(eps);
                }
                Err(e) => e.into(),
            },
            Err(e) => e.into(),
        };
        debug!(cluster = cluster.name(), "{last}");
        if Instant::now() + opts.interval > deadline {
            return Err(Error::Timeout {
                timeout: opts.timeout,
                last,
            });
        }
        tokio::time::sleep(opts.interval).await;
    }
}

/// Waits for the service in every cluster concurrently.
pub async fn wait_for_service_endpoints_all(
    clusters: &[ClusterRef],
    namespace: &str,
    service: &str,
    opts: WaitOptions,
) -> Result<(), Errors<Error>> {
    cluster::fan_out(clusters, |c| async move {
        wait_for_service_endpoints(c.as_ref(), namespace, service, opts).await
    })
    .await
    .map(|_| ())
}
