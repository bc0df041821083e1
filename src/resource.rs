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

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::cluster::ClusterRef;
use crate::config::Settings;

/// Identifies a resource tracked by a `Context`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, serde::Serialize)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource-{}", self.0)
    }
}

/// Something created by a test that the context knows about.
pub trait Resource {
    fn id(&self) -> ResourceId;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CleanupStrategy {
    /// Always run, even when cleanup is disabled.
    Always,
    /// Skipped when `Settings::no_cleanup` is set, leaving state behind for debugging.
    Conditionally,
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Holds everything tests share for a run: settings, the clusters, and what needs to be
/// torn down afterwards.
pub struct Context {
    settings: Settings,
    clusters: Vec<ClusterRef>,
    next_id: AtomicU64,
    resources: Mutex<Vec<(ResourceId, String)>>,
    cleanups: Mutex<Vec<(String, Cleanup)>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .field("clusters", &self.clusters)
            .field("resources", &*lock(&self.resources))
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking cleanup must not prevent the rest from running.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Context {
    pub fn new(settings: Settings, clusters: Vec<ClusterRef>) -> Context {
        Context {
            settings,
            clusters,
            next_id: AtomicU64::new(1),
            resources: Default::default(),
            cleanups: Default::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clusters(&self) -> &[ClusterRef] {
        &self.clusters
    }

    /// Registers a resource and returns its id.
    pub fn track_resource(&self, description: impl Into<String>) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let description = description.into();
        debug!(%id, %description, "tracking resource");
        lock(&self.resources).push((id, description));
        id
    }

    pub fn resources(&self) -> Vec<(ResourceId, String)> {
        lock(&self.resources).clone()
    }

    /// Schedules `f` to run when the context is closed.
    pub fn cleanup<F, Fut>(&self, strategy: CleanupStrategy, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if strategy == CleanupStrategy::Conditionally && self.settings.no_cleanup {
            debug!(%name, "cleanup disabled, skipping");
            return;
        }
        lock(&self.cleanups).push((name, Box::new(move || f().boxed())));
    }

    /// Runs all registered cleanups, most recent first.
    pub async fn close(&self) {
        loop {
            // Do not hold the lock across the await; cleanups may register more cleanups.
            let next = lock(&self.cleanups).pop();
            let Some((name, cleanup)) = next else {
                break;
            };
            info!("cleanup: {name}");
            cleanup().await;
        }
    }
}
