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

use std::env;

use tracing::{Event, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, prelude::*};

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

const CRATE_PREFIX: &str = "ext_authz_testing::";

/// Installs the global subscriber. LOG_FORMAT=json switches to structured output and
/// RUST_LOG controls the filter.
pub fn setup_logging() {
    tracing_subscriber::registry().with(fmt_layer()).init();
}

fn fmt_layer() -> BoxLayer {
    let format: BoxLayer = match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_span_list(false),
        ),
        _ => Box::new(tracing_subscriber::fmt::layer().event_format(TestFormat)),
    };
    let filter = env_filter(env::var(EnvFilter::DEFAULT_ENV).ok());
    Box::new(format.with_filter(filter))
}

/// The kube client logs every request at debug; it stays at info unless named explicitly.
fn env_filter(directives: Option<String>) -> EnvFilter {
    let directives = directives.unwrap_or_else(|| "info".to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse_lossy(format!("kube_client=info,hyper_util=info,{directives}"))
}

fn module(target: &str) -> &str {
    target.strip_prefix(CRATE_PREFIX).unwrap_or(target)
}

/// Writes `<time>\t<level>\t<module>[<span fields>]\t<message> <fields>`. Span fields carry
/// the cluster and namespace a Kubernetes call was made against.
struct TestFormat;

impl<S, N> FormatEvent<S, N> for TestFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        let level = meta.level().as_str().to_ascii_lowercase();
        write!(writer, "\t{level}\t{}", module(meta.target()))?;

        let span_fields: Vec<String> = ctx
            .event_scope()
            .into_iter()
            .flat_map(|scope| scope.from_root())
            .filter_map(|span| {
                let ext = span.extensions();
                ext.get::<FormattedFields<N>>()
                    .filter(|f| !f.is_empty())
                    .map(|f| f.to_string())
            })
            .collect();
        if !span_fields.is_empty() {
            write!(writer, "[{}]", span_fields.join(" "))?;
        }

        write!(writer, "\t")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
