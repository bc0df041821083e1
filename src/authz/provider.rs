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

use crate::echo::{self, CallOptions, Checker, HeaderType, Target};
use crate::protocol::Protocol;

use super::{GRPC_NAME, HTTP_NAME};

/// Header the caller sets to verify that the server overrides it.
pub const ADDITIONAL_HEADER_OVERRIDE: &str = "x-ext-authz-additional-header-override";
/// Header in which the server reports what it received in the check request.
pub const CHECK_RECEIVED: &str = "x-ext-authz-check-received";

const HTTP_OVERRIDE_VALUE: &str = "additional-header-override-value";
const GRPC_OVERRIDE_VALUE: &str = "grpc-additional-header-override-value";

/// The check API spoken between the proxy and the authz server.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Api {
    Http,
    Grpc,
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Api::Http => f.write_str("http"),
            Api::Grpc => f.write_str("grpc"),
        }
    }
}

/// An extension provider backed by the authz server.
#[derive(Clone)]
pub struct Provider {
    name: &'static str,
    api: Api,
    protocol_supported: fn(Protocol) -> bool,
    target_supported: fn(&Target) -> bool,
    check: fn(&CallOptions, bool) -> Checker,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn http() -> Provider {
        Provider {
            name: HTTP_NAME,
            api: Api::Http,
            // The HTTP check API cannot frame raw TCP traffic.
            protocol_supported: |p| !p.is_tcp(),
            target_supported: |_| true,
            check: check_http,
        }
    }

    pub fn grpc() -> Provider {
        Provider {
            name: GRPC_NAME,
            api: Api::Grpc,
            protocol_supported: |_| true,
            target_supported: |_| true,
            check: check_grpc,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn api(&self) -> Api {
        self.api
    }

    pub fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        (self.protocol_supported)(protocol)
    }

    pub fn is_target_supported(&self, target: &Target) -> bool {
        (self.target_supported)(target)
    }

    /// The targets this provider can authorize calls to.
    pub fn supported_targets<'a>(&self, targets: &'a [Target]) -> Vec<&'a Target> {
        targets
            .iter()
            .filter(|t| self.is_target_supported(t))
            .collect()
    }

    /// Builds a checker for the responses of a call made with `opts`.
    pub fn check(&self, opts: &CallOptions, expect_allowed: bool) -> Checker {
        (self.check)(opts, expect_allowed)
    }
}

fn override_value(opts: &CallOptions) -> Option<String> {
    opts.headers
        .get(ADDITIONAL_HEADER_OVERRIDE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Allowed requests are inspected as received by the upstream; denied ones in the response
/// sent back to the caller.
fn header_type(expect_allowed: bool) -> HeaderType {
    if expect_allowed {
        HeaderType::Request
    } else {
        HeaderType::Response
    }
}

fn check_http(opts: &CallOptions, expect_allowed: bool) -> Checker {
    let kind = header_type(expect_allowed);
    let caller_value = override_value(opts);
    let mut expected = vec![(
        ADDITIONAL_HEADER_OVERRIDE.to_string(),
        vec![HTTP_OVERRIDE_VALUE.to_string()],
    )];
    let mut checkers = Vec::new();
    if let Some(v) = caller_value {
        expected.push((CHECK_RECEIVED.to_string(), vec![v.clone()]));
        checkers.push(echo::header_not_contains(
            kind,
            vec![(ADDITIONAL_HEADER_OVERRIDE.to_string(), vec![v])],
        ));
    }
    checkers.insert(0, echo::header_contains(kind, expected));
    echo::and(checkers)
}

fn check_grpc(opts: &CallOptions, expect_allowed: bool) -> Checker {
    let kind = header_type(expect_allowed);
    let mut checkers = vec![echo::header_contains(
        kind,
        vec![(
            ADDITIONAL_HEADER_OVERRIDE.to_string(),
            vec![GRPC_OVERRIDE_VALUE.to_string()],
        )],
    )];
    if let Some(v) = override_value(opts) {
        checkers.push(echo::header_not_contains(
            kind,
            vec![(ADDITIONAL_HEADER_OVERRIDE.to_string(), vec![v])],
        ));
    }
    echo::and(checkers)
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderValue};
    use matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::echo::{CheckError, Port, Response};

    const CALLER_VALUE: &str = "should-be-overridden";
    const CHECK_DUMP: &str = "GET b:80/, headers: map[X-Ext-Authz:[allow] \
        X-Ext-Authz-Additional-Header-Override:[should-be-overridden] \
        X-Forwarded-Proto:[http]], body: []";

    fn target(protocol: Protocol) -> Target {
        Target {
            service_name: "b".to_string(),
            namespace: "echo".to_string(),
            ports: vec![Port {
                name: protocol.to_string().to_lowercase(),
                protocol,
                service_port: 80,
            }],
        }
    }

    fn opts(override_value: Option<&'static str>) -> CallOptions {
        let mut headers = HeaderMap::new();
        if let Some(v) = override_value {
            headers.insert(ADDITIONAL_HEADER_OVERRIDE, HeaderValue::from_static(v));
        }
        CallOptions {
            headers,
            ..Default::default()
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test_case(Protocol::Tcp, false; "tcp")]
    #[test_case(Protocol::Tls, false; "tls")]
    #[test_case(Protocol::Https, false; "https")]
    #[test_case(Protocol::Mongo, false; "mongo")]
    #[test_case(Protocol::Redis, false; "redis")]
    #[test_case(Protocol::Mysql, false; "mysql")]
    #[test_case(Protocol::Http, true; "http")]
    #[test_case(Protocol::Http2, true; "http2")]
    #[test_case(Protocol::Grpc, true; "grpc")]
    #[test_case(Protocol::Udp, true; "udp")]
    #[test_case(Protocol::Unsupported, true; "unsupported")]
    fn http_protocols(p: Protocol, supported: bool) {
        assert_eq!(Provider::http().is_protocol_supported(p), supported);
    }

    #[test_case(Protocol::Tcp; "tcp")]
    #[test_case(Protocol::Http; "http")]
    #[test_case(Protocol::Grpc; "grpc")]
    #[test_case(Protocol::Tls; "tls")]
    #[test_case(Protocol::Unsupported; "unsupported")]
    fn grpc_accepts_everything(p: Protocol) {
        let grpc = Provider::grpc();
        assert!(grpc.is_protocol_supported(p));
        assert!(grpc.is_target_supported(&target(p)));
    }

    #[test]
    fn identity() {
        let http = Provider::http();
        assert_eq!(http.name(), "ext-authz-http");
        assert_eq!(http.api(), Api::Http);
        assert_eq!(http.api().to_string(), "http");
        let grpc = Provider::grpc();
        assert_eq!(grpc.name(), "ext-authz-grpc");
        assert_eq!(grpc.api().to_string(), "grpc");
    }

    #[test]
    fn all_targets_supported() {
        let targets = vec![target(Protocol::Tcp), target(Protocol::Http)];
        assert_eq!(Provider::http().supported_targets(&targets).len(), 2);
        assert_eq!(Provider::grpc().supported_targets(&targets).len(), 2);
    }

    #[test]
    fn http_check_allowed() {
        let check = Provider::http().check(&opts(Some(CALLER_VALUE)), true);
        let good = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (CHECK_RECEIVED, "should-be-overridden"),
            ]),
            ..Default::default()
        };
        assert!(check(std::slice::from_ref(&good)).is_ok());

        let not_overridden = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (ADDITIONAL_HEADER_OVERRIDE, "should-be-overridden"),
                (CHECK_RECEIVED, "should-be-overridden"),
            ]),
            ..Default::default()
        };
        assert!(check(&[good, not_overridden]).is_err());
    }

    #[test]
    fn http_check_accepts_echoed_check_request() {
        let check = Provider::http().check(&opts(Some(CALLER_VALUE)), true);
        let allowed = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (CHECK_RECEIVED, CHECK_DUMP),
            ]),
            ..Default::default()
        };
        assert_eq!(check(&[allowed]), Ok(()));
    }

    #[test]
    fn http_check_requires_caller_value_in_check_request() {
        let check = Provider::http().check(&opts(Some(CALLER_VALUE)), true);
        let dump = "GET b:80/, headers: map[X-Ext-Authz:[allow]], body: []";
        let dropped = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (CHECK_RECEIVED, dump),
            ]),
            ..Default::default()
        };
        assert_matches!(
            check(&[dropped]),
            Err(CheckError::MissingValue { header, want, .. })
                if header == CHECK_RECEIVED && want == CALLER_VALUE
        );
    }

    #[test]
    fn http_check_rejects_caller_value_among_several() {
        let check = Provider::http().check(&opts(Some(CALLER_VALUE)), true);
        // A proxy may fold repeated headers into one comma separated value.
        let value = "additional-header-override-value, should-be-overridden";
        let folded = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, value),
                (CHECK_RECEIVED, CHECK_DUMP),
            ]),
            ..Default::default()
        };
        assert_matches!(
            check(&[folded]),
            Err(CheckError::UnexpectedValue { header, value, .. })
                if header == ADDITIONAL_HEADER_OVERRIDE && value == CALLER_VALUE
        );
    }

    #[test]
    fn http_check_denied_with_echoed_check_request() {
        let check = Provider::http().check(&opts(Some(CALLER_VALUE)), false);
        let denied = Response {
            code: 403,
            response_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (CHECK_RECEIVED, CHECK_DUMP),
            ]),
            ..Default::default()
        };
        assert_eq!(check(&[denied]), Ok(()));
    }

    #[test]
    fn grpc_value_is_not_the_http_value() {
        // The HTTP value is a substring of the gRPC one, not the other way around.
        let check = Provider::grpc().check(&opts(Some(CALLER_VALUE)), true);
        let value = "x-envoy, additional-header-override-value";
        let http_only = Response {
            code: 200,
            request_headers: headers(&[(ADDITIONAL_HEADER_OVERRIDE, value)]),
            ..Default::default()
        };
        assert_matches!(check(&[http_only]), Err(CheckError::MissingValue { .. }));
        let both = Response {
            code: 200,
            request_headers: headers(&[
                (ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE),
                (ADDITIONAL_HEADER_OVERRIDE, GRPC_OVERRIDE_VALUE),
            ]),
            ..Default::default()
        };
        assert_eq!(check(&[both]), Ok(()));
    }

    #[test]
    fn http_check_denied_uses_response_headers() {
        let check = Provider::http().check(&opts(None), false);
        let in_request = Response {
            code: 403,
            request_headers: headers(&[(ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE)]),
            ..Default::default()
        };
        assert!(check(std::slice::from_ref(&in_request)).is_err());
        let in_response = Response {
            code: 403,
            response_headers: headers(&[(ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE)]),
            ..Default::default()
        };
        assert!(check(&[in_response]).is_ok());
    }

    #[test]
    fn grpc_check() {
        let check = Provider::grpc().check(&opts(Some("caller")), true);
        let http_value = Response {
            code: 200,
            request_headers: headers(&[(ADDITIONAL_HEADER_OVERRIDE, HTTP_OVERRIDE_VALUE)]),
            ..Default::default()
        };
        assert!(check(&[http_value]).is_err());
        let grpc_value = Response {
            code: 200,
            request_headers: headers(&[(ADDITIONAL_HEADER_OVERRIDE, GRPC_OVERRIDE_VALUE)]),
            ..Default::default()
        };
        assert!(check(&[grpc_value]).is_ok());
    }
}
