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

//! Just enough of the echo workload model for authz providers to describe which targets they
//! can serve and to validate the responses observed by a caller.

use http::HeaderMap;

use crate::protocol::Protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub protocol: Protocol,
    pub service_port: u16,
}

/// A deployed echo service that can be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service_name: String,
    pub namespace: String,
    pub ports: Vec<Port>,
}

impl Target {
    pub fn fqdn(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.service_name, self.namespace)
    }

    pub fn port_for(&self, protocol: Protocol) -> Option<&Port> {
        self.ports.iter().find(|p| p.protocol == protocol)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub port: Option<Port>,
    /// Headers sent with the request.
    pub headers: HeaderMap,
}

/// A single response as reported back by the echo workload.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub code: u16,
    /// Headers the echo server received.
    pub request_headers: HeaderMap,
    /// Headers the caller received.
    pub response_headers: HeaderMap,
}

impl Response {
    pub fn headers(&self, kind: HeaderType) -> &HeaderMap {
        match kind {
            HeaderType::Request => &self.request_headers,
            HeaderType::Response => &self.response_headers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Request,
    Response,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("no responses received")]
    NoResponses,
    #[error("response[{index}]: {kind:?} header {header} missing value {want:?}, got {got:?}")]
    MissingValue {
        index: usize,
        kind: HeaderType,
        header: String,
        want: String,
        got: Vec<String>,
    },
    #[error("response[{index}]: {kind:?} header {header} has unexpected value {value:?}")]
    UnexpectedValue {
        index: usize,
        kind: HeaderType,
        header: String,
        value: String,
    },
}

/// Validates the responses of a call.
pub type Checker = Box<dyn Fn(&[Response]) -> Result<(), CheckError> + Send + Sync>;

/// Expected header values; a header may be listed with several values.
pub type HeaderValues = Vec<(String, Vec<String>)>;

fn values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .collect()
}

fn each_response(
    responses: &[Response],
    mut f: impl FnMut(usize, &Response) -> Result<(), CheckError>,
) -> Result<(), CheckError> {
    if responses.is_empty() {
        return Err(CheckError::NoResponses);
    }
    for (index, r) in responses.iter().enumerate() {
        f(index, r)?;
    }
    Ok(())
}

fn any_contains(got: &[String], value: &str) -> bool {
    got.iter().any(|g| g.contains(value))
}

/// Every response must carry all of the expected values. A value is found if any value of
/// the header contains it as a substring, since servers often echo whole requests back.
pub fn header_contains(kind: HeaderType, expected: HeaderValues) -> Checker {
    Box::new(move |responses| {
        each_response(responses, |index, r| {
            for (header, want) in &expected {
                let got = values(r.headers(kind), header);
                if let Some(missing) = want.iter().find(|w| !any_contains(&got, w)) {
                    return Err(CheckError::MissingValue {
                        index,
                        kind,
                        header: header.clone(),
                        want: missing.clone(),
                        got,
                    });
                }
            }
            Ok(())
        })
    })
}

/// No response may carry any of the listed values, not even as part of a larger value.
pub fn header_not_contains(kind: HeaderType, unexpected: HeaderValues) -> Checker {
    Box::new(move |responses| {
        each_response(responses, |index, r| {
            for (header, deny) in &unexpected {
                let got = values(r.headers(kind), header);
                if let Some(value) = deny.iter().find(|d| any_contains(&got, d)) {
                    return Err(CheckError::UnexpectedValue {
                        index,
                        kind,
                        header: header.clone(),
                        value: value.clone(),
                    });
                }
            }
            Ok(())
        })
    })
}

/// Combines checkers, failing with the first error.
pub fn and(checkers: Vec<Checker>) -> Checker {
    Box::new(move |responses| checkers.iter().try_for_each(|c| c(responses)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(header: &'static str, vals: &[&'static str]) -> Response {
        let mut r = Response {
            code: 200,
            ..Default::default()
        };
        for v in vals {
            r.request_headers
                .append(header, HeaderValue::from_static(v));
        }
        r
    }

    #[test]
    fn contains() {
        let c = header_contains(
            HeaderType::Request,
            vec![("x-foo".to_string(), vec!["a".to_string(), "b".to_string()])],
        );
        assert!(c(&[response("x-foo", &["a", "b"])]).is_ok());
        assert_eq!(
            c(&[response("x-foo", &["a", "b"]), response("x-foo", &["a"])]),
            Err(CheckError::MissingValue {
                index: 1,
                kind: HeaderType::Request,
                header: "x-foo".to_string(),
                want: "b".to_string(),
                got: vec!["a".to_string()],
            })
        );
        assert_eq!(c(&[]), Err(CheckError::NoResponses));
    }

    #[test]
    fn contains_matches_substrings() {
        let c = header_contains(
            HeaderType::Request,
            vec![("x-foo".to_string(), vec!["override-value".to_string()])],
        );
        let r = response("x-foo", &["additional-header-override-value"]);
        assert!(c(&[r]).is_ok());
        let r = response("x-foo", &["other", "additional-header-override-value"]);
        assert!(c(&[r]).is_ok());
        let r = response("x-foo", &["override", "value"]);
        assert!(c(&[r]).is_err());
    }

    #[test]
    fn not_contains_matches_substrings() {
        let c = header_not_contains(
            HeaderType::Request,
            vec![("x-foo".to_string(), vec!["caller".to_string()])],
        );
        assert!(c(&[response("x-foo", &["server-value"])]).is_ok());
        let r = response("x-foo", &["server-value", "server-value, caller"]);
        assert!(matches!(c(&[r]), Err(CheckError::UnexpectedValue { .. })));
    }

    #[test]
    fn contains_looks_at_the_right_headers() {
        let c = header_contains(
            HeaderType::Response,
            vec![("x-foo".to_string(), vec!["a".to_string()])],
        );
        assert!(c(&[response("x-foo", &["a"])]).is_err());
    }

    #[test]
    fn not_contains() {
        let c = header_not_contains(
            HeaderType::Request,
            vec![("x-foo".to_string(), vec!["bad".to_string()])],
        );
        assert!(c(&[response("x-foo", &["good"])]).is_ok());
        assert!(c(&[response("x-bar", &["bad"])]).is_ok());
        assert!(matches!(
            c(&[response("x-foo", &["good", "bad"])]),
            Err(CheckError::UnexpectedValue { .. })
        ));
    }

    #[test]
    fn and_stops_at_first_failure() {
        let c = and(vec![
            header_contains(
                HeaderType::Request,
                vec![("x-foo".to_string(), vec!["a".to_string()])],
            ),
            header_not_contains(
                HeaderType::Request,
                vec![("x-foo".to_string(), vec!["a".to_string()])],
            ),
        ]);
        assert!(matches!(
            c(&[response("x-foo", &["a"])]),
            Err(CheckError::UnexpectedValue { .. })
        ));
    }

    #[test]
    fn target_fqdn() {
        let t = Target {
            service_name: "b".to_string(),
            namespace: "echo-1".to_string(),
            ports: vec![Port {
                name: "http".to_string(),
                protocol: Protocol::Http,
                service_port: 80,
            }],
        };
        assert_eq!(t.fqdn(), "b.echo-1.svc.cluster.local");
        assert_eq!(t.port_for(Protocol::Http).map(|p| p.service_port), Some(80));
        assert!(t.port_for(Protocol::Tcp).is_none());
    }
}
