//! Response classification.
//!
//! An ordered list of rules, each a predicate over the endpoint URL and the
//! response status and body. The first matching rule decides the verdict.
//! Tunnel-specific checks are confined to [`TunnelRecognizer`].

use std::fmt;

use hookrelay_core::TransportErrorCode;
use url::Url;

use crate::client::HttpResponse;

/// What the worker does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Mark delivered. No retry.
    Delivered,
    /// Ask the scheduler for another attempt.
    Retry,
    /// Disable the endpoint. No retry.
    DisableEndpoint,
    /// Delete the endpoint. No retry.
    DeleteEndpoint,
    /// Stop with the endpoint untouched.
    Abandon,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Retry => write!(f, "retry"),
            Self::DisableEndpoint => write!(f, "disable_endpoint"),
            Self::DeleteEndpoint => write!(f, "delete_endpoint"),
            Self::Abandon => write!(f, "abandon"),
        }
    }
}

/// Recognizes endpoints behind ephemeral development tunnels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRecognizer {
    host_suffixes: Vec<String>,
}

impl Default for TunnelRecognizer {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TUNNEL_HOST_SUFFIXES.iter().copied())
    }
}

impl TunnelRecognizer {
    /// Creates a recognizer for hosts ending in `.<suffix>`.
    pub fn new<S: Into<String>>(host_suffixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            host_suffixes: host_suffixes
                .into_iter()
                .map(|s| s.into().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Configured suffixes, lowercase and without a leading dot.
    pub fn host_suffixes(&self) -> &[String] {
        &self.host_suffixes
    }

    /// Whether the URL's host is a subdomain of a tunnel suffix.
    pub fn is_tunnel_url(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase))
        else {
            return false;
        };

        self.host_suffixes.iter().any(|suffix| host.ends_with(&format!(".{suffix}")))
    }

    /// Whether the body is the tunnel service's "tunnel <host> not found"
    /// page. Case-insensitive; the host must end in a tunnel suffix.
    pub fn is_missing_tunnel_body(&self, body: &str) -> bool {
        let lower = body.to_lowercase();

        self.host_suffixes.iter().any(|suffix| {
            let tail = format!(".{suffix} not found");
            lower.match_indices("tunnel ").any(|(start, prefix)| {
                let rest = &lower[start + prefix.len()..];
                rest.match_indices(&tail)
                    .any(|(end, _)| end > 0 && !rest[..end].contains('\n'))
            })
        })
    }
}

type Predicate = fn(&TunnelRecognizer, &str, &HttpResponse) -> bool;

/// One entry in the ordered rule list.
#[derive(Clone)]
pub struct Rule {
    /// Stable name reported in events and logs.
    pub name: &'static str,
    predicate: Predicate,
    /// Verdict when the predicate holds.
    pub verdict: Verdict,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).field("verdict", &self.verdict).finish()
    }
}

/// Result of classifying one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Name of the rule that matched.
    pub rule: &'static str,
    /// What to do next.
    pub verdict: Verdict,
}

/// Rule name used when no listed rule matched.
pub const FALLBACK_RULE: &str = "other_status";

/// Ordered classifier for HTTP responses and transport failures.
#[derive(Debug, Clone)]
pub struct Classifier {
    recognizer: TunnelRecognizer,
    rules: Vec<Rule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(TunnelRecognizer::default())
    }
}

impl Classifier {
    /// Builds the standard rule list around `recognizer`.
    pub fn new(recognizer: TunnelRecognizer) -> Self {
        let rules = vec![
            Rule {
                name: "success",
                predicate: |_, _, r| r.is_success(),
                verdict: Verdict::Delivered,
            },
            Rule {
                name: "tunnel_not_found",
                predicate: |t, url, r| {
                    r.status == 404 && t.is_tunnel_url(url) && t.is_missing_tunnel_body(&r.body)
                },
                verdict: Verdict::DeleteEndpoint,
            },
            Rule {
                name: "tunnel_bad_gateway",
                predicate: |t, url, r| r.status == 502 && t.is_tunnel_url(url),
                verdict: Verdict::Retry,
            },
            Rule {
                name: "tunnel_gateway_timeout",
                predicate: |t, url, r| r.status == 504 && t.is_tunnel_url(url),
                verdict: Verdict::DisableEndpoint,
            },
        ];

        Self { recognizer, rules }
    }

    /// The tunnel recognizer in use.
    pub fn recognizer(&self) -> &TunnelRecognizer {
        &self.recognizer
    }

    /// The ordered rules, excluding the fallback.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classifies an HTTP response from `url`.
    pub fn classify_response(&self, url: &str, response: &HttpResponse) -> Classification {
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(&self.recognizer, url, response))
            .map(|rule| Classification { rule: rule.name, verdict: rule.verdict })
            .unwrap_or(Classification { rule: FALLBACK_RULE, verdict: Verdict::Retry })
    }

    /// Classifies a failure that produced no response.
    pub fn classify_transport(&self, code: TransportErrorCode) -> Classification {
        match code {
            TransportErrorCode::Tls => {
                Classification { rule: "tls_error", verdict: Verdict::Retry }
            },
            TransportErrorCode::Connection => {
                Classification { rule: "connection_error", verdict: Verdict::DisableEndpoint }
            },
            TransportErrorCode::Timeout => {
                Classification { rule: "timeout_error", verdict: Verdict::Abandon }
            },
        }
    }
}
