//! The ACME challenge relay zone.
//!
//! Clients derive their delegated name as the SHA-224 of a secret of their
//! choosing and publish TXT challenge strings under it through the HTTP
//! side-channel. `_acme-challenge.<zone>` vends a CNAME back into the zone
//! so certificate automation works without any API credentials.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use sha2::{Digest, Sha224};
use tracing::error;

use crate::http::values::RequestValues;
use crate::http::App;
use crate::names::{equal_names, lower_name};
use crate::response::{records, Rr};
use crate::store::TtlStore;
use crate::zones::{Addrs, Question};
use domain::base::iana::Rtype;

pub const CHALLENGE_TTL: u32 = 120;

/// A legal ACME challenge string: 1-255 characters of `[A-Za-z0-9_-]`.
///
/// `=` stays forbidden so a raw request body can never be confused with a
/// form-encoded one.
pub fn is_valid_challenge(s: &str) -> bool {
    (1..=255).contains(&s.len())
        && s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
}

/// A delegated label: exactly 56 hex digits and the separating dot.
pub fn is_hash_subdomain(sub: &str) -> bool {
    let b = sub.as_bytes();
    b.len() == 57 && b[56] == b'.' && b[..56].iter().all(u8::is_ascii_hexdigit)
}

/// The delegated domain for a client secret.
pub fn domain_for_secret(secret: &str, zone: &str) -> String {
    format!("{:x}.{}", Sha224::digest(secret.as_bytes()), zone)
}

//------------ Generator -----------------------------------------------------

pub struct Generator {
    pub addrs: Addrs,
    pub self_challenge_target: Option<String>,
    pub challenge_store: Arc<TtlStore>,
}

impl Generator {
    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        let mut rrs = Vec::new();
        if q.name.len() < zone.len() {
            return (rrs, false);
        }
        let sub = &q.name[..q.name.len() - zone.len()];
        if sub.is_empty() {
            match q.qtype {
                Rtype::A => {
                    rrs.extend(self.addrs.v4.iter().map(|&ip| records::a(q.name, 300, ip)));
                }
                Rtype::AAAA => {
                    rrs.extend(self.addrs.v6.iter().map(|&ip| records::aaaa(q.name, 300, ip)));
                }
                Rtype::HTTPS => {
                    rrs.extend(records::https(q.name, 300, &self.addrs.v4, &self.addrs.v6));
                }
                _ => {}
            }
            return (rrs, true);
        }
        if equal_names(sub, "_acme-challenge.") {
            if q.qtype == Rtype::TXT {
                if let Some(target) = &self.self_challenge_target {
                    rrs.push(records::cname(q.name, 300, target));
                }
            }
            return (rrs, true);
        }
        if is_hash_subdomain(sub) {
            if q.qtype == Rtype::TXT {
                for value in self.challenge_store.values(&lower_name(q.name)) {
                    if let Ok(text) = String::from_utf8(value) {
                        rrs.push(records::txt(q.name, 1, &text));
                    }
                }
            }
            return (rrs, true);
        }
        (rrs, false)
    }
}

//------------ HTTP API ------------------------------------------------------

/// `GET/POST/PUT/DELETE /challenges`.
pub async fn http_handler(State(app): State<Arc<App>>, req: Request) -> HttpResponse {
    let method = req.method().clone();
    if !matches!(
        method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE
    ) {
        return method_not_allowed("GET, POST, PUT, DELETE");
    }
    let Some(zone) = app.challenges_zone.as_deref() else {
        return (StatusCode::NOT_FOUND, "no challenges zone\n").into_response();
    };
    let values = RequestValues::from_request(req).await;
    // any string makes a valid secret
    let secret = match values.require("secret") {
        Ok(secret) => secret,
        Err(err) => return err.into_response(),
    };
    let mut txt = match values.optional("txt") {
        Ok(txt) => txt.unwrap_or_default(),
        Err(err) => return err.into_response(),
    };
    if !txt.is_empty() && !is_valid_challenge(&txt) {
        return (StatusCode::BAD_REQUEST, "invalid value for \"txt\"\n").into_response();
    }
    // fall back to the entire body as the "txt" value; the challenge
    // grammar forbids '=', so form bodies can never slip through here
    if txt.is_empty() && method != Method::GET {
        let body = values.body_text();
        if is_valid_challenge(&body) {
            txt = body;
        }
    }
    let domain = domain_for_secret(&secret, zone);
    match method {
        Method::DELETE => {
            if txt.is_empty() {
                return (StatusCode::BAD_REQUEST, "must specify \"txt\"\n").into_response();
            }
            app.challenges.remove(&domain, txt.as_bytes());
            StatusCode::NO_CONTENT.into_response()
        }
        _ => {
            if txt.is_empty() {
                return plain_text(StatusCode::OK, format!("{domain}\n"));
            }
            if let Err(err) = app.challenges.add(&domain, txt.as_bytes(), CHALLENGE_TTL) {
                error!("failed to add challenge: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
            }
            plain_text(StatusCode::CREATED, "OK\n".to_owned())
        }
    }
}

pub(crate) fn plain_text(status: StatusCode, body: String) -> HttpResponse {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        body,
    )
        .into_response()
}

pub(crate) fn method_not_allowed(allow: &'static str) -> HttpResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, HeaderValue::from_static(allow))],
        "unsupported method\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_grammar() {
        assert!(is_valid_challenge("Abc-123_x"));
        assert!(is_valid_challenge(&"a".repeat(255)));
        assert!(!is_valid_challenge(""));
        assert!(!is_valid_challenge(&"a".repeat(256)));
        assert!(!is_valid_challenge("has=equals"));
        assert!(!is_valid_challenge("has space"));
    }

    #[test]
    fn hash_subdomains() {
        let sub = format!("{:x}.", Sha224::digest(b"hello"));
        assert_eq!(sub.len(), 57);
        assert!(is_hash_subdomain(&sub));
        assert!(!is_hash_subdomain("deadbeef."));
        assert!(!is_hash_subdomain(&sub[..56]));
        assert!(!is_hash_subdomain(&format!("g{}", &sub[1..])));
    }

    #[test]
    fn domain_derivation_is_stable() {
        assert_eq!(
            domain_for_secret("hello", "c.example."),
            format!("{:x}.c.example.", Sha224::digest(b"hello"))
        );
    }
}
