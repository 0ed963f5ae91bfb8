//! The dynamic-address registration zone.
//!
//! Like the challenges zone, clients own the SHA-224 subdomain of their
//! secret; unlike it, what they store there is their current address,
//! persisted across restarts. TXT queries report when each family was last
//! updated.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use tracing::error;

use crate::http::values::RequestValues;
use crate::http::App;
use crate::names::{equal_names, lower_name};
use crate::response::{records, Rr};
use crate::store::TtlStore;
use crate::util::format_unix_utc;
use crate::zones::challenges::{domain_for_secret, is_hash_subdomain, method_not_allowed, plain_text};
use crate::zones::{Addrs, Question};
use domain::base::iana::Rtype;

pub const ADDRESS_TTL: u32 = 90 * 86400;

//------------ Generator -----------------------------------------------------

pub struct Generator {
    pub addrs: Addrs,
    pub self_challenge_target: Option<String>,
    pub data_store: Arc<TtlStore>,
}

impl Generator {
    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        let mut rrs = Vec::new();
        if q.name.len() < zone.len() {
            return (rrs, false);
        }
        let sub = &q.name[..q.name.len() - zone.len()];
        let (mut v4_only, mut v6_only) = (false, false);
        let valid = match sub {
            "" => true,
            _ if equal_names(sub, "ipv4.") => {
                v4_only = true;
                true
            }
            _ if equal_names(sub, "ipv6.") => {
                v6_only = true;
                true
            }
            _ => false,
        };
        if valid {
            match q.qtype {
                Rtype::A if !v6_only => {
                    rrs.extend(self.addrs.v4.iter().map(|&ip| records::a(q.name, 300, ip)));
                }
                Rtype::AAAA if !v4_only => {
                    rrs.extend(self.addrs.v6.iter().map(|&ip| records::aaaa(q.name, 300, ip)));
                }
                _ => {}
            }
            return (rrs, true);
        }
        if equal_names(sub, "_acme-challenge.")
            || equal_names(sub, "_acme-challenge.ipv4.")
            || equal_names(sub, "_acme-challenge.ipv6.")
        {
            if q.qtype == Rtype::TXT {
                if let Some(target) = &self.self_challenge_target {
                    rrs.push(records::cname(q.name, 300, target));
                }
            }
            return (rrs, true);
        }
        if is_hash_subdomain(sub) {
            let key = lower_name(q.name);
            match q.qtype {
                Rtype::A => {
                    if let Some(ip) = self.data_store.get(&format!("{key}:ip4")) {
                        if let Ok(octets) = <[u8; 4]>::try_from(ip.as_slice()) {
                            rrs.push(records::a(q.name, 300, octets.into()));
                        }
                    }
                }
                Rtype::AAAA => {
                    if let Some(ip) = self.data_store.get(&format!("{key}:ip6")) {
                        if let Ok(octets) = <[u8; 16]>::try_from(ip.as_slice()) {
                            rrs.push(records::aaaa(q.name, 300, octets.into()));
                        }
                    }
                }
                Rtype::TXT => {
                    for (suffix, family) in [(":ip4mtime", "ipv4"), (":ip6mtime", "ipv6")] {
                        if let Some(mtime) = self.data_store.get(&format!("{key}{suffix}")) {
                            if let Ok(octets) = <[u8; 4]>::try_from(mtime.as_slice()) {
                                let when = format_unix_utc(u32::from_be_bytes(octets));
                                rrs.push(records::txt(
                                    q.name,
                                    1,
                                    &format!("{family} last updated {when}"),
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
            return (rrs, true);
        }
        (rrs, false)
    }
}

//------------ HTTP API ------------------------------------------------------

/// Store or delete an address under a hash key, shared by `/dyn` and
/// `/myaddr-update`.
pub(crate) fn store_address(
    store: &TtlStore,
    key_base: &str,
    ip: IpAddr,
) -> Result<(), crate::store::AtCapacity> {
    let now = crate::util::unix_now().to_be_bytes();
    let (ip_key, mtime_key, bytes) = match ip {
        IpAddr::V4(v4) => (
            format!("{key_base}:ip4"),
            format!("{key_base}:ip4mtime"),
            v4.octets().to_vec(),
        ),
        IpAddr::V6(v6) => (
            format!("{key_base}:ip6"),
            format!("{key_base}:ip6mtime"),
            v6.octets().to_vec(),
        ),
    };
    store.set(&ip_key, &bytes, ADDRESS_TTL)?;
    store.set(&mtime_key, &now, ADDRESS_TTL)
}

pub(crate) fn delete_addresses(store: &TtlStore, key_base: &str) {
    for suffix in [":ip4", ":ip4mtime", ":ip6", ":ip6mtime"] {
        store.delete(&format!("{key_base}{suffix}"));
    }
}

/// Resolve the "ip" parameter, with "self" meaning the proxied client
/// address.
pub(crate) fn resolve_ip(value: &str, real_ip: Option<&str>) -> Option<IpAddr> {
    let value = if value == "self" {
        real_ip.unwrap_or("")
    } else {
        value
    };
    value.parse().ok()
}

/// `GET/POST/PUT/DELETE /dyn`.
pub async fn http_handler(State(app): State<Arc<App>>, req: Request) -> HttpResponse {
    let method = req.method().clone();
    if !matches!(
        method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE
    ) {
        return method_not_allowed("GET, POST, PUT, DELETE");
    }
    let Some(zone) = app.dyn_zone.as_deref() else {
        return (StatusCode::NOT_FOUND, "no dyn zone\n").into_response();
    };
    let real_ip = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let values = RequestValues::from_request(req).await;
    let secret = match values.require("secret") {
        Ok(secret) => secret,
        Err(err) => return err.into_response(),
    };
    let ip_str = match values.optional("ip") {
        Ok(ip) => ip,
        Err(err) => return err.into_response(),
    };
    let mut ip = match ip_str {
        Some(s) => match resolve_ip(&s, real_ip.as_deref()) {
            Some(ip) => Some(ip),
            None => {
                return (StatusCode::BAD_REQUEST, "invalid value for \"ip\"\n").into_response()
            }
        },
        None => None,
    };
    // accept the whole body as the address if nothing else named one
    if ip.is_none() && method != Method::GET {
        ip = resolve_ip(values.body_text().trim(), real_ip.as_deref());
    }
    let domain = domain_for_secret(&secret, zone);
    match method {
        Method::DELETE => {
            if ip.is_some() {
                return (
                    StatusCode::BAD_REQUEST,
                    "delete removes all addresses, do not specify \"ip\"\n",
                )
                    .into_response();
            }
            delete_addresses(&app.persistent, &domain);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => {
            let Some(ip) = ip else {
                return plain_text(StatusCode::OK, format!("{domain}\n"));
            };
            if let Err(err) = store_address(&app.persistent, &domain, ip) {
                error!("failed to set address: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
            }
            plain_text(StatusCode::OK, "OK\n".to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::rdata::ZoneRecordData;

    #[test]
    fn stored_addresses_come_back_per_family() {
        let store = Arc::new(TtlStore::new());
        let zone = "dyn.example.";
        let domain = domain_for_secret("hello", zone);
        store_address(&store, &domain, "192.0.2.7".parse().unwrap()).unwrap();
        store_address(&store, &domain, "2001:db8::7".parse().unwrap()).unwrap();

        let generator = Generator {
            addrs: Addrs::default(),
            self_challenge_target: None,
            data_store: store,
        };
        let (rrs, valid) = generator.generate(
            &Question {
                name: &domain,
                qtype: Rtype::A,
            },
            zone,
        );
        assert!(valid);
        assert!(matches!(rrs[0].data(), ZoneRecordData::A(a) if a.addr() == "192.0.2.7".parse::<std::net::Ipv4Addr>().unwrap()));

        let (rrs, _) = generator.generate(
            &Question {
                name: &domain,
                qtype: Rtype::TXT,
            },
            zone,
        );
        assert_eq!(rrs.len(), 2);
    }

    #[test]
    fn unknown_shapes_are_invalid() {
        let generator = Generator {
            addrs: Addrs::default(),
            self_challenge_target: None,
            data_store: Arc::new(TtlStore::new()),
        };
        let (rrs, valid) = generator.generate(
            &Question {
                name: "not-a-hash.dyn.example.",
                qtype: Rtype::A,
            },
            "dyn.example.",
        );
        assert!(!valid);
        assert!(rrs.is_empty());
    }

    #[test]
    fn self_resolves_via_real_ip() {
        assert_eq!(
            resolve_ip("self", Some("203.0.113.9")),
            Some("203.0.113.9".parse().unwrap())
        );
        assert_eq!(resolve_ip("self", None), None);
        assert_eq!(resolve_ip("nonsense", None), None);
    }
}
