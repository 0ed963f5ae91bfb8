//! The self-service subdomain zone.
//!
//! Names are human-chosen (six to forty characters, letters, digits and
//! inner hyphens) and claimed through a Turnstile-gated registration
//! endpoint, which hands back a random key. The key hash is the store's
//! handle for the name; updates refresh the registration, and an idle
//! registration eventually ages out of the TTL store.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header::HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::http::values::RequestValues;
use crate::http::App;
use crate::names::{equal_names, lower_name};
use crate::response::{records, Rr};
use crate::store::TtlStore;
use crate::util::{format_unix_utc, unix_now};
use crate::zones::challenges::{is_valid_challenge, method_not_allowed, plain_text};
use crate::zones::dynaddr::{delete_addresses, resolve_ip, store_address};
use crate::zones::{Addrs, Question};
use domain::base::iana::Rtype;

pub const PENDING_TTL: u32 = 3600;
pub const REGISTRATION_TTL: u32 = 120 * 86400;
pub const CHALLENGE_TTL: u32 = 120;

/// Names must be 6 to 40 characters, start with a letter, end with a letter
/// or digit, and consist of letters, digits and hyphens only.
pub fn is_valid_name(s: &str) -> bool {
    if !(6..=40).contains(&s.len()) {
        return false;
    }
    let b = s.as_bytes();
    if !b[0].is_ascii_alphabetic() || !b[b.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    b.iter().all(|&c| c.is_ascii_alphanumeric() || c == b'-')
}

fn key_hash(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// (Re-)register `name` under `hash`, refreshing every bookkeeping key.
pub fn update_registration(
    store: &TtlStore,
    prefix: &str,
    hash: &str,
    name: &str,
) -> Result<(), crate::store::AtCapacity> {
    let now = unix_now();
    let (ttl, ctime) = match store.get(&format!("{prefix}{name}:ctime")) {
        // until the first refresh a registration is only pending
        None => (PENDING_TTL, now.to_be_bytes().to_vec()),
        Some(ctime) => (REGISTRATION_TTL, ctime),
    };
    store.set(&format!("{prefix}hash:{hash}"), name.as_bytes(), ttl)?;
    store.set(&format!("{prefix}{name}:ctime"), &ctime, ttl)?;
    store.set(&format!("{prefix}{name}:mtime"), &now.to_be_bytes(), ttl)
}

/// Registration timestamps: created, last updated, and when it expires.
pub fn registration_info(store: &TtlStore, prefix: &str, name: &str) -> (u32, u32, u32) {
    let mut created = 0;
    let mut updated = 0;
    let mut expires = 0;
    if let Some(ctime) = store.get(&format!("{prefix}{name}:ctime")) {
        if let Ok(octets) = <[u8; 4]>::try_from(ctime.as_slice()) {
            created = u32::from_be_bytes(octets);
        }
        if let Some(mtime) = store.get(&format!("{prefix}{name}:mtime")) {
            if let Ok(octets) = <[u8; 4]>::try_from(mtime.as_slice()) {
                updated = u32::from_be_bytes(octets);
                expires = if created == updated {
                    updated + PENDING_TTL
                } else {
                    updated + REGISTRATION_TTL
                };
            }
        }
    }
    (created, updated, expires)
}

//------------ Generator -----------------------------------------------------

pub struct Generator {
    pub addrs: Addrs,
    pub self_challenge_target: Option<String>,
    pub data_store: Arc<TtlStore>,
    pub challenge_store: Arc<TtlStore>,
    pub key_prefix: String,
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
            _ if equal_names(sub, "dns.") || equal_names(sub, "www.") => true,
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
                Rtype::HTTPS => {
                    let v4 = if v6_only { &[][..] } else { &self.addrs.v4[..] };
                    let v6 = if v4_only { &[][..] } else { &self.addrs.v6[..] };
                    rrs.extend(records::https(q.name, 300, v4, v6));
                }
                _ => {}
            }
            return (rrs, true);
        }
        if equal_names(sub, "_acme-challenge.")
            || equal_names(sub, "_acme-challenge.dns.")
            || equal_names(sub, "_acme-challenge.www.")
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
        // the rightmost label below the zone selects the registration;
        // anything in front of it resolves like a wildcard
        let stripped = &sub[..sub.len() - 1];
        let name = match stripped.rfind('.') {
            Some(i) => &stripped[i + 1..],
            None => stripped,
        };
        if !is_valid_name(name) {
            return (rrs, false);
        }
        let name = lower_name(name);
        let key_base = format!("{}{}", self.key_prefix, name);
        match q.qtype {
            Rtype::A => {
                if let Some(ip) = self.data_store.get(&format!("{key_base}:ip4")) {
                    if let Ok(octets) = <[u8; 4]>::try_from(ip.as_slice()) {
                        rrs.push(records::a(q.name, 300, octets.into()));
                    }
                }
            }
            Rtype::AAAA => {
                if let Some(ip) = self.data_store.get(&format!("{key_base}:ip6")) {
                    if let Ok(octets) = <[u8; 16]>::try_from(ip.as_slice()) {
                        rrs.push(records::aaaa(q.name, 300, octets.into()));
                    }
                }
            }
            Rtype::TXT => {
                if sub.len() > 16 && equal_names(&sub[..16], "_acme-challenge.") {
                    for value in self.challenge_store.values(&key_base) {
                        if let Ok(text) = String::from_utf8(value) {
                            rrs.push(records::txt(q.name, 1, &text));
                        }
                    }
                } else {
                    let (created, _, expires) =
                        registration_info(&self.data_store, &self.key_prefix, &name);
                    if created > 0 {
                        rrs.push(records::txt(q.name, 1, "v=spf1 -all"));
                        // metadata only at the registration name itself
                        if equal_names(sub, &format!("{name}.")) {
                            rrs.push(records::txt(
                                q.name,
                                1,
                                &format!("registered {}", format_unix_utc(created)),
                            ));
                            rrs.push(records::txt(
                                q.name,
                                1,
                                &format!("expires {}", format_unix_utc(expires)),
                            ));
                            for (suffix, family) in [(":ip4mtime", "ipv4"), (":ip6mtime", "ipv6")] {
                                if let Some(mtime) =
                                    self.data_store.get(&format!("{key_base}{suffix}"))
                                {
                                    if let Ok(octets) = <[u8; 4]>::try_from(mtime.as_slice()) {
                                        rrs.push(records::txt(
                                            q.name,
                                            1,
                                            &format!(
                                                "{family} last updated {}",
                                                format_unix_utc(u32::from_be_bytes(octets))
                                            ),
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        (rrs, true)
    }
}

//------------ HTTP API ------------------------------------------------------

static MYADDR_NAME: HeaderName = HeaderName::from_static("myaddr-name");

#[derive(Serialize)]
struct RegistrationBody {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    registered: u32,
    updated: u32,
    expires: u32,
}

fn registration_json(app: &App, name: &str, key: Option<String>) -> HttpResponse {
    let (registered, updated, expires) =
        registration_info(&app.persistent, &app.myaddr_prefix, name);
    let body = RegistrationBody {
        name: name.to_owned(),
        key,
        registered,
        updated,
        expires,
    };
    (
        [(MYADDR_NAME.clone(), name.to_owned())],
        axum::Json(body),
    )
        .into_response()
}

fn find_name(app: &App, key: &str) -> Result<(String, String), HttpResponse> {
    if key.len() != 64 {
        return Err((StatusCode::BAD_REQUEST, "invalid value for \"key\"\n").into_response());
    }
    let hash = key_hash(key);
    let name = app
        .persistent
        .get(&format!("{}hash:{}", app.myaddr_prefix, hash))
        .and_then(|v| String::from_utf8(v).ok())
        .unwrap_or_default();
    if name.is_empty() {
        return Err((StatusCode::NOT_FOUND, "registration not found\n").into_response());
    }
    Ok((hash, name))
}

/// `GET/POST/DELETE /myaddr-reg`.
pub async fn registration_handler(State(app): State<Arc<App>>, req: Request) -> HttpResponse {
    let method = req.method().clone();
    if !matches!(method, Method::GET | Method::POST | Method::DELETE) {
        return method_not_allowed("GET, POST, DELETE");
    }
    let values = RequestValues::from_request(req).await;
    match method {
        Method::POST => {
            let name = match values.require("name") {
                Ok(name) => name,
                Err(err) => return err.into_response(),
            };
            if !is_valid_name(&name) {
                return (StatusCode::BAD_REQUEST, "invalid value for \"name\"\n").into_response();
            }
            let challenge = match values.require("challenge") {
                Ok(challenge) => challenge,
                Err(err) => return err.into_response(),
            };
            match &app.turnstile {
                Some(turnstile) => match turnstile.verify(&challenge).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            "invalid value for \"challenge\"\n",
                        )
                            .into_response();
                    }
                    Err(err) => {
                        error!("failed to verify challenge: {err}");
                        return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n")
                            .into_response();
                    }
                },
                None => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
                }
            }
            // all names are stored in lowercase
            let name = lower_name(&name).into_owned();
            if app
                .persistent
                .get(&format!("{}{}:ctime", app.myaddr_prefix, name))
                .is_some()
            {
                return (StatusCode::CONFLICT, "name already exists\n").into_response();
            }
            let mut key_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key_bytes);
            let key = hex::encode(key_bytes);
            let hash = key_hash(&key);
            if let Err(err) = update_registration(&app.persistent, &app.myaddr_prefix, &hash, &name)
            {
                error!("failed to register name: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
            }
            registration_json(&app, &name, Some(key))
        }
        _ => {
            let key = match values.require("key") {
                Ok(key) => key,
                Err(err) => return err.into_response(),
            };
            let (hash, name) = match find_name(&app, &key) {
                Ok(found) => found,
                Err(resp) => return resp,
            };
            match method {
                Method::GET => registration_json(&app, &name, None),
                _ => {
                    let prefix = &app.myaddr_prefix;
                    app.persistent.delete(&format!("{prefix}hash:{hash}"));
                    app.persistent.delete(&format!("{prefix}{name}:ctime"));
                    app.persistent.delete(&format!("{prefix}{name}:mtime"));
                    delete_addresses(&app.persistent, &format!("{prefix}{name}"));
                    app.challenges.delete(&format!("{prefix}{name}"));
                    (
                        [(MYADDR_NAME.clone(), name)],
                        StatusCode::NO_CONTENT,
                    )
                        .into_response()
                }
            }
        }
    }
}

/// `GET/POST/PUT/DELETE /myaddr-update`.
pub async fn update_handler(State(app): State<Arc<App>>, req: Request) -> HttpResponse {
    let method = req.method().clone();
    if !matches!(
        method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE
    ) {
        return method_not_allowed("GET, POST, PUT, DELETE");
    }
    let real_ip = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let values = RequestValues::from_request(req).await;
    let key = match values.require("key") {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };
    let ip = match values.optional("ip") {
        Ok(Some(s)) => match resolve_ip(&s, real_ip.as_deref()) {
            Some(ip) => Some(ip),
            None => {
                return (StatusCode::BAD_REQUEST, "invalid value for \"ip\"\n").into_response()
            }
        },
        Ok(None) => None,
        Err(err) => return err.into_response(),
    };
    let challenge = match values.optional("acme_challenge") {
        Ok(challenge) => challenge.unwrap_or_default(),
        Err(err) => return err.into_response(),
    };
    if !challenge.is_empty() && !is_valid_challenge(&challenge) {
        return (
            StatusCode::BAD_REQUEST,
            "invalid value for \"acme_challenge\"\n",
        )
            .into_response();
    }
    let (hash, name) = match find_name(&app, &key) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let key_base = format!("{}{}", app.myaddr_prefix, name);
    match method {
        Method::DELETE => {
            if ip.is_some() || !challenge.is_empty() {
                return (
                    StatusCode::BAD_REQUEST,
                    "delete removes all ip addresses, do not specify \"ip\" or \"acme_challenge\"\n",
                )
                    .into_response();
            }
            delete_addresses(&app.persistent, &key_base);
            (
                [(MYADDR_NAME.clone(), name)],
                StatusCode::NO_CONTENT,
            )
                .into_response()
        }
        _ => {
            let result = match (&ip, challenge.is_empty()) {
                (Some(ip), true) => store_address(&app.persistent, &key_base, *ip),
                (None, false) => app
                    .challenges
                    .add(&key_base, challenge.as_bytes(), CHALLENGE_TTL),
                _ => {
                    return (
                        StatusCode::BAD_REQUEST,
                        "must specify either \"ip\" or \"acme_challenge\"\n",
                    )
                        .into_response();
                }
            };
            if let Err(err) = result {
                error!("failed to update registration: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
            }
            if let Err(err) = update_registration(&app.persistent, &app.myaddr_prefix, &hash, &name)
            {
                error!("failed to refresh registration: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
            }
            let mut resp = plain_text(StatusCode::OK, "OK\n".to_owned());
            resp.headers_mut()
                .insert(MYADDR_NAME.clone(), name.parse().unwrap());
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_grammar() {
        assert!(is_valid_name("foo-bar"));
        assert!(is_valid_name("abc123"));
        assert!(is_valid_name(&format!("a{}", "b".repeat(39))));
        assert!(!is_valid_name("short"));
        assert!(!is_valid_name("1leading-digit"));
        assert!(!is_valid_name("trailing-"));
        assert!(!is_valid_name("-leading"));
        assert!(!is_valid_name(&"a".repeat(41)));
        assert!(!is_valid_name("no_underscores"));
    }

    #[test]
    fn pending_registrations_become_durable_on_refresh() {
        let store = TtlStore::new();
        update_registration(&store, "myaddr:", "hash1", "foo-bar").unwrap();
        let (created, updated, expires) = registration_info(&store, "myaddr:", "foo-bar");
        assert!(created > 0);
        assert_eq!(created, updated);
        assert_eq!(expires, updated + PENDING_TTL);

        update_registration(&store, "myaddr:", "hash1", "foo-bar").unwrap();
        let (created2, updated2, expires2) = registration_info(&store, "myaddr:", "foo-bar");
        assert_eq!(created2, created);
        assert_eq!(expires2, updated2 + REGISTRATION_TTL);
    }

    #[test]
    fn wildcard_prefixes_resolve_but_metadata_stays_exact() {
        let data = Arc::new(TtlStore::new());
        update_registration(&data, "myaddr:", "h", "foo-bar").unwrap();
        store_address(&data, "myaddr:foo-bar", "192.0.2.5".parse().unwrap()).unwrap();
        let generator = Generator {
            addrs: Addrs::default(),
            self_challenge_target: None,
            data_store: data.clone(),
            challenge_store: Arc::new(TtlStore::new()),
            key_prefix: "myaddr:".into(),
        };

        let (rrs, valid) = generator.generate(
            &Question {
                name: "www.foo-bar.myaddr.example.",
                qtype: Rtype::A,
            },
            "myaddr.example.",
        );
        assert!(valid);
        assert_eq!(rrs.len(), 1);

        // exact name: SPF plus metadata
        let (rrs, _) = generator.generate(
            &Question {
                name: "foo-bar.myaddr.example.",
                qtype: Rtype::TXT,
            },
            "myaddr.example.",
        );
        assert!(rrs.len() >= 3);

        // prefixed name: SPF only
        let (rrs, _) = generator.generate(
            &Question {
                name: "www.foo-bar.myaddr.example.",
                qtype: Rtype::TXT,
            },
            "myaddr.example.",
        );
        assert_eq!(rrs.len(), 1);
    }
}
