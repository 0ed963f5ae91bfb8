//! The store browser: `GET/DELETE /admin/db/{key...}`.
//!
//! Authentication is the local socket itself; a reverse proxy decides who
//! gets here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use serde::Deserialize;

use crate::http::App;
use crate::zones::challenges::method_not_allowed;

#[derive(Deserialize)]
pub struct AdminQuery {
    #[serde(default)]
    prefix: String,
    find: Option<String>,
}

/// Decode a `find` filter value: `0x…` hex or `base64:…`.
fn decode_find(find: &str) -> Option<Vec<u8>> {
    if let Some(hex_str) = find.strip_prefix("0x") {
        return hex::decode(hex_str).ok();
    }
    if let Some(b64) = find.strip_prefix("base64:") {
        use base64::Engine as _;
        return base64::engine::general_purpose::STANDARD.decode(b64).ok();
    }
    None
}

pub async fn handler(
    method: Method,
    key: Option<Path<String>>,
    Query(query): Query<AdminQuery>,
    State(app): State<Arc<App>>,
) -> HttpResponse {
    let key = key.map(|Path(key)| key).unwrap_or_default();
    match method {
        Method::GET => {
            if key.is_empty() {
                let mut keys = app.persistent.list(&query.prefix);
                if let Some(find) = query.find.as_deref() {
                    let Some(needle) = decode_find(find) else {
                        return (StatusCode::BAD_REQUEST, "invalid value for \"find\"\n")
                            .into_response();
                    };
                    keys.retain(|k| app.persistent.values(k).iter().any(|v| *v == needle));
                }
                keys.sort();
                axum::Json(keys).into_response()
            } else {
                let values: Vec<String> = app
                    .persistent
                    .values(&key)
                    .into_iter()
                    .map(|v| {
                        use base64::Engine as _;
                        base64::engine::general_purpose::STANDARD.encode(v)
                    })
                    .collect();
                axum::Json(values).into_response()
            }
        }
        Method::DELETE => {
            if key.is_empty() {
                return (StatusCode::BAD_REQUEST, "bad request\n").into_response();
            }
            app.persistent.delete(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => method_not_allowed("GET, DELETE"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_filters_decode() {
        assert_eq!(decode_find("0x0102"), Some(vec![1, 2]));
        assert_eq!(decode_find("base64:aGk="), Some(b"hi".to_vec()));
        assert_eq!(decode_find("plain"), None);
        assert_eq!(decode_find("0xzz"), None);
    }
}
