//! Request parameter extraction for the HTTP side-channel.
//!
//! Endpoints accept their parameters as URL query values, an urlencoded
//! form body, or a JSON object body, in any combination. A key supplied
//! more than once must carry the same value everywhere; differing values
//! are rejected rather than silently picking one.

use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{Method, StatusCode};

/// A terse error response naming the offending field.
pub type ErrorResponse = (StatusCode, String);

#[derive(Debug, PartialEq, Eq)]
pub enum ValueError {
    /// The same key appeared twice with differing values.
    Ambiguous,
    /// A JSON value for the key was not a string.
    UnexpectedType,
}

pub struct RequestValues {
    method: Method,
    query: Vec<(String, String)>,
    content_type: Option<String>,
    body: Bytes,
}

impl RequestValues {
    /// Swallow a request, reading the whole body.
    pub async fn from_request(req: Request) -> Self {
        let method = req.method().clone();
        let query = req
            .uri()
            .query()
            .map(parse_query)
            .unwrap_or_default();
        let content_type = req
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_owned());
        let body = axum::body::to_bytes(req.into_body(), 1 << 20)
            .await
            .unwrap_or_default();
        Self {
            method,
            query,
            content_type,
            body,
        }
    }

    /// The raw request body as text.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn body_values(&self, key: &str) -> Result<Vec<String>, ValueError> {
        match self.content_type.as_deref() {
            // no content type means urlencoded form values by convention
            Some("application/x-www-form-urlencoded") | Some("") | None => Ok(parse_query(
                core::str::from_utf8(&self.body).unwrap_or(""),
            )
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()),
            Some("application/json") => {
                let Ok(obj) =
                    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&self.body)
                else {
                    return Ok(Vec::new());
                };
                match obj.get(key) {
                    None => Ok(Vec::new()),
                    Some(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
                    Some(_) => Err(ValueError::UnexpectedType),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// The value for `key`, from wherever the request supplied it.
    pub fn get_string(&self, key: &str) -> Result<Option<String>, ValueError> {
        let mut vals = match self.method {
            Method::POST | Method::PUT | Method::DELETE => self.body_values(key)?,
            _ => Vec::new(),
        };
        vals.extend(
            self.query
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
        );
        let Some(first) = vals.first().cloned() else {
            return Ok(None);
        };
        if vals.iter().any(|v| *v != first) {
            return Err(ValueError::Ambiguous);
        }
        Ok(Some(first))
    }

    /// A required string parameter, mapped to a 400 naming the field.
    pub fn require(&self, key: &str) -> Result<String, ErrorResponse> {
        match self.get_string(key) {
            Ok(Some(value)) if !value.is_empty() => Ok(value),
            Ok(_) => Err((
                StatusCode::BAD_REQUEST,
                format!("must specify \"{key}\""),
            )),
            Err(err) => Err(error_for(key, err)),
        }
    }

    /// An optional string parameter; absence and emptiness both yield None.
    pub fn optional(&self, key: &str) -> Result<Option<String>, ErrorResponse> {
        match self.get_string(key) {
            Ok(Some(value)) if !value.is_empty() => Ok(Some(value)),
            Ok(_) => Ok(None),
            Err(err) => Err(error_for(key, err)),
        }
    }
}

fn error_for(key: &str, err: ValueError) -> ErrorResponse {
    let msg = match err {
        ValueError::Ambiguous => format!("multiple values found for \"{key}\""),
        ValueError::UnexpectedType => format!("\"{key}\" must be a string"),
    };
    (StatusCode::BAD_REQUEST, msg)
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(core::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(method: Method, query: &str, content_type: Option<&str>, body: &str) -> RequestValues {
        RequestValues {
            method,
            query: parse_query(query),
            content_type: content_type.map(str::to_owned),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn form_body_and_query_agree() {
        let v = values(
            Method::POST,
            "secret=hello",
            None,
            "secret=hello&txt=Abc-123",
        );
        assert_eq!(v.get_string("secret"), Ok(Some("hello".into())));
        assert_eq!(v.get_string("txt"), Ok(Some("Abc-123".into())));
    }

    #[test]
    fn differing_duplicates_are_ambiguous() {
        let v = values(Method::POST, "secret=one", None, "secret=two");
        assert_eq!(v.get_string("secret"), Err(ValueError::Ambiguous));
    }

    #[test]
    fn json_bodies_are_understood() {
        let v = values(
            Method::POST,
            "",
            Some("application/json"),
            r#"{"secret":"hello","count":3}"#,
        );
        assert_eq!(v.get_string("secret"), Ok(Some("hello".into())));
        assert_eq!(v.get_string("count"), Err(ValueError::UnexpectedType));
        assert_eq!(v.get_string("missing"), Ok(None));
    }

    #[test]
    fn get_requests_ignore_the_body() {
        let v = values(Method::GET, "secret=q", None, "secret=body");
        assert_eq!(v.get_string("secret"), Ok(Some("q".into())));
    }

    #[test]
    fn percent_decoding() {
        let v = values(Method::GET, "name=a%2Db+c", None, "");
        assert_eq!(v.get_string("name"), Ok(Some("a-b c".into())));
    }
}
