//! The JSON lookup proxy: `GET /dns/{name}/{type}`.
//!
//! Forwards a question to the configured upstream over UDP, retrying over
//! TCP when the answer came back truncated or the transport failed, and
//! renders the result as JSON with a cache lifetime derived from the
//! answer TTLs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use domain::base::iana::Rtype;
use domain::base::name::Name;
use domain::base::{Message, MessageBuilder, ToName};
use domain::rdata::AllRecordData;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::error;

use crate::http::App;
use crate::names::name_string;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CACHE_TTL: u32 = 86400;

#[derive(Serialize)]
struct JsonRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

#[derive(Serialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: u8,
    #[serde(rename = "Answer", skip_serializing_if = "Vec::is_empty")]
    answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", skip_serializing_if = "Vec::is_empty")]
    authority: Vec<JsonRecord>,
}

pub async fn handler(
    State(app): State<Arc<App>>,
    Path((name, rtype)): Path<(String, String)>,
) -> HttpResponse {
    let Some(upstream) = app.lookup_upstream.clone() else {
        return (StatusCode::NOT_FOUND, "lookups not configured\n").into_response();
    };
    let fqdn = if name.ends_with('.') {
        name
    } else {
        format!("{name}.")
    };
    let Ok(qname) = Name::<Vec<u8>>::from_str(&fqdn) else {
        return (StatusCode::BAD_REQUEST, "invalid name\n").into_response();
    };
    let Ok(qtype) = Rtype::from_str(&rtype.to_ascii_uppercase()) else {
        return (StatusCode::BAD_REQUEST, "invalid type\n").into_response();
    };

    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(rand::random());
    builder.header_mut().set_rd(true);
    let mut question = builder.question();
    if question.push((&qname, qtype)).is_err() {
        return (StatusCode::BAD_REQUEST, "invalid name\n").into_response();
    }
    let query = question.into_message().as_octets().clone();

    let received = match exchange(&upstream, &query).await {
        Ok(received) => received,
        Err(LookupError::Timeout) => {
            return (StatusCode::GATEWAY_TIMEOUT, "dns timeout\n").into_response();
        }
        Err(LookupError::Io(err)) => {
            error!("lookup exchange with {upstream} failed: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "server error\n").into_response();
        }
    };

    let mut max_age = MAX_CACHE_TTL;
    let mut body = JsonResponse {
        status: received.header().rcode().to_int(),
        answer: Vec::new(),
        authority: Vec::new(),
    };
    let answer_count;
    match received.answer() {
        Ok(section) => {
            for record in section.flatten() {
                let Ok(Some(record)) = record.to_record::<AllRecordData<_, _>>() else {
                    continue;
                };
                max_age = max_age.min(record.ttl().as_secs());
                body.answer.push(JsonRecord {
                    name: name_string(&record.owner().to_bytes()),
                    rtype: record.rtype().to_int(),
                    data: record.data().to_string(),
                });
            }
            answer_count = body.answer.len();
        }
        Err(_) => answer_count = 0,
    }
    if let Ok(section) = received.authority() {
        for record in section.flatten() {
            let Ok(Some(record)) = record.to_record::<AllRecordData<_, _>>() else {
                continue;
            };
            max_age = max_age.min(record.ttl().as_secs());
            if answer_count == 0 {
                if let AllRecordData::Soa(soa) = record.data() {
                    max_age = max_age.min(soa.minimum().as_secs());
                }
            }
            body.authority.push(JsonRecord {
                name: name_string(&record.owner().to_bytes()),
                rtype: record.rtype().to_int(),
                data: record.data().to_string(),
            });
        }
    }

    let cacheable = (body.status == 0 || body.status == 3)
        && (!body.answer.is_empty() || !body.authority.is_empty());
    let mut resp = axum::Json(body).into_response();
    if cacheable {
        if let Ok(value) = format!("max-age={max_age}").parse() {
            resp.headers_mut().insert(header::CACHE_CONTROL, value);
        }
    }
    resp
}

enum LookupError {
    Timeout,
    Io(std::io::Error),
}

impl From<std::io::Error> for LookupError {
    fn from(err: std::io::Error) -> Self {
        LookupError::Io(err)
    }
}

async fn exchange(upstream: &str, query: &[u8]) -> Result<Message<Vec<u8>>, LookupError> {
    match tokio::time::timeout(LOOKUP_TIMEOUT, exchange_udp(upstream, query)).await {
        Ok(Ok(msg)) if !msg.header().tc() => return Ok(msg),
        Ok(Ok(_)) | Ok(Err(_)) => {}
        Err(_) => {}
    }
    // retry over tcp on truncation or any transport failure
    match tokio::time::timeout(LOOKUP_TIMEOUT, exchange_tcp(upstream, query)).await {
        Ok(result) => result,
        Err(_) => Err(LookupError::Timeout),
    }
}

async fn exchange_udp(upstream: &str, query: &[u8]) -> Result<Message<Vec<u8>>, LookupError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(upstream).await?;
    socket.send(query).await?;
    let mut buf = vec![0u8; 4096];
    loop {
        let len = socket.recv(&mut buf).await?;
        if let Ok(msg) = Message::from_octets(buf[..len].to_vec()) {
            if msg.header().id() == u16::from_be_bytes([query[0], query[1]]) {
                return Ok(msg);
            }
        }
    }
}

async fn exchange_tcp(upstream: &str, query: &[u8]) -> Result<Message<Vec<u8>>, LookupError> {
    let mut stream = TcpStream::connect(upstream).await?;
    stream.write_u16(query.len() as u16).await?;
    stream.write_all(query).await?;
    let len = usize::from(stream.read_u16().await?);
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Message::from_octets(buf).map_err(|_| {
        LookupError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "short response",
        ))
    })
}
