//! Transport listeners and query dispatch.
//!
//! One task per UDP datagram, per TCP connection and per TLS connection.
//! Nothing on the query path blocks beyond the short store locks; writer
//! errors are logged and dropped, there is no retransmit.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::name::Name;
use domain::base::{Message, ToName};
use domain::rdata::AllRecordData;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::rustls::{HandshakeKind, ProtocolVersion};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::edns::{self, ReqEdns};
use crate::names::{lower_name, name_string};
use crate::response::{Proto, Response, TlsInfo};
use crate::zones::dnscheck::DnscheckZone;
use crate::zones::{Zone, ZoneAnswer};

/// How long an idle TCP/TLS connection may sit between messages.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

//------------ QueryCtx ------------------------------------------------------

/// An accepted DNS message plus everything known about its arrival.
pub struct QueryCtx {
    pub msg: Message<Vec<u8>>,
    pub proto: Proto,
    pub remote: SocketAddr,
    pub tls: Option<TlsInfo>,
    pub qname: Name<Bytes>,
    /// Presentation form of the question name, original case, trailing dot.
    pub qname_str: String,
    pub qtype: Rtype,
    pub qclass: Class,
    pub edns: Option<ReqEdns>,
}

impl QueryCtx {
    pub fn new(
        msg: Message<Vec<u8>>,
        proto: Proto,
        remote: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> Option<Self> {
        let question = msg.sole_question().ok()?;
        let qname = question.qname().to_bytes();
        let qname_str = name_string(&qname);
        let qtype = question.qtype();
        let qclass = question.qclass();
        let req_edns = edns::parse(&msg);
        Some(Self {
            msg,
            proto,
            remote,
            tls,
            qname,
            qname_str,
            qtype,
            qclass,
            edns: req_edns,
        })
    }

    /// Start a reply echoing id, opcode, RD and the question.
    pub fn reply(&self) -> Response {
        let header = self.msg.header();
        Response::reply(
            header.id(),
            header.opcode(),
            header.rd(),
            (self.qname.clone(), self.qtype, self.qclass),
        )
    }

    pub fn question(&self) -> crate::zones::Question<'_> {
        crate::zones::Question {
            name: &self.qname_str,
            qtype: self.qtype,
        }
    }
}

//------------ Accept filter -------------------------------------------------

/// What to do with a message, judged before any zone logic runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptAction {
    Accept,
    /// Silently drop (responses must never be answered).
    Ignore,
    /// Reply NOTIMP at the wire level.
    RejectNotImplemented,
    /// Reply FORMERR at the wire level.
    Reject,
}

pub fn accept(msg: &Message<Vec<u8>>) -> AcceptAction {
    let header = msg.header();
    if header.qr() {
        return AcceptAction::Ignore;
    }
    if !matches!(header.opcode(), Opcode::QUERY | Opcode::UPDATE) {
        return AcceptAction::RejectNotImplemented;
    }
    if msg.header_counts().qdcount() != 1 {
        return AcceptAction::Reject;
    }
    AcceptAction::Accept
}

//------------ Mux -----------------------------------------------------------

pub enum ZoneEntry {
    Standard(Zone),
    Dnscheck(Box<DnscheckZone>),
}

/// Dispatches questions to the zone with the longest matching suffix.
pub struct Mux {
    zones: Vec<(String, ZoneEntry)>,
}

impl Mux {
    pub fn new() -> Self {
        Self { zones: Vec::new() }
    }

    /// Register a zone. `zone` is stored lower-cased with its trailing dot.
    pub fn insert(&mut self, zone: &str, entry: ZoneEntry) {
        self.zones
            .push((lower_name(zone).into_owned(), entry));
    }

    fn lookup(&self, qname_lower: &str) -> Option<&ZoneEntry> {
        self.zones
            .iter()
            .filter(|(zone, _)| name_has_suffix(qname_lower, zone))
            .max_by_key(|(zone, _)| zone.len())
            .map(|(_, entry)| entry)
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

fn name_has_suffix(name: &str, zone: &str) -> bool {
    if zone == "." {
        return true;
    }
    name.len() >= zone.len()
        && name.ends_with(zone)
        && (name.len() == zone.len() || name.as_bytes()[name.len() - zone.len() - 1] == b'.')
}

//------------ Server --------------------------------------------------------

pub struct Server {
    pub mux: Mux,
    pub requests: Arc<AtomicU64>,
}

impl Server {
    /// Process one raw message. `None` means no reply at all.
    pub async fn handle_message(
        self: &Arc<Self>,
        wire: Vec<u8>,
        proto: Proto,
        remote: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> Option<Vec<u8>> {
        let Ok(msg) = Message::from_octets(wire) else {
            return None;
        };
        let header = msg.header();
        match accept(&msg) {
            AcceptAction::Accept => {}
            AcceptAction::Ignore => return None,
            AcceptAction::RejectNotImplemented => {
                return Some(
                    Response::status(header.id(), header.opcode(), Rcode::NOTIMP)
                        .to_wire(None, false),
                );
            }
            AcceptAction::Reject => {
                return Some(
                    Response::status(header.id(), header.opcode(), Rcode::FORMERR)
                        .to_wire(None, false),
                );
            }
        }
        let Some(ctx) = QueryCtx::new(msg, proto, remote, tls) else {
            return Some(
                Response::status(header.id(), header.opcode(), Rcode::FORMERR)
                    .to_wire(None, false),
            );
        };

        let answer = match self.mux.lookup(&lower_name(&ctx.qname_str)) {
            Some(ZoneEntry::Standard(zone)) => zone.handle(&ctx),
            Some(ZoneEntry::Dnscheck(zone)) => ZoneAnswer::Response(zone.handle(&ctx).await),
            None => {
                let mut resp = ctx.reply();
                resp.rcode = Rcode::REFUSED;
                ZoneAnswer::Response(resp)
            }
        };
        let wire = match answer {
            ZoneAnswer::Response(resp) => {
                let max_size = match ctx.proto {
                    Proto::Udp if !resp.skip_size_limit => {
                        Some(edns::max_udp_size(ctx.edns.as_ref()))
                    }
                    _ => None,
                };
                let pad = ctx.proto == Proto::Tls
                    && ctx.edns.as_ref().is_some_and(|e| e.has_padding);
                resp.to_wire(max_size, pad)
            }
            ZoneAnswer::Wire(wire) => wire,
        };

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.log_request(&ctx, &wire);
        Some(wire)
    }

    fn log_request(&self, ctx: &QueryCtx, response_wire: &[u8]) {
        let (status, an, ns, ex) = match Message::from_octets(response_wire) {
            Ok(resp) => {
                let counts = resp.header_counts();
                (
                    resp.header().rcode().to_string(),
                    counts.ancount(),
                    counts.nscount(),
                    counts.arcount(),
                )
            }
            Err(_) => ("NOREPLY".to_owned(), 0, 0, 0),
        };
        info!(
            target: "uzoned::request",
            "{status} {an}/{ns}/{ex} {remote} {proto} {opcode} {qname} {class} {qtype}",
            remote = ctx.remote,
            proto = ctx.proto,
            opcode = ctx.msg.header().opcode(),
            qname = ctx.qname_str,
            class = ctx.qclass,
            qtype = ctx.qtype,
        );
    }
}

//------------ Listeners -----------------------------------------------------

pub async fn serve_udp(server: Arc<Server>, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                error!("udp receive failed: {err}");
                continue;
            }
        };
        let wire = buf[..len].to_vec();
        let server = server.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Some(resp) = server.handle_message(wire, Proto::Udp, remote, None).await {
                if let Err(err) = socket.send_to(&resp, remote).await {
                    debug!("udp send to {remote} failed: {err}");
                }
            }
        });
    }
}

pub async fn serve_tcp(server: Arc<Server>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("tcp accept failed: {err}");
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_stream(&server, stream, Proto::Tcp, remote, None).await {
                debug!("tcp connection from {remote} ended: {err}");
            }
        });
    }
}

pub async fn serve_tls(server: Arc<Server>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("tls accept failed: {err}");
                continue;
            }
        };
        let server = server.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!("tls handshake with {remote} failed: {err}");
                    return;
                }
            };
            let tls = tls_info(stream.get_ref().1);
            if let Err(err) = serve_stream(&server, stream, Proto::Tls, remote, Some(tls)).await {
                debug!("tls connection from {remote} ended: {err}");
            }
        });
    }
}

fn tls_info(conn: &tokio_rustls::rustls::ServerConnection) -> TlsInfo {
    TlsInfo {
        version: match conn.protocol_version() {
            Some(ProtocolVersion::TLSv1_2) => "TLS 1.2".to_owned(),
            Some(ProtocolVersion::TLSv1_3) => "TLS 1.3".to_owned(),
            Some(other) => format!("{other:?}"),
            None => String::new(),
        },
        cipher_suite: conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
            .unwrap_or_default(),
        server_name: conn.server_name().map(str::to_owned),
        negotiated_protocol: conn
            .alpn_protocol()
            .map(|alpn| String::from_utf8_lossy(alpn).into_owned()),
        did_resume: conn.handshake_kind() == Some(HandshakeKind::Resumed),
    }
}

/// Length-prefixed message loop shared by TCP and TLS.
async fn serve_stream<S>(
    server: &Arc<Server>,
    mut stream: S,
    proto: Proto,
    remote: SocketAddr,
    tls: Option<TlsInfo>,
) -> std::io::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let len = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.read_u16()).await {
            Ok(Ok(len)) => usize::from(len),
            // clean EOF or idle timeout both just end the connection
            _ => return Ok(()),
        };
        let mut wire = vec![0u8; len];
        stream.read_exact(&mut wire).await?;
        if let Some(resp) = server
            .handle_message(wire, proto, remote, tls.clone())
            .await
        {
            stream.write_u16(resp.len() as u16).await?;
            stream.write_all(&resp).await?;
        }
    }
}

//------------ Message rendering ---------------------------------------------

/// A dig-style text rendering of a message, for watcher feeds.
pub fn message_text(msg: &Message<Vec<u8>>) -> String {
    let header = msg.header();
    let counts = msg.header_counts();
    let mut out = String::new();
    let _ = writeln!(
        out,
        ";; opcode: {}, status: {}, id: {}",
        header.opcode(),
        header.rcode(),
        header.id()
    );
    let mut flags = String::new();
    for (set, flag) in [
        (header.qr(), "qr"),
        (header.aa(), "aa"),
        (header.tc(), "tc"),
        (header.rd(), "rd"),
        (header.ra(), "ra"),
        (header.ad(), "ad"),
        (header.cd(), "cd"),
    ] {
        if set {
            flags.push(' ');
            flags.push_str(flag);
        }
    }
    let _ = writeln!(
        out,
        ";; flags:{}; QUERY: {}, ANSWER: {}, AUTHORITY: {}, ADDITIONAL: {}",
        flags,
        counts.qdcount(),
        counts.ancount(),
        counts.nscount(),
        counts.arcount()
    );
    if let Ok(question) = msg.sole_question() {
        let _ = writeln!(out, ";; QUESTION SECTION:");
        let _ = writeln!(
            out,
            ";{} {} {}",
            name_string(&question.qname().to_bytes()),
            question.qclass(),
            question.qtype()
        );
    }
    for (section, title) in [
        (msg.answer(), "ANSWER"),
        (msg.authority(), "AUTHORITY"),
        (msg.additional(), "ADDITIONAL"),
    ] {
        let Ok(section) = section else { continue };
        let mut wrote_title = false;
        for record in section.flatten() {
            let Ok(Some(record)) = record.to_record::<AllRecordData<_, _>>() else {
                continue;
            };
            if !wrote_title {
                let _ = writeln!(out, ";; {title} SECTION:");
                wrote_title = true;
            }
            let _ = writeln!(
                out,
                "{} {} {} {} {}",
                name_string(&record.owner().to_bytes()),
                record.ttl().as_secs(),
                record.class(),
                record.rtype(),
                record.data()
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::MessageBuilder;

    fn query_wire(qr: bool, opcode: Opcode) -> Vec<u8> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_qr(qr);
        builder.header_mut().set_opcode(opcode);
        let mut question = builder.question();
        question
            .push((
                crate::names::parse_name("x.example."),
                Rtype::A,
                Class::IN,
            ))
            .unwrap();
        question.into_message().as_slice().to_vec()
    }

    #[test]
    fn responses_are_ignored() {
        let msg = Message::from_octets(query_wire(true, Opcode::QUERY)).unwrap();
        assert_eq!(accept(&msg), AcceptAction::Ignore);
    }

    #[test]
    fn unknown_opcodes_are_notimp() {
        let msg = Message::from_octets(query_wire(false, Opcode::STATUS)).unwrap();
        assert_eq!(accept(&msg), AcceptAction::RejectNotImplemented);
        let msg = Message::from_octets(query_wire(false, Opcode::UPDATE)).unwrap();
        assert_eq!(accept(&msg), AcceptAction::Accept);
    }

    #[test]
    fn qdcount_must_be_one() {
        let builder = MessageBuilder::new_vec();
        let msg = Message::from_octets(builder.question().into_message().as_slice().to_vec())
            .unwrap();
        assert_eq!(accept(&msg), AcceptAction::Reject);
    }

    #[test]
    fn suffix_matching_respects_label_boundaries() {
        assert!(name_has_suffix("a.c.example.", "c.example."));
        assert!(name_has_suffix("c.example.", "c.example."));
        assert!(!name_has_suffix("xc.example.", "c.example."));
        assert!(!name_has_suffix("example.", "c.example."));
        assert!(name_has_suffix("anything.at.all.", "."));
    }

    #[test]
    fn longest_suffix_wins() {
        let mut mux = Mux::new();
        mux.insert(
            "example.",
            ZoneEntry::Standard(test_zone("example.")),
        );
        mux.insert(
            "sub.example.",
            ZoneEntry::Standard(test_zone("sub.example.")),
        );
        let entry = mux.lookup("a.sub.example.").unwrap();
        let ZoneEntry::Standard(zone) = entry else {
            panic!("wrong entry")
        };
        assert_eq!(zone.authority.zone, "sub.example.");
    }

    fn test_zone(name: &str) -> Zone {
        Zone {
            authority: crate::zones::ZoneAuthority::new(
                name.into(),
                vec!["ns1.example.".into()],
                None,
            ),
            static_records: Vec::new(),
            generator: None,
            updater: None,
            signer: None,
        }
    }
}
