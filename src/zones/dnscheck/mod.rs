//! The DNS-behaviour testing zone.
//!
//! The rightmost label of the queried subdomain is an option DSL (see
//! [`options`]) steering everything about the response: rcode, address
//! family, filler size, padding, truncation and the flavour of DNSSEC
//! proof. Plain TXT queries answer with a diagnostic dump of how the query
//! arrived. Queries carrying a watcher id are additionally fanned out to a
//! live WebSocket feed.

pub mod options;
pub mod watch;
pub mod ws;

use std::sync::Arc;

use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use tracing::{error, warn};

use self::options::{NameShape, Options};
use self::watch::{QueryEvent, WatcherHub};
use crate::dnssec::Signer;
use crate::edns;
use crate::http::ipinfo::IpInfoClient;
use crate::response::{records, Proto, RespOption, Response, Rr};
use crate::serve::{message_text, QueryCtx};
use crate::util::{unix_now, RateLimiter};
use crate::zones::{fix_static, ZoneAuthority};

pub struct DnscheckZone {
    pub authority: ZoneAuthority,
    pub addrs: crate::zones::Addrs,
    pub self_challenge_target: Option<String>,
    pub static_records: Vec<Rr>,
    pub large_response_limiter: Arc<RateLimiter>,
    pub watchers: Arc<WatcherHub>,
    pub ipinfo: Option<Arc<IpInfoClient>>,
    pub signer: Option<Signer>,
    pub bad_signer: Option<Signer>,
}

impl DnscheckZone {
    pub async fn handle(&self, ctx: &QueryCtx) -> Response {
        let zone = &self.authority.zone;
        let shape = options::parse_name(&ctx.qname_str, zone);
        let opts = match &shape {
            Some(NameShape::Options(opts)) => Some(opts.clone()),
            Some(NameShape::Apex) => Some(Options::default()),
            _ => None,
        };

        // fan out to a watcher before anything can reject the query, so
        // even unanswerable messages are observable
        if let Some(opts) = &opts {
            if !opts.random.is_empty() {
                self.watchers
                    .send(&opts.random, |full| self.make_event(ctx, full));
            }
        }

        if ctx.msg.header().opcode() != Opcode::QUERY {
            return Response::status(
                ctx.msg.header().id(),
                ctx.msg.header().opcode(),
                Rcode::NOTIMP,
            );
        }

        let mut resp = ctx.reply();
        resp.authoritative = true;
        if !edns::check_and_set(ctx.edns.as_ref(), &mut resp) {
            return resp;
        }
        if ctx.qclass != Class::IN {
            resp.rcode = Rcode::NOTIMP;
            return resp;
        }
        if ctx.qtype == Rtype::RRSIG || ctx.qtype == Rtype::NSEC {
            resp.rcode = Rcode::REFUSED;
            return resp;
        }
        if let Some(signer) = &self.signer {
            if signer.provide_keys(&mut resp) {
                return resp;
            }
        }

        resp.rcode = Rcode::NXDOMAIN;
        self.authority.apex_answers(&mut resp, &ctx.question());
        if !self.static_records.is_empty() {
            let (rrs, valid) = fix_static(&self.static_records, &ctx.question());
            resp.answer.extend(rrs);
            if valid {
                resp.rcode = Rcode::NOERROR;
            }
        }

        match &shape {
            None => {
                if resp.rcode == Rcode::NXDOMAIN {
                    resp.push_option(RespOption::Ede("invalid subdomain options"));
                }
                return self.finish(ctx, resp, None);
            }
            Some(NameShape::AcmeChallenge) => {
                resp.rcode = Rcode::NOERROR;
                if ctx.qtype == Rtype::TXT {
                    if let Some(target) = &self.self_challenge_target {
                        resp.answer
                            .push(records::cname(&ctx.qname_str, 300, target));
                    }
                }
                return self.finish(ctx, resp, None);
            }
            Some(NameShape::Apex) | Some(NameShape::Options(_)) => {}
        }
        let opts_ref = opts.as_ref().expect("options parsed above");
        resp.rcode = Rcode::NOERROR;

        // error response requested
        if let Some(rcode) = opts_ref.rcode {
            resp.rcode = rcode;
            return self.finish(ctx, resp, Some(opts_ref));
        }
        // minimal ANY
        if ctx.qtype == Rtype::ANY && resp.answer.is_empty() {
            resp.answer.push(records::hinfo_rfc8482(&ctx.qname_str, 300));
            return self.finish(ctx, resp, Some(opts_ref));
        }
        self.generate(ctx, &mut resp, opts_ref).await;
        self.finish(ctx, resp, Some(opts_ref))
    }

    async fn generate(&self, ctx: &QueryCtx, resp: &mut Response, opts: &Options) {
        let name = ctx.qname_str.as_str();
        match ctx.qtype {
            Rtype::A => {
                if opts.null_ip {
                    resp.answer
                        .push(records::a(name, 1, std::net::Ipv4Addr::UNSPECIFIED));
                } else if !opts.ipv6_only {
                    resp.answer
                        .extend(self.addrs.v4.iter().map(|&ip| records::a(name, 1, ip)));
                }
            }
            Rtype::AAAA => {
                if opts.null_ip {
                    resp.answer
                        .push(records::aaaa(name, 1, std::net::Ipv6Addr::UNSPECIFIED));
                } else if !opts.ipv4_only {
                    resp.answer
                        .extend(self.addrs.v6.iter().map(|&ip| records::aaaa(name, 1, ip)));
                }
            }
            Rtype::HTTPS => {
                if !opts.null_ip {
                    let v4 = if opts.ipv6_only { &[][..] } else { &self.addrs.v4[..] };
                    let v6 = if opts.ipv4_only { &[][..] } else { &self.addrs.v6[..] };
                    resp.answer.extend(records::https(name, 1, v4, v6));
                }
            }
            Rtype::TXT => {
                if opts.txt_fill != 0 {
                    if !self.large_response_limiter.allow() {
                        warn!("txtfill request rate limited for {}", ctx.remote);
                        resp.push_option(RespOption::Ede("too busy, try again later"));
                        resp.rcode = Rcode::REFUSED;
                        return;
                    }
                    let fill = "0".repeat(usize::from(opts.txt_fill));
                    resp.answer.push(records::txt(name, 1, &fill));
                    return;
                }
                for line in self.diagnostics(ctx).await {
                    resp.answer.push(records::txt(name, 1, &line));
                }
            }
            Rtype::MX => {
                resp.answer.push(records::null_mx(name, 1));
            }
            _ => {}
        }
    }

    /// The TXT dump describing how this query arrived.
    async fn diagnostics(&self, ctx: &QueryCtx) -> Vec<String> {
        let mut lines = vec![
            format!("id: {}", ctx.msg.header().id()),
            format!("proto: {}", ctx.proto),
            format!("remoteIp: {}", ctx.remote.ip()),
            format!("remotePort: {}", ctx.remote.port()),
        ];
        if let Some(ipinfo) = &self.ipinfo {
            match ipinfo.lookup(ctx.remote.ip()).await {
                Ok(Some(info)) => {
                    let geo = info.geo_string();
                    if !geo.is_empty() {
                        lines.push(format!(
                            "remoteGeo: {}",
                            crate::names::to_printable_ascii(&geo)
                        ));
                    }
                    if !info.org.is_empty() {
                        lines.push(format!(
                            "remoteOrg: {}",
                            crate::names::to_printable_ascii(&info.org)
                        ));
                    }
                }
                Ok(None) => {}
                Err(err) => error!("ip info lookup for {} failed: {err}", ctx.remote.ip()),
            }
        }
        if let Some(req_edns) = &ctx.edns {
            let flags = if req_edns.dnssec_ok { " do" } else { "" };
            lines.push(format!(
                "edns: version: {}, flags:{}; udp: {}",
                req_edns.version, flags, req_edns.udp_size
            ));
            if let Some((addr, source)) = req_edns.client_subnet {
                lines.push(format!("clientSubnet: {addr}/{source}"));
            }
        }
        if let Some(tls) = &ctx.tls {
            lines.push(format!("tlsVersion: {}", tls.version));
            lines.push(format!("tlsCipherSuite: {}", tls.cipher_suite));
            if let Some(server_name) = &tls.server_name {
                lines.push(format!(
                    "tlsServerName: {}",
                    crate::names::to_printable_ascii(server_name)
                ));
            }
            if let Some(alpn) = &tls.negotiated_protocol {
                lines.push(format!(
                    "tlsNegotiatedProtocol: {}",
                    crate::names::to_printable_ascii(alpn)
                ));
            }
            if tls.did_resume {
                lines.push("tlsDidResume: true".to_owned());
            }
        }
        lines
    }

    /// The deferred tail of the pipeline: SOA fallback, DNSSEC proof and
    /// the option-driven response shaping.
    fn finish(&self, ctx: &QueryCtx, mut resp: Response, opts: Option<&Options>) -> Response {
        if (resp.rcode == Rcode::NOERROR && resp.answer.is_empty())
            || resp.rcode == Rcode::NXDOMAIN
        {
            resp.authority.push(self.authority.soa(&ctx.qname_str));
        }

        let skip_sig = opts.is_some_and(|o| o.no_sig);
        if !skip_sig {
            let (valid_from, valid_to) = match opts {
                Some(o) if o.expired_sig != 0 => {
                    let valid_to = unix_now().wrapping_sub(o.expired_sig);
                    let rr_ttl = resp
                        .answer
                        .first()
                        .or(resp.authority.first())
                        .map(|rr| rr.ttl().as_secs())
                        .unwrap_or(0);
                    (valid_to.wrapping_sub(7200 + rr_ttl), valid_to)
                }
                _ => (0, 0),
            };
            let signer = match opts {
                Some(o) if o.bad_sig => self.bad_signer.as_ref(),
                _ => self.signer.as_ref(),
            };
            if let Some(signer) = signer {
                if let Err(err) = signer.prove(&mut resp, valid_from, valid_to) {
                    error!("failed to prove response: {err}");
                    resp = Response::status(ctx.msg.header().id(), Opcode::QUERY, Rcode::SERVFAIL);
                }
            }
        }

        if let Some(opts) = opts {
            if opts.compress {
                resp.compress = true;
            }
            if opts.no_truncate {
                resp.skip_size_limit = true;
            }
            if opts.truncate && ctx.proto == Proto::Udp {
                resp.truncated = true;
                resp.answer.clear();
                resp.authority.clear();
                resp.skip_size_limit = true;
            }
            if opts.padding != 0
                && matches!(ctx.qtype, Rtype::A | Rtype::AAAA | Rtype::TXT)
            {
                if self.large_response_limiter.allow() {
                    resp.push_option(RespOption::Padding(opts.padding));
                } else {
                    warn!("padding request rate limited for {}", ctx.remote);
                    resp.push_option(RespOption::Ede("too busy, try again later"));
                    resp.rcode = Rcode::REFUSED;
                }
            }
        }
        resp
    }

    fn make_event(&self, ctx: &QueryCtx, full: bool) -> QueryEvent {
        let mut event = QueryEvent {
            time: unix_now(),
            proto: ctx.proto.to_string(),
            remote_ip: ctx.remote.ip().to_string(),
            remote_port: ctx.remote.port().to_string(),
            msg_text: full.then(|| message_text(&ctx.msg)),
            ..Default::default()
        };
        if let Some(req_edns) = &ctx.edns {
            event.is_edns0 = true;
            event.udp_size = req_edns.udp_size;
            if let Some((addr, source)) = req_edns.client_subnet {
                event.client_subnet = format!("{addr}/{source}");
            }
        }
        if let Some(tls) = &ctx.tls {
            event.tls_version = tls.version.clone();
            event.tls_cipher_suite = tls.cipher_suite.clone();
            event.tls_server_name = tls.server_name.clone().unwrap_or_default();
            event.tls_negotiated_protocol = tls.negotiated_protocol.clone().unwrap_or_default();
            event.tls_did_resume = tls.did_resume;
        }
        event
    }
}
