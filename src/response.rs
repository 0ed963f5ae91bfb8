//! The section-based response model and its wire assembly.
//!
//! Handlers build a [`Response`] by appending typed records to its sections
//! and tweaking flags; the transport glue then renders it to wire once, with
//! compression, truncation and padding applied according to the protocol the
//! query arrived on.

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use domain::base::iana::exterr::ExtendedErrorCode;
use domain::base::iana::{Class, OptRcode, Opcode, Rcode, Rtype};
use domain::base::message_builder::{MessageBuilder, TreeCompressor};
use domain::base::name::Name;
use domain::base::opt::{ClientSubnet, ExtendedError};
use domain::base::record::Record;
use domain::base::wire::Composer;
use domain::rdata::ZoneRecordData;

/// Record data as it appears in the served zones.
pub type RrData = ZoneRecordData<Bytes, Name<Bytes>>;

/// A resource record with owned octets.
pub type Rr = Record<Name<Bytes>, RrData>;

/// The block size DoT responses are padded to, following the
/// recommendation of RFC 8467.
pub const PADDING_BLOCK: usize = 468;

/// The transport a message arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Udp => "UDP",
            Proto::Tcp => "TCP",
            Proto::Tls => "TLS",
        })
    }
}

/// TLS session details of a DoT connection.
#[derive(Clone, Debug, Default)]
pub struct TlsInfo {
    pub version: String,
    pub cipher_suite: String,
    pub server_name: Option<String>,
    pub negotiated_protocol: Option<String>,
    pub did_resume: bool,
}

/// An option to attach to the response OPT record.
#[derive(Clone, Debug)]
pub enum RespOption {
    /// Echo of a Client-Subnet option: address, source prefix, scope 0.
    ClientSubnet { addr: IpAddr, source: u8 },
    /// An Extended DNS Error with code 0 (Other) and a text.
    Ede(&'static str),
    /// Padding of the given number of zero bytes.
    Padding(u16),
}

/// The EDNS part of a response; present iff the request carried an OPT.
#[derive(Clone, Debug)]
pub struct RespEdns {
    pub udp_size: u16,
    pub dnssec_ok: bool,
    pub rcode: OptRcode,
    pub options: Vec<RespOption>,
}

impl RespEdns {
    pub fn new(udp_size: u16, dnssec_ok: bool) -> Self {
        Self {
            udp_size,
            dnssec_ok,
            rcode: OptRcode::NOERROR,
            options: Vec::new(),
        }
    }
}

/// A response under construction.
#[derive(Clone, Debug)]
pub struct Response {
    pub id: u16,
    pub opcode: Opcode,
    pub rcode: Rcode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    /// The question to echo; `None` for UPDATE responses, which echo no
    /// sections at all.
    pub question: Option<(Name<Bytes>, Rtype, Class)>,
    pub answer: Vec<Rr>,
    pub authority: Vec<Rr>,
    pub edns: Option<RespEdns>,
    pub compress: bool,
    /// Skip size-based truncation even over UDP (dnscheck `notruncate`).
    pub skip_size_limit: bool,
}

impl Response {
    /// Start a reply to the given request parameters.
    pub fn reply(id: u16, opcode: Opcode, rd: bool, question: (Name<Bytes>, Rtype, Class)) -> Self {
        Self {
            id,
            opcode,
            rcode: Rcode::NOERROR,
            authoritative: false,
            truncated: false,
            recursion_desired: rd,
            question: Some(question),
            answer: Vec::new(),
            authority: Vec::new(),
            edns: None,
            compress: false,
            skip_size_limit: false,
        }
    }

    /// Start an empty status-only response (UPDATE path, SERVFAIL path).
    pub fn status(id: u16, opcode: Opcode, rcode: Rcode) -> Self {
        Self {
            id,
            opcode,
            rcode,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            question: None,
            answer: Vec::new(),
            authority: Vec::new(),
            edns: None,
            compress: false,
            skip_size_limit: false,
        }
    }

    pub fn qname(&self) -> Option<&Name<Bytes>> {
        self.question.as_ref().map(|(name, _, _)| name)
    }

    /// Attach an EDNS option, quietly dropping it when the request carried
    /// no OPT record to respond to.
    pub fn push_option(&mut self, option: RespOption) {
        if let Some(edns) = self.edns.as_mut() {
            edns.options.push(option);
        }
    }

    /// Render to wire, applying the per-transport size policy.
    ///
    /// Over UDP the message is truncated to `max_size` by dropping records
    /// from the additional, then authority, then answer sections; TC is set
    /// once the answer section is cut. Compression is tried before anything
    /// is dropped. Over TCP and TLS no truncation happens; over TLS the
    /// caller passes `pad` to round the message up to the padding block.
    pub fn to_wire(&self, max_size: Option<usize>, pad: bool) -> Vec<u8> {
        let mut an = self.answer.len();
        let mut ns = self.authority.len();
        let mut compress = self.compress;
        let mut truncated = self.truncated;

        let mut wire = self.encode(compress, an, ns, truncated, 0);
        if let Some(max) = max_size {
            if wire.len() > max && !compress {
                compress = true;
                wire = self.encode(compress, an, ns, truncated, 0);
            }
            while wire.len() > max {
                if ns > 0 {
                    ns -= 1;
                } else if an > 0 {
                    an -= 1;
                    truncated = true;
                } else {
                    break;
                }
                wire = self.encode(compress, an, ns, truncated, 0);
            }
        } else if pad && self.edns.is_some() {
            // the padding option header itself is four bytes
            let base = wire.len() + 4;
            let fill = (PADDING_BLOCK - base % PADDING_BLOCK) % PADDING_BLOCK;
            wire = self.encode(compress, an, ns, truncated, fill as u16);
        }
        wire
    }

    fn encode(
        &self,
        compress: bool,
        an: usize,
        ns: usize,
        tc: bool,
        padding: u16,
    ) -> Vec<u8> {
        if compress {
            let target = TreeCompressor::new(Vec::new());
            self.build(target, an, ns, tc, padding).into_target()
        } else {
            self.build(Vec::new(), an, ns, tc, padding)
        }
    }

    fn build<Target>(&self, target: Target, an: usize, ns: usize, tc: bool, padding: u16) -> Target
    where
        Target: Composer,
        Target::AppendError: fmt::Debug,
    {
        // Vec-backed targets grow without bound, so pushes cannot fail.
        let mut builder = MessageBuilder::from_target(target).unwrap();
        let header = builder.header_mut();
        header.set_id(self.id);
        header.set_qr(true);
        header.set_opcode(self.opcode);
        header.set_aa(self.authoritative);
        header.set_tc(tc);
        header.set_rd(self.recursion_desired);
        header.set_rcode(self.rcode);

        let mut question = builder.question();
        if let Some((name, rtype, class)) = &self.question {
            question.push((name, *rtype, *class)).unwrap();
        }
        let mut answer = question.answer();
        for rr in &self.answer[..an] {
            answer.push(rr).unwrap();
        }
        let mut authority = answer.authority();
        for rr in &self.authority[..ns] {
            authority.push(rr).unwrap();
        }
        let mut additional = authority.additional();
        if let Some(edns) = &self.edns {
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(edns.udp_size);
                    opt.set_dnssec_ok(edns.dnssec_ok);
                    opt.set_rcode(edns.rcode);
                    for option in &edns.options {
                        match option {
                            RespOption::ClientSubnet { addr, source } => {
                                opt.push(&ClientSubnet::new(*source, 0, *addr))?;
                            }
                            RespOption::Ede(text) => {
                                if let Ok(ede) = ExtendedError::<Bytes>::new_with_str(
                                    ExtendedErrorCode::OTHER,
                                    *text,
                                ) {
                                    opt.push(&ede)?;
                                }
                            }
                            RespOption::Padding(len) => {
                                opt.padding(*len)?;
                            }
                        }
                    }
                    if padding > 0 {
                        // transport padding always goes last
                        opt.padding(padding)?;
                    }
                    Ok(())
                })
                .unwrap();
        }
        additional.finish()
    }
}

//------------ Record constructors -------------------------------------------

/// Shorthand constructors for the record shapes the generators produce.
pub mod records {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use bytes::Bytes;
    use domain::base::charstr::CharStr;
    use domain::base::iana::Class;
    use domain::base::name::Name;
    use domain::base::Ttl;
    use domain::dep::octseq::OctetsInto;
    use domain::rdata::svcb::{PushError, SvcParams, value};
    use domain::rdata::rfc1035::TxtBuilder;
    use domain::rdata::{A, Aaaa, Cname, Hinfo, Https, Mx, Ns, Soa, Txt, ZoneRecordData};

    use super::{Rr, RrData};
    use crate::names::{parse_name, split_txt};

    pub fn make(owner: &str, ttl: u32, data: RrData) -> Rr {
        Rr::new(parse_name(owner), Class::IN, Ttl::from_secs(ttl), data)
    }

    pub fn a(owner: &str, ttl: u32, addr: Ipv4Addr) -> Rr {
        make(owner, ttl, ZoneRecordData::A(A::new(addr)))
    }

    pub fn aaaa(owner: &str, ttl: u32, addr: Ipv6Addr) -> Rr {
        make(owner, ttl, ZoneRecordData::Aaaa(Aaaa::new(addr)))
    }

    pub fn cname(owner: &str, ttl: u32, target: &str) -> Rr {
        make(
            owner,
            ttl,
            ZoneRecordData::Cname(Cname::new(parse_name(target))),
        )
    }

    pub fn ns(owner: &str, ttl: u32, target: &str) -> Rr {
        make(owner, ttl, ZoneRecordData::Ns(Ns::new(parse_name(target))))
    }

    pub fn soa(
        owner: &str,
        ttl: u32,
        mname: &str,
        rname: &str,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    ) -> Rr {
        make(
            owner,
            ttl,
            ZoneRecordData::Soa(Soa::new(
                parse_name(mname),
                parse_name(rname),
                serial.into(),
                Ttl::from_secs(refresh),
                Ttl::from_secs(retry),
                Ttl::from_secs(expire),
                Ttl::from_secs(minimum),
            )),
        )
    }

    /// A TXT record whose rdata is `text` split into 255-byte strings.
    pub fn txt(owner: &str, ttl: u32, text: &str) -> Rr {
        let mut builder = TxtBuilder::<Vec<u8>>::new();
        for chunk in split_txt(text) {
            builder.append_slice(chunk.as_bytes()).unwrap();
        }
        let data: Txt<Vec<u8>> = builder.finish().unwrap();
        make(owner, ttl, ZoneRecordData::Txt(data.octets_into()))
    }

    /// The RFC 8482 minimal-ANY answer.
    pub fn hinfo_rfc8482(owner: &str, ttl: u32) -> Rr {
        make(
            owner,
            ttl,
            ZoneRecordData::Hinfo(Hinfo::new(
                CharStr::from_octets(Bytes::from_static(b"RFC8482")).unwrap(),
                CharStr::from_octets(Bytes::new()).unwrap(),
            )),
        )
    }

    /// The RFC 7505 null MX.
    pub fn null_mx(owner: &str, ttl: u32) -> Rr {
        make(owner, ttl, ZoneRecordData::Mx(Mx::new(0, Name::root())))
    }

    /// An HTTPS AliasMode record advertising h3/h2 plus address hints.
    pub fn https(owner: &str, ttl: u32, v4: &[Ipv4Addr], v6: &[Ipv6Addr]) -> Option<Rr> {
        let params = SvcParams::<Bytes>::from_values(|builder| {
            let mut alpn = value::AlpnBuilder::<Vec<u8>>::empty();
            alpn.push("h3").map_err(|_| PushError::ShortBuf)?;
            alpn.push("h2").map_err(|_| PushError::ShortBuf)?;
            builder.push(&alpn.freeze())?;
            if !v4.is_empty() {
                let hint = value::Ipv4Hint::<Vec<u8>>::from_addrs(v4.iter().copied())
                    .map_err(|_| PushError::ShortBuf)?;
                builder.push(&hint)?;
            }
            if !v6.is_empty() {
                let hint = value::Ipv6Hint::<Vec<u8>>::from_addrs(v6.iter().copied())
                    .map_err(|_| PushError::ShortBuf)?;
                builder.push(&hint)?;
            }
            Ok(())
        })
        .ok()?;
        Some(make(
            owner,
            ttl,
            ZoneRecordData::Https(Https::new(1, Name::root(), params)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::Message;

    fn big_response() -> Response {
        let mut resp = Response::reply(
            7,
            Opcode::QUERY,
            false,
            (
                crate::names::parse_name("big.test."),
                Rtype::TXT,
                Class::IN,
            ),
        );
        resp.authoritative = true;
        for _ in 0..4 {
            resp.answer
                .push(records::txt("big.test.", 1, &"x".repeat(200)));
        }
        resp
    }

    #[test]
    fn untruncated_fits_roundtrip() {
        let resp = big_response();
        let wire = resp.to_wire(None, false);
        let msg = Message::from_octets(wire).unwrap();
        assert_eq!(msg.header().id(), 7);
        assert!(msg.header().aa());
        assert!(!msg.header().tc());
        assert_eq!(msg.header_counts().ancount(), 4);
    }

    #[test]
    fn udp_truncation_cuts_answer_and_sets_tc() {
        let resp = big_response();
        let wire = resp.to_wire(Some(512), false);
        assert!(wire.len() <= 512);
        let msg = Message::from_octets(wire).unwrap();
        assert!(msg.header().tc());
        assert!(msg.header_counts().ancount() < 4);
    }

    #[test]
    fn tls_padding_rounds_to_block() {
        let mut resp = big_response();
        resp.edns = Some(RespEdns::new(1400, false));
        let wire = resp.to_wire(None, true);
        assert_eq!(wire.len() % PADDING_BLOCK, 0);
    }
}
