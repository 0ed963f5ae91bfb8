//! The per-zone handler framework.
//!
//! Every zone shares one pipeline (opcode split, EDNS negotiation, class
//! and type filters, DNSKEY short-circuit, apex synthesis, record
//! generation, the minimal-ANY answer, SOA fallback and the DNSSEC proof);
//! what differs per zone is a record generator. The dnscheck zone, whose
//! behaviour is steered by the queried name itself, carries its own
//! handler in [`dnscheck`].

pub mod challenges;
pub mod cname;
pub mod dnscheck;
pub mod dynaddr;
pub mod ip;
pub mod myaddr;
pub mod status;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use tracing::error;

use crate::edns;
use crate::dnssec::Signer;
use crate::names::{equal_names, fix_names};
use crate::response::{records, Response, Rr};
use crate::serve::QueryCtx;

/// The question as the generators see it: presentation name with the
/// original case, plus the queried type.
pub struct Question<'a> {
    pub name: &'a str,
    pub qtype: Rtype,
}

/// The server's own addresses, split by family for cheap filtering.
#[derive(Clone, Debug, Default)]
pub struct Addrs {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl Addrs {
    pub fn from_ips(ips: &[IpAddr]) -> Self {
        let mut addrs = Addrs::default();
        for ip in ips {
            match ip {
                IpAddr::V4(v4) => addrs.v4.push(*v4),
                IpAddr::V6(v6) => addrs.v6.push(*v6),
            }
        }
        addrs
    }
}

/// Static records configured for a zone, matched against a question.
///
/// Any match, even an empty one after type filtering, validates the name.
pub fn fix_static(static_records: &[Rr], q: &Question<'_>) -> (Vec<Rr>, bool) {
    let mut rrs = Vec::new();
    let mut valid = false;
    for rr in static_records {
        let owner = crate::names::name_string(rr.owner());
        if equal_names(&owner, q.name) {
            valid = true;
            if rr.rtype() == q.qtype {
                rrs.push(rr.clone());
            }
        }
    }
    if !rrs.is_empty() {
        fix_names(&mut rrs, q.name);
    }
    (rrs, valid)
}

//------------ ZoneAuthority -------------------------------------------------

/// The authority data every zone synthesizes: SOA and NS at the apex.
pub struct ZoneAuthority {
    /// Zone apex, lower-cased, with trailing dot.
    pub zone: String,
    pub ns: Vec<String>,
    pub hostmaster: String,
}

impl ZoneAuthority {
    pub fn new(zone: String, ns: Vec<String>, hostmaster: Option<String>) -> Self {
        let hostmaster = hostmaster.unwrap_or_else(|| format!("hostmaster.{zone}"));
        Self {
            zone,
            ns,
            hostmaster,
        }
    }

    /// The zone SOA, owner case matching the question suffix.
    pub fn soa(&self, qname: &str) -> Rr {
        let owner = &qname[qname.len() - self.zone.len()..];
        records::soa(
            owner,
            300,
            self.ns.first().map(String::as_str).unwrap_or("invalid."),
            &self.hostmaster,
            1,
            9000,
            9000,
            18000,
            300,
        )
    }

    /// Answer SOA and NS queries at the apex; flips the rcode to NOERROR
    /// for any apex question.
    pub fn apex_answers(&self, resp: &mut Response, q: &Question<'_>) {
        if q.name.len() != self.zone.len() {
            return;
        }
        resp.rcode = Rcode::NOERROR;
        match q.qtype {
            Rtype::SOA => resp.answer.push(self.soa(q.name)),
            Rtype::NS => {
                for ns in &self.ns {
                    resp.answer.push(records::ns(q.name, 300, ns));
                }
            }
            _ => {}
        }
    }
}

//------------ Generator -----------------------------------------------------

/// The per-zone record generators, one variant per zone flavour.
pub enum Generator {
    Challenges(challenges::Generator),
    Cname(cname::Generator),
    Dyn(dynaddr::Generator),
    Ip(ip::Generator),
    Myaddr(myaddr::Generator),
    Status(status::Generator),
}

impl Generator {
    /// Produce the records for a question plus whether the name exists at
    /// all. Generators do not fail; a name outside the recognised shapes
    /// simply is not valid.
    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        match self {
            Generator::Challenges(g) => g.generate(q, zone),
            Generator::Cname(g) => g.generate(q, zone),
            Generator::Dyn(g) => g.generate(q, zone),
            Generator::Ip(g) => g.generate(q, zone),
            Generator::Myaddr(g) => g.generate(q, zone),
            Generator::Status(g) => g.generate(q, zone),
        }
    }
}

//------------ Zone ----------------------------------------------------------

/// A zone served through the shared pipeline.
pub struct Zone {
    pub authority: ZoneAuthority,
    pub static_records: Vec<Rr>,
    pub generator: Option<Generator>,
    pub updater: Option<ip::UpdateHandler>,
    pub signer: Option<Signer>,
}

impl Zone {
    /// Run the query pipeline. Returns the finished response, or raw wire
    /// bytes when the UPDATE path built (and possibly TSIG-signed) the
    /// message itself.
    pub fn handle(&self, ctx: &QueryCtx) -> ZoneAnswer {
        let header = ctx.msg.header();
        if header.opcode() == Opcode::UPDATE {
            if let Some(updater) = &self.updater {
                return ZoneAnswer::Wire(updater.handle(ctx, &self.authority.zone));
            }
        }
        if header.opcode() != Opcode::QUERY {
            return ZoneAnswer::Response(Response::status(
                header.id(),
                header.opcode(),
                Rcode::NOTIMP,
            ));
        }

        let mut resp = ctx.reply();
        resp.authoritative = true;
        if !edns::check_and_set(ctx.edns.as_ref(), &mut resp) {
            return ZoneAnswer::Response(resp);
        }
        if ctx.qclass != Class::IN {
            resp.rcode = Rcode::NOTIMP;
            return ZoneAnswer::Response(resp);
        }
        if ctx.qtype == Rtype::RRSIG || ctx.qtype == Rtype::NSEC {
            resp.rcode = Rcode::REFUSED;
            return ZoneAnswer::Response(resp);
        }
        if let Some(signer) = &self.signer {
            if signer.provide_keys(&mut resp) {
                return ZoneAnswer::Response(resp);
            }
        }

        // the name does not exist until a step below validates it
        resp.rcode = Rcode::NXDOMAIN;
        let q = ctx.question();
        self.authority.apex_answers(&mut resp, &q);
        if !self.static_records.is_empty() {
            let (rrs, valid) = fix_static(&self.static_records, &q);
            resp.answer.extend(rrs);
            if valid {
                resp.rcode = Rcode::NOERROR;
            }
        }
        if let Some(generator) = &self.generator {
            let (rrs, valid) = generator.generate(&q, &self.authority.zone);
            resp.answer.extend(rrs);
            if valid {
                resp.rcode = Rcode::NOERROR;
            }
        }

        // deferred steps, innermost first: minimal-ANY, SOA fallback, proof
        if ctx.qtype == Rtype::ANY && resp.rcode == Rcode::NOERROR && resp.answer.is_empty() {
            resp.answer.push(records::hinfo_rfc8482(q.name, 300));
        }
        if (resp.rcode == Rcode::NOERROR && resp.answer.is_empty())
            || resp.rcode == Rcode::NXDOMAIN
        {
            resp.authority.push(self.authority.soa(q.name));
        }
        if let Some(signer) = &self.signer {
            if let Err(err) = signer.prove(&mut resp, 0, 0) {
                error!("failed to prove response: {err}");
                resp = Response::status(header.id(), Opcode::QUERY, Rcode::SERVFAIL);
            }
        }
        ZoneAnswer::Response(resp)
    }
}

/// What a zone handler produced.
pub enum ZoneAnswer {
    /// A response still subject to transport adaptation.
    Response(Response),
    /// Finished wire bytes (the UPDATE path signs the message itself).
    Wire(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::parse_name;
    use crate::response::Proto;
    use crate::serve::QueryCtx;
    use domain::base::{Message, MessageBuilder};

    fn query_ctx(qname: &str, qtype: Rtype) -> QueryCtx {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(4242);
        let mut question = builder.question();
        question
            .push((parse_name(qname), qtype, Class::IN))
            .unwrap();
        let msg = Message::from_octets(question.into_message().as_slice().to_vec()).unwrap();
        QueryCtx::new(
            msg,
            Proto::Udp,
            "203.0.113.5:55353".parse().unwrap(),
            None,
        )
        .unwrap()
    }

    fn test_zone() -> Zone {
        Zone {
            authority: ZoneAuthority::new(
                "cname.example.".into(),
                vec!["ns1.example.".into(), "ns2.example.".into()],
                None,
            ),
            static_records: Vec::new(),
            generator: Some(Generator::Cname(cname::Generator {
                addrs: Addrs::default(),
            })),
            updater: None,
            signer: None,
        }
    }

    fn response_of(answer: ZoneAnswer) -> Response {
        match answer {
            ZoneAnswer::Response(resp) => resp,
            ZoneAnswer::Wire(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn apex_soa_and_ns() {
        let zone = test_zone();
        let resp = response_of(zone.handle(&query_ctx("cname.example.", Rtype::SOA)));
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert!(resp.authoritative);
        assert_eq!(resp.answer.len(), 1);
        assert_eq!(resp.answer[0].rtype(), Rtype::SOA);

        let resp = response_of(zone.handle(&query_ctx("cname.example.", Rtype::NS)));
        assert_eq!(resp.answer.len(), 2);
    }

    #[test]
    fn id_is_echoed() {
        let zone = test_zone();
        let resp = response_of(zone.handle(&query_ctx("cname.example.", Rtype::SOA)));
        assert_eq!(resp.id, 4242);
    }

    #[test]
    fn nodata_gets_soa_authority() {
        let zone = test_zone();
        let resp = response_of(zone.handle(&query_ctx("cname.example.", Rtype::TXT)));
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert!(resp.answer.is_empty());
        assert_eq!(resp.authority.len(), 1);
        assert_eq!(resp.authority[0].rtype(), Rtype::SOA);
    }

    #[test]
    fn rrsig_and_nsec_queries_are_refused() {
        let zone = test_zone();
        let resp = response_of(zone.handle(&query_ctx("x.cname.example.", Rtype::RRSIG)));
        assert_eq!(resp.rcode, Rcode::REFUSED);
        let resp = response_of(zone.handle(&query_ctx("x.cname.example.", Rtype::NSEC)));
        assert_eq!(resp.rcode, Rcode::REFUSED);
    }

    #[test]
    fn any_gets_the_minimal_answer() {
        let zone = test_zone();
        let resp = response_of(zone.handle(&query_ctx("cname.example.", Rtype::ANY)));
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert_eq!(resp.answer.len(), 1);
        assert_eq!(resp.answer[0].rtype(), Rtype::HINFO);
    }

    #[test]
    fn static_records_match_and_validate() {
        let mut zone = test_zone();
        zone.generator = None;
        zone.static_records = vec![records::a(
            "fixed.cname.example.",
            300,
            "192.0.2.1".parse().unwrap(),
        )];
        let resp = response_of(zone.handle(&query_ctx("FIXED.cname.example.", Rtype::A)));
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert_eq!(resp.answer.len(), 1);
        assert_eq!(
            crate::names::name_string(resp.answer[0].owner()),
            "FIXED.cname.example."
        );

        // the name exists for other types too, as NODATA
        let resp = response_of(zone.handle(&query_ctx("fixed.cname.example.", Rtype::TXT)));
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert!(resp.answer.is_empty());
    }
}
