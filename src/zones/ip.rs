//! The IP-literal zone.
//!
//! Any name whose rightmost labels spell an IP address answers with that
//! address, statelessly: `1.2.3.4.ip.example.` and `1-2-3-4.ip.example.`
//! both yield `A 1.2.3.4`; `2001-db8--1.ip.example.` yields the obvious
//! AAAA. On top of that the zone accepts RFC 2136 UPDATE messages placing
//! ACME TXT challenges at `_acme-challenge.<ip>.<zone>`, gated on the
//! client actually holding that address.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::{Message, ToName};
use domain::rdata::AllRecordData;
use domain::tsig::{Algorithm, Key, KeyName, ServerTransaction};
use domain::rdata::tsig::Time48;
use tracing::{error, warn};

use crate::names::{equal_names, lower_name, name_string};
use crate::response::{records, Proto, Rr};
use crate::store::TtlStore;
use crate::util::RateLimiter;
use crate::serve::QueryCtx;
use crate::zones::challenges::is_valid_challenge;
use crate::zones::{Addrs, Question};

pub const CHALLENGE_TTL: u32 = 120;
const MAX_UPDATES_PER_REQUEST: usize = 10;

/// Published for client compatibility, not enforced as a secret.
pub const TSIG_SECRET: &str = "ipL40QrEy8cSwmP6OqCihGlYNmE=";

/// Parse the IP literal spelled by the rightmost labels of `sub`.
///
/// `sub` is the subdomain part including its trailing dot. Accepted forms
/// are dotted IPv4, dashed IPv4, fully-expanded IPv6 with seven dashes, and
/// IPv6 with `--` standing in for `::`. The scan runs from the end so any
/// prefix labels (like `_acme-challenge`) are ignored.
pub fn parse_ip(sub: &str) -> Option<IpAddr> {
    let b = sub.as_bytes();
    let end = b.len().checked_sub(1)?;
    if end < 1 || b[end] != b'.' {
        return None;
    }
    let mut has_double_dash = false;
    let mut has_high_hex = false;
    let mut dot_seps = 0;
    let mut dash_seps = 0;
    let mut i = end;
    while i > 0 {
        let (c, d) = (b[i - 1], b[i]);
        match c {
            b'.' => {
                if d == b'.' || i == 1 {
                    return None;
                }
                if dash_seps > 0 || has_high_hex || dot_seps == 3 {
                    break;
                }
                dot_seps += 1;
            }
            b'-' => {
                if dot_seps > 0 {
                    return None;
                }
                if d == b'-' {
                    if has_double_dash {
                        return None;
                    }
                    has_double_dash = true;
                } else {
                    dash_seps += 1;
                    if dash_seps > 7 {
                        return None;
                    }
                }
            }
            b'0'..=b'9' => {}
            b'A'..=b'F' | b'a'..=b'f' => {
                if dot_seps > 0 {
                    return None;
                }
                has_high_hex = true;
            }
            _ => return None,
        }
        i -= 1;
    }
    let lit = &sub[i..end];
    if dot_seps == 3 {
        return lit.parse::<Ipv4Addr>().ok().map(IpAddr::V4);
    }
    if dash_seps == 3 && !has_double_dash && !has_high_hex {
        return lit
            .replace('-', ".")
            .parse::<Ipv4Addr>()
            .ok()
            .map(IpAddr::V4);
    }
    if dash_seps == 7 || has_double_dash {
        return lit
            .replace('-', ":")
            .parse::<Ipv6Addr>()
            .ok()
            .map(IpAddr::V6);
    }
    None
}

//------------ Generator -----------------------------------------------------

pub struct Generator {
    pub addrs: Addrs,
    pub challenge_store: Arc<TtlStore>,
}

impl Generator {
    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        let mut rrs = Vec::new();
        if q.name.len() < zone.len() {
            return (rrs, false);
        }
        let sub = &q.name[..q.name.len() - zone.len()];
        let (mut v4_only, mut v6_only) = (false, false);
        let mut valid = match sub {
            "" => true,
            _ if equal_names(sub, "self.") => {
                v4_only = true;
                true
            }
            _ if equal_names(sub, "self6.") => {
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
            return (rrs, valid);
        }
        if let Some(ip) = parse_ip(sub) {
            valid = true;
            match (q.qtype, ip) {
                (Rtype::A, IpAddr::V4(v4)) => rrs.push(records::a(q.name, 300, v4)),
                (Rtype::AAAA, IpAddr::V6(v6)) => rrs.push(records::aaaa(q.name, 300, v6)),
                (Rtype::TXT, _) => {
                    if sub.len() > 16 && equal_names(&sub[..16], "_acme-challenge.") {
                        for value in self.challenge_store.values(&lower_name(q.name)) {
                            if let Ok(text) = String::from_utf8(value) {
                                rrs.push(records::txt(q.name, 1, &text));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        (rrs, valid)
    }
}

//------------ UpdateHandler -------------------------------------------------

pub struct UpdateHandler {
    pub challenge_store: Arc<TtlStore>,
    pub limiter: RateLimiter,
    tsig_keys: HashMap<(KeyName, Algorithm), Arc<Key>>,
}

impl UpdateHandler {
    pub fn new(zone: &str, challenge_store: Arc<TtlStore>, limiter: RateLimiter) -> Self {
        let mut tsig_keys = HashMap::new();
        let secret = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, TSIG_SECRET)
            .expect("well-known secret decodes");
        let name: KeyName = crate::names::parse_name(zone)
            .to_string()
            .parse()
            .expect("zone names are valid key names");
        if let Ok(key) = Key::new(Algorithm::Sha1, &secret, name.clone(), None, None) {
            tsig_keys.insert((name, Algorithm::Sha1), Arc::new(key));
        }
        Self {
            challenge_store,
            limiter,
            tsig_keys,
        }
    }

    /// Process an UPDATE message, loosely adhering to RFC 2136.
    ///
    /// The response is synthesized fresh: ID and opcode copied, QR set, no
    /// request sections echoed.
    pub fn handle(&self, ctx: &QueryCtx, zone: &str) -> Vec<u8> {
        // a valid TSIG earns a signed acknowledgement; anything else is
        // processed unsigned
        let mut stripped = ctx.msg.clone();
        let transaction =
            ServerTransaction::request(&self.tsig_keys, &mut stripped, Time48::now())
                .ok()
                .flatten();
        let rcode = self.process(&stripped, ctx, zone);
        build_update_response(ctx.msg.header().id(), rcode, transaction)
    }

    fn process(&self, msg: &Message<Vec<u8>>, ctx: &QueryCtx, zone: &str) -> Rcode {
        // zone section: exactly one entry of type SOA naming this zone
        let Ok(question) = msg.sole_question() else {
            return Rcode::FORMERR;
        };
        if question.qtype() != Rtype::SOA {
            return Rcode::FORMERR;
        }
        let zname = name_string(&question.qname().to_bytes());
        if question.qclass() != Class::IN || !equal_names(&zname, zone) {
            return Rcode::NOTAUTH;
        }
        // prerequisites are not implemented
        match msg.answer() {
            Ok(mut prereqs) => {
                if prereqs.next().is_some() {
                    return Rcode::NOTIMP;
                }
            }
            Err(_) => return Rcode::FORMERR,
        }
        let Ok(updates) = msg.authority() else {
            return Rcode::FORMERR;
        };
        let mut to_process: Vec<(Class, String, String)> = Vec::new();
        for record in updates {
            let Ok(record) = record else {
                return Rcode::FORMERR;
            };
            let Ok(Some(record)) = record.to_record::<AllRecordData<_, _>>() else {
                return Rcode::FORMERR;
            };
            if to_process.len() >= MAX_UPDATES_PER_REQUEST {
                return Rcode::REFUSED;
            }
            // class IN adds, class NONE deletes
            if record.class() != Class::IN && record.class() != Class::NONE {
                return Rcode::REFUSED;
            }
            let AllRecordData::Txt(txt) = record.data() else {
                return Rcode::REFUSED;
            };
            let mut strings = txt.iter_charstrs();
            let value = match (strings.next(), strings.next()) {
                (Some(first), None) => String::from_utf8_lossy(first.as_ref()).into_owned(),
                _ => return Rcode::REFUSED,
            };
            if !is_valid_challenge(&value) {
                return Rcode::REFUSED;
            }
            // only _acme-challenge names below an IP literal of this zone
            let owner = name_string(&record.owner().to_bytes());
            if owner.len() < zone.len() + 18
                || !equal_names(&owner[..16], "_acme-challenge.")
                || !equal_names(&owner[owner.len() - zone.len() - 1..], &format!(".{zone}"))
            {
                return Rcode::REFUSED;
            }
            let Some(ip) = parse_ip(&owner[..owner.len() - zone.len()]) else {
                return Rcode::REFUSED;
            };
            if !self.client_may_update(ctx, ip) {
                return Rcode::REFUSED;
            }
            to_process.push((record.class(), owner, value));
        }
        for (class, owner, value) in to_process {
            if !self.limiter.allow() {
                warn!("update rate limited for {}", ctx.remote);
                return Rcode::REFUSED;
            }
            let key = lower_name(&owner);
            match class {
                Class::IN => {
                    if let Err(err) =
                        self.challenge_store.add(&key, value.as_bytes(), CHALLENGE_TTL)
                    {
                        error!("failed to add client challenge: {err}");
                        return Rcode::REFUSED;
                    }
                }
                Class::NONE => {
                    // idempotent: deleting a value that was never added is
                    // not an error
                    self.challenge_store.remove(&key, value.as_bytes());
                }
                _ => unreachable!(),
            }
        }
        Rcode::NOERROR
    }

    /// Anyone may publish challenges for addresses that are not globally
    /// reachable; everything else requires a TCP connection from exactly
    /// the address being updated.
    fn client_may_update(&self, ctx: &QueryCtx, ip: IpAddr) -> bool {
        let exempt = match ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || is_cgnat(v4)
            }
            IpAddr::V6(v6) => v6.is_loopback() || is_ula(v6),
        };
        if exempt {
            return true;
        }
        if ctx.proto == Proto::Udp {
            return false;
        }
        canonical_ip(ctx.remote.ip()) == canonical_ip(ip)
    }
}

// 100.64.0.0/10, also used by tailscale and friends
fn is_cgnat(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xc0) == 64
}

// fc00::/7
fn is_ula(ip: Ipv6Addr) -> bool {
    (ip.octets()[0] & 0xfe) == 0xfc
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn build_update_response(id: u16, rcode: Rcode, txn: Option<ServerTransaction<Arc<Key>>>) -> Vec<u8> {
    let mut builder = domain::base::MessageBuilder::new_vec();
    let header = builder.header_mut();
    header.set_id(id);
    header.set_qr(true);
    header.set_opcode(Opcode::UPDATE);
    header.set_rcode(rcode);
    let mut additional = builder.additional();
    if let Some(txn) = txn {
        if let Err(err) = txn.answer(&mut additional, Time48::now()) {
            error!("failed to sign update response: {err}");
        }
    }
    additional.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_v4() {
        assert_eq!(parse_ip("1.2.3.4."), Some("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn dashed_v4() {
        assert_eq!(parse_ip("1-2-3-4."), Some("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn double_dash_v6() {
        assert_eq!(parse_ip("2001-db8--1."), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn full_v6_with_seven_dashes() {
        assert_eq!(
            parse_ip("2001-db8-0-0-0-0-0-1."),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn prefixed_literals_still_parse() {
        assert_eq!(
            parse_ip("_acme-challenge.1.2.3.4."),
            Some("1.2.3.4".parse().unwrap())
        );
        assert_eq!(
            parse_ip("foo.1-2-3-4."),
            Some("1.2.3.4".parse().unwrap())
        );
    }

    #[test]
    fn mixed_and_malformed_forms_are_rejected() {
        assert_eq!(parse_ip("1-2.3-4."), None);
        assert_eq!(parse_ip("1.2.3."), None);
        assert_eq!(parse_ip("1-2-3-4-5."), None);
        assert_eq!(parse_ip("1..2.3.4."), None);
        assert_eq!(parse_ip("."), None);
        assert_eq!(parse_ip(""), None);
        assert_eq!(parse_ip("2001-db8--1--2."), None);
        assert_eq!(parse_ip("300.1.2.3."), None);
    }

    #[test]
    fn case_insensitive_hex() {
        assert_eq!(
            parse_ip("2001-DB8--1."),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    use crate::names::parse_name;
    use domain::base::{Message, MessageBuilder};

    fn update_ctx(owner: &str, txt: &str, proto: Proto) -> QueryCtx {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(99);
        builder.header_mut().set_opcode(Opcode::UPDATE);
        let mut zone_section = builder.question();
        zone_section
            .push((parse_name("ip.example."), Rtype::SOA, Class::IN))
            .unwrap();
        let mut update_section = zone_section.answer().authority();
        update_section.push(&records::txt(owner, 0, txt)).unwrap();
        let wire = update_section.into_message().as_slice().to_vec();
        QueryCtx::new(
            Message::from_octets(wire).unwrap(),
            proto,
            "127.0.0.1:55353".parse().unwrap(),
            None,
        )
        .unwrap()
    }

    fn handler() -> UpdateHandler {
        UpdateHandler::new(
            "ip.example.",
            Arc::new(TtlStore::new()),
            RateLimiter::new(100, 100),
        )
    }

    #[test]
    fn update_adds_challenges_for_exempt_addresses() {
        let handler = handler();
        let ctx = update_ctx("_acme-challenge.127.0.0.1.ip.example.", "Abc-123", Proto::Udp);
        let wire = handler.handle(&ctx, "ip.example.");
        let resp = Message::from_octets(wire).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::NOERROR);
        assert_eq!(resp.header().id(), 99);
        assert!(resp.header().qr());
        assert_eq!(
            handler
                .challenge_store
                .values("_acme-challenge.127.0.0.1.ip.example."),
            vec![b"Abc-123".to_vec()]
        );
    }

    #[test]
    fn update_refuses_foreign_addresses() {
        let handler = handler();
        // the client does not hold 192.0.2.99
        let ctx = update_ctx("_acme-challenge.192.0.2.99.ip.example.", "Abc-123", Proto::Tcp);
        let wire = handler.handle(&ctx, "ip.example.");
        let resp = Message::from_octets(wire).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::REFUSED);
        assert_eq!(handler.challenge_store.size(), 0);
    }

    #[test]
    fn update_refuses_non_challenge_owners() {
        let handler = handler();
        let ctx = update_ctx("127.0.0.1.ip.example.", "Abc-123", Proto::Udp);
        let wire = handler.handle(&ctx, "ip.example.");
        let resp = Message::from_octets(wire).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::REFUSED);
    }

    #[test]
    fn update_delete_is_idempotent() {
        let handler = handler();
        let add = update_ctx("_acme-challenge.10.0.0.1.ip.example.", "tok-1", Proto::Udp);
        handler.handle(&add, "ip.example.");
        // deleting a value that was never present is not an error
        handler
            .challenge_store
            .remove("_acme-challenge.10.0.0.1.ip.example.", b"never-there");
        assert_eq!(handler.challenge_store.size(), 1);
    }

    #[test]
    fn cgnat_and_ula_ranges() {
        assert!(is_cgnat("100.64.0.1".parse().unwrap()));
        assert!(is_cgnat("100.127.255.254".parse().unwrap()));
        assert!(!is_cgnat("100.128.0.1".parse().unwrap()));
        assert!(is_ula("fd12:3456::1".parse().unwrap()));
        assert!(!is_ula("2001:db8::1".parse().unwrap()));
    }
}
