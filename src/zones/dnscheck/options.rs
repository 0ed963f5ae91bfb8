//! The subdomain option DSL.
//!
//! The rightmost label below the dnscheck zone is a dash-separated list of
//! tokens selecting the response behaviour, e.g.
//! `deadbeef-nosig-truncate.dnscheck.example.` A token that is not a known
//! keyword must be a 1-8 character hex watcher id; anything else, any
//! duplicate, and any violated exclusion makes the whole label invalid.

use domain::base::iana::Rcode;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Watcher id, lower-cased hex.
    pub random: String,
    pub compress: bool,
    pub truncate: bool,
    pub no_truncate: bool,

    pub rcode: Option<Rcode>,
    pub null_ip: bool,
    pub ipv4_only: bool,
    pub ipv6_only: bool,

    /// 1-4000 bytes of EDNS padding.
    pub padding: u16,
    /// 1-4000 characters of TXT filler.
    pub txt_fill: u16,

    pub no_sig: bool,
    pub bad_sig: bool,
    /// Seconds since the signature window closed; 1-99_999_999.
    pub expired_sig: u32,
}

impl Options {
    /// Parse a single label of dash-separated option tokens. Empty input is
    /// the apex: a valid, all-default parse.
    pub fn parse(label: &str) -> Option<Options> {
        let label = label.to_ascii_lowercase();
        let mut o = Options::default();
        if label.is_empty() {
            return Some(o);
        }
        for t in label.split('-') {
            match t {
                "compress" => {
                    if o.compress {
                        return None;
                    }
                    o.compress = true;
                }
                "truncate" => {
                    if o.truncate || o.no_truncate {
                        return None;
                    }
                    o.truncate = true;
                }
                "notruncate" => {
                    if o.truncate || o.no_truncate {
                        return None;
                    }
                    o.no_truncate = true;
                }
                "nxdomain" => {
                    if o.answer_shape_chosen() {
                        return None;
                    }
                    o.rcode = Some(Rcode::NXDOMAIN);
                }
                "refused" => {
                    if o.answer_shape_chosen() {
                        return None;
                    }
                    o.rcode = Some(Rcode::REFUSED);
                }
                "nullip" => {
                    if o.answer_shape_chosen() {
                        return None;
                    }
                    o.null_ip = true;
                }
                "ipv4" => {
                    if o.answer_shape_chosen() {
                        return None;
                    }
                    o.ipv4_only = true;
                }
                "ipv6" => {
                    if o.answer_shape_chosen() {
                        return None;
                    }
                    o.ipv6_only = true;
                }
                _ if t.len() > 7 && &t[..7] == "padding" => {
                    if o.padding != 0 || o.txt_fill != 0 {
                        return None;
                    }
                    o.padding = t[7..].parse().ok()?;
                    if !(1..=4000).contains(&o.padding) {
                        return None;
                    }
                }
                _ if t.len() > 7 && &t[..7] == "txtfill" => {
                    if o.padding != 0 || o.txt_fill != 0 {
                        return None;
                    }
                    o.txt_fill = t[7..].parse().ok()?;
                    if !(1..=4000).contains(&o.txt_fill) {
                        return None;
                    }
                }
                "nosig" => {
                    if o.sig_shape_chosen() {
                        return None;
                    }
                    o.no_sig = true;
                }
                "badsig" => {
                    if o.sig_shape_chosen() {
                        return None;
                    }
                    o.bad_sig = true;
                }
                _ if t.len() >= 10 && &t[..10] == "expiredsig" => {
                    if o.sig_shape_chosen() {
                        return None;
                    }
                    if t.len() > 10 {
                        o.expired_sig = t[10..].parse().ok()?;
                        if !(1..=99_999_999).contains(&o.expired_sig) {
                            return None;
                        }
                    } else {
                        o.expired_sig = 86400;
                    }
                }
                _ => {
                    // anything else must be the (single) watcher id
                    if !o.random.is_empty() {
                        return None;
                    }
                    if t.is_empty() || t.len() > 8 {
                        return None;
                    }
                    if !t.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)) {
                        return None;
                    }
                    o.random = t.to_owned();
                }
            }
        }
        Some(o)
    }

    fn answer_shape_chosen(&self) -> bool {
        self.rcode.is_some() || self.null_ip || self.ipv4_only || self.ipv6_only
    }

    fn sig_shape_chosen(&self) -> bool {
        self.no_sig || self.bad_sig || self.expired_sig != 0
    }
}

/// What a dnscheck name turned out to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameShape {
    Apex,
    AcmeChallenge,
    Options(Options),
}

/// Classify a question name below (or at) the dnscheck zone.
///
/// Returns `None` for names whose rightmost label fails the option parse.
pub fn parse_name(qname: &str, zone: &str) -> Option<NameShape> {
    if qname.len() == zone.len() {
        return Some(NameShape::Apex);
    }
    let end = qname.len().checked_sub(zone.len() + 1)?;
    if end < 1 || qname.as_bytes()[end] != b'.' {
        return None;
    }
    let sub = &qname[..end];
    if crate::names::equal_names(sub, "_acme-challenge") {
        return Some(NameShape::AcmeChallenge);
    }
    let label = match sub.rfind('.') {
        Some(i) if i == sub.len() - 1 => return None,
        Some(i) => &sub[i + 1..],
        None => sub,
    };
    Options::parse(label).map(NameShape::Options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_label_is_the_apex_parse() {
        assert_eq!(Options::parse(""), Some(Options::default()));
    }

    #[test]
    fn typical_combinations() {
        let o = Options::parse("deadbeef-nosig-compress").unwrap();
        assert_eq!(o.random, "deadbeef");
        assert!(o.no_sig);
        assert!(o.compress);

        let o = Options::parse("expiredsig").unwrap();
        assert_eq!(o.expired_sig, 86400);
        let o = Options::parse("expiredsig3600").unwrap();
        assert_eq!(o.expired_sig, 3600);
    }

    #[test]
    fn mutual_exclusions_yield_null() {
        assert_eq!(Options::parse("truncate-notruncate"), None);
        assert_eq!(Options::parse("nxdomain-refused"), None);
        assert_eq!(Options::parse("nxdomain-nullip"), None);
        assert_eq!(Options::parse("ipv4-ipv6"), None);
        assert_eq!(Options::parse("padding100-txtfill100"), None);
        assert_eq!(Options::parse("nosig-badsig"), None);
        assert_eq!(Options::parse("badsig-expiredsig"), None);
        assert_eq!(Options::parse("compress-compress"), None);
    }

    #[test]
    fn out_of_range_numbers_yield_null() {
        assert_eq!(Options::parse("padding4001"), None);
        assert_eq!(Options::parse("padding0"), None);
        assert_eq!(Options::parse("txtfill-1"), None);
        assert_eq!(Options::parse("txtfill0"), None);
        assert_eq!(Options::parse("expiredsig100000000"), None);
        assert_eq!(Options::parse("expiredsig0"), None);
    }

    #[test]
    fn random_ids_are_lowercased_hex_and_single() {
        let o = Options::parse("DEADbeef").unwrap();
        assert_eq!(o.random, "deadbeef");
        assert_eq!(Options::parse("abc-def"), None); // two ids
        assert_eq!(Options::parse("notahexid"), None);
        assert_eq!(Options::parse("123456789"), None); // too long
    }

    #[test]
    fn name_classification() {
        let zone = "dnscheck.example.";
        assert_eq!(parse_name("dnscheck.example.", zone), Some(NameShape::Apex));
        assert_eq!(
            parse_name("_acme-challenge.dnscheck.example.", zone),
            Some(NameShape::AcmeChallenge)
        );
        assert!(matches!(
            parse_name("foo.cafe.dnscheck.example.", zone),
            Some(NameShape::Options(o)) if o.random == "cafe"
        ));
        assert_eq!(parse_name("not-an-option.dnscheck.example.", zone), None);
    }
}
