//! The CNAME reflector zone.
//!
//! Any name below the zone answers with a CNAME whose target is the prefix
//! itself: `<hostname>.<zone> CNAME <hostname>`. Useful for bouncing a
//! resolver at an arbitrary name without hosting it.

use crate::response::{records, Rr};
use crate::zones::{Addrs, Question};
use domain::base::iana::Rtype;

pub struct Generator {
    pub addrs: Addrs,
}

impl Generator {
    pub fn generate(&self, q: &Question<'_>, zone: &str) -> (Vec<Rr>, bool) {
        let mut rrs = Vec::new();
        if q.name.len() < zone.len() {
            return (rrs, false);
        }
        let sub = &q.name[..q.name.len() - zone.len()];
        if sub.is_empty() {
            match q.qtype {
                Rtype::A => {
                    rrs.extend(self.addrs.v4.iter().map(|&ip| records::a(q.name, 300, ip)));
                }
                Rtype::AAAA => {
                    rrs.extend(self.addrs.v6.iter().map(|&ip| records::aaaa(q.name, 300, ip)));
                }
                _ => {}
            }
            return (rrs, true);
        }
        rrs.push(records::cname(q.name, 300, sub));
        (rrs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::name_string;
    use domain::rdata::ZoneRecordData;

    fn generator() -> Generator {
        Generator {
            addrs: Addrs::default(),
        }
    }

    #[test]
    fn reflects_the_prefix() {
        let (rrs, valid) = generator().generate(
            &Question {
                name: "www.corp.net.cname.example.",
                qtype: Rtype::A,
            },
            "cname.example.",
        );
        assert!(valid);
        assert_eq!(rrs.len(), 1);
        let ZoneRecordData::Cname(cname) = rrs[0].data() else {
            panic!("not a cname");
        };
        assert_eq!(name_string(cname.cname()), "www.corp.net.");
    }

    #[test]
    fn apex_is_valid_but_empty_without_addresses() {
        let (rrs, valid) = generator().generate(
            &Question {
                name: "cname.example.",
                qtype: Rtype::A,
            },
            "cname.example.",
        );
        assert!(valid);
        assert!(rrs.is_empty());
    }
}
