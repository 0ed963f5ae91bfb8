//! Domain name and character-string utilities.
//!
//! Owner names are handled as presentation strings with a trailing dot
//! throughout the zone logic; this keeps the suffix arithmetic the zone
//! generators live on cheap and obvious. Comparison is ASCII-only and
//! case-insensitive, as DNS requires.

use std::borrow::Cow;

use bytes::Bytes;
use domain::base::name::Name;

use crate::response::Rr;

/// The longest character-string a TXT record may carry.
pub const MAX_TXT_STRING: usize = 255;

/// Fast, ASCII-only, case-insensitive equality check.
pub fn equal_names(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(ac, bc)| ac.eq_ignore_ascii_case(&bc))
}

/// Lower-case a name, borrowing when it already is.
pub fn lower_name(s: &str) -> Cow<'_, str> {
    if s.bytes().any(|c| c.is_ascii_uppercase()) {
        Cow::Owned(s.to_ascii_lowercase())
    } else {
        Cow::Borrowed(s)
    }
}

/// Number of labels in a presentation name with trailing dot.
pub fn label_count(s: &str) -> u8 {
    if s == "." {
        return 0;
    }
    s.bytes().filter(|&c| c == b'.').count() as u8
}

/// The canonical presentation form of a name: trailing dot, original case.
pub fn name_string(name: &Name<Bytes>) -> String {
    let mut s = name.to_string();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

/// Parse a presentation name that is known to round-trip (it came off the
/// wire or out of configuration validation). Falls back to the root name
/// rather than panicking on a serving path.
pub fn parse_name(s: &str) -> Name<Bytes> {
    core::str::FromStr::from_str(s).unwrap_or_else(|_| Name::root())
}

/// Make owner names of generated records match the case of the question.
///
/// Records are stored lower-cased; a record is copied only when the
/// question actually differs in case, preserving the cheap path where
/// everything already matches.
pub fn fix_names(rrs: &mut [Rr], qname: &str) {
    for rr in rrs.iter_mut() {
        let rname = name_string(rr.owner());
        let mut target = qname;
        if rname.len() < qname.len() {
            // the record sits at a suffix of the question (e.g. zone SOA)
            if qname.as_bytes()[qname.len() - rname.len() - 1] != b'.' {
                continue;
            }
            target = &qname[qname.len() - rname.len()..];
        } else if rname.len() > qname.len() {
            continue;
        }
        if rname == target || !equal_names(&rname, target) {
            continue;
        }
        *rr = Rr::new(parse_name(target), rr.class(), rr.ttl(), rr.data().clone());
    }
}

/// Split a string into chunks suitable for TXT character-strings.
pub fn split_txt(s: &str) -> Vec<&str> {
    if s.len() <= MAX_TXT_STRING {
        return vec![s];
    }
    let mut strs = Vec::with_capacity(s.len() / MAX_TXT_STRING + 1);
    let mut rest = s;
    while rest.len() > MAX_TXT_STRING {
        let (head, tail) = rest.split_at(MAX_TXT_STRING);
        strs.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        strs.push(rest);
    }
    strs
}

/// Replace non-ASCII characters with ASCII approximations where possible and
/// drop everything that is not printable ASCII afterwards.
pub fn to_printable_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if (' '..='~').contains(&c) {
            out.push(c);
        } else if let Some(base) = decompose_ascii(c) {
            // accented Latin letters keep their base character
            out.push(base);
        }
    }
    out
}

// Minimal NFD-style decomposition for Latin-1 letters; everything else is
// dropped by the printable filter.
fn decompose_ascii(c: char) -> Option<char> {
    let mapped = match c {
        'À'..='Å' => 'A',
        'Ç' => 'C',
        'È'..='Ë' => 'E',
        'Ì'..='Ï' => 'I',
        'Ñ' => 'N',
        'Ò'..='Ö' => 'O',
        'Ù'..='Ü' => 'U',
        'Ý' => 'Y',
        'à'..='å' => 'a',
        'ç' => 'c',
        'è'..='ë' => 'e',
        'ì'..='ï' => 'i',
        'ñ' => 'n',
        'ò'..='ö' => 'o',
        'ù'..='ü' => 'u',
        'ý' | 'ÿ' => 'y',
        _ => return None,
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::records;
    use domain::base::iana::Rtype;

    #[test]
    fn equality_ignores_ascii_case() {
        assert!(equal_names("Example.COM.", "example.com."));
        assert!(!equal_names("example.com.", "example.org."));
        assert!(!equal_names("example.com.", "example.com"));
    }

    #[test]
    fn lowering_borrows_when_already_lower() {
        assert!(matches!(lower_name("already.lower."), Cow::Borrowed(_)));
        assert_eq!(lower_name("MiXeD.Case."), "mixed.case.");
    }

    #[test]
    fn txt_splitting() {
        assert_eq!(split_txt("short"), vec!["short"]);
        let long = "0".repeat(600);
        let parts = split_txt(&long);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![255, 255, 90]
        );
    }

    #[test]
    fn printable_ascii_transliteration() {
        assert_eq!(to_printable_ascii("São Paulo"), "Sao Paulo");
        assert_eq!(to_printable_ascii("plain"), "plain");
        assert_eq!(to_printable_ascii("смол"), "");
    }

    #[test]
    fn fix_names_repairs_case_of_exact_matches() {
        let mut rrs = vec![records::a("stored.example.", 300, "1.2.3.4".parse().unwrap())];
        fix_names(&mut rrs, "STORED.example.");
        assert_eq!(name_string(rrs[0].owner()), "STORED.example.");
    }

    #[test]
    fn fix_names_repairs_zone_suffix_records() {
        // an SOA owned by the zone under a longer question
        let mut rrs = vec![records::ns("zone.example.", 300, "ns1.example.")];
        fix_names(&mut rrs, "sub.ZONE.example.");
        assert_eq!(name_string(rrs[0].owner()), "ZONE.example.");
        assert_eq!(rrs[0].rtype(), Rtype::NS);
    }

    #[test]
    fn fix_names_leaves_matching_case_alone() {
        let mut rrs = vec![records::a("same.example.", 300, "1.2.3.4".parse().unwrap())];
        fix_names(&mut rrs, "same.example.");
        assert_eq!(name_string(rrs[0].owner()), "same.example.");
    }
}
