//! On-the-fly DNSSEC signing.
//!
//! Each signed zone owns a [`Signer`]: the published KSK and ZSK, the
//! precomputed RRSIG over the DNSKEY RRset, and the ZSK private key used to
//! sign every other RRset at serve time. Denial of existence is proved with
//! a synthesized NSEC whose next-domain is an always-greater pseudo-label,
//! so no ordered zone walk is ever needed.
//!
//! The dnscheck zone additionally carries a "bad" signer: a complete second
//! keypair that publishes nothing and signs normally, but stamps its RRSIGs
//! with the genuine ZSK's key tag. Validators therefore fail with "RRSIG
//! does not validate" rather than "no matching DNSKEY".

use std::fmt;

use bytes::Bytes;
use domain::base::iana::{Class, Rcode, Rtype, SecurityAlgorithm as SecAlg};
use domain::base::name::Name;
use domain::base::rdata::ComposeRecordData;
use domain::base::wire::Compose;
use domain::base::ToName;
use domain::base::Ttl;
use domain::crypto::sign::{generate, GenerateParams, KeyPair, SecretKeyBytes, SignRaw};
use domain::dep::octseq::OctetsInto;
use domain::rdata::dnssec::{RtypeBitmap, Timestamp};
use domain::rdata::{Dnskey, Nsec, Rrsig, ZoneRecordData};

use crate::names::{label_count, lower_name, name_string, parse_name};
use crate::response::{Response, Rr};
use crate::util::unix_now;

/// The TTL carried by DNSKEY, NSEC and key-RRSIG records.
pub const KEY_RR_TTL: u32 = 300;

/// Types listed in a NODATA denial before the query-specific fixups.
const DEFAULT_NSEC_TYPES: &[Rtype] = &[
    Rtype::A,
    Rtype::NS,
    Rtype::SOA,
    Rtype::MX,
    Rtype::TXT,
    Rtype::AAAA,
    Rtype::RRSIG,
    Rtype::NSEC,
    Rtype::DNSKEY,
    Rtype::HTTPS,
];

//------------ SignerError ---------------------------------------------------

#[derive(Debug)]
pub enum SignerError {
    /// The configured key material could not be used.
    BadKey(String),
    /// The cryptographic backend refused to sign.
    Signing(String),
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerError::BadKey(err) => write!(f, "unusable key material: {err}"),
            SignerError::Signing(err) => write!(f, "signing failed: {err}"),
        }
    }
}

impl std::error::Error for SignerError {}

//------------ Signer --------------------------------------------------------

pub struct Signer {
    /// The zone apex, lower-cased, with trailing dot.
    zone: String,
    algorithm: SecAlg,
    ksk: Dnskey<Bytes>,
    zsk: Dnskey<Bytes>,
    zsk_tag: u16,
    key_pair: KeyPair,
    /// RRSIG over the DNSKEY RRset, made by the KSK at key-generation time.
    key_sig: Rrsig<Bytes, Name<Bytes>>,
    /// When set, emitted RRSIGs carry this key tag instead of the real one.
    key_tag_override: Option<u16>,
}

impl Signer {
    pub fn new(
        zone: &str,
        ksk: Dnskey<Bytes>,
        zsk: Dnskey<Bytes>,
        key_pair: KeyPair,
        key_sig: Rrsig<Bytes, Name<Bytes>>,
    ) -> Self {
        let algorithm = zsk.algorithm();
        let zsk_tag = zsk.key_tag();
        Self {
            zone: lower_name(zone).into_owned(),
            algorithm,
            ksk,
            zsk,
            zsk_tag,
            key_pair,
            key_sig,
            key_tag_override: None,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn zsk_tag(&self) -> u16 {
        self.zsk_tag
    }

    pub fn algorithm(&self) -> SecAlg {
        self.algorithm
    }

    pub fn ksk(&self) -> &Dnskey<Bytes> {
        &self.ksk
    }

    pub fn zsk(&self) -> &Dnskey<Bytes> {
        &self.zsk
    }

    pub fn key_sig(&self) -> &Rrsig<Bytes, Name<Bytes>> {
        &self.key_sig
    }

    /// Generate a complete twin signer for the same zone whose emitted
    /// RRSIGs lie about their key tag.
    pub fn generate_bad_twin(&self) -> Result<Signer, SignerError> {
        let generated = Generated::create(
            &self.zone,
            self.algorithm,
            KEY_RR_TTL,
            self.key_sig.inception().into_int(),
            self.key_sig.expiration().into_int(),
        )?;
        let mut bad = generated.signer;
        bad.key_tag_override = Some(self.zsk_tag);
        Ok(bad)
    }

    /// Answer a DNSKEY query at the zone apex.
    ///
    /// Returns true iff the question matched; the caller must then add no
    /// further answers. The key RRSIG is only included when DO is set, and
    /// it is the precomputed one, never a fresh signature.
    pub fn provide_keys(&self, resp: &mut Response) -> bool {
        let Some((qname, qtype, qclass)) = resp.question.clone() else {
            return false;
        };
        if qclass != Class::IN || qtype != Rtype::DNSKEY {
            return false;
        }
        let qname_str = name_string(&qname);
        if !crate::names::equal_names(&qname_str, &self.zone) {
            return false;
        }
        let ttl = Ttl::from_secs(KEY_RR_TTL);
        resp.answer.push(Rr::new(
            qname.clone(),
            Class::IN,
            ttl,
            ZoneRecordData::Dnskey(self.ksk.clone()),
        ));
        resp.answer.push(Rr::new(
            qname.clone(),
            Class::IN,
            ttl,
            ZoneRecordData::Dnskey(self.zsk.clone()),
        ));
        if resp.edns.as_ref().is_some_and(|e| e.dnssec_ok) {
            resp.answer.push(Rr::new(
                qname,
                Class::IN,
                ttl,
                ZoneRecordData::Rrsig(self.key_sig.clone()),
            ));
        }
        true
    }

    /// Sign the response in place.
    ///
    /// Positive answers get one RRSIG per answer rtype; empty answers get an
    /// NSEC denial in the authority section (rewriting NXDOMAIN to NOERROR)
    /// and the authority section is signed afterwards. `valid_from` and
    /// `valid_to` of zero select the default validity window.
    pub fn prove(
        &self,
        resp: &mut Response,
        valid_from: u32,
        valid_to: u32,
    ) -> Result<(), SignerError> {
        // only prove successful answers (including non-existence)
        if resp.rcode != Rcode::NOERROR && resp.rcode != Rcode::NXDOMAIN {
            return Ok(());
        }
        let Some((qname, qtype, qclass)) = resp.question.clone() else {
            return Ok(());
        };
        if qclass != Class::IN {
            return Ok(());
        }
        if resp.answer.iter().any(|rr| rr.rtype() == Rtype::RRSIG) {
            return Ok(());
        }
        if !resp.edns.as_ref().is_some_and(|e| e.dnssec_ok) {
            return Ok(());
        }
        if resp.answer.is_empty() {
            self.deny(resp, &qname, qtype);
        } else {
            let sigs = self.sign(&resp.answer, valid_from, valid_to)?;
            resp.answer.extend(sigs);
        }
        if !resp.authority.is_empty() {
            let sigs = self.sign(&resp.authority, valid_from, valid_to)?;
            resp.authority.extend(sigs);
        }
        Ok(())
    }

    /// Append an NSEC denial for the question to the authority section.
    fn deny(&self, resp: &mut Response, qname: &Name<Bytes>, qtype: Rtype) {
        let qname_str = name_string(qname);
        let types: Vec<Rtype> = if resp.rcode == Rcode::NXDOMAIN {
            // NSEC-aware denial without a separate NXDOMAIN cover
            resp.rcode = Rcode::NOERROR;
            vec![Rtype::RRSIG, Rtype::NSEC]
        } else {
            let is_apex = crate::names::equal_names(&qname_str, &self.zone);
            DEFAULT_NSEC_TYPES
                .iter()
                .copied()
                .filter(|&t| {
                    t != qtype
                        && (is_apex
                            || !matches!(t, Rtype::NS | Rtype::SOA | Rtype::DNSKEY))
                })
                .collect()
        };
        let mut bitmap = RtypeBitmap::<Vec<u8>>::builder();
        for t in types {
            bitmap.add(t).expect("vec-backed bitmap build");
        }
        // an always-greater pseudo-label below the queried name
        let lowered = lower_name(&qname_str);
        let mut next = vec![1u8, 0u8];
        next.extend_from_slice(parse_name(&lowered).as_slice());
        let next = Name::from_octets(Bytes::from(next)).expect("one label added to a valid name");
        resp.authority.push(Rr::new(
            qname.clone(),
            Class::IN,
            Ttl::from_secs(KEY_RR_TTL),
            ZoneRecordData::Nsec(Nsec::new(next, bitmap.finalize().octets_into())),
        ));
    }

    /// Produce one RRSIG per rtype present in `rrs`, in first-seen order.
    pub fn sign(
        &self,
        rrs: &[Rr],
        valid_from: u32,
        valid_to: u32,
    ) -> Result<Vec<Rr>, SignerError> {
        if rrs.is_empty() {
            return Ok(Vec::new());
        }
        let now = if valid_from == 0 || valid_to == 0 {
            unix_now()
        } else {
            0
        };
        let inception = if valid_from == 0 {
            now - 3600
        } else {
            valid_from
        };
        let mut groups: Vec<(Rtype, Vec<&Rr>)> = Vec::new();
        for rr in rrs {
            match groups.iter_mut().find(|(t, _)| *t == rr.rtype()) {
                Some((_, group)) => group.push(rr),
                None => groups.push((rr.rtype(), vec![rr])),
            }
        }
        let mut sigs = Vec::with_capacity(groups.len());
        for (rtype, group) in groups {
            let ttl = group[0].ttl();
            let expiration = if valid_to == 0 {
                now + 3600 + ttl.as_secs()
            } else {
                valid_to
            };
            sigs.push(self.sign_group(rtype, &group, ttl, inception, expiration)?);
        }
        Ok(sigs)
    }

    fn sign_group(
        &self,
        rtype: Rtype,
        group: &[&Rr],
        ttl: Ttl,
        inception: u32,
        expiration: u32,
    ) -> Result<Rr, SignerError> {
        let owner = group[0].owner().clone();
        let owner_str = name_string(&owner);
        let canonical_owner = parse_name(&lower_name(&owner_str));
        let labels = label_count(&owner_str);
        let signer_name = parse_name(&self.zone);

        // RFC 4034 section 3.1.8.1: the signed data is the RRSIG rdata
        // minus the signature, followed by the RRset in canonical form and
        // order.
        let mut data = Vec::new();
        rtype.compose(&mut data).expect("vec target");
        self.algorithm.compose(&mut data).expect("vec target");
        labels.compose(&mut data).expect("vec target");
        ttl.as_secs().compose(&mut data).expect("vec target");
        expiration.compose(&mut data).expect("vec target");
        inception.compose(&mut data).expect("vec target");
        self.zsk_tag.compose(&mut data).expect("vec target");
        signer_name.compose_canonical(&mut data).expect("vec target");

        let mut rdatas: Vec<Vec<u8>> = group
            .iter()
            .map(|rr| {
                let mut buf = Vec::new();
                rr.data().compose_canonical_rdata(&mut buf).expect("vec target");
                buf
            })
            .collect();
        rdatas.sort();
        for rdata in &rdatas {
            canonical_owner
                .compose_canonical(&mut data)
                .expect("vec target");
            rtype.compose(&mut data).expect("vec target");
            Class::IN.compose(&mut data).expect("vec target");
            ttl.as_secs().compose(&mut data).expect("vec target");
            (rdata.len() as u16).compose(&mut data).expect("vec target");
            data.extend_from_slice(rdata);
        }

        let signature = self
            .key_pair
            .sign_raw(&data)
            .map_err(|err| SignerError::Signing(err.to_string()))?;
        let emitted_tag = self.key_tag_override.unwrap_or(self.zsk_tag);
        let rrsig = Rrsig::new(
            rtype,
            self.algorithm,
            labels,
            ttl,
            Timestamp::from(expiration),
            Timestamp::from(inception),
            emitted_tag,
            signer_name,
            Bytes::copy_from_slice(signature.as_ref()),
        )
        .map_err(|err| SignerError::Signing(format!("oversized signature: {err}")))?;
        Ok(Rr::new(owner, Class::IN, ttl, ZoneRecordData::Rrsig(rrsig)))
    }
}

//------------ Key generation ------------------------------------------------

/// A freshly generated signer plus the material the operator needs to keep.
pub struct Generated {
    pub signer: Signer,
    /// The ZSK private key in BIND format.
    pub zsk_secret: String,
    /// DS digest over the KSK (hex) and its digest algorithm number.
    pub ds_digest: String,
    pub ds_digest_type: u8,
}

impl Generated {
    /// Generate a KSK and ZSK for `zone` and sign the DNSKEY RRset.
    pub fn create(
        zone: &str,
        algorithm: SecAlg,
        rr_ttl: u32,
        valid_from: u32,
        valid_to: u32,
    ) -> Result<Generated, SignerError> {
        let params = generate_params(algorithm)?;
        let (ksk_secret, ksk_dnskey) = generate(params, 257)
            .map_err(|err| SignerError::BadKey(err.to_string()))?;
        let params = generate_params(algorithm)?;
        let (zsk_secret, zsk_dnskey) = generate(params, 256)
            .map_err(|err| SignerError::BadKey(err.to_string()))?;

        let ksk: Dnskey<Bytes> = ksk_dnskey.convert();
        let zsk: Dnskey<Bytes> = zsk_dnskey.convert();
        let ksk_pair = KeyPair::from_bytes(&ksk_secret, &ksk)
            .map_err(|err| SignerError::BadKey(err.to_string()))?;
        let zsk_pair = KeyPair::from_bytes(&zsk_secret, &zsk)
            .map_err(|err| SignerError::BadKey(err.to_string()))?;

        let zone = lower_name(zone).into_owned();

        // sign the DNSKEY RRset with the KSK
        let key_sig = {
            let interim = Signer {
                zone: zone.clone(),
                algorithm,
                ksk: ksk.clone(),
                zsk: zsk.clone(),
                zsk_tag: ksk.key_tag(),
                key_pair: ksk_pair,
                key_sig: placeholder_rrsig(&zone, algorithm),
                key_tag_override: None,
            };
            let ttl = Ttl::from_secs(rr_ttl);
            let keys = [
                Rr::new(
                    parse_name(&zone),
                    Class::IN,
                    ttl,
                    ZoneRecordData::Dnskey(ksk.clone()),
                ),
                Rr::new(
                    parse_name(&zone),
                    Class::IN,
                    ttl,
                    ZoneRecordData::Dnskey(zsk.clone()),
                ),
            ];
            let refs: Vec<&Rr> = keys.iter().collect();
            let sig = interim.sign_group(Rtype::DNSKEY, &refs, ttl, valid_from, valid_to)?;
            match sig.into_data() {
                ZoneRecordData::Rrsig(rrsig) => rrsig,
                _ => unreachable!(),
            }
        };

        let (ds_digest, ds_digest_type) = ds_digest(&zone, &ksk, algorithm);

        let zsk_secret_bind = zsk_secret.display_as_bind().to_string();
        let signer = Signer::new(&zone, ksk, zsk, zsk_pair, key_sig);
        Ok(Generated {
            signer,
            zsk_secret: zsk_secret_bind,
            ds_digest,
            ds_digest_type,
        })
    }
}

/// Restore a signer from configured key material.
pub fn signer_from_parts(
    zone: &str,
    ksk: Dnskey<Bytes>,
    zsk: Dnskey<Bytes>,
    zsk_private_bind: &str,
    key_sig_inception: u32,
    key_sig_expiration: u32,
    key_sig_signature: Bytes,
) -> Result<Signer, SignerError> {
    let secret = SecretKeyBytes::parse_from_bind(zsk_private_bind)
        .map_err(|err| SignerError::BadKey(err.to_string()))?;
    let key_pair = KeyPair::from_bytes(&secret, &zsk)
        .map_err(|err| SignerError::BadKey(err.to_string()))?;
    let zone = lower_name(zone).into_owned();
    let key_sig = Rrsig::new(
        Rtype::DNSKEY,
        zsk.algorithm(),
        label_count(&zone),
        Ttl::from_secs(KEY_RR_TTL),
        Timestamp::from(key_sig_expiration),
        Timestamp::from(key_sig_inception),
        ksk.key_tag(),
        parse_name(&zone),
        key_sig_signature,
    )
    .map_err(|err| SignerError::BadKey(format!("oversized key signature: {err}")))?;
    Ok(Signer::new(&zone, ksk, zsk, key_pair, key_sig))
}

pub fn generate_params(algorithm: SecAlg) -> Result<GenerateParams, SignerError> {
    match algorithm {
        SecAlg::ECDSAP256SHA256 => Ok(GenerateParams::EcdsaP256Sha256),
        SecAlg::ECDSAP384SHA384 => Ok(GenerateParams::EcdsaP384Sha384),
        SecAlg::ED25519 => Ok(GenerateParams::Ed25519),
        other => Err(SignerError::BadKey(format!(
            "unsupported algorithm: {other}"
        ))),
    }
}

fn placeholder_rrsig(zone: &str, algorithm: SecAlg) -> Rrsig<Bytes, Name<Bytes>> {
    Rrsig::new(
        Rtype::DNSKEY,
        algorithm,
        label_count(zone),
        Ttl::from_secs(KEY_RR_TTL),
        Timestamp::from(0),
        Timestamp::from(0),
        0,
        parse_name(zone),
        Bytes::new(),
    )
    .expect("empty signature fits")
}

/// The DS digest (hex) of a KSK and the digest algorithm number to publish
/// with it: SHA-256 for P-256 and Ed25519, SHA-384 for P-384.
pub fn ds_digest(zone: &str, ksk: &Dnskey<Bytes>, algorithm: SecAlg) -> (String, u8) {
    use sha2::Digest;

    let mut data = Vec::new();
    parse_name(&lower_name(zone))
        .compose_canonical(&mut data)
        .expect("vec target");
    ksk.compose_canonical_rdata(&mut data).expect("vec target");
    match algorithm {
        SecAlg::ECDSAP384SHA384 => (hex::encode(sha2::Sha384::digest(&data)), 4),
        _ => (hex::encode(sha2::Sha256::digest(&data)), 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::records;
    use domain::base::iana::Opcode;
    use domain::base::Message;

    fn test_signer() -> Signer {
        Generated::create("signed.test.", SecAlg::ECDSAP256SHA256, 300, 0, u32::MAX)
            .unwrap()
            .signer
    }

    fn reply_with_do(qname: &str, qtype: Rtype) -> Response {
        let mut resp = Response::reply(
            1,
            Opcode::QUERY,
            false,
            (parse_name(qname), qtype, Class::IN),
        );
        resp.edns = Some(crate::response::RespEdns::new(1400, true));
        resp
    }

    #[test]
    fn positive_answers_get_one_rrsig_per_type() {
        let signer = test_signer();
        let mut resp = reply_with_do("a.signed.test.", Rtype::A);
        resp.answer
            .push(records::a("a.signed.test.", 300, "192.0.2.1".parse().unwrap()));
        resp.answer
            .push(records::a("a.signed.test.", 300, "192.0.2.2".parse().unwrap()));
        resp.answer
            .push(records::txt("a.signed.test.", 1, "hello"));
        signer.prove(&mut resp, 0, 0).unwrap();
        let sigs: Vec<_> = resp
            .answer
            .iter()
            .filter(|rr| rr.rtype() == Rtype::RRSIG)
            .collect();
        assert_eq!(sigs.len(), 2);
    }

    #[test]
    fn prove_without_do_is_a_no_op() {
        let signer = test_signer();
        let mut resp = reply_with_do("a.signed.test.", Rtype::A);
        resp.edns.as_mut().unwrap().dnssec_ok = false;
        resp.answer
            .push(records::a("a.signed.test.", 300, "192.0.2.1".parse().unwrap()));
        signer.prove(&mut resp, 0, 0).unwrap();
        assert_eq!(resp.answer.len(), 1);
    }

    #[test]
    fn nxdomain_denial_rewrites_rcode_and_adds_nsec() {
        let signer = test_signer();
        let mut resp = reply_with_do("missing.signed.test.", Rtype::A);
        resp.rcode = Rcode::NXDOMAIN;
        resp.authority.push(records::soa(
            "signed.test.",
            300,
            "ns1.test.",
            "hostmaster.signed.test.",
            1,
            9000,
            9000,
            18000,
            300,
        ));
        signer.prove(&mut resp, 0, 0).unwrap();
        assert_eq!(resp.rcode, Rcode::NOERROR);
        assert!(resp.authority.iter().any(|rr| rr.rtype() == Rtype::NSEC));
        // SOA and NSEC groups each signed
        let sigs = resp
            .authority
            .iter()
            .filter(|rr| rr.rtype() == Rtype::RRSIG)
            .count();
        assert_eq!(sigs, 2);
    }

    #[test]
    fn nsec_next_domain_sorts_after_qname() {
        let signer = test_signer();
        let mut resp = reply_with_do("gone.signed.test.", Rtype::TXT);
        resp.rcode = Rcode::NXDOMAIN;
        signer.prove(&mut resp, 0, 0).unwrap();
        let nsec = resp
            .authority
            .iter()
            .find(|rr| rr.rtype() == Rtype::NSEC)
            .unwrap();
        let ZoneRecordData::Nsec(data) = nsec.data() else {
            panic!("not an nsec");
        };
        assert!(name_string(data.next_name()).ends_with("gone.signed.test."));
    }

    #[test]
    fn nodata_bitmap_excludes_qtype_and_apex_types() {
        let signer = test_signer();
        // NODATA off the apex: base set minus TXT, NS, SOA and DNSKEY
        let mut resp = reply_with_do("sub.signed.test.", Rtype::TXT);
        signer.prove(&mut resp, 0, 0).unwrap();
        let nsec = resp
            .authority
            .iter()
            .find(|rr| rr.rtype() == Rtype::NSEC)
            .unwrap();
        let ZoneRecordData::Nsec(data) = nsec.data() else {
            panic!("not an nsec");
        };
        for present in [Rtype::A, Rtype::AAAA, Rtype::MX, Rtype::RRSIG, Rtype::NSEC] {
            assert!(data.types().contains(present), "{present} missing");
        }
        for absent in [Rtype::TXT, Rtype::NS, Rtype::SOA, Rtype::DNSKEY] {
            assert!(!data.types().contains(absent), "{absent} present");
        }

        // NXDOMAIN denial carries only RRSIG and NSEC
        let mut resp = reply_with_do("gone.signed.test.", Rtype::A);
        resp.rcode = Rcode::NXDOMAIN;
        signer.prove(&mut resp, 0, 0).unwrap();
        let nsec = resp
            .authority
            .iter()
            .find(|rr| rr.rtype() == Rtype::NSEC)
            .unwrap();
        let ZoneRecordData::Nsec(data) = nsec.data() else {
            panic!("not an nsec");
        };
        assert!(data.types().contains(Rtype::RRSIG));
        assert!(data.types().contains(Rtype::NSEC));
        assert!(!data.types().contains(Rtype::A));
    }

    #[test]
    fn provide_keys_matches_apex_dnskey_only() {
        let signer = test_signer();
        let mut resp = reply_with_do("signed.test.", Rtype::DNSKEY);
        assert!(signer.provide_keys(&mut resp));
        // KSK, ZSK and the precomputed key signature
        assert_eq!(resp.answer.len(), 3);
        assert_eq!(
            resp.answer
                .iter()
                .filter(|rr| rr.rtype() == Rtype::DNSKEY)
                .count(),
            2
        );

        let mut other = reply_with_do("sub.signed.test.", Rtype::DNSKEY);
        assert!(!signer.provide_keys(&mut other));
        let mut a = reply_with_do("signed.test.", Rtype::A);
        assert!(!signer.provide_keys(&mut a));
    }

    #[test]
    fn bad_twin_reuses_the_genuine_key_tag() {
        let signer = test_signer();
        let bad = signer.generate_bad_twin().unwrap();
        let mut resp = reply_with_do("x.signed.test.", Rtype::A);
        resp.answer
            .push(records::a("x.signed.test.", 300, "192.0.2.1".parse().unwrap()));
        bad.prove(&mut resp, 0, 0).unwrap();
        let sig = resp
            .answer
            .iter()
            .find(|rr| rr.rtype() == Rtype::RRSIG)
            .unwrap();
        let ZoneRecordData::Rrsig(rrsig) = sig.data() else {
            panic!("not an rrsig");
        };
        assert_eq!(rrsig.key_tag(), signer.zsk_tag());
        assert_ne!(bad.zsk_tag(), signer.zsk_tag());
    }

    #[test]
    fn signed_response_still_encodes() {
        let signer = test_signer();
        let mut resp = reply_with_do("a.signed.test.", Rtype::A);
        resp.answer
            .push(records::a("a.signed.test.", 300, "192.0.2.1".parse().unwrap()));
        signer.prove(&mut resp, 0, 0).unwrap();
        let wire = resp.to_wire(None, false);
        let msg = Message::from_octets(wire).unwrap();
        assert_eq!(msg.header_counts().ancount(), 2);
    }
}
