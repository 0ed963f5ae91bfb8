//! JSON configuration.
//!
//! Loaded once at boot; there is no reloading. Key material arrives as the
//! zone-file presentation the keygen helper printed, plus the base64-wrapped
//! private key.

use std::fmt;
use std::net::IpAddr;

use base64::Engine as _;
use bytes::Bytes;
use camino::Utf8PathBuf;
use domain::base::name::FlattenInto;
use domain::dnssec::common::parse_from_bind;
use domain::zonefile::inplace::{Entry, Zonefile};
use serde::Deserialize;

use crate::dnssec::{signer_from_parts, Signer, SignerError};
use crate::names::lower_name;
use crate::response::Rr;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Zone(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read configuration: {err}"),
            ConfigError::Json(err) => write!(f, "cannot parse configuration: {err}"),
            ConfigError::Zone(err) => write!(f, "bad zone configuration: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "HTTPSocketPath")]
    pub http_socket_path: Option<Utf8PathBuf>,
    #[serde(rename = "RequestLogPath")]
    pub request_log_path: Option<Utf8PathBuf>,
    #[serde(rename = "DatabasePath")]
    pub database_path: Option<Utf8PathBuf>,
    #[serde(rename = "TLSCertPath")]
    pub tls_cert_path: Option<Utf8PathBuf>,
    #[serde(rename = "TLSKeyPath")]
    pub tls_key_path: Option<Utf8PathBuf>,
    #[serde(rename = "ResponseAddrs", default)]
    pub response_addrs: Vec<IpAddr>,
    #[serde(rename = "InternalChallengeTarget")]
    pub internal_challenge_target: Option<String>,
    #[serde(rename = "LookupUpstream")]
    pub lookup_upstream: Option<String>,
    #[serde(rename = "IPInfoBaseURL")]
    pub ipinfo_base_url: Option<String>,
    #[serde(rename = "MyaddrTurnstileSecret")]
    pub myaddr_turnstile_secret: Option<String>,
    #[serde(rename = "LogLevel")]
    pub log_level: Option<String>,
    #[serde(rename = "DnscheckZones", default)]
    pub dnscheck_zones: Vec<ZoneConfig>,
    #[serde(rename = "CnameZones", default)]
    pub cname_zones: Vec<ZoneConfig>,
    #[serde(rename = "ChallengesZone")]
    pub challenges_zone: Option<ZoneConfig>,
    #[serde(rename = "DynZone")]
    pub dyn_zone: Option<ZoneConfig>,
    #[serde(rename = "IPZone")]
    pub ip_zone: Option<ZoneConfig>,
    #[serde(rename = "MyaddrZones", default)]
    pub myaddr_zones: Vec<ZoneConfig>,
}

impl Config {
    pub fn load(path: &Utf8PathBuf) -> Result<Config, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneConfig {
    #[serde(rename = "Zone")]
    pub zone: String,
    #[serde(rename = "Ns", default)]
    pub ns: Vec<String>,
    #[serde(rename = "HostMasterMbox")]
    pub hostmaster: Option<String>,
    #[serde(rename = "StaticRecords", default)]
    pub static_records: Vec<String>,
    #[serde(rename = "PrivateKey")]
    pub private_key: Option<String>,
    #[serde(rename = "Dnssec")]
    pub dnssec: Option<DnssecConfig>,
}

#[derive(Debug, Deserialize)]
pub struct DnssecConfig {
    /// Zone-file presentation of the KSK DNSKEY record.
    #[serde(rename = "Ksk")]
    pub ksk: String,
    /// Zone-file presentation of the ZSK DNSKEY record.
    #[serde(rename = "Zsk")]
    pub zsk: String,
    #[serde(rename = "KeySig")]
    pub key_sig: KeySigConfig,
}

#[derive(Debug, Deserialize)]
pub struct KeySigConfig {
    #[serde(rename = "Inception")]
    pub inception: u32,
    #[serde(rename = "Expiration")]
    pub expiration: u32,
    /// Base64 signature bytes of the precomputed DNSKEY RRSIG.
    #[serde(rename = "Signature")]
    pub signature: String,
}

impl ZoneConfig {
    /// The zone name in canonical form: lower-case, trailing dot.
    pub fn canonical_zone(&self) -> String {
        canonical_name(&self.zone)
    }

    /// The nameserver list, each in canonical form.
    pub fn canonical_ns(&self) -> Vec<String> {
        self.ns.iter().map(|ns| canonical_name(ns)).collect()
    }

    pub fn canonical_hostmaster(&self) -> Option<String> {
        self.hostmaster.as_deref().map(canonical_name)
    }

    /// Build the zone signer from the configured material, if any.
    pub fn signer(&self) -> Result<Option<Signer>, ConfigError> {
        let zone = self.canonical_zone();
        let (Some(dnssec), Some(private_key)) = (&self.dnssec, &self.private_key) else {
            return Ok(None);
        };
        let decode = |what: &str, data: &str| {
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|err| ConfigError::Zone(format!("{zone}: bad {what}: {err}")))
        };
        let private_bind = String::from_utf8(decode("private key", private_key)?)
            .map_err(|err| ConfigError::Zone(format!("{zone}: bad private key: {err}")))?;
        let signature = Bytes::from(decode("key signature", &dnssec.key_sig.signature)?);
        let ksk = parse_dnskey(&zone, "KSK", &dnssec.ksk)?;
        let zsk = parse_dnskey(&zone, "ZSK", &dnssec.zsk)?;
        signer_from_parts(
            &zone,
            ksk,
            zsk,
            &private_bind,
            dnssec.key_sig.inception,
            dnssec.key_sig.expiration,
            signature,
        )
        .map(Some)
        .map_err(|err: SignerError| ConfigError::Zone(format!("{zone}: {err}")))
    }

    /// Parse the configured static records (zone-file presentation).
    pub fn parsed_static_records(&self) -> Result<Vec<Rr>, ConfigError> {
        let mut records = Vec::new();
        for line in &self.static_records {
            let mut zonefile = Zonefile::new();
            zonefile.extend_from_slice(line.as_bytes());
            zonefile.extend_from_slice(b"\n");
            match zonefile.next_entry() {
                Ok(Some(Entry::Record(record))) => records.push(record.flatten_into()),
                other => {
                    return Err(ConfigError::Zone(format!(
                        "{}: bad static record '{line}': {other:?}",
                        self.zone
                    )));
                }
            }
        }
        Ok(records)
    }
}

fn parse_dnskey(
    zone: &str,
    what: &str,
    presentation: &str,
) -> Result<domain::rdata::Dnskey<Bytes>, ConfigError> {
    let record = parse_from_bind(presentation)
        .map_err(|err| ConfigError::Zone(format!("{zone}: bad {what}: {err}")))?;
    Ok(record.data().clone())
}

fn canonical_name(name: &str) -> String {
    let mut name = lower_name(name).into_owned();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = serde_json::from_str(
            r#"{
                "ResponseAddrs": ["192.0.2.1", "2001:db8::1"],
                "ChallengesZone": {
                    "Zone": "C.Example",
                    "Ns": ["ns1.example"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.response_addrs.len(), 2);
        let zone = config.challenges_zone.unwrap();
        assert_eq!(zone.canonical_zone(), "c.example.");
        assert_eq!(zone.canonical_ns(), vec!["ns1.example."]);
        assert!(zone.signer().unwrap().is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"Bogus": 1}"#).is_err());
    }

    #[test]
    fn static_records_parse_from_presentation() {
        let zone = ZoneConfig {
            zone: "s.example.".into(),
            ns: vec![],
            hostmaster: None,
            static_records: vec!["fixed.s.example. 300 IN A 192.0.2.9".into()],
            private_key: None,
            dnssec: None,
        };
        let records = zone.parsed_static_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtype(), domain::base::iana::Rtype::A);
    }
}
