//! Best-effort geo/org lookups for the dnscheck diagnostics.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IpInfo {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub org: String,
}

impl IpInfo {
    pub fn geo_string(&self) -> String {
        [&self.city, &self.region, &self.country]
            .into_iter()
            .filter(|part| !part.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct IpInfoClient {
    base_url: String,
    client: reqwest::Client,
}

impl IpInfoClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(1))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Look an address up, best effort. A miss or timeout is `Ok(None)`
    /// territory for callers; only transport errors surface.
    pub async fn lookup(&self, ip: IpAddr) -> Result<Option<IpInfo>, reqwest::Error> {
        // all addresses of the same /64 share their info
        let key = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => {
                let mut octets = v6.octets();
                octets[8..].fill(0);
                std::net::Ipv6Addr::from(octets).to_string()
            }
        };
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), key);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_string_skips_empty_parts() {
        let info = IpInfo {
            city: "Utrecht".into(),
            region: String::new(),
            country: "NL".into(),
            org: String::new(),
        };
        assert_eq!(info.geo_string(), "Utrecht, NL");
        assert_eq!(IpInfo::default().geo_string(), "");
    }
}
