//! Cloudflare Turnstile verification for myaddr registrations.

use std::time::Duration;

use serde::Deserialize;

const VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

pub struct Turnstile {
    secret: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
}

impl Turnstile {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<bool, reqwest::Error> {
        let resp: VerifyResponse = self
            .client
            .post(VERIFY_URL)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.success)
    }
}
