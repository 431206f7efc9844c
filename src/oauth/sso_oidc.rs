//! AWS SSO OIDC client
//!
//! Dynamic client registration, device authorization, and token polling for
//! Builder ID flows.

use anyhow::{Result, bail};
use serde_json::json;

use super::types::{CreateTokenResponse, OidcErrorResponse, RegisterClientResponse, StartDeviceAuthResponse};

const BUILDER_ID_START_URL: &str = "https://view.awsapps.com/start";
const CLIENT_USER_AGENT: &str = "aws-sdk-rust/1.3.2 api/sso-oidc";

/// Result of one token poll
#[derive(Debug)]
pub enum CreateTokenResult {
    Success(CreateTokenResponse),
    Pending,
    SlowDown,
    Expired,
}

pub struct SsoOidcClient {
    client: reqwest::Client,
    region: String,
}

impl SsoOidcClient {
    pub fn new(client: reqwest::Client, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("https://oidc.{}.amazonaws.com", self.region)
    }

    pub fn builder_id_start_url() -> &'static str {
        BUILDER_ID_START_URL
    }

    /// Register a throwaway OIDC client for a device flow.
    pub async fn register_client(&self, client_name: &str) -> Result<RegisterClientResponse> {
        let url = format!("{}/client/register", self.endpoint());
        let payload = json!({
            "clientName": client_name,
            "clientType": "public",
            "scopes": [
                "codewhisperer:completions",
                "codewhisperer:analysis",
                "codewhisperer:conversations"
            ],
            "grantTypes": ["urn:ietf:params:oauth:grant-type:device_code", "refresh_token"]
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", CLIENT_USER_AGENT)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to register client (status {}): {}", status, body);
        }
        Ok(response.json().await?)
    }

    /// Start the device authorization flow.
    pub async fn start_device_authorization(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<StartDeviceAuthResponse> {
        let url = format!("{}/device_authorization", self.endpoint());
        let payload = json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "startUrl": BUILDER_ID_START_URL
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", CLIENT_USER_AGENT)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to start device authorization (status {}): {}", status, body);
        }
        Ok(response.json().await?)
    }

    /// Poll for a token after the user authorizes the device.
    pub async fn create_token(
        &self,
        client_id: &str,
        client_secret: &str,
        device_code: &str,
    ) -> Result<CreateTokenResult> {
        let url = format!("{}/token", self.endpoint());
        let payload = json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "deviceCode": device_code,
            "grantType": "urn:ietf:params:oauth:grant-type:device_code"
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", CLIENT_USER_AGENT)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<OidcErrorResponse>(&body) {
                return match err.error.as_str() {
                    "authorization_pending" => Ok(CreateTokenResult::Pending),
                    "slow_down" => Ok(CreateTokenResult::SlowDown),
                    "expired_token" => Ok(CreateTokenResult::Expired),
                    other => bail!("Token creation failed: {}", other),
                };
            }
            bail!("Token creation failed: {}", body);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to create token (status {}): {}", status, body);
        }

        Ok(CreateTokenResult::Success(response.json().await?))
    }
}
