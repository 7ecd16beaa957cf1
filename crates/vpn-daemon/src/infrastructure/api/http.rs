//! `reqwest`-based implementation of [`AccountApi`].
//!
//! # Endpoints
//!
//! | Call | Request |
//! |---|---|
//! | token exchange | `POST /auth/v1/token` `{"account_number"}` |
//! | create account | `POST /accounts/v1/accounts` |
//! | account data | `GET /accounts/v1/accounts/me` |
//! | list devices | `GET /accounts/v1/devices` |
//! | get device | `GET /accounts/v1/devices/{id}` |
//! | create device | `POST /accounts/v1/devices` `{"pubkey", "hijack_dns"}` |
//! | delete device | `DELETE /accounts/v1/devices/{id}` |
//! | rotate key | `PUT /accounts/v1/devices/{id}/pubkey` `{"pubkey"}` |
//! | voucher | `POST /app/v1/submit-voucher` `{"voucher_code"}` |
//!
//! Non-2xx responses carry a JSON body `{"code": "...", "error": "..."}`
//! which is mapped through [`ApiError::from_status`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use vpn_core::{AccountData, AccountToken, ApiError, Device, PublicKey, VoucherSubmission};

use crate::application::account_api::{AccessToken, AccountApi};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TokenRequest<'a> {
    account_number: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct NewAccountResponse {
    number: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DeviceResponse {
    id: String,
    name: String,
    pubkey: String,
    created: DateTime<Utc>,
}

impl From<DeviceResponse> for Device {
    fn from(device: DeviceResponse) -> Self {
        Device {
            id: device.id,
            name: device.name,
            pubkey: PublicKey::new(device.pubkey),
            created: device.created,
        }
    }
}

#[derive(Serialize)]
struct NewDeviceRequest<'a> {
    pubkey: &'a str,
    hijack_dns: bool,
}

#[derive(Serialize)]
struct PubkeyRequest<'a> {
    pubkey: &'a str,
}

#[derive(Serialize)]
struct VoucherRequest<'a> {
    voucher_code: &'a str,
}

#[derive(Deserialize)]
struct VoucherResponse {
    time_added: u64,
    new_expiry: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    code: Option<String>,
    error: Option<String>,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct HttpAccountApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountApi {
    /// Creates a client for the API at `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the TLS backend cannot be set up.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vpn-daemon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    fn authed(&self, method: Method, path: &str, token: &AccessToken) -> RequestBuilder {
        self.request(method, path).bearer_auth(token.value())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        trace!(status = status.as_u16(), url = %response.url().path(), "api response");
        if status.is_success() {
            return Ok(response);
        }
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let error = ApiError::from_status(
            status.as_u16(),
            body.code.as_deref(),
            body.error.as_deref().unwrap_or(""),
        );
        debug!(status = status.as_u16(), %error, "api request failed");
        Err(error)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Transport("request timed out".to_string())
    } else {
        ApiError::Transport(error.to_string())
    }
}

#[async_trait]
impl AccountApi for HttpAccountApi {
    async fn fetch_access_token(&self, account: &AccountToken) -> Result<AccessToken, ApiError> {
        let request = self.request(Method::POST, "/auth/v1/token").json(&TokenRequest {
            account_number: account.as_str(),
        });
        let response: TokenResponse = self.send_json(request).await?;
        Ok(AccessToken::new(response.access_token, response.expiry))
    }

    async fn create_account(&self) -> Result<AccountToken, ApiError> {
        let request = self.request(Method::POST, "/accounts/v1/accounts");
        let response: NewAccountResponse = self.send_json(request).await?;
        Ok(AccountToken::new(response.number))
    }

    async fn get_account_data(&self, token: &AccessToken) -> Result<AccountData, ApiError> {
        let request = self.authed(Method::GET, "/accounts/v1/accounts/me", token);
        let response: AccountResponse = self.send_json(request).await?;
        Ok(AccountData {
            expiry: response.expiry,
        })
    }

    async fn list_devices(&self, token: &AccessToken) -> Result<Vec<Device>, ApiError> {
        let request = self.authed(Method::GET, "/accounts/v1/devices", token);
        let devices: Vec<DeviceResponse> = self.send_json(request).await?;
        Ok(devices.into_iter().map(Device::from).collect())
    }

    async fn get_device(&self, token: &AccessToken, device_id: &str) -> Result<Device, ApiError> {
        let request = self.authed(Method::GET, &format!("/accounts/v1/devices/{device_id}"), token);
        let device: DeviceResponse = self.send_json(request).await?;
        Ok(device.into())
    }

    async fn create_device(&self, token: &AccessToken, pubkey: &PublicKey) -> Result<Device, ApiError> {
        let request = self
            .authed(Method::POST, "/accounts/v1/devices", token)
            .json(&NewDeviceRequest {
                pubkey: pubkey.as_str(),
                hijack_dns: false,
            });
        let device: DeviceResponse = self.send_json(request).await?;
        Ok(device.into())
    }

    async fn delete_device(&self, token: &AccessToken, device_id: &str) -> Result<(), ApiError> {
        let request = self.authed(Method::DELETE, &format!("/accounts/v1/devices/{device_id}"), token);
        self.send(request).await.map(|_| ())
    }

    async fn replace_device_key(
        &self,
        token: &AccessToken,
        device_id: &str,
        pubkey: &PublicKey,
    ) -> Result<Device, ApiError> {
        let request = self
            .authed(Method::PUT, &format!("/accounts/v1/devices/{device_id}/pubkey"), token)
            .json(&PubkeyRequest {
                pubkey: pubkey.as_str(),
            });
        let device: DeviceResponse = self.send_json(request).await?;
        Ok(device.into())
    }

    async fn submit_voucher(&self, token: &AccessToken, code: &str) -> Result<VoucherSubmission, ApiError> {
        let request = self
            .authed(Method::POST, "/app/v1/submit-voucher", token)
            .json(&VoucherRequest { voucher_code: code });
        let response: VoucherResponse = self.send_json(request).await?;
        Ok(VoucherSubmission {
            time_added: response.time_added,
            new_expiry: response.new_expiry,
        })
    }
}

impl std::fmt::Debug for HttpAccountApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAccountApi")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
