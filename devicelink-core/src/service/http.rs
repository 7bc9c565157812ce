//! HTTP client for the account-management endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::crypto::{IdentityKeyPair, OneTimePreKey, ProfileKey, PublicIdentityKey, SignedPreKey};
use crate::service::{AccountManager, Credentials, LinkCompletionRequest, NewDeviceRegistration};
use crate::{LinkError, Result};

/// reqwest-backed [`AccountManager`].
pub struct HttpAccountManager {
    client: reqwest::Client,
    service_url: String,
    link_timeout: Duration,
}

#[derive(Deserialize)]
struct ProvisioningHandleResponse {
    uuid: String,
}

#[derive(Serialize)]
struct LinkDeviceBody<'a> {
    public_key: String,
    signaling_key: &'a str,
    registration_id: u32,
    name: &'a str,
    fetches_messages: bool,
}

#[derive(Deserialize)]
struct LinkDeviceResponse {
    device_id: u32,
    number: String,
    identity_key: String,
    profile_key: String,
}

#[derive(Serialize)]
struct PreKeyEntity {
    key_id: u32,
    public_key: String,
}

#[derive(Serialize)]
struct SignedPreKeyEntity {
    key_id: u32,
    public_key: String,
    signature: String,
}

#[derive(Serialize)]
struct PreKeyState {
    identity_key: String,
    signed_pre_key: SignedPreKeyEntity,
    pre_keys: Vec<PreKeyEntity>,
}

#[derive(Deserialize)]
struct SenderCertificateResponse {
    certificate: String,
}

impl HttpAccountManager {
    pub fn new(config: &LinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| LinkError::Network(e.to_string()))?;

        Ok(Self {
            client,
            service_url: config.service_url.trim_end_matches('/').to_string(),
            link_timeout: config.link_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.service_url, path)
    }

    /// The server holds this request open until the primary device confirms,
    /// so it gets its own timeout instead of the client-wide one.
    fn link_request(&self, request: &LinkCompletionRequest) -> reqwest::RequestBuilder {
        let body = LinkDeviceBody {
            public_key: STANDARD.encode(request.ephemeral_public_key.as_bytes()),
            signaling_key: &request.signaling_key,
            registration_id: request.registration_id,
            name: &request.device_name,
            fetches_messages: true,
        };
        self.client
            .put(self.url(&format!("/v1/devices/link/{}", request.provisioning_handle)))
            .basic_auth(&request.provisioning_handle, Some(&request.password))
            .timeout(self.link_timeout)
            .json(&body)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
        Err(status_error(status, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(resp: reqwest::Response, what: &str) -> Result<T> {
        resp.json()
            .await
            .map_err(|e| LinkError::MalformedData(format!("Invalid {} response: {}", what, e)))
    }
}

fn transport_error(e: reqwest::Error) -> LinkError {
    if e.is_timeout() {
        LinkError::Timeout(e.to_string())
    } else {
        LinkError::Network(e.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> LinkError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            LinkError::Timeout(format!("Service returned {}", status))
        }
        StatusCode::CONFLICT | StatusCode::GONE => {
            LinkError::UntrustedIdentity(format!("Service returned {}: {}", status, body))
        }
        _ => LinkError::Network(format!("Service error {}: {}", status, body)),
    }
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| LinkError::MalformedData(format!("Invalid {}: {}", field, e)))
}

#[async_trait]
impl AccountManager for HttpAccountManager {
    async fn request_provisioning_handle(&self, password: &str) -> Result<String> {
        let request = self
            .client
            .post(self.url("/v1/provisioning/handle"))
            .json(&serde_json::json!({ "password": password }));
        let resp = self.execute(request).await?;
        let body: ProvisioningHandleResponse = Self::json(resp, "provisioning handle").await?;
        Ok(body.uuid)
    }

    async fn await_link_completion(
        &self,
        request: &LinkCompletionRequest,
    ) -> Result<NewDeviceRegistration> {
        let resp = self.execute(self.link_request(request)).await?;
        let body: LinkDeviceResponse = Self::json(resp, "link completion").await?;

        Ok(NewDeviceRegistration {
            device_id: body.device_id,
            account_id: body.number,
            identity_key_pair: IdentityKeyPair::from_private_bytes(&decode_b64(
                &body.identity_key,
                "identity key",
            )?)?,
            profile_key: ProfileKey::from_bytes(&decode_b64(&body.profile_key, "profile key")?)?,
        })
    }

    async fn register_push_token(
        &self,
        credentials: &Credentials,
        token: Option<&str>,
    ) -> Result<()> {
        let url = self.url("/v1/accounts/push");
        let request = match token {
            Some(token) => self
                .client
                .put(url)
                .json(&serde_json::json!({ "push_token": token })),
            None => self.client.delete(url),
        };
        self.execute(request.basic_auth(&credentials.username, Some(&credentials.password)))
            .await?;
        Ok(())
    }

    async fn upload_pre_keys(
        &self,
        credentials: &Credentials,
        identity_key: &PublicIdentityKey,
        signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey],
    ) -> Result<()> {
        let state = PreKeyState {
            identity_key: STANDARD.encode(identity_key.as_bytes()),
            signed_pre_key: SignedPreKeyEntity {
                key_id: signed_pre_key.id,
                public_key: STANDARD.encode(signed_pre_key.public_key()),
                signature: STANDARD.encode(signed_pre_key.signature),
            },
            pre_keys: one_time_pre_keys
                .iter()
                .map(|k| PreKeyEntity {
                    key_id: k.id,
                    public_key: STANDARD.encode(k.public_key()),
                })
                .collect(),
        };
        let request = self
            .client
            .put(self.url("/v2/keys"))
            .basic_auth(&credentials.username, Some(&credentials.password))
            .json(&state);
        self.execute(request).await?;
        Ok(())
    }

    async fn sender_certificate(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let request = self
            .client
            .get(self.url("/v1/certificate/delivery"))
            .basic_auth(&credentials.username, Some(&credentials.password));
        let resp = self.execute(request).await?;
        let body: SenderCertificateResponse = Self::json(resp, "sender certificate").await?;
        decode_b64(&body.certificate, "sender certificate")
    }
}
