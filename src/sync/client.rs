//! HTTP client for the remote patch service.

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::error::SyncError;
use super::protocol::{
    CreateClientRequest, CreateClientResponse, CreatePatchesRequest, CreatePatchesResponse,
    CreateUserResponse, DeletePendingPatchesRequest, DeletePendingPatchesResponse,
    ErrorBody, GetPendingPatchesResponse, HeadResponse, HealthResponse, IdToken, RemoteHead,
    UpdateHeadRequest, UpdateHeadResponse,
};
use crate::config::SyncConfig;
use crate::models::{Patch, PatchKey};

/// Client bound to one user of one remote service.
///
/// Calls never retry; a failed request surfaces as [`SyncError::Network`] or
/// [`SyncError::Server`].
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    server_url: String,
    user_id: i64,
    token: String,
}

impl RemoteClient {
    /// Creates a client from config.
    ///
    /// Returns an error if sync is not configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let server_url = config
            .server_url
            .clone()
            .ok_or(SyncError::NotConfigured)?;
        let user_id = config.user_id.ok_or(SyncError::NotConfigured)?;
        Ok(Self::new(server_url, user_id))
    }

    pub fn new(server_url: impl Into<String>, user_id: i64) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            server_url,
            user_id,
            token: IdToken::new(user_id).to_bearer(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    fn user_url(&self, path: &str) -> String {
        format!("{}/users/{}{}", self.server_url, self.user_id, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(SyncError::Server {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))
    }

    pub async fn health(&self) -> Result<HealthResponse, SyncError> {
        self.send(self.http.get(self.url("/health"))).await
    }

    /// Registers this client's user. Returns `false` if the user already
    /// existed.
    pub async fn create_user(&self) -> Result<bool, SyncError> {
        match self
            .send::<CreateUserResponse>(self.http.post(self.url("/users")))
            .await
        {
            Ok(_) => Ok(true),
            Err(SyncError::Server { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Registers a new device and returns its client id.
    pub async fn create_client(&self, name: &str) -> Result<i64, SyncError> {
        let body = CreateClientRequest {
            name: name.to_string(),
        };
        let response: CreateClientResponse = self
            .send(self.http.post(self.user_url("/clients")).json(&body))
            .await?;
        tracing::info!(client_id = response.client_id, name, "registered client");
        Ok(response.client_id)
    }

    /// Uploads patches. Already stored keys are ignored by the server.
    pub async fn create_patches(&self, patches: &[Patch]) -> Result<usize, SyncError> {
        let body = CreatePatchesRequest {
            patches: patches.to_vec(),
        };
        let response: CreatePatchesResponse = self
            .send(self.http.post(self.user_url("/patches~batch")).json(&body))
            .await?;
        Ok(response.inserted)
    }

    /// Patches produced by other clients that `client_id` has not
    /// acknowledged yet, in server insertion order.
    pub async fn get_pending_patches(
        &self,
        client_id: i64,
        limit: usize,
    ) -> Result<Vec<Patch>, SyncError> {
        let url = self.user_url(&format!(
            "/clients/{}/pending_patches?limit={}",
            client_id, limit
        ));
        let response: GetPendingPatchesResponse = self.send(self.http.get(url)).await?;
        Ok(response.patches)
    }

    pub async fn delete_pending_patches(
        &self,
        client_id: i64,
        patch_keys: &[PatchKey],
    ) -> Result<u64, SyncError> {
        let body = DeletePendingPatchesRequest {
            patch_keys: patch_keys.to_vec(),
        };
        let url = self.user_url(&format!("/clients/{}/pending_patches", client_id));
        let response: DeletePendingPatchesResponse =
            self.send(self.http.delete(url).json(&body)).await?;
        Ok(response.deleted)
    }

    pub async fn get_head(&self) -> Result<RemoteHead, SyncError> {
        let response: HeadResponse = self.send(self.http.get(self.user_url("/head"))).await?;
        Ok(response.into())
    }

    /// Moves the server head to `patch_key` if it currently equals
    /// `expected`, or unconditionally when `expected` is `None`.
    pub async fn update_head(
        &self,
        patch_key: PatchKey,
        expected: Option<PatchKey>,
    ) -> Result<bool, SyncError> {
        let body = UpdateHeadRequest {
            patch_key,
            header_if_match: expected,
        };
        let response: UpdateHeadResponse = self
            .send(self.http.put(self.user_url("/head")).json(&body))
            .await?;
        Ok(response.updated)
    }
}
