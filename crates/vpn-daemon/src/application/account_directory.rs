//! Retried, cancellable, authenticated calls to the account API.
//!
//! [`AccountDirectoryClient`] wraps an [`AccountApi`] with three rules:
//!
//! 1. Each call runs as a [`CancellableOperation`] under the client's
//!    [`RetryPolicy`] and can be cancelled through its [`ApiCall`].
//! 2. Authenticated calls take their access token from the shared
//!    [`AccessTokenCache`].
//! 3. When the API answers 401, the stale token is invalidated, a fresh one
//!    is fetched and the call is repeated exactly once within the same
//!    attempt.  A second 401 is returned to the caller.
//!
//! Endpoint-specific mappings: a 404 from `get_device` becomes `Ok(None)`
//! and a 404 from `delete_device` becomes `Ok(false)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::debug;

use vpn_core::{
    AccountData, AccountToken, ApiError, Device, DeviceId, PublicKey, RetryPolicy,
    VoucherSubmission,
};

use super::account_api::{AccessToken, AccountApi};
use super::cancellable::{CancelHandle, CancellableOperation, PendingOperation};
use super::token_cache::AccessTokenCache;

/// An in-flight API call.  Await it for the result; cancel it through
/// [`ApiCall::cancel`] or a [`CancelHandle`] obtained beforehand.
///
/// A cancelled call resolves to [`ApiError::Cancelled`].
pub struct ApiCall<T> {
    inner: PendingOperation<T, ApiError>,
}

impl<T> ApiCall<T> {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel_handle()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl<T> Future for ApiCall<T> {
    type Output = Result<T, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll(cx)
            .map(|outcome| outcome.into_result(|| ApiError::Cancelled))
    }
}

pub struct AccountDirectoryClient {
    api: Arc<dyn AccountApi>,
    tokens: Arc<AccessTokenCache>,
    policy: RetryPolicy,
}

impl AccountDirectoryClient {
    pub fn new(api: Arc<dyn AccountApi>, tokens: Arc<AccessTokenCache>, policy: RetryPolicy) -> Self {
        Self {
            api,
            tokens,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn create_account(&self) -> ApiCall<AccountToken> {
        let api = Arc::clone(&self.api);
        ApiCall {
            inner: CancellableOperation::spawn(self.policy, move |_| {
                let api = Arc::clone(&api);
                async move { api.create_account().await }
            }),
        }
    }

    pub fn get_account_data(&self, account: &AccountToken) -> ApiCall<AccountData> {
        self.authenticated(account, "get_account_data", |api, token| async move {
            api.get_account_data(&token).await
        })
    }

    pub fn list_devices(&self, account: &AccountToken) -> ApiCall<Vec<Device>> {
        self.authenticated(account, "list_devices", |api, token| async move {
            api.list_devices(&token).await
        })
    }

    /// `Ok(None)` when the device no longer exists on the account.
    pub fn get_device(&self, account: &AccountToken, device_id: &DeviceId) -> ApiCall<Option<Device>> {
        let device_id = device_id.clone();
        self.authenticated(account, "get_device", move |api, token| {
            let device_id = device_id.clone();
            async move {
                match api.get_device(&token, &device_id).await {
                    Ok(device) => Ok(Some(device)),
                    Err(ApiError::NotFound) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
    }

    pub fn create_device(&self, account: &AccountToken, pubkey: &PublicKey) -> ApiCall<Device> {
        let pubkey = pubkey.clone();
        self.authenticated(account, "create_device", move |api, token| {
            let pubkey = pubkey.clone();
            async move { api.create_device(&token, &pubkey).await }
        })
    }

    /// `Ok(false)` when the device was already gone.
    pub fn delete_device(&self, account: &AccountToken, device_id: &DeviceId) -> ApiCall<bool> {
        let device_id = device_id.clone();
        self.authenticated(account, "delete_device", move |api, token| {
            let device_id = device_id.clone();
            async move {
                match api.delete_device(&token, &device_id).await {
                    Ok(()) => Ok(true),
                    Err(ApiError::NotFound) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
    }

    pub fn rotate_device_key(
        &self,
        account: &AccountToken,
        device_id: &DeviceId,
        pubkey: &PublicKey,
    ) -> ApiCall<Device> {
        let device_id = device_id.clone();
        let pubkey = pubkey.clone();
        self.authenticated(account, "replace_device_key", move |api, token| {
            let device_id = device_id.clone();
            let pubkey = pubkey.clone();
            async move { api.replace_device_key(&token, &device_id, &pubkey).await }
        })
    }

    pub fn submit_voucher(&self, account: &AccountToken, code: &str) -> ApiCall<VoucherSubmission> {
        let code = code.to_string();
        self.authenticated(account, "submit_voucher", move |api, token| {
            let code = code.clone();
            async move { api.submit_voucher(&token, &code).await }
        })
    }

    /// Drops the cached access token for `account`.  Called once a logged
    /// out account's device has been removed.
    pub fn forget_account(&self, account: &AccountToken) {
        self.tokens.invalidate(account);
    }

    fn authenticated<T, F, Fut>(&self, account: &AccountToken, endpoint: &'static str, call: F) -> ApiCall<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn AccountApi>, AccessToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let tokens = Arc::clone(&self.tokens);
        let account = account.clone();
        let call = Arc::new(call);
        let inner = CancellableOperation::spawn(self.policy, move |attempt| {
            let api = Arc::clone(&api);
            let tokens = Arc::clone(&tokens);
            let account = account.clone();
            let call = Arc::clone(&call);
            async move {
                // The surrounding operation already retries transport errors,
                // so the token fetch itself runs a single attempt.
                let token = tokens.get_token(&account, RetryPolicy::never()).await?;
                match call(Arc::clone(&api), token.clone()).await {
                    Err(ApiError::Unauthorized) => {
                        debug!(endpoint, attempt, "access token rejected, refreshing once");
                        tokens.invalidate_token(&account, &token);
                        let fresh = tokens.get_token(&account, RetryPolicy::never()).await?;
                        call(api, fresh).await
                    }
                    other => other,
                }
            }
        });
        ApiCall { inner }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
