//! In-process account API used by `--dry-run` and scenario tests.
//!
//! Behaves like the real service for the calls the daemon makes: accounts
//! own devices up to a cap, access tokens expire, unknown devices are 404s.
//! Tests can also reach behind the daemon's back: remove a device remotely,
//! expire every access token, queue a failure for the next call to an
//! endpoint, or hold an endpoint so calls to it park until released.  Every
//! call is recorded in [`InMemoryAccountApi::calls`] so tests
//! can assert on ordering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use vpn_core::{AccountData, AccountToken, ApiError, Device, PublicKey, VoucherSubmission};

use crate::application::account_api::{AccessToken, AccountApi};

const ADJECTIVES: [&str; 6] = ["agile", "brave", "calm", "eager", "quiet", "witty"];
const ANIMALS: [&str; 6] = ["lynx", "otter", "heron", "bison", "fox", "moth"];

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCallRecord {
    /// Endpoint name, e.g. `"list_devices"`.
    pub endpoint: &'static str,
    /// Access token value, account number, or device id the call carried.
    pub subject: String,
}

struct AccountRecord {
    expiry: chrono::DateTime<Utc>,
    devices: Vec<Device>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountToken, AccountRecord>,
    /// Access token value to owning account.
    tokens: HashMap<String, AccountToken>,
    vouchers: HashMap<String, u64>,
    faults: HashMap<&'static str, VecDeque<ApiError>>,
    calls: Vec<ApiCallRecord>,
    next_id: u64,
}

pub struct InMemoryAccountApi {
    inner: Mutex<Inner>,
    max_devices: usize,
    token_ttl: ChronoDuration,
    latency: Mutex<Option<Duration>>,
    held: watch::Sender<HashSet<&'static str>>,
}

impl Default for InMemoryAccountApi {
    fn default() -> Self {
        Self::new(5)
    }
}

impl InMemoryAccountApi {
    pub fn new(max_devices: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_devices,
            token_ttl: ChronoDuration::hours(1),
            latency: Mutex::new(None),
            held: watch::Sender::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Test controls ────────────────────────────────────────────────────────

    /// Adds an account with 30 days of time and no devices.
    pub fn add_account(&self, account: &AccountToken) {
        self.lock().accounts.insert(
            account.clone(),
            AccountRecord {
                expiry: Utc::now() + ChronoDuration::days(30),
                devices: Vec::new(),
            },
        );
    }

    /// Registers a device on `account` without going through the daemon.
    pub fn add_device(&self, account: &AccountToken, pubkey: &PublicKey) -> Option<Device> {
        let mut inner = self.lock();
        let device = new_device(&mut inner, pubkey);
        let record = inner.accounts.get_mut(account)?;
        record.devices.push(device.clone());
        Some(device)
    }

    /// Deletes a device as if another client had removed it.
    pub fn remove_device_remotely(&self, account: &AccountToken, device_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.accounts.get_mut(account) {
            Some(record) => {
                let before = record.devices.len();
                record.devices.retain(|device| device.id != device_id);
                record.devices.len() != before
            }
            None => false,
        }
    }

    pub fn devices(&self, account: &AccountToken) -> Vec<Device> {
        self.lock()
            .accounts
            .get(account)
            .map(|record| record.devices.clone())
            .unwrap_or_default()
    }

    pub fn add_voucher(&self, code: &str, seconds: u64) {
        self.lock().vouchers.insert(code.to_string(), seconds);
    }

    /// Invalidates every issued access token.  The next authenticated call
    /// answers 401.
    pub fn expire_access_tokens(&self) {
        self.lock().tokens.clear();
    }

    /// Makes the next call to `endpoint` fail with `error`.  Faults queue up
    /// per endpoint.
    pub fn fail_next(&self, endpoint: &'static str, error: ApiError) {
        self.lock()
            .faults
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Delays every call.  Lets tests observe in-flight operations.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Parks every call to `endpoint` after it has been recorded, until
    /// [`release`](Self::release) is called.
    pub fn hold(&self, endpoint: &'static str) {
        self.held.send_modify(|held| {
            held.insert(endpoint);
        });
    }

    pub fn release(&self, endpoint: &'static str) {
        self.held.send_modify(|held| {
            held.remove(endpoint);
        });
    }

    pub fn calls(&self) -> Vec<ApiCallRecord> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .count()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Records the call, waits while the endpoint is held, waits out the
    /// latency, and returns a queued fault.
    async fn enter(&self, endpoint: &'static str, subject: &str) -> Result<(), ApiError> {
        self.lock().calls.push(ApiCallRecord {
            endpoint,
            subject: subject.to_string(),
        });
        let mut held = self.held.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = held.wait_for(|held| !held.contains(endpoint)).await;
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        match inner.faults.get_mut(endpoint).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn account_for(inner: &Inner, token: &AccessToken) -> Result<AccountToken, ApiError> {
        if token.expiry() <= Utc::now() {
            return Err(ApiError::Unauthorized);
        }
        inner
            .tokens
            .get(token.value())
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }

    fn record_mut<'a>(
        inner: &'a mut Inner,
        token: &AccessToken,
    ) -> Result<&'a mut AccountRecord, ApiError> {
        let account = Self::account_for(inner, token)?;
        inner
            .accounts
            .get_mut(&account)
            .ok_or(ApiError::InvalidAccount)
    }
}

fn new_device(inner: &mut Inner, pubkey: &PublicKey) -> Device {
    inner.next_id += 1;
    let n = inner.next_id as usize;
    Device {
        id: Uuid::new_v4().to_string(),
        name: format!(
            "{} {}",
            ADJECTIVES[n % ADJECTIVES.len()],
            ANIMALS[(n / ADJECTIVES.len()) % ANIMALS.len()]
        ),
        pubkey: pubkey.clone(),
        created: Utc::now(),
    }
}

#[async_trait]
impl AccountApi for InMemoryAccountApi {
    async fn fetch_access_token(&self, account: &AccountToken) -> Result<AccessToken, ApiError> {
        self.enter("fetch_access_token", account.as_str()).await?;
        let mut inner = self.lock();
        if !inner.accounts.contains_key(account) {
            return Err(ApiError::InvalidAccount);
        }
        let value = format!("mva_{}", Uuid::new_v4().simple());
        inner.tokens.insert(value.clone(), account.clone());
        Ok(AccessToken::new(value, Utc::now() + self.token_ttl))
    }

    async fn create_account(&self) -> Result<AccountToken, ApiError> {
        self.enter("create_account", "").await?;
        let digits: String = Uuid::new_v4()
            .as_u128()
            .to_string()
            .chars()
            .take(16)
            .collect();
        let account = AccountToken::new(digits);
        self.lock().accounts.insert(
            account.clone(),
            AccountRecord {
                expiry: Utc::now(),
                devices: Vec::new(),
            },
        );
        Ok(account)
    }

    async fn get_account_data(&self, token: &AccessToken) -> Result<AccountData, ApiError> {
        self.enter("get_account_data", token.value()).await?;
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, token)?;
        Ok(AccountData {
            expiry: record.expiry,
        })
    }

    async fn list_devices(&self, token: &AccessToken) -> Result<Vec<Device>, ApiError> {
        self.enter("list_devices", token.value()).await?;
        let mut inner = self.lock();
        Ok(Self::record_mut(&mut inner, token)?.devices.clone())
    }

    async fn get_device(&self, token: &AccessToken, device_id: &str) -> Result<Device, ApiError> {
        self.enter("get_device", device_id).await?;
        let mut inner = self.lock();
        Self::record_mut(&mut inner, token)?
            .devices
            .iter()
            .find(|device| device.id == device_id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn create_device(&self, token: &AccessToken, pubkey: &PublicKey) -> Result<Device, ApiError> {
        self.enter("create_device", pubkey.as_str()).await?;
        let mut inner = self.lock();
        let count = Self::record_mut(&mut inner, token)?.devices.len();
        if count >= self.max_devices {
            return Err(ApiError::TooManyDevices);
        }
        let device = new_device(&mut inner, pubkey);
        Self::record_mut(&mut inner, token)?.devices.push(device.clone());
        Ok(device)
    }

    async fn delete_device(&self, token: &AccessToken, device_id: &str) -> Result<(), ApiError> {
        self.enter("delete_device", device_id).await?;
        let mut inner = self.lock();
        let record = Self::record_mut(&mut inner, token)?;
        let before = record.devices.len();
        record.devices.retain(|device| device.id != device_id);
        if record.devices.len() == before {
            return Err(ApiError::NotFound);
        }
        Ok(())
    }

    async fn replace_device_key(
        &self,
        token: &AccessToken,
        device_id: &str,
        pubkey: &PublicKey,
    ) -> Result<Device, ApiError> {
        self.enter("replace_device_key", device_id).await?;
        let mut inner = self.lock();
        let device = Self::record_mut(&mut inner, token)?
            .devices
            .iter_mut()
            .find(|device| device.id == device_id)
            .ok_or(ApiError::NotFound)?;
        device.pubkey = pubkey.clone();
        Ok(device.clone())
    }

    async fn submit_voucher(&self, token: &AccessToken, code: &str) -> Result<VoucherSubmission, ApiError> {
        self.enter("submit_voucher", code).await?;
        let mut inner = self.lock();
        let seconds = inner.vouchers.remove(code).ok_or(ApiError::InvalidVoucher)?;
        let record = Self::record_mut(&mut inner, token)?;
        record.expiry = record.expiry.max(Utc::now()) + ChronoDuration::seconds(seconds as i64);
        Ok(VoucherSubmission {
            time_added: seconds,
            new_expiry: record.expiry,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
