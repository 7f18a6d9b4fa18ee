//! §4.6 token manager. Holds the credential set, issues tokens in parallel
//! at startup, and exposes `ready_credentials`/`mark_used`/`mark_invalid`
//! plus a background refresh loop. Grounded on `original_source/main.py`'s
//! `get_token()` retry loop; the teacher's `cooldown.rs`/`timing_wheel.rs`
//! bitset+wheel is not reused here — credential counts in this domain are in
//! the hundreds, not 65k-wide, so a plain `HashMap<u32, Credential>` keyed
//! by uid with a `last_use: Option<Instant>` field is the idiomatic
//! replacement (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};

use crate::config::UserEntry;
use crate::http::PaintboardClient;

const MAX_ISSUE_ATTEMPTS: u32 = 5;
const ISSUE_RETRY_BASE: Duration = Duration::from_millis(500);
const ISSUE_RETRY_CAP: Duration = Duration::from_secs(10);
const MAX_ISSUE_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct Credential {
    pub uid: u32,
    pub access_key: String,
    pub token: [u8; 16],
    pub issued_at: Instant,
    pub invalid_count: u32,
    pub fail_count: u32,
    pub last_use: Option<Instant>,
    pub invalid: bool,
}

pub struct TokenManager {
    client: Arc<PaintboardClient>,
    pub(crate) credentials: RwLock<HashMap<u32, Credential>>,
    cooldown: Duration,
    refresh_interval: Duration,
    refresh_tx: mpsc::UnboundedSender<u32>,
    refresh_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
}

impl TokenManager {
    pub fn new(client: Arc<PaintboardClient>, cooldown_seconds: f64, refresh_interval_seconds: u64) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            client,
            credentials: RwLock::new(HashMap::new()),
            cooldown: Duration::from_secs_f64(cooldown_seconds.max(0.0)),
            refresh_interval: Duration::from_secs(refresh_interval_seconds),
            refresh_tx,
            refresh_rx: tokio::sync::Mutex::new(Some(refresh_rx)),
        })
    }

    /// Issue tokens for every configured user in parallel (bounded worker
    /// count), retrying transient failures with exponential backoff up to
    /// `MAX_ISSUE_ATTEMPTS` times (§4.6). A persistently-failing credential
    /// is marked invalid and skipped rather than blocking the others.
    pub async fn issue_initial(&self, users: &[UserEntry], max_enabled: usize) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_ISSUE_WORKERS));
        let mut handles = Vec::with_capacity(users.len());

        for user in users {
            let permit = semaphore.clone();
            let client = self.client.clone();
            let uid = user.uid;
            let access_key = user.access_key.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                issue_with_retry(&client, uid, &access_key).await
            }));
        }

        let mut credentials = self.credentials.write().await;
        for (user, handle) in users.iter().zip(handles) {
            match handle.await {
                Ok(Some(token)) => {
                    if max_enabled != 0 && credentials.len() >= max_enabled {
                        continue;
                    }
                    credentials.insert(
                        user.uid,
                        Credential {
                            uid: user.uid,
                            access_key: user.access_key.clone(),
                            token,
                            issued_at: Instant::now(),
                            invalid_count: 0,
                            fail_count: 0,
                            last_use: None,
                            invalid: false,
                        },
                    );
                }
                Ok(None) => {
                    log::error!("uid {} could not obtain a token after {MAX_ISSUE_ATTEMPTS} attempts, marking invalid", user.uid);
                }
                Err(e) => log::error!("token issuance task for uid {} panicked: {e}", user.uid),
            }
        }
    }

    pub async fn token_for(&self, uid: u32) -> Option<[u8; 16]> {
        self.credentials.read().await.get(&uid).map(|c| c.token)
    }

    pub async fn active_count(&self) -> usize {
        self.credentials.read().await.values().filter(|c| !c.invalid).count()
    }

    /// Credentials whose cooldown has elapsed and which aren't invalid,
    /// sorted by ascending `last_use` (most-rested first, §4.9 step 1).
    /// Never-used credentials sort before any that have been used.
    pub async fn ready_credentials(&self, now: Instant) -> Vec<u32> {
        let credentials = self.credentials.read().await;
        let mut ready: Vec<(u32, Option<Instant>)> = credentials
            .values()
            .filter(|c| !c.invalid)
            .filter(|c| match c.last_use {
                None => true,
                Some(last) => now.duration_since(last) >= self.cooldown,
            })
            .map(|c| (c.uid, c.last_use))
            .collect();
        ready.sort_by_key(|(_, last_use)| *last_use);
        ready.into_iter().map(|(uid, _)| uid).collect()
    }

    /// Starts this credential's cooldown at enqueue time, not at server
    /// acknowledgment (§4.6, §5 Ordering guarantees).
    pub async fn mark_used(&self, uid: u32, now: Instant) {
        if let Some(cred) = self.credentials.write().await.get_mut(&uid) {
            cred.last_use = Some(now);
        }
    }

    pub async fn mark_result(&self, uid: u32, success: bool) {
        if let Some(cred) = self.credentials.write().await.get_mut(&uid) {
            if success {
                cred.fail_count = 0;
            } else {
                cred.fail_count += 1;
            }
        }
    }

    /// A `0xed` (token invalid) result: mark for immediate refresh (§4.6,
    /// §7 "Token invalid" row).
    pub fn mark_invalid(&self, uid: u32) {
        let _ = self.refresh_tx.send(uid);
    }

    /// Background refresh loop: drains invalid-uid requests immediately and
    /// also performs a full refresh sweep every `refresh_interval` (default
    /// 3600s, §4.6). Runs until `stop` fires.
    pub async fn run_refresh_loop(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut rx = match self.refresh_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut full_refresh = tokio::time::interval(self.refresh_interval);
        full_refresh.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                Some(uid) = rx.recv() => {
                    self.refresh_one(uid).await;
                }
                _ = full_refresh.tick() => {
                    self.refresh_all().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
    }

    async fn refresh_one(&self, uid: u32) {
        let access_key = match self.credentials.read().await.get(&uid) {
            Some(cred) => cred.access_key.clone(),
            None => return,
        };
        match issue_with_retry(&self.client, uid, &access_key).await {
            Some(token) => {
                if let Some(cred) = self.credentials.write().await.get_mut(&uid) {
                    cred.token = token;
                    cred.issued_at = Instant::now();
                    cred.invalid = false;
                    cred.invalid_count = 0;
                    cred.fail_count = 0;
                    // cooldown still applies from its last enqueue; refreshing
                    // the token doesn't re-enter the ready set early.
                }
                log::info!("uid {uid}: token refreshed");
            }
            None => {
                if let Some(cred) = self.credentials.write().await.get_mut(&uid) {
                    cred.invalid = true;
                    cred.invalid_count += 1;
                }
                log::error!("uid {uid}: refresh failed, credential marked invalid");
            }
        }
    }

    async fn refresh_all(&self) {
        let uids: Vec<u32> = self.credentials.read().await.keys().copied().collect();
        for uid in uids {
            self.refresh_one(uid).await;
        }
    }
}

async fn issue_with_retry(client: &PaintboardClient, uid: u32, access_key: &str) -> Option<[u8; 16]> {
    let mut delay = ISSUE_RETRY_BASE;
    for attempt in 1..=MAX_ISSUE_ATTEMPTS {
        match client.issue_token(uid, access_key).await {
            Ok(token) => return Some(token),
            Err(e) => {
                log::warn!("uid {uid}: token issuance attempt {attempt}/{MAX_ISSUE_ATTEMPTS} failed: {e}");
                if attempt == MAX_ISSUE_ATTEMPTS {
                    return None;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(ISSUE_RETRY_CAP);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_for_test() -> Arc<TokenManager> {
        let client = Arc::new(PaintboardClient::new("https://example.invalid").unwrap());
        TokenManager::new(client, 1.0, 3600)
    }

    async fn insert(manager: &TokenManager, uid: u32) {
        manager.credentials.write().await.insert(
            uid,
            Credential {
                uid,
                access_key: "key".into(),
                token: [0u8; 16],
                issued_at: Instant::now(),
                invalid_count: 0,
                fail_count: 0,
                last_use: None,
                invalid: false,
            },
        );
    }

    #[tokio::test]
    async fn unused_credential_is_immediately_ready() {
        let manager = manager_for_test();
        insert(&manager, 1).await;
        let ready = manager.ready_credentials(Instant::now()).await;
        assert_eq!(ready, vec![1]);
    }

    #[tokio::test]
    async fn mark_used_starts_cooldown() {
        let manager = manager_for_test();
        insert(&manager, 1).await;
        let t0 = Instant::now();
        manager.mark_used(1, t0).await;

        assert!(manager.ready_credentials(t0).await.is_empty());
        assert!(manager
            .ready_credentials(t0 + Duration::from_millis(500))
            .await
            .is_empty());
        assert_eq!(
            manager.ready_credentials(t0 + Duration::from_secs(2)).await,
            vec![1]
        );
    }

    #[tokio::test]
    async fn ready_credentials_sorts_by_ascending_last_use() {
        let manager = manager_for_test();
        insert(&manager, 1).await;
        insert(&manager, 2).await;
        let t0 = Instant::now() - Duration::from_secs(10);
        manager.mark_used(1, t0 + Duration::from_secs(5)).await;
        manager.mark_used(2, t0 + Duration::from_secs(1)).await;

        let ready = manager.ready_credentials(t0 + Duration::from_secs(20)).await;
        assert_eq!(ready, vec![2, 1]);
    }

    #[tokio::test]
    async fn invalid_credential_excluded_from_ready_set() {
        let manager = manager_for_test();
        insert(&manager, 1).await;
        manager.credentials.write().await.get_mut(&1).unwrap().invalid = true;
        assert!(manager.ready_credentials(Instant::now()).await.is_empty());
    }
}
