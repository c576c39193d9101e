//! Dashboard sessions, password checks and brute-force lockout.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use argon2::Argon2;
use password_hash::{PasswordHash, PasswordVerifier};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timings of the session and lockout policy.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub session_duration: Duration,
    /// Consecutive failures from one address before it is locked out.
    pub max_login_attempts: u32,
    pub lockout_duration: Duration,
    /// How often expired sessions and stale lockouts are swept.
    pub cleanup_interval: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            session_duration: Duration::from_secs(15 * 60),
            max_login_attempts: 5,
            lockout_duration: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailInfo {
    count: u32,
    last_failure: Instant,
    locked_until: Option<Instant>,
}

/// Issues and validates session tokens and tracks failed logins per address.
#[derive(Debug)]
pub struct AuthManager {
    password_hash: Option<String>,
    policy: AuthPolicy,
    sessions: RwLock<HashMap<String, Instant>>,
    failed_logins: RwLock<HashMap<String, FailInfo>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl AuthManager {
    /// `password_hash` is an argon2 PHC string; `None` disables all gating.
    pub fn new(password_hash: Option<String>, policy: AuthPolicy) -> Self {
        Self {
            password_hash,
            policy,
            sessions: RwLock::new(HashMap::new()),
            failed_logins: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn validate_password(&self, password: &str) -> bool {
        let Some(hash) = &self.password_hash else {
            warn!("Auth disabled: no password hash configured");
            return true;
        };
        let parsed = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Configured password hash is invalid: {}", e);
                return false;
            }
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Creates a session and returns its token.
    pub fn create_session(&self) -> String {
        let token = generate_token();
        write(&self.sessions).insert(token.clone(), Instant::now() + self.policy.session_duration);
        token
    }

    pub fn validate_session(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let expiry = match read(&self.sessions).get(token) {
            Some(expiry) => *expiry,
            None => return false,
        };
        if Instant::now() >= expiry {
            write(&self.sessions).remove(token);
            return false;
        }
        true
    }

    pub fn invalidate_session(&self, token: &str) {
        write(&self.sessions).remove(token);
    }

    pub fn is_locked_out(&self, addr: &str) -> bool {
        read(&self.failed_logins).get(addr).is_some_and(|info| {
            info.count >= self.policy.max_login_attempts
                && info.locked_until.is_some_and(|until| Instant::now() < until)
        })
    }

    pub fn record_failed_login(&self, addr: &str) {
        let now = Instant::now();
        let mut failed = write(&self.failed_logins);
        let info = failed.entry(addr.to_string()).or_insert(FailInfo {
            count: 0,
            last_failure: now,
            locked_until: None,
        });
        info.count += 1;
        info.last_failure = now;
        if info.count >= self.policy.max_login_attempts {
            info.locked_until = Some(now + self.policy.lockout_duration);
            warn!(
                "AUDIT address {} locked out for {:?} after {} failed login attempts",
                addr, self.policy.lockout_duration, info.count
            );
        }
    }

    pub fn clear_failed_logins(&self, addr: &str) {
        write(&self.failed_logins).remove(addr);
    }

    /// Removes expired sessions and lockout records that no longer matter.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut sessions = write(&self.sessions);
        let mut failed = write(&self.failed_logins);

        sessions.retain(|_, expiry| now < *expiry);
        failed.retain(|_, info| match info.locked_until {
            Some(until) => now < until,
            None => now.duration_since(info.last_failure) < self.policy.lockout_duration,
        });
        debug!(
            "Auth sweep: {} sessions, {} tracked addresses",
            sessions.len(),
            failed.len()
        );
    }

    /// Sweeps on every `cleanup_interval` tick until `cancel` fires.
    pub async fn sweep_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.cleanup_interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Auth cleanup stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        read(&self.sessions).len()
    }
}

/// Constant-time comparison of a configured token with a provided one.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => to_hex(&bytes),
        Err(e) => {
            warn!("OS random source failed ({}), using a timestamp-derived session token", e);
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            to_hex(&nanos.to_le_bytes())
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use argon2::{Algorithm, Params, Version};
    use password_hash::{PasswordHasher, SaltString};

    use super::*;

    fn hash(password: &str) -> String {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(1024, 1, 1, None).unwrap(),
        );
        let salt = SaltString::generate(&mut rand::thread_rng());
        argon2.hash_password(password.as_bytes(), &salt).unwrap().to_string()
    }

    fn quick_policy() -> AuthPolicy {
        AuthPolicy {
            session_duration: Duration::from_millis(80),
            max_login_attempts: 3,
            lockout_duration: Duration::from_millis(80),
            cleanup_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn disabled_without_hash() {
        let auth = AuthManager::new(None, AuthPolicy::default());
        assert!(!auth.enabled());
        assert!(auth.validate_password("anything"));
    }

    #[test]
    fn password_checked_against_hash() {
        let auth = AuthManager::new(Some(hash("s3cret")), AuthPolicy::default());
        assert!(auth.enabled());
        assert!(auth.validate_password("s3cret"));
        assert!(!auth.validate_password("wrong"));
        assert!(!auth.validate_password(""));
    }

    #[test]
    fn sessions_expire_and_can_be_invalidated() {
        let auth = AuthManager::new(None, quick_policy());
        let token = auth.create_session();
        assert_eq!(token.len(), 64);
        assert!(auth.validate_session(&token));
        assert!(!auth.validate_session(""));
        assert!(!auth.validate_session("unknown"));

        let other = auth.create_session();
        assert_ne!(token, other);
        auth.invalidate_session(&other);
        assert!(!auth.validate_session(&other));

        std::thread::sleep(Duration::from_millis(100));
        assert!(!auth.validate_session(&token));
    }

    #[test]
    fn lockout_after_max_failures_until_duration_elapses() {
        let auth = AuthManager::new(None, quick_policy());
        let ip = "10.0.0.7";

        auth.record_failed_login(ip);
        auth.record_failed_login(ip);
        assert!(!auth.is_locked_out(ip));
        auth.record_failed_login(ip);
        assert!(auth.is_locked_out(ip));
        assert!(!auth.is_locked_out("10.0.0.8"));

        std::thread::sleep(Duration::from_millis(100));
        assert!(!auth.is_locked_out(ip));
    }

    #[test]
    fn success_clears_the_counter() {
        let auth = AuthManager::new(None, quick_policy());
        let ip = "10.0.0.9";
        auth.record_failed_login(ip);
        auth.record_failed_login(ip);
        auth.clear_failed_logins(ip);
        auth.record_failed_login(ip);
        auth.record_failed_login(ip);
        assert!(!auth.is_locked_out(ip));
    }

    #[test]
    fn sweep_drops_expired_state() {
        let auth = AuthManager::new(None, quick_policy());
        auth.create_session();
        for _ in 0..3 {
            auth.record_failed_login("1.1.1.1");
        }
        std::thread::sleep(Duration::from_millis(100));
        auth.sweep();
        assert_eq!(auth.session_count(), 0);
        assert!(read(&auth.failed_logins).is_empty());
    }

    #[tokio::test]
    async fn sweep_loop_exits_on_cancel() {
        let auth = std::sync::Arc::new(AuthManager::new(None, quick_policy()));
        let cancel = CancellationToken::new();
        let task = {
            let auth = std::sync::Arc::clone(&auth);
            let cancel = cancel.clone();
            tokio::spawn(async move { auth.sweep_loop(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", ""));
    }
}
