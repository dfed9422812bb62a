use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::device_code::{DeviceCodeAcquisition, DeviceCodeFlow, VerificationPrompt};
use super::host_session::HostSession;
use super::prompt::{Prompter, SignInMethod};
use super::store::memory::MemorySecretStore;
use super::store::SecretStore;
use super::{AcquireMode, CredentialManager, Token, TokenSource, SECRET_KEY};
use crate::error::AuthError;

fn token_valid_for(access: &str, minutes: i64) -> Token {
    Token::new(access.to_string(), Utc::now() + Duration::minutes(minutes))
}

fn stored(token: &Token) -> String {
    serde_json::to_string(token).unwrap()
}

/// Host session fake that counts calls per interactivity.
#[derive(Default)]
struct FakeHost {
    silent: Option<Token>,
    interactive: Option<Token>,
    hang_interactive: bool,
    silent_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
}

#[async_trait]
impl HostSession for FakeHost {
    async fn session(&self, interactive: bool) -> Result<Option<Token>, AuthError> {
        if interactive {
            self.interactive_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_interactive {
                std::future::pending::<()>().await;
            }
            Ok(self.interactive.clone())
        } else {
            self.silent_calls.fetch_add(1, Ordering::SeqCst);
            // Slow enough for concurrent callers to pile up on the cache lock.
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            Ok(self.silent.clone())
        }
    }
}

enum DeviceOutcome {
    Grant(Token),
    Fail(fn() -> AuthError),
    Hang,
}

struct FakeDevice {
    refresh: Option<Token>,
    outcome: DeviceOutcome,
    starts: AtomicUsize,
    clears: AtomicUsize,
    fail_clear: bool,
}

impl FakeDevice {
    fn new(outcome: DeviceOutcome) -> Self {
        Self {
            refresh: None,
            outcome,
            starts: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            fail_clear: false,
        }
    }
}

fn prompt() -> VerificationPrompt {
    VerificationPrompt {
        verification_uri: "https://microsoft.com/devicelogin".into(),
        user_code: "ABCD-1234".into(),
        expires_in_secs: 900,
    }
}

#[async_trait]
impl DeviceCodeFlow for FakeDevice {
    async fn refresh_silent(&self) -> Result<Option<Token>, AuthError> {
        Ok(self.refresh.clone())
    }

    fn start(&self) -> DeviceCodeAcquisition {
        self.starts.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            DeviceOutcome::Grant(token) => {
                let token = token.clone();
                DeviceCodeAcquisition::spawn(move |prompt_tx, _cancel| async move {
                    let _ = prompt_tx.send(prompt());
                    Ok(token)
                })
            }
            DeviceOutcome::Fail(make) => {
                let make = *make;
                DeviceCodeAcquisition::spawn(move |_prompt_tx, _cancel| async move { Err(make()) })
            }
            DeviceOutcome::Hang => DeviceCodeAcquisition::spawn(|prompt_tx, mut cancel| async move {
                let _ = prompt_tx.send(prompt());
                let _ = cancel.changed().await;
                Err(AuthError::Cancelled)
            }),
        }
    }

    async fn clear_accounts(&self) -> Result<(), AuthError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        if self.fail_clear {
            return Err(AuthError::Provider("cache locked".into()));
        }
        Ok(())
    }
}

struct FakePrompter {
    choice: Option<SignInMethod>,
    cancel_after: Option<StdDuration>,
    choices_asked: AtomicUsize,
    shown: Mutex<Vec<VerificationPrompt>>,
}

impl FakePrompter {
    fn choosing(choice: Option<SignInMethod>) -> Self {
        Self {
            choice,
            cancel_after: None,
            choices_asked: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Prompter for FakePrompter {
    async fn choose_sign_in_method(&self) -> Option<SignInMethod> {
        self.choices_asked.fetch_add(1, Ordering::SeqCst);
        self.choice
    }

    async fn show_verification(&self, prompt: &VerificationPrompt) {
        self.shown.lock().unwrap().push(prompt.clone());
    }

    async fn cancelled(&self) {
        match self.cancel_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    }
}

struct Harness {
    store: Arc<MemorySecretStore>,
    host: Arc<FakeHost>,
    device: Arc<FakeDevice>,
    prompter: Arc<FakePrompter>,
    manager: Arc<CredentialManager>,
}

fn harness(store: MemorySecretStore, host: FakeHost, device: FakeDevice, prompter: FakePrompter) -> Harness {
    let store = Arc::new(store);
    let host = Arc::new(host);
    let device = Arc::new(device);
    let prompter = Arc::new(prompter);
    let manager = Arc::new(CredentialManager::new(
        store.clone(),
        host.clone(),
        device.clone(),
        prompter.clone(),
    ));
    Harness {
        store,
        host,
        device,
        prompter,
        manager,
    }
}

fn empty_harness() -> Harness {
    harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Fail(|| AuthError::Provider("unused".into()))),
        FakePrompter::choosing(None),
    )
}

#[test]
fn validity_uses_five_minute_margin() {
    let now = Utc::now();
    let four = Token::new("t".into(), now + Duration::minutes(4));
    let six = Token::new("t".into(), now + Duration::minutes(6));
    let exactly_five = Token::new("t".into(), now + Duration::minutes(5));
    let past = Token::new("t".into(), now - Duration::minutes(1));
    assert!(!four.is_valid_at(now));
    assert!(six.is_valid_at(now));
    assert!(!exactly_five.is_valid_at(now));
    assert!(!past.is_valid_at(now));
}

#[test]
fn debug_output_redacts_access_token() {
    let token = token_valid_for("super-secret-value", 60);
    let debug = format!("{token:?}");
    assert!(!debug.contains("super-secret-value"));
    assert!(debug.contains("redacted"));
}

#[test]
fn persisted_format_uses_camel_case_keys() {
    let json = stored(&token_valid_for("abc", 60));
    assert!(json.contains("\"accessToken\":\"abc\""));
    assert!(json.contains("\"expiresOn\""));
}

#[tokio::test]
async fn valid_stored_token_short_circuits_acquisition() {
    let cached = token_valid_for("cached", 60);
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, &stored(&cached)),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Grant(token_valid_for("device", 60))),
        FakePrompter::choosing(Some(SignInMethod::DeviceCode)),
    );

    for mode in [
        AcquireMode::Auto,
        AcquireMode::Silent,
        AcquireMode::DeviceCode,
        AcquireMode::HostInteractive,
    ] {
        assert_eq!(h.manager.get_token(mode).await.unwrap(), "cached");
    }
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.host.interactive_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn silent_host_session_is_cached_and_persisted() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost {
            silent: Some(token_valid_for("host", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );

    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "host");
    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "host");
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 0);

    let raw = h.store.get(SECRET_KEY).await.unwrap().expect("persisted");
    let persisted: Token = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.access_token(), "host");
}

#[tokio::test]
async fn expired_stored_token_triggers_reacquisition() {
    let expiring = token_valid_for("old", 4);
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, &stored(&expiring)),
        FakeHost {
            silent: Some(token_valid_for("new", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );
    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "new");
}

#[tokio::test]
async fn auto_mode_asks_for_method_after_silent_miss() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Grant(token_valid_for("device", 60))),
        FakePrompter::choosing(Some(SignInMethod::DeviceCode)),
    );

    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "device");
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 1);
    let shown = h.prompter.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].user_code, "ABCD-1234");
}

#[tokio::test]
async fn auto_mode_can_pick_interactive_host_session() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost {
            interactive: Some(token_valid_for("interactive", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(Some(SignInMethod::HostSession)),
    );
    assert_eq!(
        h.manager.get_token(AcquireMode::Auto).await.unwrap(),
        "interactive"
    );
    assert_eq!(h.host.interactive_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_choice_is_authentication_error() {
    let h = empty_harness();
    let err = h.manager.get_token(AcquireMode::Auto).await.unwrap_err();
    assert!(matches!(err, AuthError::Cancelled));
    assert!(h.store.get(SECRET_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn silent_mode_never_prompts() {
    let h = empty_harness();
    let err = h.manager.get_token(AcquireMode::Silent).await.unwrap_err();
    assert!(matches!(err, AuthError::NoSession));
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 0);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn device_code_mode_bypasses_choice_and_host() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost {
            silent: Some(token_valid_for("host", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Grant(token_valid_for("device", 60))),
        FakePrompter::choosing(None),
    );
    assert_eq!(
        h.manager.get_token(AcquireMode::DeviceCode).await.unwrap(),
        "device"
    );
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 0);
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn device_code_prefers_silent_refresh() {
    let mut device = FakeDevice::new(DeviceOutcome::Hang);
    device.refresh = Some(token_valid_for("refreshed", 60));
    let h = harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        device,
        FakePrompter::choosing(None),
    );
    assert_eq!(
        h.manager.get_token(AcquireMode::DeviceCode).await.unwrap(),
        "refreshed"
    );
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn device_code_failure_propagates() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Fail(|| AuthError::Expired)),
        FakePrompter::choosing(None),
    );
    let err = h.manager.get_token(AcquireMode::DeviceCode).await.unwrap_err();
    assert!(matches!(err, AuthError::Expired));
    assert!(h.prompter.shown.lock().unwrap().is_empty());
}

#[tokio::test]
async fn user_cancel_abandons_device_code() {
    let mut prompter = FakePrompter::choosing(None);
    prompter.cancel_after = Some(StdDuration::from_millis(30));
    let h = harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Hang),
        prompter,
    );
    let err = h.manager.get_token(AcquireMode::DeviceCode).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(h.prompter.shown.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn user_cancel_abandons_interactive_host_session() {
    let mut prompter = FakePrompter::choosing(Some(SignInMethod::HostSession));
    prompter.cancel_after = Some(StdDuration::from_millis(30));
    let h = harness(
        MemorySecretStore::default(),
        FakeHost {
            hang_interactive: true,
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        prompter,
    );
    let err = h.manager.get_token(AcquireMode::Auto).await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(h.host.interactive_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
    assert!(h.store.get(SECRET_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn store_write_failure_still_returns_token() {
    let store = MemorySecretStore::default();
    store.fail_writes.store(true, Ordering::SeqCst);
    let h = harness(
        store,
        FakeHost {
            silent: Some(token_valid_for("host", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );

    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "host");
    // Served from memory afterwards.
    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "host");
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_stored_token_is_ignored() {
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, "{\"accessToken\":"),
        FakeHost {
            silent: Some(token_valid_for("host", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );
    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "host");
}

#[tokio::test]
async fn concurrent_callers_share_one_acquisition() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Grant(token_valid_for("device", 60))),
        FakePrompter::choosing(Some(SignInMethod::DeviceCode)),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.get_token(AcquireMode::Auto).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "device");
    }
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn is_authenticated_probes_without_prompting_or_caching() {
    let h = harness(
        MemorySecretStore::default(),
        FakeHost {
            silent: Some(token_valid_for("host", 60)),
            ..FakeHost::default()
        },
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(Some(SignInMethod::DeviceCode)),
    );
    assert!(h.manager.is_authenticated().await);
    assert_eq!(h.prompter.choices_asked.load(Ordering::SeqCst), 0);
    assert_eq!(h.device.starts.load(Ordering::SeqCst), 0);
    assert!(h.store.get(SECRET_KEY).await.unwrap().is_none());

    let nobody = empty_harness();
    assert!(!nobody.manager.is_authenticated().await);
    assert_eq!(nobody.device.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn is_authenticated_accepts_valid_cache() {
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, &stored(&token_valid_for("cached", 60))),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );
    assert!(h.manager.is_authenticated().await);
    assert_eq!(h.host.silent_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sign_out_clears_everything_and_is_idempotent() {
    let mut device = FakeDevice::new(DeviceOutcome::Hang);
    device.fail_clear = true;
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, &stored(&token_valid_for("cached", 60))),
        FakeHost::default(),
        device,
        FakePrompter::choosing(None),
    );
    assert_eq!(h.manager.get_token(AcquireMode::Auto).await.unwrap(), "cached");

    h.manager.sign_out().await;
    h.manager.sign_out().await;

    assert!(h.store.get(SECRET_KEY).await.unwrap().is_none());
    assert_eq!(h.device.clears.load(Ordering::SeqCst), 2);
    let err = h.manager.get_token(AcquireMode::Silent).await.unwrap_err();
    assert!(matches!(err, AuthError::NoSession));
}

#[tokio::test]
async fn bearer_header_formats_token() {
    let h = harness(
        MemorySecretStore::with_secret(SECRET_KEY, &stored(&token_valid_for("abc", 60))),
        FakeHost::default(),
        FakeDevice::new(DeviceOutcome::Hang),
        FakePrompter::choosing(None),
    );
    assert_eq!(h.manager.bearer_header().await.unwrap(), "Bearer abc");
}
