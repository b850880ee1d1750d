//! Token provider: construction, accessor, shutdown
//!
//! Construction performs one fetch on the caller's task and fails if it does
//! not succeed. Afterwards a single background task owns all credential
//! calls and publishes snapshots; `get_access_token` only reads the latest
//! snapshot and never blocks on the network.

use std::sync::Arc;

use credential::{CredentialClient, CredentialError, TokenRequestOptions};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RefreshConfig;
use crate::error::{Error, Result};
use crate::observer::{MetricsObserver, RefreshObserver};
use crate::refresh::Refresher;
use crate::schedule::unix_seconds;
use crate::scheduler::{SchedulePolicy, SchedulerAction, SchedulerState};
use crate::state::TokenState;

type CredentialFactory =
    Box<dyn FnOnce() -> credential::Result<Arc<dyn CredentialClient>> + Send + 'static>;

enum CredentialSource {
    Ready(Arc<dyn CredentialClient>),
    Factory(CredentialFactory),
}

/// Keeps one bearer token fresh in the background.
pub struct TokenProvider {
    audience: String,
    state: watch::Receiver<Arc<TokenState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenProvider {
    pub fn builder() -> TokenProviderBuilder {
        TokenProviderBuilder::default()
    }

    /// Current token and the error from the most recent refresh, if it failed.
    ///
    /// A failed refresh keeps the previous token, so a non-`None` error means
    /// the token may be stale; callers decide whether that is acceptable.
    pub fn get_access_token(&self) -> (String, Option<CredentialError>) {
        let state = self.state();
        (state.token().to_owned(), state.last_error().cloned())
    }

    /// Full snapshot of the latest refresh attempt.
    pub fn state(&self) -> Arc<TokenState> {
        self.state.borrow().clone()
    }

    /// Receiver that wakes whenever a refresh attempt publishes a snapshot.
    ///
    /// The current snapshot is marked as seen, so `changed()` resolves on the
    /// next attempt. `changed()` returns an error once the loop has stopped.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TokenState>> {
        let mut rx = self.state.clone();
        rx.mark_unchanged();
        rx
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Whether the background loop is still scheduling refreshes.
    pub fn is_refreshing(&self) -> bool {
        self.state.has_changed().is_ok()
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// The last snapshot stays readable afterwards. Calling this twice is a
    /// no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(audience = %self.audience, "token refresh loop panicked");
                }
            }
        }
    }
}

impl Drop for TokenProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("audience", &self.audience)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Collects the provider's dependencies; `build` validates them, performs
/// the initial fetch and starts the refresh loop.
pub struct TokenProviderBuilder {
    audience: Option<String>,
    config: Option<RefreshConfig>,
    credential: Option<CredentialSource>,
    observer: Arc<dyn RefreshObserver>,
    cancel: Option<CancellationToken>,
}

impl Default for TokenProviderBuilder {
    fn default() -> Self {
        Self {
            audience: None,
            config: None,
            credential: None,
            observer: Arc::new(MetricsObserver),
            cancel: None,
        }
    }
}

impl TokenProviderBuilder {
    /// Scope requested from the credential client.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn config(mut self, config: RefreshConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn credential(mut self, client: Arc<dyn CredentialClient>) -> Self {
        self.credential = Some(CredentialSource::Ready(client));
        self
    }

    /// Create the credential client during `build`, after configuration has
    /// been validated. A factory error fails construction with
    /// `CredentialCreation`.
    pub fn credential_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> credential::Result<Arc<dyn CredentialClient>> + Send + 'static,
    {
        self.credential = Some(CredentialSource::Factory(Box::new(factory)));
        self
    }

    /// Replace the default `MetricsObserver`.
    pub fn observer(mut self, observer: Arc<dyn RefreshObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Tie the refresh loop to a parent token: cancelling `parent` stops the
    /// loop as if `shutdown` had been called.
    pub fn cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = Some(parent.child_token());
        self
    }

    pub async fn build(self) -> Result<TokenProvider> {
        let audience = match self.audience {
            Some(a) if !a.trim().is_empty() => a,
            _ => return Err(Error::Configuration("audience is required".into())),
        };
        let config = self
            .config
            .ok_or_else(|| Error::Configuration("refresh config is required".into()))?;
        config.validate()?;

        let credential = match self.credential {
            Some(CredentialSource::Ready(client)) => client,
            Some(CredentialSource::Factory(factory)) => {
                factory().map_err(Error::CredentialCreation)?
            }
            None => {
                return Err(Error::Configuration(
                    "credential client is required".into(),
                ));
            }
        };

        let refresher = Refresher {
            options: TokenRequestOptions::for_audience(audience.clone()),
            audience: audience.clone(),
            credential,
            policy: SchedulePolicy::from(&config),
            observer: self.observer,
        };

        let attempt = refresher.attempt(SchedulerState::Initializing).await;
        let token = match (attempt.action, attempt.result) {
            (SchedulerAction::Sleep(_), Ok(token)) => token,
            (_, Err(e)) => {
                attempt.span.in_scope(|| {
                    error!(audience = %audience, error = %e, "initial token fetch failed")
                });
                return Err(Error::InitialFetch(e));
            }
            (action, Ok(_)) => {
                warn!(?action, "unexpected scheduler action after initial fetch");
                return Err(Error::InitialFetch(CredentialError::InvalidToken(
                    "initial token could not be scheduled".into(),
                )));
            }
        };

        let initial = TokenState::fetched(token, attempt.now, attempt.refresh_duration);
        info!(
            audience = %audience,
            credential = refresher.credential.id(),
            expires_at = unix_seconds(initial.expires_on()),
            refresh_in_secs = attempt.refresh_duration.as_secs(),
            "token provider initialized"
        );

        let (publisher, state) = watch::channel(Arc::new(initial));
        let cancel = self.cancel.unwrap_or_default();
        let task = tokio::spawn(refresher.run(
            attempt.state,
            attempt.action,
            publisher,
            cancel.clone(),
        ));

        Ok(TokenProvider {
            audience,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{NoopObserver, RefreshReport};
    use credential::{AccessToken, StaticCredential};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    const MINUTE: Duration = Duration::from_secs(60);

    /// Credential client that replays a fixed script of results.
    ///
    /// Tokens expire `lifetime` after the call. Once the script runs out every
    /// call fails.
    struct ScriptedCredential {
        script: std::sync::Mutex<VecDeque<std::result::Result<(&'static str, Duration), &'static str>>>,
        calls: AtomicUsize,
        scopes: std::sync::Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedCredential {
        fn new(
            script: Vec<std::result::Result<(&'static str, Duration), &'static str>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                scopes: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CredentialClient for ScriptedCredential {
        fn id(&self) -> &str {
            "scripted"
        }

        fn get_token<'a>(
            &'a self,
            options: &'a TokenRequestOptions,
        ) -> Pin<Box<dyn Future<Output = credential::Result<AccessToken>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scopes.lock().unwrap().push(options.scopes.clone());
            let next = self.script.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(Ok((token, lifetime))) => {
                        Ok(AccessToken::new(token, SystemTime::now() + lifetime))
                    }
                    Some(Err(msg)) => Err(CredentialError::Request(msg.into())),
                    None => Err(CredentialError::Request("script exhausted".into())),
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        outcomes: std::sync::Mutex<Vec<bool>>,
    }

    impl RefreshObserver for RecordingObserver {
        fn on_refresh(&self, report: &RefreshReport<'_>) {
            self.outcomes.lock().unwrap().push(report.is_success());
        }
    }

    fn config(refresh_percentage: u8, retry_on_failure: bool) -> RefreshConfig {
        RefreshConfig {
            refresh_percentage,
            retry_on_failure,
            retry_interval_secs: 300,
        }
    }

    async fn build(
        credential: Arc<ScriptedCredential>,
        config: RefreshConfig,
    ) -> Result<TokenProvider> {
        TokenProvider::builder()
            .audience("api://backend/.default")
            .config(config)
            .credential(credential)
            .observer(Arc::new(NoopObserver))
            .build()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn initial_fetch_populates_token() {
        let credential = ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE))]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();

        let (token, err) = provider.get_access_token();
        assert_eq!(token, "at_1");
        assert!(err.is_none());
        assert_eq!(credential.calls(), 1);
        assert!(provider.is_refreshing());

        let state = provider.state();
        assert!(state.refresh_duration() <= 20 * MINUTE);
        assert!(state.refresh_duration() > 19 * MINUTE);
        assert!(state.next_refresh().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_audience_as_only_scope() {
        let credential = ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE))]);
        let _provider = build(credential.clone(), config(80, true)).await.unwrap();

        let scopes = credential.scopes.lock().unwrap().clone();
        assert_eq!(scopes, vec![vec!["api://backend/.default".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_replaces_token() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();
        let mut rx = provider.subscribe();

        rx.changed().await.unwrap();

        let (token, err) = provider.get_access_token();
        assert_eq!(token, "at_2");
        assert!(err.is_none());
        assert_eq!(credential.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_does_not_happen_before_schedule() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();

        tokio::time::sleep(19 * MINUTE).await;
        assert_eq!(credential.calls(), 1);
        assert_eq!(provider.get_access_token().0, "at_1");

        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(credential.calls(), 2);
        assert_eq!(provider.get_access_token().0, "at_2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_stale_token_with_error() {
        let credential =
            ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE)), Err("authority unavailable")]);
        let provider = build(credential, config(80, true)).await.unwrap();
        let mut rx = provider.subscribe();

        rx.changed().await.unwrap();

        let (token, err) = provider.get_access_token();
        assert_eq!(token, "at_1");
        assert_eq!(
            err,
            Some(CredentialError::Request("authority unavailable".into()))
        );
        let state = provider.state();
        assert_eq!(state.refresh_duration(), 5 * MINUTE);
        assert!(state.next_refresh().is_some());
        assert!(provider.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_failure_clears_error() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Err("authority unavailable"),
            Ok(("at_3", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();
        let mut rx = provider.subscribe();

        rx.changed().await.unwrap();
        assert!(provider.get_access_token().1.is_some());

        rx.changed().await.unwrap();
        let (token, err) = provider.get_access_token();
        assert_eq!(token, "at_3");
        assert!(err.is_none());
        assert_eq!(credential.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_retry_stops_loop() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Err("authority unavailable"),
            Ok(("never", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, false)).await.unwrap();
        let mut rx = provider.subscribe();

        rx.changed().await.unwrap();
        assert!(rx.changed().await.is_err(), "loop must exit after failure");
        assert!(!provider.is_refreshing());

        tokio::time::sleep(60 * MINUTE).await;
        assert_eq!(credential.calls(), 2);

        let (token, err) = provider.get_access_token();
        assert_eq!(token, "at_1");
        assert!(err.is_some());
        let state = provider.state();
        assert_eq!(state.refresh_duration(), 5 * MINUTE);
        assert!(state.next_refresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_token_retries_in_one_minute() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", Duration::from_secs(5))),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(10, true)).await.unwrap();
        assert_eq!(provider.state().refresh_duration(), MINUTE);

        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;
        assert_eq!(credential.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_failure_fails_construction() {
        let credential = ScriptedCredential::new(vec![Err("bad secret")]);
        let err = build(credential.clone(), config(10, true)).await.unwrap_err();
        assert!(matches!(err, Error::InitialFetch(CredentialError::Request(_))));
        assert!(err.to_string().starts_with("failed to get access token"));

        tokio::time::sleep(60 * MINUTE).await;
        assert_eq!(credential.calls(), 1, "no loop may start after failure");
    }

    #[tokio::test]
    async fn missing_config_is_configuration_error() {
        let credential = ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE))]);
        let err = TokenProvider::builder()
            .audience("api://backend")
            .credential(credential.clone())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn missing_credential_is_configuration_error() {
        let err = TokenProvider::builder()
            .audience("api://backend")
            .config(RefreshConfig::default())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn blank_audience_is_configuration_error() {
        let credential = ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE))]);
        for audience in [None, Some("  ")] {
            let mut builder = TokenProvider::builder()
                .config(RefreshConfig::default())
                .credential(credential.clone());
            if let Some(audience) = audience {
                builder = builder.audience(audience);
            }
            let err = builder.build().await.unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{audience:?}");
        }
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_percentage_is_configuration_error() {
        let credential = ScriptedCredential::new(vec![Ok(("at_1", 100 * MINUTE))]);
        let err = build(credential.clone(), config(101, true)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("refresh_percentage")));
        assert_eq!(credential.calls(), 0);
    }

    #[tokio::test]
    async fn factory_failure_is_credential_creation_error() {
        let err = TokenProvider::builder()
            .audience("api://backend")
            .config(RefreshConfig::default())
            .credential_factory(|| Err(CredentialError::Unavailable("no identity".into())))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CredentialCreation(CredentialError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn factory_not_called_when_config_missing() {
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        let err = TokenProvider::builder()
            .audience("api://backend")
            .credential_factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StaticCredential::new("t", MINUTE)) as Arc<dyn CredentialClient>)
            })
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn factory_success_builds_provider() {
        let provider = TokenProvider::builder()
            .audience("api://backend")
            .config(RefreshConfig::default())
            .credential_factory(|| {
                Ok(Arc::new(StaticCredential::new("at_static", 60 * MINUTE))
                    as Arc<dyn CredentialClient>)
            })
            .observer(Arc::new(NoopObserver))
            .build()
            .await
            .unwrap();
        assert_eq!(provider.get_access_token().0, "at_static");
        assert_eq!(provider.audience(), "api://backend");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_refreshing() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();

        provider.shutdown().await;
        assert!(!provider.is_refreshing());

        tokio::time::sleep(60 * MINUTE).await;
        assert_eq!(credential.calls(), 1);
        assert_eq!(provider.get_access_token().0, "at_1");

        // second call is a no-op
        provider.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_loop() {
        let parent = CancellationToken::new();
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = TokenProvider::builder()
            .audience("api://backend")
            .config(config(80, true))
            .credential(credential.clone())
            .observer(Arc::new(NoopObserver))
            .cancellation(&parent)
            .build()
            .await
            .unwrap();
        let mut rx = provider.subscribe();

        parent.cancel();
        assert!(rx.changed().await.is_err());
        assert_eq!(credential.calls(), 1);
        assert!(!provider.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_provider_stops_loop() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Ok(("at_2", 100 * MINUTE)),
        ]);
        let provider = build(credential.clone(), config(80, true)).await.unwrap();
        let mut rx = provider.subscribe();

        drop(provider);
        assert!(rx.changed().await.is_err());
        assert_eq!(credential.calls(), 1);
    }

    /// Hands out one token, then never answers.
    #[derive(Default)]
    struct HangingCredential {
        calls: AtomicUsize,
    }

    impl CredentialClient for HangingCredential {
        fn id(&self) -> &str {
            "hanging"
        }

        fn get_token<'a>(
            &'a self,
            _options: &'a TokenRequestOptions,
        ) -> Pin<Box<dyn Future<Output = credential::Result<AccessToken>> + Send + 'a>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if call > 0 {
                    std::future::pending::<()>().await;
                }
                Ok(AccessToken::new("at_1", SystemTime::now() + 100 * MINUTE))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_fetch_publishes_nothing() {
        let credential = Arc::new(HangingCredential::default());
        let observer = Arc::new(RecordingObserver::default());
        let provider = TokenProvider::builder()
            .audience("api://backend")
            .config(config(80, true))
            .credential(credential.clone())
            .observer(observer.clone())
            .build()
            .await
            .unwrap();
        let rx = provider.subscribe();

        tokio::time::sleep(25 * MINUTE).await;
        assert_eq!(credential.calls.load(Ordering::SeqCst), 2);

        provider.shutdown().await;

        assert!(rx.has_changed().is_err());
        assert!(!provider.is_refreshing());
        assert_eq!(*observer.outcomes.lock().unwrap(), vec![true]);
        assert_eq!(provider.get_access_token(), ("at_1".to_string(), None));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_attempt() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Err("authority unavailable"),
            Ok(("at_3", 100 * MINUTE)),
        ]);
        let observer = Arc::new(RecordingObserver::default());
        let provider = TokenProvider::builder()
            .audience("api://backend")
            .config(config(80, true))
            .credential(credential)
            .observer(observer.clone())
            .build()
            .await
            .unwrap();
        let mut rx = provider.subscribe();

        rx.changed().await.unwrap();
        rx.changed().await.unwrap();

        assert_eq!(*observer.outcomes.lock().unwrap(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn readers_never_see_mixed_snapshots() {
        let credential = ScriptedCredential::new(vec![
            Ok(("at_1", 100 * MINUTE)),
            Err("after at_1"),
            Ok(("at_3", 100 * MINUTE)),
            Err("after at_3"),
            Ok(("at_5", 100 * MINUTE)),
        ]);
        let provider = Arc::new(build(credential, config(80, true)).await.unwrap());

        let mut readers = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            let mut rx = provider.subscribe();
            readers.push(tokio::spawn(async move {
                let mut seen = 0;
                loop {
                    let (token, err) = provider.get_access_token();
                    if let Some(CredentialError::Request(msg)) = &err {
                        assert_eq!(msg, &format!("after {token}"));
                    }
                    seen += 1;
                    if token == "at_5" {
                        return seen;
                    }
                    rx.changed().await.unwrap();
                }
            }));
        }

        for reader in readers {
            assert!(reader.await.unwrap() >= 1);
        }
    }
}
