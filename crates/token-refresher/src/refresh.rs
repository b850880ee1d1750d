//! Background refresh loop
//!
//! Executes the scheduler's actions: sleeps, calls the credential client,
//! publishes a new `TokenState` after every attempt and reports the attempt
//! to the observer. The loop is the only writer of the token state; readers
//! hold a `watch::Receiver` and clone the current `Arc<TokenState>`.
//!
//! Cancellation is observed at both suspension points (the sleep and the
//! credential call). A fetch cancelled mid-flight publishes nothing.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use credential::{AccessToken, CredentialClient, TokenRequestOptions};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span};

use crate::observer::{RefreshObserver, RefreshReport};
use crate::schedule::unix_seconds;
use crate::scheduler::{
    SchedulePolicy, SchedulerAction, SchedulerEvent, SchedulerState, handle_event,
};
use crate::state::TokenState;

/// One fetch attempt after the scheduler has seen its outcome.
pub(crate) struct Attempt {
    pub state: SchedulerState,
    pub action: SchedulerAction,
    pub result: credential::Result<AccessToken>,
    pub now: SystemTime,
    /// Delay the scheduler chose; the retry interval when stopping
    pub refresh_duration: Duration,
    /// `refresh_token` span of this attempt, with its outcome recorded
    pub span: Span,
}

/// Everything the loop needs to fetch and report a token.
pub(crate) struct Refresher {
    pub audience: String,
    pub credential: Arc<dyn CredentialClient>,
    pub options: TokenRequestOptions,
    pub policy: SchedulePolicy,
    pub observer: Arc<dyn RefreshObserver>,
}

impl Refresher {
    /// Fetch once from `state` (Initializing or Refreshing) and advance the
    /// scheduler with the outcome. The fetch and the observer run inside a
    /// `refresh_token` span carrying the outcome and the schedule it produced.
    pub(crate) async fn attempt(&self, state: SchedulerState) -> Attempt {
        let span = info_span!(
            "refresh_token",
            audience = %self.audience,
            credential = self.credential.id(),
            is_success = field::Empty,
            error = field::Empty,
            token.expiry_timestamp = field::Empty,
            tokenrefresh.next_refresh_timestamp = field::Empty,
            tokenrefresh.refresh_duration = field::Empty,
        );

        let result = self
            .credential
            .get_token(&self.options)
            .instrument(span.clone())
            .await;
        let now = SystemTime::now();

        let event = match &result {
            Ok(token) => SchedulerEvent::Fetched {
                expires_on: token.expires_on,
                now,
            },
            Err(_) => SchedulerEvent::FetchFailed,
        };
        let (state, action) = handle_event(&self.policy, state, event);

        let refresh_duration = match state {
            SchedulerState::Waiting { delay } => delay,
            _ => self.policy.retry_interval,
        };
        let next_refresh = matches!(action, SchedulerAction::Sleep(_)).then(|| now + refresh_duration);
        let expires_on = result.as_ref().ok().map(|t| t.expires_on);

        span.record("is_success", result.is_ok());
        if let Err(err) = &result {
            span.record("error", field::display(err));
        }
        span.record(
            "tokenrefresh.refresh_duration",
            field::debug(refresh_duration),
        );
        if let Some(expires_on) = expires_on {
            span.record("token.expiry_timestamp", unix_seconds(expires_on));
        }
        if let Some(next) = next_refresh {
            span.record("tokenrefresh.next_refresh_timestamp", unix_seconds(next));
        }

        span.in_scope(|| {
            self.observer.on_refresh(&RefreshReport {
                audience: &self.audience,
                error: result.as_ref().err(),
                expires_on,
                next_refresh,
                refresh_duration,
            })
        });

        Attempt {
            state,
            action,
            result,
            now,
            refresh_duration,
            span,
        }
    }

    /// Run the loop until cancelled or until the scheduler stops it.
    ///
    /// `state`/`action` are the scheduler's output for the initial fetch.
    pub(crate) async fn run(
        self,
        mut state: SchedulerState,
        mut action: SchedulerAction,
        publisher: watch::Sender<Arc<TokenState>>,
        cancel: CancellationToken,
    ) {
        loop {
            match action {
                SchedulerAction::Sleep(delay) => {
                    debug!(
                        audience = %self.audience,
                        delay_secs = delay.as_secs(),
                        "waiting for next token refresh"
                    );
                    let event = tokio::select! {
                        _ = cancel.cancelled() => SchedulerEvent::Cancelled,
                        _ = tokio::time::sleep(delay) => SchedulerEvent::TimerElapsed,
                    };
                    (state, action) = handle_event(&self.policy, state, event);
                }
                SchedulerAction::Fetch => {
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => None,
                        attempt = self.attempt(state) => Some(attempt),
                    };
                    let Some(attempt) = attempt else {
                        (state, action) =
                            handle_event(&self.policy, state, SchedulerEvent::Cancelled);
                        continue;
                    };
                    self.publish(&publisher, &attempt);
                    (state, action) = (attempt.state, attempt.action);
                }
                SchedulerAction::Stop | SchedulerAction::AbortConstruction => break,
                SchedulerAction::None => {
                    error!(?state, "refresh scheduler stalled, stopping refresh loop");
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            info!(audience = %self.audience, "token refresh loop cancelled");
        } else {
            info!(
                audience = %self.audience,
                "token refresh loop stopped, serving last token until shutdown"
            );
        }
    }

    /// Publish the snapshot for a background attempt, logging inside its span.
    fn publish(&self, publisher: &watch::Sender<Arc<TokenState>>, attempt: &Attempt) {
        let _entered = attempt.span.enter();
        let refresh_duration = attempt.refresh_duration;

        let next = match &attempt.result {
            Ok(token) => {
                info!(
                    audience = %self.audience,
                    expires_at = unix_seconds(token.expires_on),
                    refresh_in_secs = refresh_duration.as_secs(),
                    "token refreshed"
                );
                TokenState::fetched(token.clone(), attempt.now, refresh_duration)
            }
            Err(err) => {
                let retrying = matches!(attempt.action, SchedulerAction::Sleep(_));
                error!(
                    audience = %self.audience,
                    error = %err,
                    retrying,
                    retry_in_secs = refresh_duration.as_secs(),
                    "failed to refresh token"
                );
                publisher
                    .borrow()
                    .failed(err.clone(), attempt.now, refresh_duration, retrying)
            }
        };

        publisher.send_replace(Arc::new(next));
    }
}
