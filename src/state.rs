//! Shared application state for Axum handlers.
//!
//! Holds the security components built from [`Config`] and owns the
//! background maintenance tasks:
//!
//! - **Store sweep**: drops expired revocations and counters from the
//!   in-memory backend (Redis expires keys itself)
//! - **Key rotation**: rotates the current DEK once it is older than
//!   `KEY_ROTATION_DAYS`
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::crypto::KeyManager;
use crate::error::{AppError, AppResult};
use crate::middleware::{PipelineSettings, SecurityPipeline};
use crate::ratelimit::RateLimiter;
use crate::store::StoreHandle;
use crate::token::{TokenService, TokenSettings};
use crate::validation::InputValidator;

/// How often the key rotation task checks the current DEK's age.
const KEY_AGE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state, cloned per request.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::from_config(config, SystemClock::shared()).await?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub store: StoreHandle,
    pub tokens: Arc<TokenService>,
    pub keys: Arc<KeyManager>,
    /// `None` when no rate limit rule is enabled
    pub limiter: Option<RateLimiter>,
    pub validator: Arc<InputValidator>,
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build every component from `config`: connect the store, then load or
    /// create the keyring.
    pub async fn from_config(config: Config, clock: SharedClock) -> AppResult<Self> {
        let store = StoreHandle::from_config(&config, clock.clone()).await?;

        // PBKDF2 and file I/O
        let keys = {
            let config = config.clone();
            let clock = clock.clone();
            tokio::task::spawn_blocking(move || KeyManager::from_config(&config, clock))
                .await
                .map_err(|e| AppError::Internal(format!("Keyring task failed: {e}")))??
        };

        Self::new(config, store, Arc::new(keys), clock)
    }

    /// Assemble state from already built store and key manager, and start
    /// the background tasks.
    pub fn new(
        config: Config,
        store: StoreHandle,
        keys: Arc<KeyManager>,
        clock: SharedClock,
    ) -> AppResult<Self> {
        let tokens = TokenService::new(
            &TokenSettings::from_config(&config),
            Arc::new(store.clone()),
            clock.clone(),
        )
        .with_failure_policy(config.store_failure_policy);

        let limiter = config.rate_limiting_enabled().then(|| {
            RateLimiter::new(
                config.rate_limit_policy.clone(),
                Arc::new(store.clone()),
                clock.clone(),
            )
        });

        let validator = InputValidator::with_families(&config.validation_rules, config.max_url_length)?;

        let state = Self {
            config: Arc::new(config),
            clock,
            store,
            tokens: Arc::new(tokens),
            keys,
            limiter,
            validator: Arc::new(validator),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_store_sweep_task();
        state.spawn_key_rotation_task();

        Ok(state)
    }

    /// The security pipeline over this state's components.
    pub fn pipeline(&self) -> SecurityPipeline {
        SecurityPipeline::new(
            self.tokens.clone(),
            self.limiter.clone(),
            self.validator.clone(),
            PipelineSettings::from_config(&self.config),
        )
    }

    fn spawn_store_sweep_task(&self) {
        let store = self.store.clone();
        let period = self.config.store_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Store sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        trace!(removed, "Swept expired store entries");
                    }
                }
            }

            debug!("Store sweep task shutting down");
        });
    }

    fn spawn_key_rotation_task(&self) {
        if self.config.key_rotation_age().is_none() {
            info!("Automatic key rotation disabled (KEY_ROTATION_DAYS=0)");
            return;
        }

        let keys = self.keys.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(KEY_AGE_CHECK_INTERVAL);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Key rotation task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let keys = keys.clone();
                        match tokio::task::spawn_blocking(move || keys.rotate_if_stale()).await {
                            Ok(Ok(Some(kid))) => info!(kid = %kid, "Rotated stale encryption key"),
                            Ok(Ok(None)) => trace!("Current encryption key is within its rotation age"),
                            Ok(Err(e)) => error!(error = %e, "Scheduled key rotation failed"),
                            Err(e) => error!(error = %e, "Key rotation task panicked"),
                        }
                    }
                }
            }

            debug!("Key rotation task shutting down");
        });
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
