//! Contains the options to configure the request handlers.
use std::time::Duration;

use crate::store::RetryPolicy;

/// Options of the request handlers and the in-memory store.
///
/// The retry options only take effect through [`PatcherOptions::retry_policy`],
/// which is passed to [`InMemoryStore::with_retry_policy`]. A
/// [`ResourceHandler`] leaves retrying to its store and ignores them.
///
/// [`InMemoryStore::with_retry_policy`]: crate::InMemoryStore::with_retry_policy
/// [`ResourceHandler`]: crate::ResourceHandler
///
/// The [`Default`] implementation contains the following values:
///
/// - Dry-run requests are enabled.
/// - Requests time out after 30 seconds, unless they specify a timeout.
/// - Updates are attempted at most 5 times on concurrent modifications,
///   without waiting in between.
///
/// Additionally, this struct can be used as CLI arguments.
///
/// ```
/// use std::time::Duration;
///
/// use stackable_patcher::PatcherOptions;
///
/// let options = PatcherOptions::builder()
///     .dry_run_enabled(false)
///     .request_timeout(Duration::from_secs(10))
///     .build();
///
/// assert!(!options.dry_run_enabled());
/// assert_eq!(options.retry_policy().max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
#[command(next_help_heading = "Patch Options")]
pub struct PatcherOptions {
    /// Reject requests which ask for a dry run.
    #[arg(long, env)]
    pub disable_dry_run: bool,

    /// The timeout of requests which don't specify one themselves.
    #[arg(long, env, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// How often the in-memory store attempts an update when the object is
    /// modified concurrently.
    #[arg(long, env, default_value_t = 5)]
    pub max_update_attempts: u32,

    /// How long the in-memory store waits before retrying an update after a
    /// concurrent modification.
    #[arg(long, env, default_value = "0s")]
    pub update_backoff: humantime::Duration,
}

impl Default for PatcherOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PatcherOptions {
    /// Returns the default [`PatcherOptionsBuilder`].
    pub fn builder() -> PatcherOptionsBuilder {
        PatcherOptionsBuilder::default()
    }

    pub fn dry_run_enabled(&self) -> bool {
        !self.disable_dry_run
    }

    /// The retry policy for [`InMemoryStore::with_retry_policy`].
    ///
    /// [`InMemoryStore::with_retry_policy`]: crate::InMemoryStore::with_retry_policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_update_attempts,
            backoff: self.update_backoff.into(),
        }
    }
}

/// Selectively customizes [`PatcherOptions`].
#[derive(Debug, Default)]
pub struct PatcherOptionsBuilder {
    dry_run_enabled: Option<bool>,
    request_timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
}

impl PatcherOptionsBuilder {
    /// Enables or disables the dry-run feature.
    pub fn dry_run_enabled(mut self, enabled: bool) -> Self {
        self.dry_run_enabled = Some(enabled);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Builds the final [`PatcherOptions`] by using default values for any not
    /// explicitly set option.
    pub fn build(self) -> PatcherOptions {
        let retry_policy = self.retry_policy.unwrap_or_default();
        PatcherOptions {
            disable_dry_run: !self.dry_run_enabled.unwrap_or(true),
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_secs(30))
                .into(),
            max_update_attempts: retry_policy.max_attempts,
            update_backoff: retry_policy.backoff.into(),
        }
    }
}
