//! Check / skip / throttle policy.
//!
//! All persisted preferences go through [`UpdatePolicy`]; nothing else
//! writes the preference keys, so the interval bounds and skip-window
//! rules cannot be bypassed.
//!
//! Reads degrade: a missing, unreadable or malformed value yields the
//! default. Writes propagate their [`ConfigError`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::{self, ConfigKey, ConfigStore};
use crate::error::ConfigError;

/// Default days between automatic checks.
pub const DEFAULT_AUTO_INTERVAL_DAYS: u32 = 2;
pub const MIN_AUTO_INTERVAL_DAYS: u32 = 1;
pub const MAX_AUTO_INTERVAL_DAYS: u32 = 60;

/// Default days a skipped version stays suppressed.
pub const DEFAULT_SKIP_INTERVAL_DAYS: i32 = 14;
pub const MAX_SKIP_INTERVAL_DAYS: i32 = 180;
/// Skip interval meaning "until the offered version changes".
pub const SKIP_FOREVER: i32 = -1;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock set to the given Unix time.
    pub fn at(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}

/// How an update check was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Turn automatic checks off.
    Disable,
    /// Turn automatic checks on and check now.
    Enable,
    /// Scheduled background check, throttled by the interval.
    Auto,
    /// Ask the user if they never decided.
    Prompt,
    /// Check now and ignore a skipped version.
    IgnoreSkip,
    /// Offer the latest release even if it is already installed.
    Reinstall,
}

impl Mode {
    /// Modes that force the enabled path without consulting the policy.
    pub fn bypasses_policy(self) -> bool {
        matches!(self, Self::IgnoreSkip | Self::Reinstall)
    }
}

/// Policy decision for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disabled,
    Enabled,
    /// The interval has not elapsed; do not touch the network.
    AlreadyChecked,
    /// The user has not decided whether to check automatically.
    NeedsPrompt,
}

/// Snapshot of the persisted policy fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicyState {
    /// `None` when the user never decided.
    pub auto_check: Option<bool>,
    pub auto_once: bool,
    pub auto_last: Option<DateTime<Utc>>,
    pub auto_interval_days: u32,
    /// `false` when skipping is disabled (`AutoSkip = 0`).
    pub auto_skip: bool,
    pub auto_channel: Option<String>,
    pub auto_host: Option<String>,
    pub skip_version: Option<String>,
    pub skip_time: Option<DateTime<Utc>>,
    pub skip_interval_days: i32,
}

impl Default for UpdatePolicyState {
    fn default() -> Self {
        Self {
            auto_check: None,
            auto_once: false,
            auto_last: None,
            auto_interval_days: DEFAULT_AUTO_INTERVAL_DAYS,
            auto_skip: true,
            auto_channel: None,
            auto_host: None,
            skip_version: None,
            skip_time: None,
            skip_interval_days: DEFAULT_SKIP_INTERVAL_DAYS,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn clamp_auto_interval(days: i64) -> u32 {
    days.clamp(MIN_AUTO_INTERVAL_DAYS as i64, MAX_AUTO_INTERVAL_DAYS as i64) as u32
}

fn clamp_skip_interval(days: i64) -> i32 {
    if days < 0 {
        SKIP_FOREVER
    } else {
        days.min(MAX_SKIP_INTERVAL_DAYS as i64) as i32
    }
}

/// The check/skip state machine over a [`ConfigStore`].
pub struct UpdatePolicy {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl UpdatePolicy {
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Policy on the wall clock.
    pub fn with_system_clock(store: Arc<dyn ConfigStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------------

    fn read(&self, key: ConfigKey) -> Option<String> {
        match self.store.read(key) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                warn!(%key, error = %e, "Cannot read preference; using default");
                None
            }
        }
    }

    fn write(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        self.store.write(key, value)
    }

    fn write_time(&self, key: ConfigKey, time: DateTime<Utc>) -> Result<(), ConfigError> {
        self.write(key, &time.timestamp().to_string())
    }

    fn read_bool(&self, key: ConfigKey) -> Option<bool> {
        let raw = self.read(key)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(%key, value = %raw, "Ignoring malformed boolean preference");
        }
        parsed
    }

    fn read_time(&self, key: ConfigKey) -> Option<DateTime<Utc>> {
        let raw = self.read(key)?;
        let parsed = parse_time(&raw);
        if parsed.is_none() {
            warn!(%key, value = %raw, "Ignoring malformed timestamp preference");
        }
        parsed
    }

    /// Load every policy field, falling back to defaults.
    pub fn state(&self) -> UpdatePolicyState {
        let defaults = UpdatePolicyState::default();
        UpdatePolicyState {
            auto_check: self.read_bool(ConfigKey::AutoCheck),
            auto_once: self.read_bool(ConfigKey::AutoOnce).unwrap_or(false),
            auto_last: self.read_time(ConfigKey::AutoLast),
            auto_interval_days: self
                .read(ConfigKey::AutoInterval)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(clamp_auto_interval)
                .unwrap_or(defaults.auto_interval_days),
            auto_skip: self.read_bool(ConfigKey::AutoSkip).unwrap_or(true),
            auto_channel: self.read(ConfigKey::AutoChannel),
            auto_host: self.read(ConfigKey::AutoHost),
            skip_version: self.read(ConfigKey::SkipVersion),
            skip_time: self.read_time(ConfigKey::SkipTime),
            skip_interval_days: self
                .read(ConfigKey::SkipInterval)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(clamp_skip_interval)
                .unwrap_or(defaults.skip_interval_days),
        }
    }

    // ------------------------------------------------------------------------
    // Check decision
    // ------------------------------------------------------------------------

    /// Decide whether a check in `mode` should proceed.
    ///
    /// [`Mode::IgnoreSkip`] and [`Mode::Reinstall`] are not meant to be
    /// passed here; they are reported as [`Status::Enabled`] without
    /// touching any state.
    ///
    /// # Errors
    ///
    /// Propagates failures to persist a changed setting.
    pub fn status_for(&self, mode: Mode) -> Result<Status, ConfigError> {
        match mode {
            Mode::IgnoreSkip | Mode::Reinstall => return Ok(Status::Enabled),
            Mode::Disable => {
                self.write(ConfigKey::AutoCheck, "0")?;
                info!("Automatic update checks disabled");
                return Ok(Status::Disabled);
            }
            Mode::Enable => {
                self.write(ConfigKey::AutoCheck, "1")?;
                self.store.delete(ConfigKey::AutoLast)?;
                info!("Automatic update checks enabled");
                return Ok(Status::Enabled);
            }
            Mode::Auto => {
                let now = self.now();
                let interval = self.state().auto_interval_days;
                if let Some(last) = self.read_time(ConfigKey::AutoLast) {
                    let next = last + Duration::days(interval as i64);
                    if now < next {
                        debug!(%last, %next, "Checked recently; skipping");
                        return Ok(Status::AlreadyChecked);
                    }
                }
                self.write_time(ConfigKey::AutoLast, now)?;
            }
            Mode::Prompt => {}
        }

        Ok(match self.read_bool(ConfigKey::AutoCheck) {
            Some(true) => Status::Enabled,
            Some(false) if mode == Mode::Auto => Status::Disabled,
            Some(false) | None => Status::NeedsPrompt,
        })
    }

    /// Persist the user's answer to "check automatically?".
    pub fn set_auto_check(&self, enabled: bool) -> Result<(), ConfigError> {
        self.write(ConfigKey::AutoCheck, if enabled { "1" } else { "0" })
    }

    /// Set the automatic check interval, clamped to 1..=60 days.
    pub fn set_auto_interval(&self, days: u32) -> Result<u32, ConfigError> {
        let days = clamp_auto_interval(days as i64);
        self.write(ConfigKey::AutoInterval, &days.to_string())?;
        Ok(days)
    }

    /// Record that one update has been installed through the updater.
    pub fn mark_checked_once(&self) -> Result<(), ConfigError> {
        self.write(ConfigKey::AutoOnce, "1")
    }

    // ------------------------------------------------------------------------
    // Skip window
    // ------------------------------------------------------------------------

    /// Suppress `version` for the skip interval, starting now.
    pub fn skip(&self, version: &str) -> Result<(), ConfigError> {
        let version = version.trim();
        self.write(ConfigKey::SkipVersion, version)?;
        self.write_time(ConfigKey::SkipTime, self.now())?;
        info!(version, "Skipping version");
        Ok(())
    }

    /// Set the skip interval: 0..=180 days, negative for "forever".
    pub fn set_skip_interval(&self, days: i32) -> Result<i32, ConfigError> {
        let days = clamp_skip_interval(days as i64);
        self.write(ConfigKey::SkipInterval, &days.to_string())?;
        Ok(days)
    }

    /// Enable or disable the skip window altogether.
    pub fn set_auto_skip(&self, enabled: bool) -> Result<(), ConfigError> {
        self.write(ConfigKey::AutoSkip, if enabled { "1" } else { "0" })
    }

    fn clear_skip(&self) -> Result<(), ConfigError> {
        self.store.delete(ConfigKey::SkipVersion)?;
        self.store.delete(ConfigKey::SkipTime)
    }

    /// Whether `candidate` is inside its skip window.
    ///
    /// A stale skip (other version, or expired window) is cleared. A skip
    /// that is still active is left untouched, so repeated calls agree.
    pub fn is_skipped(&self, candidate: &str) -> Result<bool, ConfigError> {
        let state = self.state();
        if !state.auto_skip {
            return Ok(false);
        }
        let Some(skipped) = state.skip_version else {
            return Ok(false);
        };

        if skipped != candidate.trim() {
            debug!(skipped = %skipped, candidate, "Skipped version superseded");
            self.clear_skip()?;
            return Ok(false);
        }

        if state.skip_interval_days < 0 {
            return Ok(true);
        }

        let expired = match state.skip_time {
            Some(since) => {
                self.now() >= since + Duration::days(state.skip_interval_days as i64)
            }
            None => true,
        };
        if expired {
            debug!(version = candidate, "Skip window expired");
            self.clear_skip()?;
            return Ok(false);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Overrides and maintenance
    // ------------------------------------------------------------------------

    /// Persisted channel override, if any.
    pub fn channel_override(&self) -> Option<String> {
        self.read(ConfigKey::AutoChannel).map(|c| c.trim().to_string())
    }

    /// Persisted feed URL override, if any.
    pub fn host_override(&self) -> Option<String> {
        self.read(ConfigKey::AutoHost).map(|h| h.trim().to_string())
    }

    pub fn set_channel_override(&self, channel: Option<&str>) -> Result<(), ConfigError> {
        match channel {
            Some(channel) => self.write(ConfigKey::AutoChannel, channel),
            None => self.store.delete(ConfigKey::AutoChannel),
        }
    }

    pub fn set_host_override(&self, host: Option<&str>) -> Result<(), ConfigError> {
        match host {
            Some(host) => self.write(ConfigKey::AutoHost, host),
            None => self.store.delete(ConfigKey::AutoHost),
        }
    }

    /// Forget every persisted preference.
    pub fn reset(&self) -> Result<(), ConfigError> {
        config::reset(self.store.as_ref())
    }

    /// All persisted preferences, for diagnostics.
    pub fn dump(&self) -> Vec<(ConfigKey, Option<String>)> {
        config::dump(self.store.as_ref())
    }
}
