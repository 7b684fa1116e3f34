use std::time::Duration;

/// Environment-driven knobs for the engine. This is the *complete* set of
/// externally tunable knobs that affect engine semantics (§6) — nothing
/// else should be threaded in from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Diff Gate: downsample the wider dimension of a captured frame to at
    /// most this many pixels before comparing it to the previous frame.
    pub diff_downsample_width: u32,
    /// Diff Gate: per-channel intensity difference (0–255) above which a
    /// pixel counts as "changed".
    pub diff_pixel_threshold: u8,
    /// Diff Gate: fraction of changed pixels (0.0–1.0) above which a frame
    /// is considered different enough to warrant a vision call.
    pub diff_change_ratio: f64,
    /// Lower clamp on a job's effective poll interval.
    pub min_poll: Duration,
    /// Upper clamp on a job's effective poll interval.
    pub max_poll: Duration,
    /// Default timeout applied when a caller doesn't specify one.
    pub default_timeout: Duration,
    /// Wall-clock budget the Wake Notifier is given per call.
    pub wake_notify_timeout: Duration,
    /// Prefix used in wake text, e.g. `"smart_wait"` yields
    /// `"[smart_wait resolved] ..."`.
    pub wake_state_prefix: String,
}

impl EngineConfig {
    /// Default Diff Gate downsample width, in pixels (§4.2).
    pub const DEFAULT_DIFF_DOWNSAMPLE_WIDTH: u32 = 320;
    /// Default Diff Gate per-channel change threshold, out of 255 (§4.2).
    pub const DEFAULT_DIFF_PIXEL_THRESHOLD: u8 = 10;
    /// Default Diff Gate changed-pixel ratio, as a fraction (§4.2).
    pub const DEFAULT_DIFF_CHANGE_RATIO: f64 = 0.01;
    /// Default lower poll-interval clamp.
    pub const DEFAULT_MIN_POLL: Duration = Duration::from_millis(500);
    /// Default upper poll-interval clamp.
    pub const DEFAULT_MAX_POLL: Duration = Duration::from_secs(30);
    /// Default timeout applied when a caller doesn't specify one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
    /// Default Wake Notifier wall-clock budget (§4.5).
    pub const DEFAULT_WAKE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default wake-text prefix.
    pub const DEFAULT_WAKE_STATE_PREFIX: &'static str = "smart_wait";

    /// Build the config from its compiled-in defaults.
    pub fn defaults() -> Self {
        Self {
            diff_downsample_width: Self::DEFAULT_DIFF_DOWNSAMPLE_WIDTH,
            diff_pixel_threshold: Self::DEFAULT_DIFF_PIXEL_THRESHOLD,
            diff_change_ratio: Self::DEFAULT_DIFF_CHANGE_RATIO,
            min_poll: Self::DEFAULT_MIN_POLL,
            max_poll: Self::DEFAULT_MAX_POLL,
            default_timeout: Self::DEFAULT_TIMEOUT,
            wake_notify_timeout: Self::DEFAULT_WAKE_NOTIFY_TIMEOUT,
            wake_state_prefix: Self::DEFAULT_WAKE_STATE_PREFIX.to_string(),
        }
    }

    /// Read the enumerated `SMARTWAIT_*` environment variables, falling back
    /// to defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut cfg = Self::defaults();

        if let Some(v) = env_u32("SMARTWAIT_DIFF_DOWNSAMPLE_WIDTH") {
            cfg.diff_downsample_width = v;
        }
        if let Some(v) = env_u8("SMARTWAIT_DIFF_PIXEL_THRESHOLD") {
            cfg.diff_pixel_threshold = v;
        }
        if let Some(v) = env_f64("SMARTWAIT_DIFF_CHANGE_RATIO") {
            cfg.diff_change_ratio = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_f64("SMARTWAIT_MIN_POLL_S") {
            cfg.min_poll = secs(v);
        }
        if let Some(v) = env_f64("SMARTWAIT_MAX_POLL_S") {
            cfg.max_poll = secs(v);
        }
        if let Some(v) = env_f64("SMARTWAIT_DEFAULT_TIMEOUT_S") {
            cfg.default_timeout = secs(v);
        }
        if let Some(v) = env_f64("SMARTWAIT_WAKE_NOTIFY_TIMEOUT_S") {
            cfg.wake_notify_timeout = secs(v);
        }
        if let Ok(v) = std::env::var("SMARTWAIT_WAKE_STATE_PREFIX") {
            if !v.is_empty() {
                cfg.wake_state_prefix = v;
            }
        }

        cfg.normalize();
        cfg
    }

    /// Clamp a requested base poll interval into `[min_poll, max_poll]`.
    pub fn clamp_poll(&self, requested: Duration) -> Duration {
        requested.clamp(self.min_poll, self.max_poll)
    }

    /// Repair an inconsistent config, the way the engine defensively
    /// normalizes whatever `EngineConfig` it's started with.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Repair an inconsistent config in place (zero/inverted values fall
    /// back to documented defaults), mirroring the normalization the engine
    /// loop applies to its own config before starting.
    fn normalize(&mut self) {
        if self.diff_downsample_width == 0 {
            self.diff_downsample_width = Self::DEFAULT_DIFF_DOWNSAMPLE_WIDTH;
        }
        if self.min_poll.is_zero() {
            self.min_poll = Self::DEFAULT_MIN_POLL;
        }
        if self.max_poll < self.min_poll {
            self.max_poll = self.min_poll;
        }
        if self.default_timeout.is_zero() {
            self.default_timeout = Self::DEFAULT_TIMEOUT;
        }
        if self.wake_notify_timeout.is_zero() {
            self.wake_notify_timeout = Self::DEFAULT_WAKE_NOTIFY_TIMEOUT;
        }
        if self.wake_state_prefix.trim().is_empty() {
            self.wake_state_prefix = Self::DEFAULT_WAKE_STATE_PREFIX.to_string();
        }
    }
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u8(key: &str) -> Option<u8> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
