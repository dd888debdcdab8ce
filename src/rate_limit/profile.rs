//! Named rate-limit profiles.
//!
//! Each profile is an independent `{points, window, block_duration}` budget.
//! Profiles are read from the environment once at startup and never change.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Identifier of a configured profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    /// General API traffic.
    Api,
    /// Login and other credential endpoints.
    Auth,
    /// Token issuance.
    Token,
    /// Penalty budget consumed by failed credential checks.
    FailedAuth,
    /// File uploads.
    Upload,
}

impl ProfileName {
    /// All profiles, in configuration order.
    pub const ALL: [ProfileName; 5] = [
        ProfileName::Api,
        ProfileName::Auth,
        ProfileName::Token,
        ProfileName::FailedAuth,
        ProfileName::Upload,
    ];

    /// Lowercase name used in counter keys and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileName::Api => "api",
            ProfileName::Auth => "auth",
            ProfileName::Token => "token",
            ProfileName::FailedAuth => "failed_auth",
            ProfileName::Upload => "upload",
        }
    }

    /// Environment variable prefix segment (`RATE_LIMIT_<SEGMENT>_POINTS`).
    pub fn env_segment(self) -> &'static str {
        match self {
            ProfileName::Api => "API",
            ProfileName::Auth => "AUTH",
            ProfileName::Token => "TOKEN",
            ProfileName::FailedAuth => "FAILED_AUTH",
            ProfileName::Upload => "UPLOAD",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rate-limit budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitProfile {
    pub name: ProfileName,
    /// Maximum requests per window.
    pub points: u32,
    /// Counting window.
    pub window: Duration,
    /// How long a penalized key stays charged.
    pub block_duration: Duration,
}

impl RateLimitProfile {
    pub fn new(name: ProfileName, points: u32, window_secs: u64, block_secs: u64) -> Self {
        Self {
            name,
            points,
            window: Duration::from_secs(window_secs),
            block_duration: Duration::from_secs(block_secs),
        }
    }

    /// Built-in default for a profile.
    pub fn default_for(name: ProfileName) -> Self {
        match name {
            ProfileName::Api => Self::new(name, 100, 60, 60),
            ProfileName::Auth => Self::new(name, 5, 900, 900),
            ProfileName::Token => Self::new(name, 10, 60, 300),
            ProfileName::FailedAuth => Self::new(name, 5, 900, 3600),
            ProfileName::Upload => Self::new(name, 10, 60, 300),
        }
    }

    /// Denial hint: the window length rounded up to whole seconds.
    pub fn window_retry_after_secs(&self) -> u64 {
        let millis = self.window.as_millis();
        u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
    }
}

/// The full set of profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitProfiles {
    pub api: RateLimitProfile,
    pub auth: RateLimitProfile,
    pub token: RateLimitProfile,
    pub failed_auth: RateLimitProfile,
    pub upload: RateLimitProfile,
}

impl RateLimitProfiles {
    /// Look up a profile by name.
    pub fn get(&self, name: ProfileName) -> &RateLimitProfile {
        match name {
            ProfileName::Api => &self.api,
            ProfileName::Auth => &self.auth,
            ProfileName::Token => &self.token,
            ProfileName::FailedAuth => &self.failed_auth,
            ProfileName::Upload => &self.upload,
        }
    }

    /// Iterate over all profiles.
    pub fn iter(&self) -> impl Iterator<Item = &RateLimitProfile> {
        ProfileName::ALL.into_iter().map(|name| self.get(name))
    }
}

impl Default for RateLimitProfiles {
    fn default() -> Self {
        Self {
            api: RateLimitProfile::default_for(ProfileName::Api),
            auth: RateLimitProfile::default_for(ProfileName::Auth),
            token: RateLimitProfile::default_for(ProfileName::Token),
            failed_auth: RateLimitProfile::default_for(ProfileName::FailedAuth),
            upload: RateLimitProfile::default_for(ProfileName::Upload),
        }
    }
}
