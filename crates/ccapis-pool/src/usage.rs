//! Usage data model and the usage-fetch collaborator interface
//!
//! The upstream service reports per-account utilization over rolling quota
//! windows. The five-hour window drives quota-exhaustion detection and the
//! ranking tie-break; the seven-day windows are carried for observers.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::credentials::Credential;
use crate::error::TransportError;

/// One rolling quota window: consumed percentage and the reset instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Percentage of the window's quota consumed (0-100, fractional allowed)
    #[serde(default)]
    pub utilization: f64,
    /// Window reset as epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<u64>,
}

/// Usage sample for one account. Unknown windows and fields are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_oauth_apps: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_opus: Option<UsageWindow>,
}

impl UsageData {
    /// Five-hour window utilization, if reported.
    pub fn five_hour_utilization(&self) -> Option<f64> {
        self.five_hour.map(|w| w.utilization)
    }

    /// Five-hour window reset instant, if reported.
    pub fn five_hour_resets_at(&self) -> Option<SystemTime> {
        self.five_hour
            .and_then(|w| w.resets_at)
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Collaborator interface pulling a usage sample for one credential.
///
/// Boxed futures keep the trait usable behind `Arc<dyn UsageFetcher>`.
pub trait UsageFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<UsageData, TransportError>> + Send + 'a>>;
}
