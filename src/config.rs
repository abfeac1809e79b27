use serde::Serialize;

use crate::NetworkDispatcher;

/// Options for [`NetworkService`](crate::NetworkService) and [`EventBuffer`](crate::EventBuffer).
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct StatsigOptions {
    /// Base URL for API calls. Endpoints (`/initialize`, `/log_event`) are appended to it.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_API`].
    pub api: String,
    /// Maximum number of concurrently open requests.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_MAX_CONCURRENT_REQUESTS`].
    pub max_concurrent_requests: usize,
    /// Number of events sent per `log_event` request.
    ///
    /// Defaults to [`StatsigOptions::DEFAULT_EVENT_BATCH_SIZE`].
    pub event_batch_size: usize,
    /// SDK name and version reported to the backend.
    pub sdk_metadata: SdkMetadata,
}

impl StatsigOptions {
    /// Default value for [`StatsigOptions::api`].
    pub const DEFAULT_API: &'static str = "https://api.statsig.com/v1";
    /// Default value for [`StatsigOptions::max_concurrent_requests`].
    pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = NetworkDispatcher::DEFAULT_MAX_IN_FLIGHT;
    /// Default value for [`StatsigOptions::event_batch_size`].
    pub const DEFAULT_EVENT_BATCH_SIZE: usize = 50;

    /// Create options with default values.
    pub fn new() -> StatsigOptions {
        StatsigOptions::default()
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn with_api(mut self, api: impl Into<String>) -> StatsigOptions {
        self.api = api.into();
        self
    }

    /// Update the concurrent request limit with `max_concurrent_requests`.
    pub fn with_max_concurrent_requests(
        mut self,
        max_concurrent_requests: usize,
    ) -> StatsigOptions {
        self.max_concurrent_requests = max_concurrent_requests;
        self
    }

    /// Update event batch size with `event_batch_size`.
    pub fn with_event_batch_size(mut self, event_batch_size: usize) -> StatsigOptions {
        self.event_batch_size = event_batch_size;
        self
    }

    /// Report a different SDK name and version (for SDKs wrapping this crate).
    pub fn with_sdk_metadata(mut self, sdk_metadata: SdkMetadata) -> StatsigOptions {
        self.sdk_metadata = sdk_metadata;
        self
    }
}

impl Default for StatsigOptions {
    fn default() -> StatsigOptions {
        StatsigOptions {
            api: StatsigOptions::DEFAULT_API.to_owned(),
            max_concurrent_requests: StatsigOptions::DEFAULT_MAX_CONCURRENT_REQUESTS,
            event_batch_size: StatsigOptions::DEFAULT_EVENT_BATCH_SIZE,
            sdk_metadata: SdkMetadata::default(),
        }
    }
}

/// SDK name and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkMetadata {
    /// SDK name. Usually, language name.
    pub name: &'static str,
    /// Version of SDK.
    pub version: &'static str,
}

impl Default for SdkMetadata {
    fn default() -> SdkMetadata {
        SdkMetadata {
            name: "statsig-core-rust",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// `statsigMetadata` field of outgoing requests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatsigMetadata<'a> {
    pub sdk_type: &'static str,
    pub sdk_version: &'static str,
    #[serde(rename = "stableID", skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<&'a str>,
}

impl<'a> StatsigMetadata<'a> {
    pub(crate) fn new(sdk: &SdkMetadata, stable_id: Option<&'a str>) -> StatsigMetadata<'a> {
        StatsigMetadata {
            sdk_type: sdk.name,
            sdk_version: sdk.version,
            stable_id,
        }
    }
}
