//! Global request quota using tower-governor

use axum::Router;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer,
};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Limit every route of `router` to `per_day` requests per day, shared by all clients
///
/// The whole quota is available as a burst and replenishes evenly over the
/// day: for 500 requests that is one request every 172.8 seconds.
pub fn with_daily_quota<S>(router: Router<S>, per_day: u32) -> anyhow::Result<Router<S>>
where
    S: Clone + Send + Sync + 'static,
{
    let replenishment_ms = (MILLIS_PER_DAY / u64::from(per_day.max(1))).max(1);

    let governor_conf = GovernorConfigBuilder::default()
        .per_millisecond(replenishment_ms)
        .burst_size(per_day)
        .key_extractor(GlobalKeyExtractor)
        .finish()
        .ok_or_else(|| anyhow::anyhow!("Invalid rate limit: {} requests per day", per_day))?;

    Ok(router.layer(GovernorLayer {
        config: Arc::new(governor_conf),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_quota_is_rejected() {
        assert!(with_daily_quota(Router::<()>::new(), 0).is_err());
    }

    #[test]
    fn test_quota_layer_creation() {
        assert!(with_daily_quota(Router::<()>::new(), 500).is_ok());
    }
}
