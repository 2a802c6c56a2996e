//! Shared AWS SDK configuration for the S3 and Athena clients

use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::info;

/// Load SDK configuration for `region`, optionally from a named credentials
/// profile. Everything else follows the default provider chain.
pub async fn load_sdk_config(region: &str, profile: Option<&str>) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }

    let config = loader.load().await;

    info!(region, profile = profile.unwrap_or("default"), "AWS configuration loaded");

    config
}
