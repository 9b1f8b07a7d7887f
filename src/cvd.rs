//! CVD (Cumulative Volume Delta) study configuration assembly.
//!
//! The Pine-script text/pineId/pineVersion triple is fetched by an injected
//! `CvdConfigProvider` rather than this crate, keeping the cached encrypted
//! script text out of the client's own responsibilities.

use async_trait::async_trait;
use serde_json::{Value, json};
use ustr::Ustr;

use crate::error::Result;

/// Literal study name TradingView expects for this script family.
pub const CVD_STUDY_NAME: &str = "Script@tv-scripting-101!";

#[derive(Debug, Clone)]
pub struct CvdConfig {
    pub text: Ustr,
    pub pine_id: Ustr,
    pub pine_version: Ustr,
}

/// Injected collaborator resolving the encrypted Pine-script text for a
/// requested anchor period. Implementations may cache.
#[async_trait]
pub trait CvdConfigProvider: Send + Sync {
    async fn get_cvd_config(&self, anchor_period: &str) -> Result<CvdConfig>;
}

/// Deterministic provider for tests and `PoolConfig::use_mock_cvd`: returns a
/// fixed config without any network/IO.
pub struct MockCvdConfigProvider {
    pub config: CvdConfig,
}

impl MockCvdConfigProvider {
    pub fn new() -> Self {
        Self {
            config: CvdConfig {
                text: Ustr::from("mock-cvd-script"),
                pine_id: Ustr::from("PUB;mock-cvd"),
                pine_version: Ustr::from("1.0"),
            },
        }
    }
}

impl Default for MockCvdConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CvdConfigProvider for MockCvdConfigProvider {
    async fn get_cvd_config(&self, _anchor_period: &str) -> Result<CvdConfig> {
        Ok(self.config.clone())
    }
}

/// Assemble the `create_study` config object for CVD: the provider's
/// `text`/`pineId`/`pineVersion`, a pine-features blob, and inputs `in_0`
/// (anchor period), `in_1` (custom timeframe present), `in_2` (custom
/// timeframe string), `__profile`.
pub fn build_cvd_study_config(cfg: &CvdConfig, anchor_period: &str, custom_timeframe: Option<&str>) -> Value {
    json!({
        "text": cfg.text,
        "pineId": cfg.pine_id,
        "pineVersion": cfg.pine_version,
        "pineFeatures": {
            "v": "{\"indexes_visible\":true}",
            "f": true,
            "t": "text",
        },
        "in_0": { "v": anchor_period, "f": true, "t": "text" },
        "in_1": { "v": custom_timeframe.is_some(), "f": true, "t": "bool" },
        "in_2": { "v": custom_timeframe.unwrap_or(""), "f": true, "t": "text" },
        "__profile": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_returns_fixed_config() {
        let provider = MockCvdConfigProvider::new();
        let cfg = provider.get_cvd_config("3M").await.unwrap();
        assert_eq!(cfg.pine_id.as_str(), "PUB;mock-cvd");
    }

    #[test]
    fn study_config_carries_anchor_period_and_provider_fields() {
        let cfg = CvdConfig {
            text: Ustr::from("abc"),
            pine_id: Ustr::from("PUB;x"),
            pine_version: Ustr::from("2.0"),
        };
        let value = build_cvd_study_config(&cfg, "3M", None);
        assert_eq!(value["text"], "abc");
        assert_eq!(value["in_0"]["v"], "3M");
        assert_eq!(value["in_1"]["v"], false);
    }

    #[test]
    fn study_config_reflects_custom_timeframe_when_provided() {
        let cfg = CvdConfig {
            text: Ustr::from("abc"),
            pine_id: Ustr::from("PUB;x"),
            pine_version: Ustr::from("2.0"),
        };
        let value = build_cvd_study_config(&cfg, "6M", Some("240"));
        assert_eq!(value["in_1"]["v"], true);
        assert_eq!(value["in_2"]["v"], "240");
    }
}
