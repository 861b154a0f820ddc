//! Versioned per-provider bandwidth price tables

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const BUILTIN_VERSION: &str = "builtin-2024-01";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTable {
    pub version: String,
    #[serde(default = "PriceTable::default_currency")]
    pub currency: String,
    #[serde(default)]
    pub providers: ProviderPricing,
}

/// Provider-specific pricing fields, keyed by provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPricing {
    #[serde(default)]
    pub vercel: Option<VercelPricing>,
    #[serde(default, alias = "cloudfront", alias = "awsCloudfront")]
    pub aws: Option<AwsPricing>,
    #[serde(default)]
    pub netlify: Option<NetlifyPricing>,
    #[serde(default)]
    pub cloudflare: Option<CloudflarePricing>,
    /// Fallback for providers the table has no entry for
    #[serde(default, alias = "generic")]
    pub default: Option<GenericPricing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VercelPricing {
    pub included_gb: f64,
    pub overage_per_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsPricing {
    pub default_region: String,
    /// Region -> ascending tiers
    pub regions: BTreeMap<String, Vec<PriceTier>>,
    #[serde(default)]
    pub free_tier_gb: f64,
}

/// Rate applying to usage up to `up_to_gb` (cumulative); `None` is unbounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTier {
    #[serde(default)]
    pub up_to_gb: Option<f64>,
    pub per_gb: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetlifyPlan {
    Personal,
    #[default]
    Pro,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetlifyPricing {
    pub personal_per_gb: f64,
    pub pro_per_gb: f64,
    pub legacy_per_gb: f64,
    #[serde(default)]
    pub default_plan: NetlifyPlan,
}

impl NetlifyPricing {
    pub fn rate(&self, plan: NetlifyPlan) -> f64 {
        match plan {
            NetlifyPlan::Personal => self.personal_per_gb,
            NetlifyPlan::Pro => self.pro_per_gb,
            NetlifyPlan::Legacy => self.legacy_per_gb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflarePricing {
    #[serde(default)]
    pub cdn_per_gb: f64,
    pub argo_per_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericPricing {
    pub per_gb: f64,
}

/// Provider keys the calculator knows how to price
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Vercel,
    Aws,
    Netlify,
    Cloudflare,
    Other(String),
}

impl Provider {
    pub fn parse(key: &str) -> Self {
        match key.trim().to_ascii_lowercase().as_str() {
            "vercel" => Provider::Vercel,
            "aws" | "cloudfront" | "aws_cloudfront" | "aws-cloudfront" => Provider::Aws,
            "netlify" => Provider::Netlify,
            "cloudflare" => Provider::Cloudflare,
            other => Provider::Other(other.to_string()),
        }
    }
}

impl PriceTable {
    fn default_currency() -> String {
        "USD".to_string()
    }

    /// Table used when no price file is configured or it cannot be read
    pub fn builtin() -> Self {
        let us_tiers = vec![
            PriceTier { up_to_gb: Some(10_240.0), per_gb: 0.085 },
            PriceTier { up_to_gb: Some(51_200.0), per_gb: 0.080 },
            PriceTier { up_to_gb: Some(153_600.0), per_gb: 0.060 },
            PriceTier { up_to_gb: Some(512_000.0), per_gb: 0.040 },
            PriceTier { up_to_gb: None, per_gb: 0.030 },
        ];
        let asia_tiers = vec![
            PriceTier { up_to_gb: Some(10_240.0), per_gb: 0.120 },
            PriceTier { up_to_gb: Some(51_200.0), per_gb: 0.085 },
            PriceTier { up_to_gb: Some(153_600.0), per_gb: 0.082 },
            PriceTier { up_to_gb: None, per_gb: 0.080 },
        ];

        let mut regions = BTreeMap::new();
        regions.insert("us".to_string(), us_tiers.clone());
        regions.insert("eu".to_string(), us_tiers);
        regions.insert("ap".to_string(), asia_tiers);

        Self {
            version: BUILTIN_VERSION.to_string(),
            currency: Self::default_currency(),
            providers: ProviderPricing {
                vercel: Some(VercelPricing {
                    included_gb: 1_000.0,
                    overage_per_gb: 0.15,
                }),
                aws: Some(AwsPricing {
                    default_region: "us".to_string(),
                    regions,
                    free_tier_gb: 1_024.0,
                }),
                netlify: Some(NetlifyPricing {
                    personal_per_gb: 0.55,
                    pro_per_gb: 0.40,
                    legacy_per_gb: 0.20,
                    default_plan: NetlifyPlan::Pro,
                }),
                cloudflare: Some(CloudflarePricing {
                    cdn_per_gb: 0.0,
                    argo_per_gb: 0.10,
                }),
                default: Some(GenericPricing { per_gb: 0.10 }),
            },
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read price table {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse price table {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_aliases() {
        assert_eq!(Provider::parse("CloudFront"), Provider::Aws);
        assert_eq!(Provider::parse(" vercel "), Provider::Vercel);
        assert_eq!(Provider::parse("fly"), Provider::Other("fly".to_string()));
    }

    #[test]
    fn test_table_parses_partial_providers() {
        let table: PriceTable = serde_json::from_str(
            r#"{"version":"t1","providers":{"cloudflare":{"cdnPerGb":0,"argoPerGb":0.1}}}"#,
        )
        .unwrap();
        assert_eq!(table.currency, "USD");
        assert!(table.providers.vercel.is_none());
        assert_eq!(table.providers.cloudflare.unwrap().cdn_per_gb, 0.0);
    }
}
