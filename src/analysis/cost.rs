//! Bandwidth cost estimation
//!
//! `calculate_cost` is a pure function of its input and the price table:
//! identical arguments always produce identical output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analysis::pricing::{NetlifyPlan, PriceTable, PriceTier, Provider};

const BYTES_PER_GB: f64 = 1e9;
const DAYS_PER_MONTH: f64 = 30.0;

/// Provider-specific knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostOptions {
    pub aws_region: Option<String>,
    pub aws_free_tier: bool,
    pub netlify_plan: Option<NetlifyPlan>,
    pub cloudflare_argo: bool,
}

impl Default for CostOptions {
    fn default() -> Self {
        Self {
            aws_region: None,
            aws_free_tier: true,
            netlify_plan: None,
            cloudflare_argo: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostInput<'a> {
    pub provider: &'a str,
    pub total_bytes: u64,
    pub breakdown: &'a BTreeMap<String, u64>,
    pub window_days: Option<f64>,
    pub options: &'a CostOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdownItem {
    pub category: String,
    pub bytes: u64,
    pub monthly_bytes: u64,
    pub monthly_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub provider: String,
    pub currency: String,
    pub price_table_version: String,
    pub rate_per_gb: f64,
    /// Split across categories by share, each share rounded on its own
    pub free_bytes_allowance: u64,
    pub monthly_factor: f64,
    pub total_cost: f64,
    pub items: Vec<CostBreakdownItem>,
    pub notes: Vec<String>,
    /// False when the provider could not be priced from the table
    pub pricing_resolved: bool,
}

/// Effective rate and free allowance for one provider
#[derive(Debug, Clone, PartialEq)]
struct RateResolution {
    rate_per_gb: f64,
    free_bytes: u64,
    notes: Vec<String>,
    resolved: bool,
}

impl RateResolution {
    fn priced(rate_per_gb: f64, free_bytes: u64) -> Self {
        Self {
            rate_per_gb,
            free_bytes,
            notes: Vec::new(),
            resolved: true,
        }
    }

    fn unpriced(note: String) -> Self {
        Self {
            rate_per_gb: 0.0,
            free_bytes: 0,
            notes: vec![note],
            resolved: false,
        }
    }
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 30 / windowDays, or 1 when the window is unset or invalid
pub fn monthly_factor(window_days: Option<f64>) -> f64 {
    match window_days {
        Some(days) if days.is_finite() && days > 0.0 => DAYS_PER_MONTH / days,
        _ => 1.0,
    }
}

/// Price a category -> bytes breakdown for one provider
pub fn calculate_cost(input: &CostInput<'_>, table: &PriceTable) -> CostEstimate {
    let factor = monthly_factor(input.window_days);

    let monthly: Vec<(&String, u64, u64)> = input
        .breakdown
        .iter()
        .map(|(category, &bytes)| (category, bytes, (bytes as f64 * factor).round() as u64))
        .collect();
    let total_monthly = monthly
        .iter()
        .fold(0u64, |acc, (_, _, m)| acc.saturating_add(*m));

    let resolution = resolve_rate(input.provider, total_monthly, input.options, table);

    let items: Vec<CostBreakdownItem> = monthly
        .into_iter()
        .map(|(category, bytes, monthly_bytes)| {
            let allocated_free = if total_monthly > 0 {
                (resolution.free_bytes as f64 * monthly_bytes as f64 / total_monthly as f64).round()
                    as u64
            } else {
                0
            };
            let chargeable = monthly_bytes.saturating_sub(allocated_free);
            CostBreakdownItem {
                category: category.clone(),
                bytes,
                monthly_bytes,
                monthly_cost: round_cents(chargeable as f64 / BYTES_PER_GB * resolution.rate_per_gb),
            }
        })
        .collect();

    let total_cost = round_cents(items.iter().map(|i| i.monthly_cost).sum());

    let mut notes = resolution.notes;
    let categorized = input
        .breakdown
        .values()
        .fold(0u64, |acc, bytes| acc.saturating_add(*bytes));
    if categorized != input.total_bytes {
        notes.push(format!(
            "Category breakdown covers {categorized} of {} total bytes",
            input.total_bytes
        ));
    }

    CostEstimate {
        provider: input.provider.to_string(),
        currency: table.currency.clone(),
        price_table_version: table.version.clone(),
        rate_per_gb: resolution.rate_per_gb,
        free_bytes_allowance: resolution.free_bytes,
        monthly_factor: factor,
        total_cost,
        items,
        notes,
        pricing_resolved: resolution.resolved,
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    if gb.is_finite() && gb > 0.0 {
        (gb * BYTES_PER_GB).round() as u64
    } else {
        0
    }
}

fn resolve_rate(
    provider_key: &str,
    total_monthly_bytes: u64,
    options: &CostOptions,
    table: &PriceTable,
) -> RateResolution {
    let pricing = &table.providers;
    let provider = Provider::parse(provider_key);

    let missing = |name: &str| {
        RateResolution::unpriced(format!(
            "Price table {} has no {name} pricing; cost reported as zero",
            table.version
        ))
    };

    match provider {
        Provider::Vercel => match &pricing.vercel {
            Some(vercel) => {
                let mut r =
                    RateResolution::priced(vercel.overage_per_gb, gb_to_bytes(vercel.included_gb));
                r.notes.push(format!(
                    "Vercel: first {} GB/month included, then {:.4} {}/GB",
                    vercel.included_gb, vercel.overage_per_gb, table.currency
                ));
                r
            }
            None => missing("Vercel"),
        },
        Provider::Aws => match &pricing.aws {
            Some(aws) => {
                let region = options
                    .aws_region
                    .clone()
                    .unwrap_or_else(|| aws.default_region.clone());
                let (region, tiers) = match aws.regions.get(&region) {
                    Some(tiers) => (region, tiers),
                    None => match aws.regions.get(&aws.default_region) {
                        Some(tiers) => (aws.default_region.clone(), tiers),
                        None => return missing("CloudFront region"),
                    },
                };
                let free_bytes = if options.aws_free_tier {
                    gb_to_bytes(aws.free_tier_gb)
                } else {
                    0
                };
                let chargeable_gb =
                    total_monthly_bytes.saturating_sub(free_bytes) as f64 / BYTES_PER_GB;
                let rate = blended_tier_rate(tiers, chargeable_gb);
                let mut r = RateResolution::priced(rate, free_bytes);
                r.notes.push(format!(
                    "CloudFront region {region}: blended tiered rate {rate:.4} {}/GB",
                    table.currency
                ));
                if free_bytes > 0 {
                    r.notes.push(format!(
                        "CloudFront free tier of {} GB/month allocated proportionally",
                        aws.free_tier_gb
                    ));
                }
                r
            }
            None => missing("CloudFront"),
        },
        Provider::Netlify => match &pricing.netlify {
            Some(netlify) => {
                let plan = options.netlify_plan.unwrap_or(netlify.default_plan);
                let mut r = RateResolution::priced(netlify.rate(plan), 0);
                r.notes.push(format!(
                    "Netlify {plan:?} plan effective rate {:.4} {}/GB",
                    netlify.rate(plan),
                    table.currency
                ));
                r
            }
            None => missing("Netlify"),
        },
        Provider::Cloudflare => match &pricing.cloudflare {
            Some(cf) if options.cloudflare_argo => {
                let mut r = RateResolution::priced(cf.argo_per_gb, 0);
                r.notes.push(format!(
                    "Cloudflare Argo Smart Routing billed at {:.4} {}/GB",
                    cf.argo_per_gb, table.currency
                ));
                r
            }
            Some(cf) => {
                let mut r = RateResolution::priced(cf.cdn_per_gb, 0);
                if cf.cdn_per_gb == 0.0 {
                    r.notes.push(
                        "Cloudflare self-serve CDN bandwidth is not metered (0/GB); \
                         monthly cost is zero regardless of volume"
                            .to_string(),
                    );
                } else {
                    r.notes.push(format!(
                        "Cloudflare CDN billed at {:.4} {}/GB",
                        cf.cdn_per_gb, table.currency
                    ));
                }
                r
            }
            None => missing("Cloudflare"),
        },
        Provider::Other(name) => match &pricing.default {
            Some(generic) => {
                let mut r = RateResolution::priced(generic.per_gb, 0);
                r.notes.push(format!(
                    "Unknown provider '{name}'; applied generic default rate {:.4} {}/GB with no free allowance",
                    generic.per_gb, table.currency
                ));
                r
            }
            None => RateResolution::unpriced(format!(
                "Unknown provider '{name}' and no default rate in price table {}; cost reported as zero",
                table.version
            )),
        },
    }
}

/// Average per-GB rate when `gb` is spread across cumulative tiers
fn blended_tier_rate(tiers: &[PriceTier], gb: f64) -> f64 {
    let Some(first) = tiers.first() else {
        return 0.0;
    };
    if gb <= 0.0 {
        return first.per_gb;
    }

    let mut remaining = gb;
    let mut floor = 0.0;
    let mut cost = 0.0;
    for tier in tiers {
        let span = match tier.up_to_gb {
            Some(cap) => (cap - floor).max(0.0),
            None => f64::INFINITY,
        };
        let used = remaining.min(span);
        cost += used * tier.per_gb;
        remaining -= used;
        if let Some(cap) = tier.up_to_gb {
            floor = cap;
        }
        if remaining <= 0.0 {
            break;
        }
    }
    if remaining > 0.0 {
        // usage beyond the last bounded tier stays on the last rate
        cost += remaining * tiers.last().map(|t| t.per_gb).unwrap_or(0.0);
    }

    cost / gb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::pricing::{CloudflarePricing, GenericPricing, VercelPricing};

    fn breakdown(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn estimate(provider: &str, b: &BTreeMap<String, u64>, days: Option<f64>, table: &PriceTable) -> CostEstimate {
        let options = CostOptions::default();
        calculate_cost(
            &CostInput {
                provider,
                total_bytes: b.values().sum(),
                breakdown: b,
                window_days: days,
                options: &options,
            },
            table,
        )
    }

    fn generic_table(per_gb: f64) -> PriceTable {
        let mut table = PriceTable::builtin();
        table.providers.default = Some(GenericPricing { per_gb });
        table
    }

    #[test]
    fn test_halving_window_doubles_monthly_values() {
        let table = generic_table(0.10);
        let b = breakdown(&[("bot", 3_000_000_000), ("human", 7_000_000_000)]);
        let month = estimate("fly", &b, Some(30.0), &table);
        let half = estimate("fly", &b, Some(15.0), &table);

        for (a, h) in month.items.iter().zip(half.items.iter()) {
            assert_eq!(h.monthly_bytes, a.monthly_bytes * 2);
            assert_eq!(h.monthly_cost, a.monthly_cost * 2.0);
        }
        assert_eq!(month.total_cost, 1.0);
        assert_eq!(half.total_cost, 2.0);
    }

    #[test]
    fn test_total_is_rounded_sum_of_items() {
        let table = generic_table(0.137);
        let b = breakdown(&[("a", 1_234_567_891), ("b", 987_654_321), ("c", 5_555_555_555)]);
        let est = estimate("other", &b, Some(7.0), &table);
        let sum: f64 = est.items.iter().map(|i| i.monthly_cost).sum();
        assert_eq!(est.total_cost, round_cents(sum));
    }

    #[test]
    fn test_tiny_window_saturates_instead_of_overflowing() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("bot", 10_000_000_000), ("human", 10_000_000_000)]);
        let est = estimate("vercel", &b, Some(1e-9), &table);

        assert_eq!(est.items.len(), 2);
        assert!(est.items.iter().all(|i| i.monthly_bytes == u64::MAX));
        assert!(est.total_cost.is_finite());
        assert!(est.total_cost > 0.0);
        let sum: f64 = est.items.iter().map(|i| i.monthly_cost).sum();
        assert_eq!(est.total_cost, round_cents(sum));
    }

    #[test]
    fn test_invalid_window_uses_factor_one() {
        assert_eq!(monthly_factor(None), 1.0);
        assert_eq!(monthly_factor(Some(0.0)), 1.0);
        assert_eq!(monthly_factor(Some(-3.0)), 1.0);
        assert_eq!(monthly_factor(Some(f64::NAN)), 1.0);
        assert_eq!(monthly_factor(Some(7.5)), 4.0);
    }

    #[test]
    fn test_cloudflare_zero_rate() {
        let mut table = PriceTable::builtin();
        table.providers.cloudflare = Some(CloudflarePricing {
            cdn_per_gb: 0.0,
            argo_per_gb: 0.1,
        });
        let b = breakdown(&[("bot", 900_000_000_000_000), ("human", 1)]);
        let est = estimate("cloudflare", &b, Some(7.0), &table);
        assert!(est.items.iter().all(|i| i.monthly_cost == 0.0));
        assert_eq!(est.total_cost, 0.0);
        assert!(est.notes.iter().any(|n| n.contains("not metered")));
        assert!(est.pricing_resolved);
    }

    #[test]
    fn test_cloudflare_argo() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("bot", 10_000_000_000)]);
        let options = CostOptions {
            cloudflare_argo: true,
            ..Default::default()
        };
        let est = calculate_cost(
            &CostInput {
                provider: "cloudflare",
                total_bytes: 10_000_000_000,
                breakdown: &b,
                window_days: Some(30.0),
                options: &options,
            },
            &table,
        );
        assert_eq!(est.total_cost, 1.0);
    }

    #[test]
    fn test_free_allowance_is_proportional() {
        let mut table = PriceTable::builtin();
        table.providers.vercel = Some(VercelPricing {
            included_gb: 100.0,
            overage_per_gb: 1.0,
        });
        let b = breakdown(&[("bot", 100_000_000_000), ("human", 300_000_000_000)]);
        let est = estimate("vercel", &b, Some(30.0), &table);
        // 100 GB free split 25/75
        let bot = est.items.iter().find(|i| i.category == "bot").unwrap();
        let human = est.items.iter().find(|i| i.category == "human").unwrap();
        assert_eq!(bot.monthly_cost, 75.0);
        assert_eq!(human.monthly_cost, 225.0);
        assert_eq!(est.total_cost, 300.0);
    }

    #[test]
    fn test_allowance_larger_than_usage_is_free() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("bot", 5_000_000_000)]);
        let est = estimate("vercel", &b, Some(30.0), &table);
        assert_eq!(est.total_cost, 0.0);
    }

    #[test]
    fn test_unknown_provider_without_default_is_zero() {
        let mut table = PriceTable::builtin();
        table.providers.default = None;
        let b = breakdown(&[("bot", 50_000_000_000)]);
        let est = estimate("mystery-cdn", &b, Some(30.0), &table);
        assert_eq!(est.total_cost, 0.0);
        assert!(!est.pricing_resolved);
        assert!(est.notes[0].contains("mystery-cdn"));
    }

    #[test]
    fn test_unknown_provider_uses_generic_rate() {
        let b = breakdown(&[("bot", 20_000_000_000)]);
        let est = estimate("fly", &b, Some(30.0), &generic_table(0.1));
        assert_eq!(est.total_cost, 2.0);
        assert_eq!(est.free_bytes_allowance, 0);
        assert!(est.notes.iter().any(|n| n.contains("generic default rate")));
    }

    #[test]
    fn test_netlify_plans() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("human", 10_000_000_000)]);
        let options = CostOptions {
            netlify_plan: Some(NetlifyPlan::Legacy),
            ..Default::default()
        };
        let est = calculate_cost(
            &CostInput {
                provider: "netlify",
                total_bytes: 10_000_000_000,
                breakdown: &b,
                window_days: None,
                options: &options,
            },
            &table,
        );
        assert_eq!(est.rate_per_gb, 0.20);
        assert_eq!(est.total_cost, 2.0);
    }

    #[test]
    fn test_blended_tiers() {
        let tiers = vec![
            PriceTier { up_to_gb: Some(10.0), per_gb: 1.0 },
            PriceTier { up_to_gb: None, per_gb: 0.5 },
        ];
        assert_eq!(blended_tier_rate(&tiers, 0.0), 1.0);
        assert_eq!(blended_tier_rate(&tiers, 5.0), 1.0);
        assert_eq!(blended_tier_rate(&tiers, 20.0), 0.75);
    }

    #[test]
    fn test_aws_free_tier_toggle() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("bot", 1_000_000_000_000)]);
        let with_free = estimate("aws", &b, Some(30.0), &table);
        assert_eq!(with_free.total_cost, 0.0);

        let options = CostOptions {
            aws_free_tier: false,
            ..Default::default()
        };
        let est = calculate_cost(
            &CostInput {
                provider: "cloudfront",
                total_bytes: 1_000_000_000_000,
                breakdown: &b,
                window_days: Some(30.0),
                options: &options,
            },
            &table,
        );
        assert_eq!(est.total_cost, 85.0);
    }

    #[test]
    fn test_deterministic() {
        let table = PriceTable::builtin();
        let b = breakdown(&[("bot", 123_456_789_012), ("human", 98_765_432_101)]);
        assert_eq!(
            estimate("aws", &b, Some(7.0), &table),
            estimate("aws", &b, Some(7.0), &table)
        );
    }
}
