//! Cheap substring and regex checks for well-known automation

use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

use crate::models::UaClassification;

pub const QUICK_CONFIDENCE: f64 = 0.9;
pub const HEADLESS_CONFIDENCE: f64 = 0.85;

/// (lowercase token, botType, botName)
///
/// Agents carried by the built-in signature set are left to it so they get
/// their signature confidence.
const QUICK_TOKENS: &[(&str, &str, &str)] = &[
    ("claudebot", "ai_training", "ClaudeBot"),
    ("anthropic-ai", "ai_training", "anthropic-ai"),
    ("ccbot", "ai_training", "CCBot"),
    ("bytespider", "ai_training", "Bytespider"),
    ("google-extended", "ai_training", "Google-Extended"),
    ("amazonbot", "ai_training", "Amazonbot"),
    ("perplexitybot", "ai_search", "PerplexityBot"),
    ("oai-searchbot", "ai_search", "OAI-SearchBot"),
    ("chatgpt-user", "ai_assistant", "ChatGPT-User"),
    ("applebot", "search_engine", "Applebot"),
    ("duckduckbot", "search_engine", "DuckDuckBot"),
    ("yandexbot", "search_engine", "YandexBot"),
    ("baiduspider", "search_engine", "Baiduspider"),
    ("semrushbot", "seo", "SemrushBot"),
    ("mj12bot", "seo", "MJ12bot"),
    ("dotbot", "seo", "DotBot"),
    ("petalbot", "search_engine", "PetalBot"),
    ("facebookexternalhit", "social", "facebookexternalhit"),
    ("twitterbot", "social", "Twitterbot"),
    ("slackbot", "social", "Slackbot"),
    ("discordbot", "social", "Discordbot"),
    ("linkedinbot", "social", "LinkedInBot"),
    ("uptimerobot", "monitoring", "UptimeRobot"),
    ("pingdom", "monitoring", "Pingdom"),
    ("statuscake", "monitoring", "StatusCake"),
    ("wget", "tool", "Wget"),
    ("libwww-perl", "tool", "libwww-perl"),
    ("scrapy", "scraper", "Scrapy"),
];

const HEADLESS_PATTERN: &str = r"headlesschrome|phantomjs|puppeteer|playwright|selenium|webdriver|slimerjs|go-http-client|okhttp|java/\d|apache-httpclient|axios/|node-fetch|undici|aiohttp|httpx|urllib|libcurl|guzzlehttp|postmanruntime";

/// First quick token contained in the agent, case-insensitive
pub fn quick_match(user_agent: &str) -> Option<UaClassification> {
    let lower = user_agent.to_lowercase();
    QUICK_TOKENS
        .iter()
        .find(|(token, _, _)| lower.contains(token))
        .map(|(_, bot_type, bot_name)| UaClassification::bot(*bot_type, *bot_name, QUICK_CONFIDENCE))
}

fn headless_regex() -> Option<&'static Regex> {
    static HEADLESS: OnceLock<Option<Regex>> = OnceLock::new();
    HEADLESS
        .get_or_init(|| {
            RegexBuilder::new(HEADLESS_PATTERN)
                .case_insensitive(true)
                .build()
                .ok()
        })
        .as_ref()
}

/// Headless browsers and scripted HTTP clients
pub fn headless_match(user_agent: &str) -> Option<UaClassification> {
    let regex = headless_regex()?;
    let found = regex.find(user_agent)?;
    Some(UaClassification::bot(
        "headless",
        found.as_str().trim_end_matches('/').to_lowercase(),
        HEADLESS_CONFIDENCE,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_match_is_case_insensitive() {
        let hit = quick_match("Mozilla/5.0 (compatible; ClaudeBot/1.0; +claudebot@anthropic.com)").unwrap();
        assert!(hit.is_bot);
        assert_eq!(hit.bot_type.as_deref(), Some("ai_training"));
        assert_eq!(hit.bot_name.as_deref(), Some("ClaudeBot"));
        assert_eq!(hit.confidence, QUICK_CONFIDENCE);

        assert!(quick_match("WGET/1.21").is_some());
    }

    #[test]
    fn test_quick_match_leaves_signature_agents_alone() {
        assert!(quick_match("Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; GPTBot/1.0)").is_none());
        assert!(quick_match("curl/8.4.0").is_none());
        assert!(quick_match("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0").is_none());
    }

    #[test]
    fn test_headless_match() {
        let hit = headless_match("Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/119.0.0.0 Safari/537.36").unwrap();
        assert_eq!(hit.bot_type.as_deref(), Some("headless"));
        assert_eq!(hit.bot_name.as_deref(), Some("headlesschrome"));
        assert_eq!(hit.confidence, HEADLESS_CONFIDENCE);

        assert_eq!(
            headless_match("axios/1.6.2").unwrap().bot_name.as_deref(),
            Some("axios")
        );
        assert!(headless_match("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) Safari/605.1.15").is_none());
    }
}
