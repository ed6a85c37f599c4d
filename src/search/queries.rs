//! Query generation from the trend and suggestion feeds.
//!
//! The trend feed is fetched one calendar day at a time, walking backward
//! from yesterday until enough topics have accumulated. Feed failures are
//! logged and treated as an empty day; nothing here propagates an error to
//! the campaign.

use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{NaiveDate, Utc};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::DeviceMode;

const TREND_FEED_URL: &str = "https://trends.google.com/trends/api/dailytrends";
const SUGGESTION_URL: &str = "https://api.bing.com/osjson.aspx";

/// The trend feed prepends this many bytes of non-JSON framing to the body.
const TREND_PREFIX_LEN: usize = 5;

/// Hard bounds on the backward day-walk. The feed occasionally serves empty
/// or broken days; without a cap a persistently empty feed would walk
/// forever.
const TREND_MAX_LOOKBACK_DAYS: i64 = 30;
const TREND_FETCH_BUDGET: Duration = Duration::from_secs(90);

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Geo used when no usable locale hint is available.
const DEFAULT_GEO: &str = "US";

/// One trending topic: a lower-cased primary term plus its related terms in
/// discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendTopic {
    pub topic: String,
    pub related: Vec<String>,
}

/// A campaign's worth of queries: the deduplicated, shuffled topic list and
/// the flattened term queue derived from it.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub topics: Vec<TrendTopic>,
    pub queries: Vec<String>,
}

/// Where the campaign gets its terms from. One live implementation over the
/// trend feed; tests script their own.
pub trait QuerySource {
    fn query_plan(
        &self,
        geo_locale: &str,
        target: usize,
        mode: DeviceMode,
    ) -> impl Future<Output = QueryPlan> + Send;

    /// Suggestion list for one term; empty on failure, never an error.
    fn related_terms(&self, term: &str) -> impl Future<Output = Vec<String>> + Send;
}

/// Live query source backed by the public trend and suggestion feeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrendFeed;

impl QuerySource for TrendFeed {
    async fn query_plan(&self, geo_locale: &str, target: usize, mode: DeviceMode) -> QueryPlan {
        info!(
            "[Trends] Generating search queries, this can take a while | GeoLocale: {}",
            geo_locale
        );
        let geo = geo_locale.to_string();
        let raw = accumulate_topics(|date| fetch_trend_day(geo.clone(), date), target).await;
        let plan = assemble_plan(raw, mode);
        info!(
            "[Trends] Generated {} topics ({} queries) for {} mode",
            plan.topics.len(),
            plan.queries.len(),
            mode
        );
        plan
    }

    async fn related_terms(&self, term: &str) -> Vec<String> {
        match fetch_suggestions(term).await {
            Ok(list) => list,
            Err(e) => {
                error!("[Suggestions] Lookup for '{}' failed: {}", term, e);
                Vec::new()
            }
        }
    }
}

/// Resolve the geo parameter for the trend feed: an opted-in two-letter
/// hint is upper-cased, anything else falls back to the default market.
pub fn resolve_geo(hint: Option<&str>, use_geo_locale: bool) -> String {
    match hint {
        Some(code) if use_geo_locale && code.len() == 2 => code.to_uppercase(),
        _ => DEFAULT_GEO.to_string(),
    }
}

/// Walk backward from yesterday, one day per fetch, until `target` topics
/// accumulate or a bound trips. Failed days are logged and skipped.
async fn accumulate_topics<F, Fut>(mut fetch_day: F, target: usize) -> Vec<TrendTopic>
where
    F: FnMut(NaiveDate) -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<TrendTopic>>>,
{
    let started = Instant::now();
    let today = Utc::now().date_naive();
    let mut topics: Vec<TrendTopic> = Vec::new();
    let mut offset: i64 = 1;

    while topics.len() < target {
        if offset > TREND_MAX_LOOKBACK_DAYS {
            warn!(
                "[Trends] Hit the {}-day lookback cap with {} of {} topics",
                TREND_MAX_LOOKBACK_DAYS,
                topics.len(),
                target
            );
            break;
        }
        if started.elapsed() > TREND_FETCH_BUDGET {
            warn!(
                "[Trends] Out of fetch budget with {} of {} topics",
                topics.len(),
                target
            );
            break;
        }

        let date = today - chrono::Duration::days(offset);
        offset += 1;

        match fetch_day(date).await {
            Ok(mut day) => topics.append(&mut day),
            Err(e) => error!("[Trends] Fetch for {} failed: {}", date, e),
        }
    }

    topics
}

/// Dedupe (first occurrence wins), shuffle, and flatten into the query queue.
fn assemble_plan(raw: Vec<TrendTopic>, mode: DeviceMode) -> QueryPlan {
    let mut topics = dedupe_topics(raw);
    topics.shuffle(&mut rand::thread_rng());
    let queries = flatten_queries(&topics, mode);
    QueryPlan { topics, queries }
}

fn dedupe_topics(topics: Vec<TrendTopic>) -> Vec<TrendTopic> {
    let mut seen = HashSet::new();
    topics
        .into_iter()
        .filter(|t| seen.insert(t.topic.clone()))
        .collect()
}

/// Desktop searches a topic and then each of its related terms; mobile
/// searches the topic only (related terms make mobile counters unreliable).
fn flatten_queries(topics: &[TrendTopic], mode: DeviceMode) -> Vec<String> {
    let mut queries = Vec::new();
    for entry in topics {
        queries.push(entry.topic.clone());
        if !mode.is_mobile() {
            queries.extend(entry.related.iter().cloned());
        }
    }
    queries
}

async fn fetch_trend_day(geo: String, date: NaiveDate) -> anyhow::Result<Vec<TrendTopic>> {
    let client = reqwest::Client::builder()
        .timeout(FEED_TIMEOUT)
        .build()
        .context("building trend feed client")?;

    let url = format!(
        "{}?geo={}&hl=en&ed={}&ns=15",
        TREND_FEED_URL,
        urlencoding::encode(&geo),
        date.format("%Y%m%d")
    );

    let body = client
        .get(&url)
        .header("Content-Type", "application/json")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    parse_trend_payload(&body)
}

fn parse_trend_payload(body: &str) -> anyhow::Result<Vec<TrendTopic>> {
    let json = body
        .get(TREND_PREFIX_LEN..)
        .ok_or_else(|| anyhow!("payload shorter than its {}-byte framing", TREND_PREFIX_LEN))?;
    let feed: TrendResponse = serde_json::from_str(json).context("parsing trend payload")?;

    let day = feed.feed.trending_searches_days.into_iter().next();
    let entries = day.map(|d| d.trending_searches).unwrap_or_default();

    Ok(entries
        .into_iter()
        .map(|entry| TrendTopic {
            topic: entry.title.query.to_lowercase(),
            related: entry
                .related_queries
                .into_iter()
                .map(|q| q.query.to_lowercase())
                .collect(),
        })
        .collect())
}

async fn fetch_suggestions(term: &str) -> anyhow::Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(FEED_TIMEOUT)
        .build()
        .context("building suggestion client")?;

    let url = format!("{}?query={}", SUGGESTION_URL, urlencoding::encode(term));
    let body: serde_json::Value = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    parse_suggestions(&body)
}

/// The suggestion envelope is `[echoed query, [suggestions...], ...]`; the
/// list is the second element.
fn parse_suggestions(body: &serde_json::Value) -> anyhow::Result<Vec<String>> {
    let list = body
        .get(1)
        .ok_or_else(|| anyhow!("suggestion envelope has no list element"))?;
    serde_json::from_value(list.clone()).context("parsing suggestion list")
}

#[derive(Deserialize)]
struct TrendResponse {
    #[serde(rename = "default")]
    feed: TrendSection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendSection {
    #[serde(default)]
    trending_searches_days: Vec<TrendDay>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendDay {
    #[serde(default)]
    trending_searches: Vec<TrendEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendEntry {
    title: TrendTitle,
    #[serde(default)]
    related_queries: Vec<RelatedQuery>,
}

#[derive(Deserialize)]
struct TrendTitle {
    query: String,
}

#[derive(Deserialize)]
struct RelatedQuery {
    query: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn topic(name: &str, related: &[&str]) -> TrendTopic {
        TrendTopic {
            topic: name.to_string(),
            related: related.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_trend_payload_strips_framing() {
        let body = format!(
            ")]}}',{}",
            r#"{"default":{"trendingSearchesDays":[{"trendingSearches":[
                {"title":{"query":"Solar Eclipse"},"relatedQueries":[{"query":"Eclipse TIME"},{"query":"eclipse glasses"}]},
                {"title":{"query":"transfer news"},"relatedQueries":[]}
            ]},{"trendingSearches":[{"title":{"query":"ignored older day"},"relatedQueries":[]}]}]}}"#
        );

        let topics = parse_trend_payload(&body).unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].topic, "solar eclipse");
        assert_eq!(topics[0].related, vec!["eclipse time", "eclipse glasses"]);
        assert_eq!(topics[1].related.len(), 0);
    }

    #[test]
    fn test_parse_trend_payload_rejects_short_body() {
        assert!(parse_trend_payload(")]}}").is_err());
        assert!(parse_trend_payload("xxxxxnot json").is_err());
    }

    #[test]
    fn test_parse_suggestions_takes_second_element() {
        let body: serde_json::Value =
            serde_json::from_str(r#"["rust",["rust lang","rust game","rust belt"]]"#).unwrap();
        let list = parse_suggestions(&body).unwrap();
        assert_eq!(list, vec!["rust lang", "rust game", "rust belt"]);

        let empty: serde_json::Value = serde_json::from_str(r#"["rust"]"#).unwrap();
        assert!(parse_suggestions(&empty).is_err());
    }

    #[test]
    fn test_resolve_geo() {
        assert_eq!(resolve_geo(Some("gb"), true), "GB");
        assert_eq!(resolve_geo(Some("gb"), false), "US");
        assert_eq!(resolve_geo(Some("gbr"), true), "US");
        assert_eq!(resolve_geo(None, true), "US");
    }

    #[test]
    fn test_dedupe_topics_keeps_first_occurrence() {
        let raw = vec![
            topic("alpha", &["a1"]),
            topic("beta", &[]),
            topic("alpha", &["a2"]),
        ];
        let deduped = dedupe_topics(raw);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].related, vec!["a1"]);
    }

    #[test]
    fn test_flatten_queries_per_mode() {
        let topics = vec![topic("alpha", &["a1", "a2"]), topic("beta", &["b1"])];

        let desktop = flatten_queries(&topics, DeviceMode::Desktop);
        assert_eq!(desktop, vec!["alpha", "a1", "a2", "beta", "b1"]);

        let mobile = flatten_queries(&topics, DeviceMode::Mobile);
        assert_eq!(mobile, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_assemble_plan_has_no_duplicate_topics() {
        let raw = vec![
            topic("alpha", &["a1"]),
            topic("beta", &["b1"]),
            topic("alpha", &[]),
            topic("gamma", &[]),
        ];
        let plan = assemble_plan(raw, DeviceMode::Desktop);

        assert_eq!(plan.topics.len(), 3);
        let names: HashSet<&str> = plan.topics.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(names.len(), 3);
        // every topic appears in the flattened queue
        for name in names {
            assert!(plan.queries.iter().any(|q| q == name));
        }
    }

    #[tokio::test]
    async fn test_accumulate_walks_back_past_failures() {
        // three failed days, then a short day, then enough
        let calls = Mutex::new(0usize);
        let dates = Mutex::new(Vec::new());

        let topics = accumulate_topics(
            |date| {
                let call = {
                    let mut n = calls.lock().unwrap();
                    *n += 1;
                    *n
                };
                dates.lock().unwrap().push(date);
                async move {
                    match call {
                        1..=3 => Err(anyhow!("feed down")),
                        4 => Ok(vec![topic("day4-a", &[]), topic("day4-b", &[])]),
                        _ => Ok(vec![
                            topic("day5-a", &[]),
                            topic("day5-b", &[]),
                            topic("day5-c", &[]),
                        ]),
                    }
                }
            },
            5,
        )
        .await;

        assert_eq!(topics.len(), 5);
        let dates = dates.lock().unwrap();
        assert_eq!(dates.len(), 5);
        for pair in dates.windows(2) {
            assert_eq!(pair[0] - pair[1], chrono::Duration::days(1));
        }
    }

    #[tokio::test]
    async fn test_accumulate_stops_at_lookback_cap() {
        let calls = Mutex::new(0usize);
        let topics = accumulate_topics(
            |_| {
                *calls.lock().unwrap() += 1;
                async { Ok(Vec::new()) }
            },
            10,
        )
        .await;

        assert!(topics.is_empty());
        assert_eq!(*calls.lock().unwrap(), TREND_MAX_LOOKBACK_DAYS as usize);
    }
}
