//! System value sources: tickers, the cron scheduler, lifecycle events.
//!
//! Each source is a small task feeding root updates (depth 0) into the
//! engine. Tickers publish the current RFC 3339 timestamp into
//! `system/ticker/<interval>` at their cadence; the scheduler fires
//! system topics whose config carries a `cron` expression at each
//! matching minute with a bare `true`. Neither replays missed firings.

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EngineHandle, Job, TRIGGER_SCHEDULE, TRIGGER_SYSTEM, TRIGGER_TICKER};
use crate::topics::{Registry, RegistryError, TopicKind};

pub const STARTUP_TOPIC: &str = "system/events/startup";
pub const SHUTDOWN_TOPIC: &str = "system/events/shutdown";
pub const ERROR_TOPIC: &str = "system/events/error";
pub const HEARTBEAT_TOPIC: &str = "system/events/heartbeat";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Creates the engine-owned topics if this is a fresh deployment.
pub fn ensure_system_topics(
    registry: &Registry,
    ticker_intervals: &[(String, Duration)],
) -> Result<(), RegistryError> {
    for (label, _) in ticker_intervals {
        registry.ensure_system(
            &format!("system/ticker/{}", label),
            json!({"interval": label}),
            false,
        )?;
    }
    registry.ensure_system(STARTUP_TOPIC, json!({}), false)?;
    registry.ensure_system(SHUTDOWN_TOPIC, json!({}), false)?;
    registry.ensure_system(ERROR_TOPIC, json!({}), false)?;
    registry.ensure_system(
        HEARTBEAT_TOPIC,
        json!({"interval": "30s"}),
        true,
    )?;
    Ok(())
}

/// One task per configured interval. Drift is fine; missed ticks are not
/// caught up.
pub fn spawn_tickers(
    intervals: Vec<(String, Duration)>,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    intervals
        .into_iter()
        .map(|(label, period)| {
            let handle = handle.clone();
            let cancel = cancel.clone();
            let topic = format!("system/ticker/{}", label);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The immediate first tick would predate subscriber setup.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            handle.submit(Job::Update {
                                topic: topic.clone(),
                                value: json!(Utc::now().to_rfc3339()),
                                trigger: TRIGGER_TICKER.to_string(),
                                depth: 0,
                            });
                        }
                    }
                }
                debug!("ticker '{}' stopped", topic);
            })
        })
        .collect()
}

/// Heartbeat every 30 s; the topic is configured with `emit_to_mqtt`, so
/// each beat also reaches the broker.
pub fn spawn_heartbeat(handle: EngineHandle, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    handle.submit(Job::Update {
                        topic: HEARTBEAT_TOPIC.to_string(),
                        value: json!(Utc::now().to_rfc3339()),
                        trigger: TRIGGER_SYSTEM.to_string(),
                        depth: 0,
                    });
                }
            }
        }
    })
}

/// Minute-aligned scheduler over system topics with a `cron` config.
/// Fires `true` into each topic whose expression matches the minute.
pub fn spawn_scheduler(
    registry: Arc<Registry>,
    handle: EngineHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("cron scheduler started");
        loop {
            let wait = seconds_to_next_minute();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let minute = current_minute();
            for topic in registry.list(Some(TopicKind::System)) {
                let Some(expr) = topic.cron_expr() else {
                    continue;
                };
                match parse_cron(expr) {
                    Ok(schedule) => {
                        if fires_within_minute(&schedule, minute) {
                            debug!("cron fired for '{}'", topic.name);
                            handle.submit(Job::Update {
                                topic: topic.name.clone(),
                                value: json!(true),
                                trigger: TRIGGER_SCHEDULE.to_string(),
                                depth: 0,
                            });
                        }
                    }
                    Err(e) => {
                        warn!("topic '{}' has a bad cron expression: {}", topic.name, e)
                    }
                }
            }
        }
        info!("cron scheduler stopped");
    })
}

fn seconds_to_next_minute() -> Duration {
    let now = Utc::now();
    Duration::from_secs(60 - u64::from(now.second()).min(59))
}

fn current_minute() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// The `cron` crate wants a seconds field; users write classic 5-field
/// expressions. Prepend a zero-seconds column when needed.
fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {}", expr))
    } else {
        Schedule::from_str(expr)
    }
}

fn fires_within_minute(schedule: &Schedule, minute: DateTime<Utc>) -> bool {
    let just_before = minute - chrono::Duration::seconds(1);
    schedule
        .after(&just_before)
        .next()
        .is_some_and(|t| t >= minute && t < minute + chrono::Duration::seconds(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_normalized() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn every_minute_fires() {
        let schedule = parse_cron("* * * * *").unwrap();
        let minute = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        assert!(fires_within_minute(&schedule, minute));
    }

    #[test]
    fn hourly_fires_only_on_the_hour() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let half_past = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        assert!(fires_within_minute(&schedule, on_the_hour));
        assert!(!fires_within_minute(&schedule, half_past));
    }

    #[test]
    fn specific_time_matches_exactly() {
        let schedule = parse_cron("15 7 * * *").unwrap();
        let quarter_past_seven = Utc.with_ymd_and_hms(2024, 6, 1, 7, 15, 0).unwrap();
        let eight = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert!(fires_within_minute(&schedule, quarter_past_seven));
        assert!(!fires_within_minute(&schedule, eight));
    }

    #[tokio::test]
    async fn system_topics_are_created_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let metrics = Arc::new(crate::metrics::Metrics::new());
        let store = Arc::new(
            crate::store::SqliteStore::open(&dir.path().join("sources.db"), metrics, 100).unwrap(),
        );
        let registry = Registry::new(store);
        let intervals = vec![("1s".to_string(), Duration::from_secs(1))];

        ensure_system_topics(&registry, &intervals).unwrap();
        ensure_system_topics(&registry, &intervals).unwrap();

        let system = registry.list(Some(TopicKind::System));
        let names: Vec<&str> = system.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"system/ticker/1s"));
        assert!(names.contains(&HEARTBEAT_TOPIC));
        assert!(names.contains(&STARTUP_TOPIC));

        let heartbeat = registry.get(HEARTBEAT_TOPIC).unwrap();
        assert!(heartbeat.emit_to_mqtt);
    }
}
