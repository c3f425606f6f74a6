//! iCalendar feed connector.
//!
//! The feed has no cursor: every run downloads the whole `.ics`, keeps events starting
//! inside `[start of today, start of today + fetch_days]`, and drops ids already in the
//! local cache.

use super::content_id;
use crate::http;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use std::collections::HashSet;
use tidemark_core::config::CalendarConfig;
use tidemark_core::{
    CacheEntry, CacheSettings, CursorMode, Error, LocalCache, Result, SourceAdapter, SyncItem,
};
use tracing::instrument;

pub const CALENDAR_TYPE: &str = "calendar";
const CACHE_NAME: &str = "calendar";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalendarEvent {
    pub uid: Option<String>,
    pub summary: String,
    pub url: Option<String>,
    pub start: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    fn id(&self, start: DateTime<Utc>) -> String {
        content_id(&[&self.summary, &start.to_rfc3339()])
    }
}

/// Join folded lines: a line starting with a space or tab continues the previous one.
fn unfold(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        match line.strip_prefix([' ', '\t']) {
            Some(rest) if !lines.is_empty() => {
                if let Some(last) = lines.last_mut() {
                    last.push_str(rest);
                }
            }
            _ => lines.push(line.to_string()),
        }
    }
    lines
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `TZID` parameter of a property head such as `DTSTART;TZID="Asia/Tokyo"`.
fn tzid_param(head: &str) -> Option<&str> {
    head.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("TZID")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// `DTSTART` value: `YYYYMMDD`, `YYYYMMDDTHHMMSS` or `YYYYMMDDTHHMMSSZ`.
///
/// Local times are resolved in their `TZID` zone. Dates, floating times and times in an
/// unknown zone are read as UTC.
fn parse_ics_date(head: &str, value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|e| Error::parse(format!("ics date '{value}'"), e))?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::InvalidInput(format!("ics date '{value}' has no midnight")))?;
        return Ok(date.and_utc());
    }

    let (local, is_utc) = match value.strip_suffix('Z') {
        Some(v) => (v, true),
        None => (value, false),
    };
    let naive = NaiveDateTime::parse_from_str(local, "%Y%m%dT%H%M%S")
        .map_err(|e| Error::parse(format!("ics date-time '{value}'"), e))?;
    if is_utc {
        return Ok(naive.and_utc());
    }

    let Some(tzid) = tzid_param(head) else {
        tracing::warn!(value, "floating ics time; reading as UTC");
        return Ok(naive.and_utc());
    };
    let Ok(tz) = tzid.parse::<Tz>() else {
        tracing::warn!(tzid, value, "unknown ics TZID; reading as UTC");
        return Ok(naive.and_utc());
    };
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => Ok(dt.with_timezone(&Utc)),
        None => {
            tracing::warn!(tzid, value, "ics time falls in a DST gap; reading as UTC");
            Ok(naive.and_utc())
        }
    }
}

/// Extract `VEVENT` components from an iCalendar document.
pub fn parse_ics(raw: &str) -> Result<Vec<CalendarEvent>> {
    let mut events = Vec::new();
    let mut current: Option<CalendarEvent> = None;
    let mut nested = 0usize;
    for line in unfold(raw) {
        let Some((head, value)) = line.split_once(':') else {
            continue;
        };
        let name = head.split(';').next().unwrap_or(head).to_ascii_uppercase();
        if value.eq_ignore_ascii_case("VEVENT") {
            match name.as_str() {
                "BEGIN" => current = Some(CalendarEvent::default()),
                "END" => events.extend(current.take()),
                _ => {}
            }
            continue;
        }
        // Properties of nested components (VALARM) do not belong to the event.
        if current.is_some() {
            match name.as_str() {
                "BEGIN" => nested += 1,
                "END" => nested = nested.saturating_sub(1),
                _ => {}
            }
        }
        let Some(ev) = current.as_mut().filter(|_| nested == 0) else {
            continue;
        };
        match name.as_str() {
            "UID" => ev.uid = Some(value.to_string()),
            "SUMMARY" => ev.summary = unescape_text(value),
            "URL" => ev.url = Some(value.to_string()),
            "DTSTART" => ev.start = Some(parse_ics_date(head, value)?),
            _ => {}
        }
    }
    Ok(events)
}

pub struct CalendarConnector {
    client: Client,
    config: CalendarConfig,
    cache: LocalCache,
}

impl CalendarConnector {
    pub fn new(config: CalendarConfig, cache: &CacheSettings) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            config,
            cache: cache
                .open(CACHE_NAME)
                .with_retention(ChronoDuration::days(1)),
        })
    }

    #[instrument(level = "info", skip(self))]
    async fn fetch_at(&self, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let resp = self
            .client
            .get(&self.config.calendar_url)
            .send()
            .await
            .map_err(|e| http::send_error("Calendar fetch failed", e))?;
        let resp = http::check("Calendar fetch failed", resp).await?;
        let body = http::text("Calendar fetch failed", resp).await?;
        let events = parse_ics(&body)?;

        let window_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let window_end = window_start + ChronoDuration::days(i64::from(self.config.calendar_fetch_days));

        let seen: HashSet<String> = self.cache.read().await.into_iter().map(|e| e.id).collect();
        let mut items = Vec::new();
        let mut entries = Vec::new();
        for event in &events {
            let Some(start) = event.start else {
                tracing::warn!(uid = ?event.uid, "event without DTSTART skipped");
                continue;
            };
            if start < window_start || start > window_end {
                continue;
            }
            let id = event.id(start);
            if seen.contains(&id) {
                continue;
            }
            let mut item =
                SyncItem::new(CALENDAR_TYPE, event.summary.as_str(), start.timestamp_millis());
            if let Some(url) = &event.url {
                item = item.with_url(url);
            }
            entries.push(CacheEntry::new(id, start.timestamp_millis()));
            items.push(item);
        }
        tracing::info!(events = events.len(), new = items.len(), "calendar events");

        // Window-relative pruning: anything older than a day before the window start is gone.
        self.cache.merge_at(entries, window_start).await?;
        Ok(items)
    }
}

#[async_trait]
impl SourceAdapter for CalendarConnector {
    fn id(&self) -> &'static str {
        "calendar"
    }

    fn source_type(&self) -> &str {
        CALENDAR_TYPE
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::LocalCache
    }

    async fn fetch(&self, _cursor: Option<&SyncItem>) -> Result<Vec<SyncItem>> {
        self.fetch_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ICS: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:past@example.com\r\n\
SUMMARY:Yesterday\r\n\
DTSTART:20240114T090000Z\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:standup@example.com\r\n\
SUMMARY:Team standup\\, daily\r\n\
DTSTART;TZID=Asia/Tokyo:20240116T100000\r\n\
URL:https://meet.example.com/standup\r\n\
BEGIN:VALARM\r\n\
SUMMARY:Reminder\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:offsite@example.com\r\n\
SUMMARY:Offsite planning with a very long\r\n  folded title\r\n\
DTSTART;VALUE=DATE:20240120\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:far@example.com\r\n\
SUMMARY:Far future\r\n\
DTSTART:20240401T090000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_events_with_folding_and_escapes() {
        let events = parse_ics(ICS).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1].summary, "Team standup, daily");
        assert_eq!(events[1].start, Some(at("2024-01-16T01:00:00Z")));
        assert_eq!(events[1].url.as_deref(), Some("https://meet.example.com/standup"));
        assert_eq!(events[2].summary, "Offsite planning with a very long folded title");
        assert_eq!(events[2].start, Some(at("2024-01-20T00:00:00Z")));
    }

    #[test]
    fn dtstart_honours_tzid() {
        let cases = [
            ("DTSTART;TZID=Asia/Tokyo", "20240116T100000", "2024-01-16T01:00:00Z"),
            ("DTSTART;TZID=\"America/New_York\"", "20240716T100000", "2024-07-16T14:00:00Z"),
            ("DTSTART;TZID=Europe/Berlin", "20240116T100000Z", "2024-01-16T10:00:00Z"),
            ("DTSTART", "20240116T100000", "2024-01-16T10:00:00Z"),
            ("DTSTART;TZID=Tokyo Standard Time", "20240116T100000", "2024-01-16T10:00:00Z"),
            ("DTSTART;VALUE=DATE", "20240116", "2024-01-16T00:00:00Z"),
        ];
        for (head, value, expected) in cases {
            assert_eq!(parse_ics_date(head, value).unwrap(), at(expected), "{head}:{value}");
        }
        assert!(parse_ics_date("DTSTART", "2024-01-16").is_err());
    }

    #[tokio::test]
    async fn keeps_window_and_dedups_on_rerun() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cal.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ICS))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let connector = CalendarConnector::new(
            CalendarConfig {
                calendar_url: format!("{}/cal.ics", server.uri()),
                calendar_fetch_days: 28,
            },
            &CacheSettings::new(dir.path()),
        )
        .unwrap();
        let now = at("2024-01-15T08:00:00Z");

        let first = connector.fetch_at(now).await.unwrap();
        let titles: Vec<_> = first.iter().map(|i| i.title.plain_text()).collect();
        assert_eq!(
            titles,
            ["Team standup, daily", "Offsite planning with a very long folded title"]
        );
        assert_eq!(first[0].source_type, "calendar");

        let second = connector.fetch_at(now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let connector = CalendarConnector::new(
            CalendarConfig {
                calendar_url: server.uri(),
                calendar_fetch_days: 7,
            },
            &CacheSettings::new(dir.path()),
        )
        .unwrap();
        let err = connector.fetch(None).await.unwrap_err();
        assert_eq!(err.class(), tidemark_core::FailureClass::Retryable);
    }
}
