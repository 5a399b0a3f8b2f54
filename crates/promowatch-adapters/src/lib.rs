//! Markup extraction for the retailer's announcement pages.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use promowatch_core::{AnnouncementRecord, CandidateReference, EffectivePeriod};
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "promowatch-adapters";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("container `{selector}` not found in markup")]
    ContainerMissing { selector: String },
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid date pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// CSS selectors locating listing entries and announcement fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSelectors {
    pub listing_container: String,
    pub listing_item: String,
    pub listing_anchor: String,
    pub detail_container: String,
    pub title: String,
    pub date: String,
    pub body: String,
    pub note: String,
}

impl Default for SiteSelectors {
    fn default() -> Self {
        Self {
            listing_container: "div#tabs-1".to_string(),
            listing_item: "li".to_string(),
            listing_anchor: "a".to_string(),
            detail_container: "div.content".to_string(),
            title: "h3".to_string(),
            date: "p.marketing_date".to_string(),
            body: "p.event_content".to_string(),
            note: "p.event_note".to_string(),
        }
    }
}

impl SiteSelectors {
    /// Load overrides from YAML; keys left out keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn compile(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Trailing run of ASCII digits in `link`, if any.
pub fn parse_trailing_identifier(link: &str) -> Option<i64> {
    let link = link.trim_end();
    let digits = link
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    link[link.len() - digits..].parse().ok()
}

/// Resolve a listing link against the detail prefix. Absolute links pass through.
pub fn detail_url(prefix: &str, link: &str) -> String {
    let link = link.trim();
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    match (prefix.ends_with('/'), link.starts_with('/')) {
        (true, true) => format!("{prefix}{}", &link[1..]),
        (false, false) => format!("{prefix}/{link}"),
        _ => format!("{prefix}{link}"),
    }
}

#[derive(Debug, Clone)]
pub struct ListingExtractor {
    container_css: String,
    container: Selector,
    item: Selector,
    anchor: Selector,
}

impl ListingExtractor {
    pub fn new(selectors: &SiteSelectors) -> Result<Self, ExtractionError> {
        Ok(Self {
            container_css: selectors.listing_container.clone(),
            container: compile(&selectors.listing_container)?,
            item: compile(&selectors.listing_item)?,
            anchor: compile(&selectors.listing_anchor)?,
        })
    }

    /// Candidate references in document order. Entries without an anchor target or
    /// without a numeric link suffix are not candidates and are skipped.
    pub fn extract_candidates(&self, markup: &str) -> Result<Vec<CandidateReference>, ExtractionError> {
        let document = Html::parse_document(markup);
        let container = document
            .select(&self.container)
            .next()
            .ok_or_else(|| ExtractionError::ContainerMissing {
                selector: self.container_css.clone(),
            })?;

        let mut candidates = Vec::new();
        for item in container.select(&self.item) {
            let Some(href) = item
                .select(&self.anchor)
                .next()
                .and_then(|a| a.value().attr("href"))
            else {
                debug!("listing item has no anchor target");
                continue;
            };
            let link = href.trim();
            let Some(identifier) = parse_trailing_identifier(link) else {
                debug!(link, "listing link has no trailing identifier");
                continue;
            };
            candidates.push(CandidateReference::new(identifier, link));
        }
        Ok(candidates)
    }
}

#[derive(Debug, Clone)]
pub struct DetailExtractor {
    container_css: String,
    container: Selector,
    title: Selector,
    date: Selector,
    body: Selector,
    note: Selector,
    periods: PeriodParser,
}

impl DetailExtractor {
    pub fn new(selectors: &SiteSelectors, utc_offset: FixedOffset) -> Result<Self, ExtractionError> {
        Ok(Self {
            container_css: selectors.detail_container.clone(),
            container: compile(&selectors.detail_container)?,
            title: compile(&selectors.title)?,
            date: compile(&selectors.date)?,
            body: compile(&selectors.body)?,
            note: compile(&selectors.note)?,
            periods: PeriodParser::new(utc_offset)?,
        })
    }

    /// Only a missing content container is an error; absent fields come back empty.
    pub fn extract_record(&self, markup: &str) -> Result<AnnouncementRecord, ExtractionError> {
        let document = Html::parse_document(markup);
        let container = document
            .select(&self.container)
            .next()
            .ok_or_else(|| ExtractionError::ContainerMissing {
                selector: self.container_css.clone(),
            })?;

        let date_text = first_text(container, &self.date);
        let period = self.periods.parse_effective_period(&date_text);
        Ok(AnnouncementRecord {
            title: first_text(container, &self.title),
            date_text,
            period,
            body: first_text(container, &self.body),
            note: first_text(container, &self.note),
        })
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> String {
    scope
        .select(selector)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Both extractors plus the link resolution rule for one site.
#[derive(Debug, Clone)]
pub struct SiteAdapter {
    detail_prefix: String,
    listing: ListingExtractor,
    detail: DetailExtractor,
}

impl SiteAdapter {
    pub fn new(
        selectors: &SiteSelectors,
        detail_prefix: impl Into<String>,
        utc_offset: FixedOffset,
    ) -> Result<Self, ExtractionError> {
        Ok(Self {
            detail_prefix: detail_prefix.into(),
            listing: ListingExtractor::new(selectors)?,
            detail: DetailExtractor::new(selectors, utc_offset)?,
        })
    }

    pub fn extract_candidates(&self, markup: &str) -> Result<Vec<CandidateReference>, ExtractionError> {
        self.listing.extract_candidates(markup)
    }

    pub fn extract_record(&self, markup: &str) -> Result<AnnouncementRecord, ExtractionError> {
        self.detail.extract_record(markup)
    }

    pub fn detail_url(&self, candidate: &CandidateReference) -> String {
        detail_url(&self.detail_prefix, &candidate.link)
    }
}

const DATE_TOKEN_PATTERN: &str = r"(?x)
    (?:
        (?P<year>[0-9]{4}) \s* (?:
            [/.\-] \s* (?P<month>[0-9]{1,2}) \s* [/.\-] \s* (?P<day>[0-9]{1,2})
          | 年 \s* (?P<cmonth>[0-9]{1,2}) \s* 月 \s* (?P<cday>[0-9]{1,2}) \s* 日?
        )
      | (?P<smonth>[0-9]{1,2}) \s* (?:
            / \s* (?P<sday>[0-9]{1,2})
          | 月 \s* (?P<scday>[0-9]{1,2}) \s* 日?
        )
    )
    (?: \s* [(（] [^)）]{1,4} [)）] )?
    (?: \s* (?P<hour>[0-9]{1,2}) \s* [:：] \s* (?P<minute>[0-9]{2})
        (?: \s* [-~～–] \s* (?P<until_hour>[0-9]{1,2}) \s* [:：] \s* (?P<until_minute>[0-9]{2}) )?
    )?
";

/// Text between two dates that makes the second one the end of a range.
const RANGE_CONNECTORS: &[&str] = &["-", "~", "～", "–", "—", "至", "到", "起至"];

/// Phrases meaning the window opens at publication time, which the text does not date.
const OPEN_START_MARKERS: &[&str] = &["即日起", "即日至", "即日開始"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateToken {
    date: NaiveDate,
    time: Option<NaiveTime>,
    until: Option<NaiveTime>,
    end: usize,
}

/// Reads the promotion window out of a free-text date line.
///
/// Dates look like `2026/10/24`, `2026-10-24`, `2026.10.24` or `2026年10月24日`, optionally
/// followed by a weekday in parentheses and an `HH:MM` or `HH:MM-HH:MM` time. A later date
/// may omit the year (`5/31`, `5月31日`) when it directly follows a range connector; it
/// inherits the previous year and rolls into the next one when needed. The first date opens
/// the window and the last one closes it. A missing time means start-of-day or end-of-day.
/// Anything unreadable stays raw: open-start phrasing, an impossible calendar date, or a
/// window that ends before it starts.
#[derive(Debug, Clone)]
pub struct PeriodParser {
    date_token: Regex,
    utc_offset: FixedOffset,
}

impl PeriodParser {
    pub fn new(utc_offset: FixedOffset) -> Result<Self, ExtractionError> {
        Ok(Self {
            date_token: Regex::new(DATE_TOKEN_PATTERN)?,
            utc_offset,
        })
    }

    pub fn parse_effective_period(&self, text: &str) -> EffectivePeriod {
        if OPEN_START_MARKERS.iter().any(|marker| text.contains(marker)) {
            return EffectivePeriod::Raw(text.to_string());
        }
        self.scan_dates(text)
            .and_then(|tokens| self.period_from_tokens(&tokens))
            .unwrap_or_else(|| EffectivePeriod::Raw(text.to_string()))
    }

    fn period_from_tokens(&self, tokens: &[DateToken]) -> Option<EffectivePeriod> {
        let first = tokens.first()?;
        let last = tokens.last()?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)?;
        let start = first.date.and_time(first.time.unwrap_or(NaiveTime::MIN));
        let end_time = if tokens.len() == 1 {
            first.until.unwrap_or(end_of_day)
        } else {
            last.until.or(last.time).unwrap_or(end_of_day)
        };
        let end = last.date.and_time(end_time);
        if end < start {
            return None;
        }
        Some(EffectivePeriod::Range {
            start: self.to_utc(start)?,
            end: self.to_utc(end)?,
        })
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        Some(self.utc_offset.from_local_datetime(&local).single()?.with_timezone(&Utc))
    }

    /// `None` when a full date is present but is not a real calendar day.
    fn scan_dates(&self, text: &str) -> Option<Vec<DateToken>> {
        let mut tokens: Vec<DateToken> = Vec::new();
        for caps in self.date_token.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if !standalone(text, whole.start(), whole.end()) {
                continue;
            }

            let date = if let Some(year) = caps.name("year") {
                let year: i32 = year.as_str().parse().ok()?;
                let month = number(&caps, "month").or_else(|| number(&caps, "cmonth"))?;
                let day = number(&caps, "day").or_else(|| number(&caps, "cday"))?;
                NaiveDate::from_ymd_opt(year, month, day)?
            } else {
                let Some(prev) = tokens.last() else { continue };
                if !RANGE_CONNECTORS.contains(&text[prev.end..whole.start()].trim()) {
                    continue;
                }
                let (Some(month), Some(day)) = (
                    number(&caps, "smonth"),
                    number(&caps, "sday").or_else(|| number(&caps, "scday")),
                ) else {
                    continue;
                };
                let Some(date) = inherit_year(prev.date, month, day) else { continue };
                date
            };

            tokens.push(DateToken {
                date,
                time: clock(&caps, "hour", "minute"),
                until: clock(&caps, "until_hour", "until_minute"),
                end: whole.end(),
            });
        }
        Some(tokens)
    }
}

fn number(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name)?.as_str().parse().ok()
}

fn clock(caps: &Captures<'_>, hour: &str, minute: &str) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(number(caps, hour)?, number(caps, minute)?, 0)
}

/// Rejects matches glued to more digits or slashes, e.g. `10/24/2026` or `12026/1/1`.
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let glued = |c: Option<char>| matches!(c, Some(c) if c.is_ascii_digit() || c == '/');
    !glued(text[..start].chars().next_back()) && !glued(text[end..].chars().next())
}

fn inherit_year(prev: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(prev.year(), month, day)?;
    if date < prev {
        NaiveDate::from_ymd_opt(prev.year() + 1, month, day)
    } else {
        Some(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures/starbucks-tw").join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn taipei() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn utc(text: &str) -> chrono::DateTime<Utc> {
        chrono::DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn periods() -> PeriodParser {
        PeriodParser::new(taipei()).unwrap()
    }

    fn adapter() -> SiteAdapter {
        SiteAdapter::new(&SiteSelectors::default(), "https://www.starbucks.com.tw/stores/", taipei())
            .unwrap()
    }

    #[test]
    fn trailing_identifier_parsing() {
        assert_eq!(parse_trailing_identifier("allevent_detail.jspx?id=1234"), Some(1234));
        assert_eq!(parse_trailing_identifier("event/77 "), Some(77));
        assert_eq!(parse_trailing_identifier("event/77/detail"), None);
        assert_eq!(parse_trailing_identifier("javascript:void(0)"), None);
        assert_eq!(parse_trailing_identifier(""), None);
        assert_eq!(parse_trailing_identifier("id=99999999999999999999999"), None);
    }

    #[test]
    fn detail_url_joins_prefix_and_link() {
        let prefix = "https://www.starbucks.com.tw/stores/";
        assert_eq!(
            detail_url(prefix, "allevent_detail.jspx?id=5"),
            "https://www.starbucks.com.tw/stores/allevent_detail.jspx?id=5"
        );
        assert_eq!(
            detail_url(prefix, "/allevent_detail.jspx?id=5"),
            "https://www.starbucks.com.tw/stores/allevent_detail.jspx?id=5"
        );
        assert_eq!(
            detail_url("https://example.test/stores", "e?id=5"),
            "https://example.test/stores/e?id=5"
        );
        assert_eq!(
            detail_url(prefix, "https://other.test/e?id=5"),
            "https://other.test/e?id=5"
        );
    }

    #[test]
    fn listing_fixture_yields_candidates_in_document_order() {
        let candidates = adapter().extract_candidates(&fixture("listing.html")).unwrap();
        let ids = candidates.iter().map(|c| c.identifier).collect::<Vec<_>>();
        assert_eq!(ids, vec![101, 103, 102, 103]);
        assert_eq!(candidates[0].link, "allevent_detail.jspx?id=101");
    }

    #[test]
    fn listing_without_container_is_an_error() {
        let err = adapter()
            .extract_candidates("<html><body><ul><li><a href=\"x?id=1\">x</a></li></ul></body></html>")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::ContainerMissing { ref selector } if selector == "div#tabs-1"));
    }

    #[test]
    fn empty_listing_container_yields_no_candidates() {
        let candidates = adapter()
            .extract_candidates("<div id=\"tabs-1\"><ul></ul></div>")
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn full_detail_page_extracts_every_field() {
        let record = adapter().extract_record(&fixture("detail_full.html")).unwrap();
        assert_eq!(record.title, "週末買一送一");
        assert_eq!(record.date_text, "活動期間：2026/10/24(六) - 2026/10/25(日)");
        assert_eq!(record.body, "指定飲料買一送一，每人每次限兌換一次。");
        assert_eq!(record.note, "本活動不適用於外送平台。");
        assert_eq!(
            record.period,
            EffectivePeriod::Range {
                start: utc("2026-10-23T16:00:00Z"),
                end: utc("2026-10-25T15:59:59Z"),
            }
        );
    }

    #[test]
    fn missing_note_is_an_empty_string() {
        let record = adapter().extract_record(&fixture("detail_missing_note.html")).unwrap();
        assert_eq!(record.title, "星禮程雙倍星星");
        assert_eq!(record.note, "");
        assert_eq!(record.period, EffectivePeriod::Raw("即日起至售完為止".into()));
    }

    #[test]
    fn container_with_no_fields_is_still_a_record() {
        let record = adapter()
            .extract_record("<div class=\"content\"><p>unrelated</p></div>")
            .unwrap();
        assert_eq!(record, AnnouncementRecord::default());
    }

    #[test]
    fn missing_content_container_is_the_only_hard_failure() {
        let err = adapter()
            .extract_record(&fixture("detail_no_container.html"))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::ContainerMissing { ref selector } if selector == "div.content"));
    }

    #[test]
    fn period_with_times_and_inherited_year() {
        let period = periods().parse_effective_period("2026/5/1 10:00 ~ 5/31 21:30");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-05-01T02:00:00Z"),
                end: utc("2026-05-31T13:30:00Z"),
            }
        );
    }

    #[test]
    fn period_with_weekday_before_time() {
        let period = periods().parse_effective_period("2026-12-24（四） 18:00 至 2026-12-25（五）");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-12-24T10:00:00Z"),
                end: utc("2026-12-25T15:59:59Z"),
            }
        );
    }

    #[test]
    fn period_rolls_short_date_into_next_year() {
        let period = periods().parse_effective_period("2026/12/30 - 1/3");
        assert_eq!(period.end(), Some(utc("2027-01-03T15:59:59Z")));
    }

    #[test]
    fn single_chinese_date_covers_that_day() {
        let period = periods().parse_effective_period("2026年11月1日起");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-10-31T16:00:00Z"),
                end: utc("2026-11-01T15:59:59Z"),
            }
        );
    }

    #[test]
    fn slash_numbers_in_prose_are_not_dates() {
        let period = periods().parse_effective_period("2026/10/24 - 2026/10/25 第2/3杯");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-10-23T16:00:00Z"),
                end: utc("2026-10-25T15:59:59Z"),
            }
        );

        let single = periods().parse_effective_period("2026/10/24 限量1/2價");
        assert_eq!(single.end(), Some(utc("2026-10-24T15:59:59Z")));
    }

    #[test]
    fn single_date_with_hours_spans_those_hours() {
        let period = periods().parse_effective_period("2026/10/24 10:00-22:00");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-10-24T02:00:00Z"),
                end: utc("2026-10-24T14:00:00Z"),
            }
        );
    }

    #[test]
    fn single_date_with_opening_time_runs_to_end_of_day() {
        let period = periods().parse_effective_period("2026/10/24(六) 10:00 開賣");
        assert_eq!(
            period,
            EffectivePeriod::Range {
                start: utc("2026-10-24T02:00:00Z"),
                end: utc("2026-10-24T15:59:59Z"),
            }
        );
    }

    #[test]
    fn chinese_short_date_after_connector_inherits_year() {
        let period = periods().parse_effective_period("2026年12月30日至1月3日");
        assert_eq!(period.start(), Some(utc("2026-12-29T16:00:00Z")));
        assert_eq!(period.end(), Some(utc("2027-01-03T15:59:59Z")));
    }

    #[test]
    fn us_style_dates_are_not_read_as_short_dates() {
        let period = periods().parse_effective_period("2026/10/01 - 10/24/2026");
        assert_eq!(period.end(), Some(utc("2026-10-01T15:59:59Z")));
    }

    #[test]
    fn unreadable_periods_stay_raw() {
        for text in [
            "即日起至售完為止",
            "即日起至2026/12/31止",
            "2026/02/30 - 2026/03/02",
            "2026/10/25 - 2026/10/24",
            "",
        ] {
            assert_eq!(
                periods().parse_effective_period(text),
                EffectivePeriod::Raw(text.to_string()),
                "{text}"
            );
        }
    }

    #[test]
    fn yaml_overrides_replace_only_named_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selectors.yaml");
        fs::write(&path, "listing_container: \"section.events\"\nnote: \"div.fineprint\"\n").unwrap();

        let selectors = SiteSelectors::from_yaml_file(&path).unwrap();
        assert_eq!(selectors.listing_container, "section.events");
        assert_eq!(selectors.note, "div.fineprint");
        assert_eq!(selectors.title, SiteSelectors::default().title);

        let listing = ListingExtractor::new(&selectors).unwrap();
        let candidates = listing
            .extract_candidates("<section class=\"events\"><li><a href=\"e?id=8\">e</a></li></section>")
            .unwrap();
        assert_eq!(candidates, vec![CandidateReference::new(8, "e?id=8")]);
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = SiteSelectors {
            title: "h3[".to_string(),
            ..SiteSelectors::default()
        };
        let err = DetailExtractor::new(&selectors, taipei()).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidSelector { ref selector, .. } if selector == "h3["));
    }
}
