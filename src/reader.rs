use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use reqwest::{Client, Response};
use thiserror::Error;

const USER_AGENT: &str = "gator";

/// Default cap on a feed body.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// Longest named or numeric entity looked for, `&` and `;` included.
const MAX_ENTITY_LEN: usize = 32;

/// Errors that can occur while fetching or decoding a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("response larger than {limit} bytes")]
    ResponseTooLarge { limit: usize },
    /// Body is not an RSS channel document
    #[error("parse error: {0}")]
    Parse(String),
}

/// A decoded RSS channel with entity-unescaped text fields.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RawItem>,
}

/// One feed entry as it appeared in the document.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

impl RawItem {
    /// Best-effort publish time, see [`parse_pub_date`].
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        parse_pub_date(&self.pub_date)
    }
}

impl From<&rss::Item> for RawItem {
    fn from(item: &rss::Item) -> Self {
        Self {
            title: unescape_html(item.title().unwrap_or_default()),
            link: item.link().unwrap_or_default().to_string(),
            description: unescape_html(item.description().unwrap_or_default()),
            pub_date: item.pub_date().unwrap_or_default().to_string(),
        }
    }
}

impl From<rss::Channel> for Channel {
    fn from(channel: rss::Channel) -> Self {
        Self {
            title: unescape_html(channel.title()),
            link: channel.link().to_string(),
            description: unescape_html(channel.description()),
            items: channel.items().iter().map(RawItem::from).collect(),
        }
    }
}

#[derive(Clone)]
pub struct FeedReader {
    client: Client,
    max_body_size: usize,
}

impl FeedReader {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            max_body_size: MAX_FEED_SIZE,
        })
    }

    /// Bodies over `limit` bytes fail with [`FetchError::ResponseTooLarge`].
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Issues a single GET for `url` and decodes the body. `timeout` bounds the
    /// whole request, body included.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<Channel, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let body = read_limited_bytes(response, self.max_body_size).await?;
        parse_channel(&body)
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err)
    }
}

/// Reads the body chunk by chunk, giving up as soon as it passes `limit`.
async fn read_limited_bytes(mut response: Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Decodes an RSS document and unescapes HTML entities in the channel and
/// item titles and descriptions.
pub fn parse_channel(xml: &[u8]) -> Result<Channel, FetchError> {
    rss::Channel::read_from(xml)
        .map(Channel::from)
        .map_err(|e| FetchError::Parse(e.to_string()))
}

/// Decodes every well-formed entity and keeps anything else, such as a bare
/// `&` or an unknown name, as written.
fn unescape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = entity_len(tail)
            .and_then(|len| Some((len, htmlescape::decode_html(&tail[..len]).ok()?)));
        match decoded {
            Some((len, text)) => {
                out.push_str(&text);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Length of the `&name;` or `&#nn;` at the start of `tail`, if there is one.
fn entity_len(tail: &str) -> Option<usize> {
    let end = tail
        .bytes()
        .take(MAX_ENTITY_LEN)
        .position(|b| b == b';')?;
    let name = &tail[1..end];
    let well_formed =
        !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'#');
    well_formed.then_some(end + 1)
}

enum DateFormat {
    /// Pattern ends with a numeric `%z` offset
    Offset(&'static str),
    /// Pattern is followed by a zone abbreviation such as `GMT`
    ZoneName(&'static str),
    Rfc3339,
    /// No zone information; read as UTC
    Naive(&'static str),
}

/// Tried after any leading weekday has been removed.
const DATE_FORMATS: &[DateFormat] = &[
    DateFormat::Offset("%d %b %Y %H:%M:%S %z"),
    DateFormat::ZoneName("%d %b %Y %H:%M:%S"),
    DateFormat::Rfc3339,
    DateFormat::Naive("%Y-%m-%dT%H:%M:%SZ"),
    DateFormat::Naive("%Y-%m-%dT%H:%M:%S"),
    DateFormat::Naive("%Y-%m-%d %H:%M:%S"),
];

/// Normalizes a `pubDate` value. The first format that matches wins; empty or
/// unrecognized input gives `None`. A leading `Mon, ` is accepted but not
/// checked against the date, since feeds often get it wrong.
pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = strip_weekday(raw.trim());
    if raw.is_empty() {
        return None;
    }
    DATE_FORMATS.iter().find_map(|format| parse_with(format, raw))
}

fn strip_weekday(raw: &str) -> &str {
    match raw.split_once(',') {
        Some((day, rest)) if !day.is_empty() && day.chars().all(|c| c.is_ascii_alphabetic()) => {
            rest.trim_start()
        }
        _ => raw,
    }
}

fn parse_with(format: &DateFormat, raw: &str) -> Option<DateTime<Utc>> {
    match format {
        DateFormat::Offset(pattern) => DateTime::parse_from_str(raw, pattern)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        DateFormat::ZoneName(pattern) => {
            let (stamp, zone) = raw.rsplit_once(' ')?;
            let offset = zone_offset(zone)?;
            let naive = NaiveDateTime::parse_from_str(stamp, pattern).ok()?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
        DateFormat::Rfc3339 => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        DateFormat::Naive(pattern) => NaiveDateTime::parse_from_str(raw, pattern)
            .ok()
            .map(|naive| naive.and_utc()),
    }
}

/// Offsets for the RFC 822 zone names. Other alphabetic abbreviations are
/// read as UTC.
fn zone_offset(zone: &str) -> Option<FixedOffset> {
    if zone.is_empty() || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let hours = match zone.to_ascii_uppercase().as_str() {
        "EDT" => -4,
        "EST" | "CDT" => -5,
        "CST" | "MDT" => -6,
        "MST" | "PDT" => -7,
        "PST" => -8,
        _ => 0,
    };
    FixedOffset::east_opt(hours * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    mod parse_pub_date_tests {
        use super::*;

        #[test]
        fn test_rfc1123_with_numeric_zone() {
            let parsed = parse_pub_date("Mon, 02 Jan 2006 15:04:05 -0700").unwrap();
            let expected = Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap();
            assert_eq!(parsed, expected);
        }

        #[test]
        fn test_rfc1123_single_digit_day() {
            let parsed = parse_pub_date("Mon, 2 Jan 2006 15:04:05 +0000").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap());
        }

        #[test]
        fn test_rfc1123_with_gmt() {
            let parsed = parse_pub_date("Mon, 09 Dec 2024 12:00:00 GMT").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_rfc1123_with_us_zone() {
            let parsed = parse_pub_date("Mon, 09 Dec 2024 12:00:00 EST").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 17, 0, 0).unwrap());
        }

        #[test]
        fn test_wrong_weekday_is_ignored() {
            // 09 Dec 2024 was a Monday
            let parsed = parse_pub_date("Tue, 09 Dec 2024 12:00:00 +0000").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
            let parsed = parse_pub_date("Fri, 09 Dec 2024 12:00:00 GMT").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_without_weekday() {
            let parsed = parse_pub_date("09 Dec 2024 12:00:00 +0100").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 11, 0, 0).unwrap());
        }

        #[test]
        fn test_iso8601_with_offset() {
            let parsed = parse_pub_date("2024-12-09T12:00:00+02:00").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 10, 0, 0).unwrap());
        }

        #[test]
        fn test_iso8601_utc() {
            let parsed = parse_pub_date("2024-12-09T12:00:00Z").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_iso8601_without_zone() {
            let parsed = parse_pub_date("2024-12-09T12:00:00").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_bare_date_time() {
            let parsed = parse_pub_date("2024-12-09 12:00:00").unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_surrounding_whitespace_ignored() {
            assert!(parse_pub_date("\n  2024-12-09 12:00:00  ").is_some());
        }

        #[test]
        fn test_empty_is_absent() {
            assert_eq!(parse_pub_date(""), None);
            assert_eq!(parse_pub_date("   "), None);
        }

        #[test]
        fn test_unrecognized_is_absent() {
            assert_eq!(parse_pub_date("yesterday afternoon"), None);
            assert_eq!(parse_pub_date("12/09/2024"), None);
            assert_eq!(parse_pub_date("Mon, 09 Dec 2024 12:00:00 +05:30:00"), None);
        }

        #[test]
        fn test_raw_item_published_at() {
            let item = RawItem {
                pub_date: "Mon, 02 Jan 2006 15:04:05 -0700".to_string(),
                ..Default::default()
            };
            assert!(item.published_at().is_some());
            assert!(RawItem::default().published_at().is_none());
        }
    }

    mod parse_channel_tests {
        use super::*;

        #[test]
        fn test_parse_channel_and_items() {
            let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0">
                    <channel>
                        <title>Tech News</title>
                        <link>https://technews.example.com</link>
                        <description>Latest tech news</description>
                        <item>
                            <title>First</title>
                            <link>https://technews.example.com/article/1</link>
                            <description>One</description>
                            <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                        </item>
                        <item>
                            <title>Second</title>
                            <link>https://technews.example.com/article/2</link>
                        </item>
                    </channel>
                </rss>
            "#;

            let channel = parse_channel(xml.as_bytes()).unwrap();

            assert_eq!(channel.title, "Tech News");
            assert_eq!(channel.link, "https://technews.example.com");
            assert_eq!(channel.items.len(), 2);
            assert_eq!(channel.items[0].link, "https://technews.example.com/article/1");
            assert_eq!(channel.items[0].pub_date, "Mon, 09 Dec 2024 12:00:00 GMT");
            assert_eq!(channel.items[1].description, "");
            assert_eq!(channel.items[1].pub_date, "");
        }

        #[test]
        fn test_html_entities_unescaped() {
            let xml = r#"<rss><channel>
                <title>Tom &amp;amp; Jerry</title>
                <description>&amp;lt;b&amp;gt;bold&amp;lt;/b&amp;gt;</description>
                <item>
                    <title>It&amp;#39;s here</title>
                    <link>https://example.com/1</link>
                    <description><![CDATA[caf&eacute; &amp; more]]></description>
                </item>
            </channel></rss>"#;

            let channel = parse_channel(xml.as_bytes()).unwrap();

            assert_eq!(channel.title, "Tom & Jerry");
            assert_eq!(channel.description, "<b>bold</b>");
            assert_eq!(channel.items[0].title, "It's here");
            assert_eq!(channel.items[0].description, "café & more");
        }

        #[test]
        fn test_bare_ampersand_does_not_block_other_entities() {
            let xml = r#"<rss><channel><title>Q&amp;A</title>
                <item>
                    <title>Tom &amp; Jerry &amp;amp; friends&amp;#39;</title>
                    <link>https://example.com/1</link>
                </item>
            </channel></rss>"#;

            let channel = parse_channel(xml.as_bytes()).unwrap();

            assert_eq!(channel.title, "Q&A");
            assert_eq!(channel.items[0].title, "Tom & Jerry & friends'");
        }

        #[test]
        fn test_unescape_keeps_unknown_entities() {
            assert_eq!(unescape_html("AT&T &bogus; &#x27;x&#x27;"), "AT&T &bogus; 'x'");
            assert_eq!(unescape_html("trailing &"), "trailing &");
            assert_eq!(unescape_html("&amp"), "&amp");
        }

        #[test]
        fn test_atom_self_link_in_channel() {
            let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
                    <channel>
                        <title>T</title>
                        <link>https://x.com</link>
                        <atom:link href="https://x.com/feed" rel="self" type="application/rss+xml"/>
                        <description>D</description>
                        <item>
                            <title>Post</title>
                            <link>https://x.com/post</link>
                        </item>
                    </channel>
                </rss>"#;

            let channel = parse_channel(xml.as_bytes()).unwrap();

            assert_eq!(channel.link, "https://x.com");
            assert_eq!(channel.items.len(), 1);
            assert_eq!(channel.items[0].link, "https://x.com/post");
        }

        #[test]
        fn test_atom_link_in_item() {
            let xml = r#"<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
                <channel>
                    <title>T</title>
                    <item>
                        <title>Post</title>
                        <link>https://x.com/post</link>
                        <atom:link href="https://x.com/post#comments" rel="replies"/>
                        <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                    </item>
                </channel>
            </rss>"#;

            let channel = parse_channel(xml.as_bytes()).unwrap();

            assert_eq!(channel.items[0].link, "https://x.com/post");
            assert!(channel.items[0].published_at().is_some());
        }

        #[test]
        fn test_channel_without_items() {
            let xml = "<rss><channel><title>Empty</title></channel></rss>";
            let channel = parse_channel(xml.as_bytes()).unwrap();
            assert!(channel.items.is_empty());
        }

        #[test]
        fn test_malformed_xml_is_parse_error() {
            let result = parse_channel(b"<rss><channel><title>Broken</channel>");
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_non_rss_document_is_parse_error() {
            let result = parse_channel(b"<html><body>Not a feed</body></html>");
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_empty_body_is_parse_error() {
            assert!(matches!(parse_channel(b""), Err(FetchError::Parse(_))));
        }
    }

    mod fetch_tests {
        use super::*;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const FEED: &str = r#"<rss><channel><title>Feed</title>
            <item><title>Only</title><link>https://example.com/only</link></item>
        </channel></rss>"#;

        #[tokio::test]
        async fn test_fetch_sends_user_agent() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss"))
                .and(header("user-agent", "gator"))
                .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
                .expect(1)
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap();
            let url = format!("{}/rss", mock_server.uri());
            let channel = reader.fetch(&url, Duration::from_secs(5)).await.unwrap();

            assert_eq!(channel.items.len(), 1);
            assert_eq!(channel.items[0].title, "Only");
        }

        #[tokio::test]
        async fn test_fetch_http_error_status() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap();
            let result = reader
                .fetch(&mock_server.uri(), Duration::from_secs(5))
                .await;

            assert!(matches!(result, Err(FetchError::HttpStatus(503))));
        }

        #[tokio::test]
        async fn test_fetch_timeout() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(FEED)
                        .set_delay(Duration::from_secs(2)),
                )
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap();
            let result = reader
                .fetch(&mock_server.uri(), Duration::from_millis(100))
                .await;

            assert!(matches!(result, Err(FetchError::Timeout)));
        }

        #[tokio::test]
        async fn test_fetch_unreachable_host() {
            let reader = FeedReader::new().unwrap();
            let result = reader
                .fetch("http://127.0.0.1:1/rss", Duration::from_secs(5))
                .await;

            assert!(matches!(result, Err(FetchError::Network(_))));
        }

        #[tokio::test]
        async fn test_fetch_html_page_is_parse_error() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap();
            let result = reader
                .fetch(&mock_server.uri(), Duration::from_secs(5))
                .await;

            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[tokio::test]
        async fn test_fetch_oversized_body_rejected() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap().with_max_body_size(1024);
            let result = reader
                .fetch(&mock_server.uri(), Duration::from_secs(5))
                .await;

            assert!(matches!(
                result,
                Err(FetchError::ResponseTooLarge { limit: 1024 })
            ));
        }

        #[tokio::test]
        async fn test_fetch_body_within_limit() {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
                .mount(&mock_server)
                .await;

            let reader = FeedReader::new().unwrap().with_max_body_size(FEED.len());
            let channel = reader
                .fetch(&mock_server.uri(), Duration::from_secs(5))
                .await
                .unwrap();

            assert_eq!(channel.items.len(), 1);
        }
    }
}
