//! Channel back-ends that announce assemblies and reshare them on the day.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, SecondsFormat, Utc};
use demobot_core::{
    format_date, format_title, format_title_with_limit, Assembly, PostFormatter,
    CANCELLATION_MARKER,
};
use demobot_storage::{build_http_client, HttpClientConfig};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "demobot-publishers";

/// How many of the account's own posts are searched for a reminder match.
pub const HISTORY_LIMIT: usize = 250;

pub const MASTODON_PAGE_SIZE: usize = 40;
pub const BLUESKY_PAGE_SIZE: usize = 50;
pub const BLUESKY_TITLE_LIMIT: usize = 120;
pub const BLUESKY_POST_LIMIT: usize = 300;
pub const DEFAULT_BLUESKY_SERVICE: &str = "https://bsky.social";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{channel} is not configured: missing {}", .missing.join(", "))]
pub struct ChannelConfigError {
    pub channel: &'static str,
    pub missing: Vec<&'static str>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Config(#[from] ChannelConfigError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{channel} api returned {status}: {body}")]
    Api {
        channel: &'static str,
        status: u16,
        body: String,
    },
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemindOutcome {
    Reshared { reference: String },
    NoMatch,
    Unsupported,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, assembly: &Assembly) -> Result<Published, PublishError>;

    /// Reshare this channel's earlier announcement of `assembly`, if there is one.
    async fn remind(&self, assembly: &Assembly) -> Result<RemindOutcome, PublishError>;
}

fn require(
    channel: &'static str,
    fields: &[(&'static str, &str)],
) -> Result<(), ChannelConfigError> {
    let missing: Vec<&'static str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ChannelConfigError { channel, missing })
    }
}

async fn ensure_success(
    channel: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, PublishError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PublishError::Api {
        channel,
        status: status.as_u16(),
        body,
    })
}

/// An earlier post announces `assembly` when it carries the same formatted
/// title and date and is not a cancellation notice.
pub fn announces(text: &str, title: &str, date: &str) -> bool {
    !text.contains(CANCELLATION_MARKER) && text.contains(title) && text.contains(date)
}

/// First match in newest-first order, so the most recent announcement wins.
pub fn find_announcement<'a, T>(
    posts: &'a [T],
    text_of: impl Fn(&T) -> String,
    title: &str,
    date: &str,
) -> Option<&'a T> {
    posts.iter().find(|post| announces(&text_of(*post), title, date))
}

#[derive(Debug, Clone, Default)]
pub struct MastodonConfig {
    pub server_url: String,
    pub access_token: String,
    pub account_id: String,
}

impl MastodonConfig {
    pub fn validate(&self) -> Result<(), ChannelConfigError> {
        require(
            "mastodon",
            &[
                ("server_url", self.server_url.as_str()),
                ("access_token", self.access_token.as_str()),
                ("account_id", self.account_id.as_str()),
            ],
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MastodonStatus {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl MastodonStatus {
    /// Status bodies come back as HTML; matching runs on the visible text.
    pub fn plain_text(&self) -> String {
        Html::parse_fragment(&self.content)
            .root_element()
            .text()
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    status: &'a str,
    visibility: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    spoiler_text: Option<&'a str>,
}

pub struct MastodonPublisher {
    client: reqwest::Client,
    config: MastodonConfig,
    formatter: Arc<PostFormatter>,
}

impl MastodonPublisher {
    pub fn new(
        config: MastodonConfig,
        formatter: Arc<PostFormatter>,
        http: &HttpClientConfig,
    ) -> Result<Self, PublishError> {
        config.validate()?;
        Ok(Self {
            client: build_http_client(http)?,
            config,
            formatter,
        })
    }

    fn api(&self, path: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.config.server_url.trim_end_matches('/'),
            path
        )
    }

    async fn recent_statuses(&self) -> Result<Vec<MastodonStatus>, PublishError> {
        let url = self.api(&format!("accounts/{}/statuses", self.config.account_id));
        let mut collected: Vec<MastodonStatus> = Vec::new();
        let mut max_id: Option<String> = None;
        loop {
            let mut query = vec![("limit", MASTODON_PAGE_SIZE.to_string())];
            if let Some(id) = &max_id {
                query.push(("max_id", id.clone()));
            }
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.config.access_token)
                .query(&query)
                .send()
                .await?;
            let page: Vec<MastodonStatus> = ensure_success("mastodon", resp).await?.json().await?;
            let page_len = page.len();
            max_id = page.last().map(|s| s.id.clone());
            collected.extend(page);
            if page_len < MASTODON_PAGE_SIZE || collected.len() >= HISTORY_LIMIT {
                break;
            }
        }
        collected.truncate(HISTORY_LIMIT);
        debug!(count = collected.len(), "mastodon history loaded");
        Ok(collected)
    }
}

#[async_trait]
impl Publisher for MastodonPublisher {
    fn name(&self) -> &'static str {
        "mastodon"
    }

    async fn publish(&self, assembly: &Assembly) -> Result<Published, PublishError> {
        let post = self.formatter.compose(assembly);
        let body = StatusRequest {
            status: &post.text,
            visibility: "public",
            spoiler_text: post.content_warning.as_deref(),
        };
        let resp = self
            .client
            .post(self.api("statuses"))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;
        let status: MastodonStatus = ensure_success("mastodon", resp).await?.json().await?;
        let reference = status.url.unwrap_or(status.id);
        info!(%reference, "mastodon status posted");
        Ok(Published { reference })
    }

    async fn remind(&self, assembly: &Assembly) -> Result<RemindOutcome, PublishError> {
        let statuses = self.recent_statuses().await?;
        let title = format_title(&assembly.topic);
        let date = format_date(&assembly.date);
        let Some(status) = find_announcement(&statuses, MastodonStatus::plain_text, &title, &date)
        else {
            return Ok(RemindOutcome::NoMatch);
        };
        let resp = self
            .client
            .post(self.api(&format!("statuses/{}/reblog", status.id)))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        ensure_success("mastodon", resp).await?;
        let reference = status.url.clone().unwrap_or_else(|| status.id.clone());
        info!(%reference, "mastodon status reblogged");
        Ok(RemindOutcome::Reshared { reference })
    }
}

#[derive(Debug, Clone)]
pub struct BlueskyConfig {
    pub service_url: String,
    pub identifier: String,
    pub password: String,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_BLUESKY_SERVICE.to_string(),
            identifier: String::new(),
            password: String::new(),
        }
    }
}

impl BlueskyConfig {
    pub fn validate(&self) -> Result<(), ChannelConfigError> {
        require(
            "bluesky",
            &[
                ("service_url", self.service_url.as_str()),
                ("identifier", self.identifier.as_str()),
                ("password", self.password.as_str()),
            ],
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlueskySession {
    access_jwt: String,
    did: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedPost {
    pub uri: String,
    pub cid: String,
    #[serde(default)]
    pub record: serde_json::Value,
}

impl FeedPost {
    pub fn text(&self) -> String {
        self.record
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    pub post: FeedPost,
    /// Present when the item is a repost rather than an original post.
    #[serde(default)]
    pub reason: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorFeed {
    #[serde(default)]
    pub feed: Vec<FeedItem>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Post text for Bluesky: shorter title, content warning as a leading line,
/// whole text capped at the network's post length.
pub fn bluesky_text(formatter: &PostFormatter, assembly: &Assembly) -> String {
    let body = formatter.format_post_with_title_limit(assembly, BLUESKY_TITLE_LIMIT);
    let text = match formatter.classifier().content_warning(assembly) {
        Some(label) => format!("CW: {label}\n\n{body}"),
        None => body,
    };
    format_title_with_limit(&text, BLUESKY_POST_LIMIT - 1)
}

pub struct BlueskyPublisher {
    client: reqwest::Client,
    config: BlueskyConfig,
    formatter: Arc<PostFormatter>,
    session: Mutex<Option<BlueskySession>>,
}

impl BlueskyPublisher {
    pub fn new(
        config: BlueskyConfig,
        formatter: Arc<PostFormatter>,
        http: &HttpClientConfig,
    ) -> Result<Self, PublishError> {
        config.validate()?;
        Ok(Self {
            client: build_http_client(http)?,
            config,
            formatter,
            session: Mutex::new(None),
        })
    }

    fn xrpc(&self, method: &str) -> String {
        format!(
            "{}/xrpc/{}",
            self.config.service_url.trim_end_matches('/'),
            method
        )
    }

    async fn session(&self) -> Result<BlueskySession, PublishError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let resp = self
            .client
            .post(self.xrpc("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": self.config.identifier,
                "password": self.config.password,
            }))
            .send()
            .await?;
        let session: BlueskySession = ensure_success("bluesky", resp).await?.json().await?;
        debug!(did = %session.did, "bluesky session created");
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn create_record(
        &self,
        session: &BlueskySession,
        collection: &str,
        record: serde_json::Value,
    ) -> Result<StrongRef, PublishError> {
        let resp = self
            .client
            .post(self.xrpc("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": collection,
                "record": record,
            }))
            .send()
            .await?;
        Ok(ensure_success("bluesky", resp).await?.json().await?)
    }

    async fn recent_posts(&self, session: &BlueskySession) -> Result<Vec<FeedPost>, PublishError> {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("actor", session.did.clone()),
                ("limit", BLUESKY_PAGE_SIZE.to_string()),
                ("filter", "posts_no_replies".to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let resp = self
                .client
                .get(self.xrpc("app.bsky.feed.getAuthorFeed"))
                .bearer_auth(&session.access_jwt)
                .query(&query)
                .send()
                .await?;
            let page: AuthorFeed = ensure_success("bluesky", resp).await?.json().await?;
            let page_len = page.feed.len();
            collected.extend(
                page.feed
                    .into_iter()
                    .filter(|item| item.reason.is_none())
                    .map(|item| item.post),
            );
            cursor = page.cursor;
            if cursor.is_none() || page_len < BLUESKY_PAGE_SIZE || collected.len() >= HISTORY_LIMIT
            {
                break;
            }
        }
        collected.truncate(HISTORY_LIMIT);
        Ok(collected)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    fn name(&self) -> &'static str {
        "bluesky"
    }

    async fn publish(&self, assembly: &Assembly) -> Result<Published, PublishError> {
        let session = self.session().await?;
        let record = json!({
            "$type": "app.bsky.feed.post",
            "text": bluesky_text(&self.formatter, assembly),
            "langs": ["de"],
            "createdAt": now_rfc3339(),
        });
        let created = self
            .create_record(&session, "app.bsky.feed.post", record)
            .await?;
        info!(uri = %created.uri, "bluesky post created");
        Ok(Published {
            reference: created.uri,
        })
    }

    async fn remind(&self, assembly: &Assembly) -> Result<RemindOutcome, PublishError> {
        let session = self.session().await?;
        let posts = self.recent_posts(&session).await?;
        let title = format_title_with_limit(&assembly.topic, BLUESKY_TITLE_LIMIT);
        let date = format_date(&assembly.date);
        let Some(post) = find_announcement(&posts, FeedPost::text, &title, &date) else {
            return Ok(RemindOutcome::NoMatch);
        };
        let record = json!({
            "$type": "app.bsky.feed.repost",
            "subject": { "uri": post.uri, "cid": post.cid },
            "createdAt": now_rfc3339(),
        });
        self.create_record(&session, "app.bsky.feed.repost", record)
            .await?;
        info!(uri = %post.uri, "bluesky post reposted");
        Ok(RemindOutcome::Reshared {
            reference: post.uri.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct IcsConfig {
    pub output_dir: PathBuf,
}

impl IcsConfig {
    pub fn validate(&self) -> Result<(), ChannelConfigError> {
        let dir = self.output_dir.to_string_lossy();
        require("ics", &[("output_dir", dir.as_ref())])
    }
}

/// Longest topic part of a calendar file name, in bytes.
pub const ICS_TOPIC_LIMIT: usize = 200;

fn file_slug(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `<topic>_<date>.ics`, restricted to `[a-z0-9_.-]` with everything else
/// replaced by `_`. The topic part is cut to [`ICS_TOPIC_LIMIT`] bytes.
pub fn ics_file_name(assembly: &Assembly) -> String {
    let topic = if assembly.topic.trim().is_empty() {
        "versammlung"
    } else {
        assembly.topic.as_str()
    };
    // slug is ASCII, so any byte index is a char boundary
    let mut topic = file_slug(topic);
    topic.truncate(ICS_TOPIC_LIMIT);
    format!("{topic}_{}.ics", file_slug(&assembly.date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventTiming {
    AllDay,
    At(NaiveTime),
    Between(NaiveTime, NaiveTime),
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    let s = s.trim().trim_end_matches("Uhr").trim();
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

fn event_timing(time: Option<&str>) -> EventTiming {
    let Some(time) = time else {
        return EventTiming::AllDay;
    };
    if let Some((start, end)) = time.split_once('-') {
        return match (parse_clock(start), parse_clock(end)) {
            (Some(s), Some(e)) if e > s => EventTiming::Between(s, e),
            (Some(s), _) => EventTiming::At(s),
            _ => EventTiming::AllDay,
        };
    }
    parse_clock(time).map_or(EventTiming::AllDay, EventTiming::At)
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Content lines longer than 75 octets continue on the next line after a
/// single space.
fn fold_line(line: &str) -> String {
    const LIMIT: usize = 75;
    let mut out = String::with_capacity(line.len() + line.len() / LIMIT * 3);
    let mut width = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > LIMIT {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(c);
        width += len;
    }
    out
}

/// Render a single-event calendar for `assembly`.
pub fn render_event(formatter: &PostFormatter, assembly: &Assembly) -> String {
    let uid = Uuid::new_v5(&Uuid::NAMESPACE_URL, ics_file_name(assembly).as_bytes());
    let compact_date = assembly.date.replace('-', "");
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");

    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//demobot//Versammlungen//DE".to_string(),
        "CALSCALE:GREGORIAN".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{uid}@demobot"),
        format!("DTSTAMP:{stamp}"),
    ];
    match event_timing(assembly.time.as_deref()) {
        EventTiming::AllDay => {
            lines.push(format!("DTSTART;VALUE=DATE:{compact_date}"));
            if let Ok(day) = NaiveDate::parse_from_str(&assembly.date, "%Y-%m-%d") {
                if let Some(next) = day.succ_opt() {
                    lines.push(format!("DTEND;VALUE=DATE:{}", next.format("%Y%m%d")));
                }
            }
        }
        EventTiming::At(start) => {
            lines.push(format!("DTSTART:{compact_date}T{}", start.format("%H%M%S")));
        }
        EventTiming::Between(start, end) => {
            lines.push(format!("DTSTART:{compact_date}T{}", start.format("%H%M%S")));
            lines.push(format!("DTEND:{compact_date}T{}", end.format("%H%M%S")));
        }
    }
    lines.push(format!("SUMMARY:{}", escape_text(&format_title(&assembly.topic))));
    if let Some(place) = assembly.location.as_ref().or(assembly.meeting_point.as_ref()) {
        lines.push(format!("LOCATION:{}", escape_text(place)));
    }
    lines.push(format!(
        "DESCRIPTION:{}",
        escape_text(&formatter.format_post(assembly))
    ));
    if let Some(label) = formatter.classifier().content_warning(assembly) {
        lines.push(format!("CATEGORIES:{}", escape_text(label)));
    }
    let status = if assembly.is_cancelled() {
        "CANCELLED"
    } else {
        "CONFIRMED"
    };
    lines.push(format!("STATUS:{status}"));
    lines.push("END:VEVENT".to_string());
    lines.push("END:VCALENDAR".to_string());

    let mut out = lines
        .iter()
        .map(|line| fold_line(line))
        .collect::<Vec<_>>()
        .join("\r\n");
    out.push_str("\r\n");
    out
}

pub struct IcsPublisher {
    config: IcsConfig,
    formatter: Arc<PostFormatter>,
}

impl IcsPublisher {
    pub fn new(config: IcsConfig, formatter: Arc<PostFormatter>) -> Result<Self, PublishError> {
        config.validate()?;
        Ok(Self { config, formatter })
    }
}

#[async_trait]
impl Publisher for IcsPublisher {
    fn name(&self) -> &'static str {
        "ics"
    }

    async fn publish(&self, assembly: &Assembly) -> Result<Published, PublishError> {
        let dir = &self.config.output_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PublishError::Io {
                path: dir.clone(),
                source,
            })?;
        let path = dir.join(ics_file_name(assembly));
        tokio::fs::write(&path, render_event(&self.formatter, assembly))
            .await
            .map_err(|source| PublishError::Io {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "calendar file written");
        Ok(Published {
            reference: path.display().to_string(),
        })
    }

    async fn remind(&self, _assembly: &Assembly) -> Result<RemindOutcome, PublishError> {
        debug!("calendar files have nothing to reshare");
        Ok(RemindOutcome::Unsupported)
    }
}

/// Which channels the run was given credentials for. `None` means the
/// channel was not mentioned at all.
#[derive(Debug, Clone, Default)]
pub struct ChannelsConfig {
    pub mastodon: Option<MastodonConfig>,
    pub bluesky: Option<BlueskyConfig>,
    pub ics: Option<IcsConfig>,
}

fn register<P: Publisher + 'static>(
    out: &mut Vec<Box<dyn Publisher>>,
    channel: &'static str,
    built: Result<P, PublishError>,
) {
    match built {
        Ok(publisher) => {
            info!(channel, "publisher initialized");
            out.push(Box::new(publisher));
        }
        Err(err) => warn!(channel, error = %err, "publisher skipped"),
    }
}

/// Build every configured channel. Channels that fail validation are
/// skipped with a warning so the rest still run.
pub fn publishers_from_config(
    channels: &ChannelsConfig,
    formatter: Arc<PostFormatter>,
    http: &HttpClientConfig,
) -> Vec<Box<dyn Publisher>> {
    let mut out: Vec<Box<dyn Publisher>> = Vec::new();
    match &channels.mastodon {
        Some(config) => register(
            &mut out,
            "mastodon",
            MastodonPublisher::new(config.clone(), formatter.clone(), http),
        ),
        None => debug!(channel = "mastodon", "not configured"),
    }
    match &channels.bluesky {
        Some(config) => register(
            &mut out,
            "bluesky",
            BlueskyPublisher::new(config.clone(), formatter.clone(), http),
        ),
        None => debug!(channel = "bluesky", "not configured"),
    }
    match &channels.ics {
        Some(config) => register(
            &mut out,
            "ics",
            IcsPublisher::new(config.clone(), formatter.clone()),
        ),
        None => debug!(channel = "ics", "not configured"),
    }
    out
}
