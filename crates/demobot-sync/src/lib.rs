//! Run configuration and the update / remind pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use demobot_core::{Assembly, Classifier, ClassifierRules, FormattedPost, PostFormatter};
use demobot_publishers::{
    publishers_from_config, BlueskyConfig, ChannelsConfig, IcsConfig, MastodonConfig, Publisher,
    RemindOutcome, DEFAULT_BLUESKY_SERVICE,
};
use demobot_storage::{
    change_set, fetch_dataset, DatasetSource, FetchError, HttpClientConfig, HttpDatasetSource,
    RetryPolicy, SnapshotError, SnapshotStore, DEFAULT_DATASET_URL,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "demobot-sync";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("dataset fetch failed: {0}")]
    FatalFetch(#[from] FetchError),
    #[error("previous snapshot unusable: {0}")]
    FatalSnapshot(#[source] SnapshotError),
    #[error("snapshot could not be written: {0}")]
    Persist(#[source] SnapshotError),
    #[error("classifier rules {}: {message}", .path.display())]
    Rules { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset_url: String,
    pub snapshot_path: PathBuf,
    pub rules_path: PathBuf,
    pub fetch_attempts: usize,
    pub fetch_retry_delay: Duration,
    pub http_timeout: Duration,
    pub publish_delay: Duration,
    pub user_agent: String,
    pub channels: ChannelsConfig,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            dataset_url: get("DATASET_URL").unwrap_or_else(|| DEFAULT_DATASET_URL.to_string()),
            snapshot_path: get("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("assemblies.json")),
            rules_path: get("RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/classifier.yaml")),
            fetch_attempts: number("FETCH_ATTEMPTS", 3) as usize,
            fetch_retry_delay: Duration::from_secs(number("FETCH_RETRY_DELAY_SECS", 10)),
            http_timeout: Duration::from_secs(number("FETCH_TIMEOUT_SECS", 30)),
            publish_delay: Duration::from_millis(number("PUBLISH_DELAY_MS", 1000)),
            user_agent: get("DEMOBOT_USER_AGENT")
                .unwrap_or_else(|| format!("demobot/{}", env!("CARGO_PKG_VERSION"))),
            channels: channels_from_lookup(&get),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts,
            delay: self.fetch_retry_delay,
        }
    }
}

/// Values of `names` when every one is set. A channel with only some of its
/// variables set is reported and left out.
fn channel_values(
    get: &impl Fn(&str) -> Option<String>,
    channel: &str,
    names: &[&str],
) -> Option<Vec<String>> {
    let values: Vec<Option<String>> = names.iter().map(|&name| get(name)).collect();
    let missing: Vec<&str> = names
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        return Some(values.into_iter().flatten().collect());
    }
    if missing.len() == names.len() {
        warn!(channel, "channel not configured; skipping");
    } else {
        warn!(
            channel,
            missing = %missing.join(", "),
            "channel partially configured; skipping"
        );
    }
    None
}

fn channels_from_lookup(get: &impl Fn(&str) -> Option<String>) -> ChannelsConfig {
    let mastodon = channel_values(
        get,
        "mastodon",
        &["MASTO_SERVER_URL", "ACCESS_TOKEN", "ACCOUNT_ID"],
    )
    .map(|v| MastodonConfig {
        server_url: v[0].clone(),
        access_token: v[1].clone(),
        account_id: v[2].clone(),
    });
    let bluesky = channel_values(get, "bluesky", &["BLUESKY_IDENTIFIER", "BLUESKY_PASSWORD"]).map(
        |v| BlueskyConfig {
            service_url: get("BLUESKY_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_BLUESKY_SERVICE.to_string()),
            identifier: v[0].clone(),
            password: v[1].clone(),
        },
    );
    let ics = channel_values(get, "ics", &["ICS_OUTPUT_DIR"]).map(|v| IcsConfig {
        output_dir: PathBuf::from(&v[0]),
    });
    ChannelsConfig {
        mastodon,
        bluesky,
        ics,
    }
}

/// Read the classifier lists from YAML. A missing file falls back to the
/// built-in lists; an unreadable or malformed one is an error.
pub async fn load_classifier_rules(path: &Path) -> Result<ClassifierRules, RunError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no rules file; using built-in classifier lists");
            return Ok(ClassifierRules::default());
        }
        Err(err) => {
            return Err(RunError::Rules {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
    };
    serde_yaml::from_str(&text).map_err(|err| RunError::Rules {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Update,
    Remind,
    Preview,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Update => "update",
            RunMode::Remind => "remind",
            RunMode::Preview => "preview",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub publishers: usize,
    pub fetched_records: usize,
    pub candidates: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reshared: usize,
    pub no_match: usize,
}

impl RunSummary {
    fn start(mode: RunMode, publishers: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            publishers,
            fetched_records: 0,
            candidates: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            reshared: 0,
            no_match: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// A post the next update would send.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewPost {
    pub assembly: Assembly,
    pub post: FormattedPost,
}

pub struct AnnouncePipeline {
    source: Box<dyn DatasetSource>,
    store: SnapshotStore,
    publishers: Vec<Box<dyn Publisher>>,
    formatter: Arc<PostFormatter>,
    retry: RetryPolicy,
    publish_delay: Duration,
    today: Option<NaiveDate>,
}

impl AnnouncePipeline {
    /// Load the classifier rules and initialise every configured publisher.
    pub async fn new(config: &RunConfig) -> Result<Self, RunError> {
        let rules = load_classifier_rules(&config.rules_path).await?;
        let formatter = Arc::new(PostFormatter::new(Classifier::from_rules(rules)));
        let http = config.http_client_config();
        let source = HttpDatasetSource::new(config.dataset_url.clone(), &http)?;
        let publishers = publishers_from_config(&config.channels, formatter.clone(), &http);
        Ok(Self {
            source: Box::new(source),
            store: SnapshotStore::new(config.snapshot_path.clone()),
            publishers,
            formatter,
            retry: config.retry_policy(),
            publish_delay: config.publish_delay,
            today: None,
        })
    }

    /// Assemble a pipeline from already-built parts. No pacing, default
    /// retry policy.
    pub fn from_parts(
        source: Box<dyn DatasetSource>,
        store: SnapshotStore,
        publishers: Vec<Box<dyn Publisher>>,
        formatter: Arc<PostFormatter>,
    ) -> Self {
        Self {
            source,
            store,
            publishers,
            formatter,
            retry: RetryPolicy::default(),
            publish_delay: Duration::ZERO,
            today: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pin the calendar day used for filtering instead of the current UTC date.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    async fn pace(&self) {
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }
    }

    /// Announce every record that is new or changed since the last run.
    ///
    /// The snapshot is written before the first publish, so a crash during
    /// fan-out does not repeat announcements on the next run.
    pub async fn run_update(&self) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::start(RunMode::Update, self.publishers.len());
        let span = info_span!("announce_run", run_id = %summary.run_id, mode = "update");
        self.update(&mut summary).instrument(span).await?;
        Ok(summary.finish())
    }

    async fn update(&self, summary: &mut RunSummary) -> Result<(), RunError> {
        if self.publishers.is_empty() {
            warn!("no publishers initialized; nothing to do");
            return Ok(());
        }

        let previous = self.store.load().await.map_err(RunError::FatalSnapshot)?;
        let current = fetch_dataset(self.source.as_ref(), &self.retry).await?;
        summary.fetched_records = current.len();

        let candidates = change_set(&previous, &current, self.today());
        summary.candidates = candidates.len();
        info!(
            previous = previous.len(),
            current = current.len(),
            candidates = candidates.len(),
            "change set computed"
        );

        self.store.persist(&current).await.map_err(RunError::Persist)?;

        for assembly in &candidates {
            for publisher in &self.publishers {
                summary.attempted += 1;
                match publisher.publish(assembly).await {
                    Ok(published) => {
                        summary.succeeded += 1;
                        info!(
                            publisher = publisher.name(),
                            date = %assembly.date,
                            reference = %published.reference,
                            "assembly announced"
                        );
                    }
                    Err(err) => {
                        summary.failed += 1;
                        error!(
                            publisher = publisher.name(),
                            date = %assembly.date,
                            topic = %assembly.topic,
                            error = %err,
                            "announcement failed"
                        );
                    }
                }
                self.pace().await;
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "update finished"
        );
        Ok(())
    }

    /// Reshare each channel's earlier announcement of today's assemblies.
    pub async fn run_remind(&self) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::start(RunMode::Remind, self.publishers.len());
        let span = info_span!("announce_run", run_id = %summary.run_id, mode = "remind");
        self.remind(&mut summary).instrument(span).await?;
        Ok(summary.finish())
    }

    async fn remind(&self, summary: &mut RunSummary) -> Result<(), RunError> {
        if self.publishers.is_empty() {
            warn!("no publishers initialized; nothing to do");
            return Ok(());
        }

        let current = fetch_dataset(self.source.as_ref(), &self.retry).await?;
        summary.fetched_records = current.len();
        let todays = current.assemblies_on(self.today());
        summary.candidates = todays.len();
        info!(count = todays.len(), "assemblies today");

        for assembly in &todays {
            for publisher in &self.publishers {
                summary.attempted += 1;
                match publisher.remind(assembly).await {
                    Ok(RemindOutcome::Reshared { reference }) => {
                        summary.succeeded += 1;
                        summary.reshared += 1;
                        info!(publisher = publisher.name(), %reference, "announcement reshared");
                    }
                    Ok(RemindOutcome::NoMatch) => {
                        summary.succeeded += 1;
                        summary.no_match += 1;
                        info!(
                            publisher = publisher.name(),
                            topic = %assembly.topic,
                            "no earlier announcement found"
                        );
                    }
                    Ok(RemindOutcome::Unsupported) => {
                        summary.succeeded += 1;
                        debug!(publisher = publisher.name(), "reminders not supported");
                    }
                    Err(err) => {
                        summary.failed += 1;
                        error!(
                            publisher = publisher.name(),
                            topic = %assembly.topic,
                            error = %err,
                            "reminder failed"
                        );
                    }
                }
                self.pace().await;
            }
        }
        Ok(())
    }

    /// What the next update would announce, without writing or publishing.
    pub async fn preview(&self) -> Result<Vec<PreviewPost>, RunError> {
        let span = info_span!("announce_run", mode = "preview");
        self.preview_posts().instrument(span).await
    }

    async fn preview_posts(&self) -> Result<Vec<PreviewPost>, RunError> {
        let previous = self.store.load().await.map_err(RunError::FatalSnapshot)?;
        let current = fetch_dataset(self.source.as_ref(), &self.retry).await?;
        Ok(change_set(&previous, &current, self.today())
            .into_iter()
            .map(|assembly| PreviewPost {
                post: self.formatter.compose(&assembly),
                assembly,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = RunConfig::from_lookup(lookup(&[]));
        assert_eq!(config.dataset_url, DEFAULT_DATASET_URL);
        assert_eq!(config.snapshot_path, PathBuf::from("assemblies.json"));
        assert_eq!(config.rules_path, PathBuf::from("rules/classifier.yaml"));
        assert_eq!(config.fetch_attempts, 3);
        assert_eq!(config.fetch_retry_delay, Duration::from_secs(10));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.publish_delay, Duration::from_millis(1000));
        assert!(config.user_agent.starts_with("demobot/"));
        assert!(config.channels.mastodon.is_none());
        assert!(config.channels.bluesky.is_none());
        assert!(config.channels.ics.is_none());
    }

    #[test]
    fn overrides_and_channels_are_read() {
        let config = RunConfig::from_lookup(lookup(&[
            ("SNAPSHOT_PATH", "/tmp/snap.json"),
            ("FETCH_ATTEMPTS", "5"),
            ("PUBLISH_DELAY_MS", "0"),
            ("FETCH_TIMEOUT_SECS", "not a number"),
            ("MASTO_SERVER_URL", "https://social.example"),
            ("ACCESS_TOKEN", "secret"),
            ("ACCOUNT_ID", "42"),
            ("BLUESKY_IDENTIFIER", "bot.example"),
            ("BLUESKY_PASSWORD", "app-password"),
            ("ICS_OUTPUT_DIR", "calendar"),
        ]));
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/snap.json"));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.publish_delay, Duration::ZERO);
        assert_eq!(config.http_timeout, Duration::from_secs(30));

        let mastodon = config.channels.mastodon.expect("mastodon configured");
        assert_eq!(mastodon.account_id, "42");
        let bluesky = config.channels.bluesky.expect("bluesky configured");
        assert_eq!(bluesky.service_url, DEFAULT_BLUESKY_SERVICE);
        assert_eq!(
            config.channels.ics.map(|c| c.output_dir),
            Some(PathBuf::from("calendar"))
        );
    }

    #[test]
    fn partially_configured_channel_is_left_out() {
        let config = RunConfig::from_lookup(lookup(&[
            ("MASTO_SERVER_URL", "https://social.example"),
            ("ACCESS_TOKEN", "  "),
            ("BLUESKY_IDENTIFIER", "bot.example"),
        ]));
        assert!(config.channels.mastodon.is_none());
        assert!(config.channels.bluesky.is_none());
    }

    #[tokio::test]
    async fn rules_file_overrides_builtin_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.yaml");
        tokio::fs::write(
            &path,
            "label: Achtung\ndenylist:\n  - Test e.V.\norganizer_aliases:\n  Alt: Neu\n",
        )
        .await
        .unwrap();

        let rules = load_classifier_rules(&path).await.unwrap();
        assert_eq!(rules.label, "Achtung");
        assert_eq!(rules.denylist, vec!["Test e.V.".to_string()]);
        assert_eq!(rules.organizer_aliases.get("Alt").map(String::as_str), Some("Neu"));
    }

    #[tokio::test]
    async fn missing_rules_fall_back_and_broken_rules_fail() {
        let dir = tempfile::tempdir().unwrap();
        let rules = load_classifier_rules(&dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(rules, ClassifierRules::default());

        let broken = dir.path().join("broken.yaml");
        tokio::fs::write(&broken, "denylist: [unterminated").await.unwrap();
        assert!(matches!(
            load_classifier_rules(&broken).await,
            Err(RunError::Rules { .. })
        ));
    }

    #[tokio::test]
    async fn checked_in_rules_match_builtin_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/classifier.yaml");
        let rules = load_classifier_rules(&path).await.unwrap();
        assert_eq!(rules, ClassifierRules::default());
    }

    #[test]
    fn run_mode_displays_lowercase() {
        assert_eq!(RunMode::Remind.to_string(), "remind");
        assert_eq!(
            serde_json::to_string(&RunMode::Update).unwrap(),
            "\"update\""
        );
    }
}
