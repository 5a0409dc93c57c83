//! Core domain model for the assembly register: records, fingerprints,
//! classification and post formatting.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "demobot-core";

/// Status keyword the register uses for withdrawn assemblies.
pub const CANCELLED_STATUS: &str = "abgemeldet";
/// Marker prefixed to the header of posts about withdrawn assemblies.
pub const CANCELLATION_MARKER: &str = "[Abmeldung]";
pub const ALL_DAY_TIME: &str = "ganztägig";
/// Organizer value the register uses for private individuals.
pub const PRIVATE_ORGANIZER: &str = "natürliche Person";
pub const LOCATION_UNKNOWN: &str = "Ort bisher nicht bekannt.";

pub const TITLE_LIMIT: usize = 250;
pub const ELLIPSIS: &str = "…";

const IDENTITY_SEPARATOR: &str = "\u{1f}";

/// One entry of the register exactly as the upstream JSON carries it.
///
/// The entry is kept as raw JSON so a snapshot written back to disk carries
/// every key and `null` that was fetched. Accessors read text fields
/// leniently: a value of the wrong type counts as absent for this entry only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawAssembly {
    value: JsonValue,
}

impl RawAssembly {
    pub fn from_value(value: JsonValue) -> Self {
        Self { value }
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.value
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.value.get(key)
    }

    /// String value of `key`; missing, `null` and non-string values are `None`.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    /// Set `key`, turning a non-object entry into an object first.
    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) {
        if !self.value.is_object() {
            self.value = JsonValue::Object(JsonMap::new());
        }
        if let JsonValue::Object(map) = &mut self.value {
            map.insert(key.to_string(), value.into());
        }
    }

    pub fn date(&self) -> Option<&str> {
        self.text("Datum")
    }

    pub fn time(&self) -> Option<&str> {
        self.text("Zeit")
    }

    pub fn topic(&self) -> Option<&str> {
        self.text("Thema")
    }

    pub fn location(&self) -> Option<&str> {
        self.text("Ort")
    }

    pub fn meeting_point(&self) -> Option<&str> {
        self.text("Startpunkt")
    }

    pub fn attendance(&self) -> Option<&JsonValue> {
        self.get("Teilnehmer")
    }

    pub fn organizer(&self) -> Option<&str> {
        self.text("Veranstalter")
    }

    pub fn status(&self) -> Option<&str> {
        self.text("Status")
    }

    pub fn identity_key(&self) -> String {
        identity_key([
            self.date(),
            self.time(),
            self.topic(),
            self.location(),
            self.meeting_point(),
            self.status(),
        ])
    }
}

/// The full register document (`{"Versammlungen": [...]}`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(rename = "Versammlungen")]
    pub versammlungen: Vec<RawAssembly>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Dataset {
    pub fn new(versammlungen: Vec<RawAssembly>) -> Self {
        Self {
            versammlungen,
            extra: JsonMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.versammlungen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versammlungen.is_empty()
    }

    pub fn identity_keys(&self) -> HashSet<String> {
        self.versammlungen
            .iter()
            .map(RawAssembly::identity_key)
            .collect()
    }

    /// Validated records; entries without topic or date are dropped here.
    pub fn assemblies(&self) -> Vec<Assembly> {
        self.versammlungen
            .iter()
            .filter_map(|raw| match Assembly::try_from(raw) {
                Ok(assembly) => Some(assembly),
                Err(reason) => {
                    debug!(date = ?raw.date(), %reason, "skipping register entry");
                    None
                }
            })
            .collect()
    }

    /// Validated records scheduled on exactly `date`.
    pub fn assemblies_on(&self, date: NaiveDate) -> Vec<Assembly> {
        let day = iso_date(date);
        self.assemblies()
            .into_iter()
            .filter(|a| a.date == day)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecord {
    #[error("record has no topic")]
    MissingTopic,
    #[error("record has no date")]
    MissingDate,
}

/// A register entry that passed validation and may be formatted and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    pub date: String,
    pub time: Option<String>,
    pub topic: String,
    pub location: Option<String>,
    pub meeting_point: Option<String>,
    pub expected_attendance: Option<String>,
    pub organizer: Option<String>,
    pub status: String,
}

impl Assembly {
    pub fn identity_key(&self) -> String {
        identity_key([
            Some(self.date.as_str()),
            self.time.as_deref(),
            Some(self.topic.as_str()),
            self.location.as_deref(),
            self.meeting_point.as_deref(),
            Some(self.status.as_str()),
        ])
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CANCELLED_STATUS
    }

    /// Lexicographic on the fixed-width ISO form.
    pub fn is_on_or_after(&self, day: &str) -> bool {
        self.date.as_str() >= day
    }
}

impl TryFrom<&RawAssembly> for Assembly {
    type Error = InvalidRecord;

    fn try_from(raw: &RawAssembly) -> Result<Self, Self::Error> {
        let topic = non_empty(raw.topic()).ok_or(InvalidRecord::MissingTopic)?;
        let date = non_empty(raw.date()).ok_or(InvalidRecord::MissingDate)?;
        Ok(Self {
            date,
            time: non_empty(raw.time()),
            topic,
            location: non_empty(raw.location()),
            meeting_point: non_empty(raw.meeting_point()),
            expected_attendance: raw.attendance().and_then(attendance_text),
            organizer: non_empty(raw.organizer()),
            status: raw.status().unwrap_or_default().to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn attendance_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_empty(Some(s.as_str())),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Order-preserving concatenation of date, time, topic, location, meeting
/// point and status. Absent parts contribute an empty string.
pub fn identity_key(parts: [Option<&str>; 6]) -> String {
    parts
        .into_iter()
        .map(|p| p.unwrap_or_default())
        .collect::<Vec<_>>()
        .join(IDENTITY_SEPARATOR)
}

pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Denylist and organizer rewrites in their on-disk shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRules {
    pub label: String,
    #[serde(default)]
    pub denylist: Vec<String>,
    #[serde(default)]
    pub organizer_aliases: BTreeMap<String, String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        let denylist = [
            "AfD Dresden",
            "AfD Kreisverband Dresden",
            "PEGIDA Förderverein e. V.",
            "Freie Sachsen",
            "Partei FREIE Sachsen",
            "Initiative Dresden gegen Moschee-(Neu)Bau",
        ];
        let aliases = [
            ("Fridays For Future", "#FridaysForFuture"),
            ("Fridays For Futhure", "#FridaysForFuture"),
            ("Piratenpartei Sachsen", "@piratensachsen@dresden.network"),
        ];
        Self {
            label: "Rechte Versammlung".to_string(),
            denylist: denylist.iter().map(ToString::to_string).collect(),
            organizer_aliases: aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    label: String,
    denylist: HashSet<String>,
    organizer_aliases: BTreeMap<String, String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_rules(ClassifierRules::default())
    }
}

impl Classifier {
    pub fn from_rules(rules: ClassifierRules) -> Self {
        Self {
            label: rules.label,
            denylist: rules.denylist.iter().map(|s| s.to_lowercase()).collect(),
            organizer_aliases: rules.organizer_aliases,
        }
    }

    /// Label for records whose organizer or topic is on the denylist.
    ///
    /// Matching is whole-string and case-insensitive, never substring.
    pub fn content_warning(&self, assembly: &Assembly) -> Option<&str> {
        let organizer_hit = assembly
            .organizer
            .as_deref()
            .is_some_and(|o| self.denylist.contains(&o.to_lowercase()));
        let topic_hit = self.denylist.contains(&assembly.topic.to_lowercase());
        (organizer_hit || topic_hit).then_some(self.label.as_str())
    }

    pub fn display_organizer(&self, organizer: &str) -> String {
        self.organizer_aliases
            .get(organizer)
            .cloned()
            .unwrap_or_else(|| organizer.to_string())
    }
}

/// Channel-agnostic post text plus the optional sensitivity label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedPost {
    pub text: String,
    pub content_warning: Option<String>,
}

pub fn format_date(iso: &str) -> String {
    iso.split('-').rev().collect::<Vec<_>>().join(".")
}

pub fn format_title(topic: &str) -> String {
    format_title_with_limit(topic, TITLE_LIMIT)
}

/// Titles are measured in UTF-16 code units, the unit earlier posts were cut
/// in. A character that would straddle the limit is dropped whole.
pub fn format_title_with_limit(topic: &str, limit: usize) -> String {
    if topic.encode_utf16().count() <= limit {
        return topic.to_string();
    }
    let mut cut = String::new();
    let mut units = 0;
    for c in topic.chars() {
        units += c.len_utf16();
        if units > limit {
            break;
        }
        cut.push(c);
    }
    cut.push_str(ELLIPSIS);
    cut
}

#[derive(Debug, Clone, Default)]
pub struct PostFormatter {
    classifier: Classifier,
}

impl PostFormatter {
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn compose(&self, assembly: &Assembly) -> FormattedPost {
        FormattedPost {
            text: self.format_post(assembly),
            content_warning: self.classifier.content_warning(assembly).map(ToString::to_string),
        }
    }

    pub fn format_post(&self, assembly: &Assembly) -> String {
        self.format_post_with_title_limit(assembly, TITLE_LIMIT)
    }

    pub fn format_post_with_title_limit(&self, assembly: &Assembly, title_limit: usize) -> String {
        let mut lines = vec![
            header_line(assembly),
            String::new(),
            format_title_with_limit(&assembly.topic, title_limit),
            String::new(),
        ];

        lines.push(match (&assembly.location, &assembly.meeting_point) {
            (Some(location), _) => format!("Ort: {location}"),
            (None, Some(start)) => format!("Startpunkt: {start}"),
            (None, None) => LOCATION_UNKNOWN.to_string(),
        });

        if let Some(count) = &assembly.expected_attendance {
            if assembly.is_cancelled() {
                lines.push(format!("Geplant waren {count} Teilnehmer·innen."));
            } else {
                lines.push(format!("Geplant sind {count} Teilnehmer·innen."));
            }
        }

        if let Some(organizer) = assembly
            .organizer
            .as_deref()
            .filter(|o| *o != PRIVATE_ORGANIZER)
        {
            lines.push(format!(
                "Veranstaltet durch {}",
                self.classifier.display_organizer(organizer)
            ));
        }

        lines.join("\n")
    }
}

fn header_line(assembly: &Assembly) -> String {
    let date = format_date(&assembly.date);
    let status = &assembly.status;
    let sentence = match assembly.time.as_deref() {
        Some(ALL_DAY_TIME) => format!("Ganztägige Versammlung am {date} {status}."),
        Some(time) if time.starts_with("bis") => format!("Versammlung am {date} {time} {status}."),
        Some(time) if time.contains('-') => format!("Versammlung am {date} von {time} {status}."),
        Some(time) => format!("Versammlung am {date} um {time} {status}."),
        None => format!("Versammlung am {date} {status}."),
    };
    if assembly.is_cancelled() {
        format!("{CANCELLATION_MARKER} {sentence}")
    } else {
        sentence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(date: &str, topic: &str, status: &str) -> Assembly {
        Assembly {
            date: date.to_string(),
            time: None,
            topic: topic.to_string(),
            location: None,
            meeting_point: None,
            expected_attendance: None,
            organizer: None,
            status: status.to_string(),
        }
    }

    #[test]
    fn title_at_limit_is_untouched() {
        let title = "a".repeat(250);
        assert_eq!(format_title(&title), title);
    }

    #[test]
    fn title_over_limit_is_cut_with_single_ellipsis() {
        let title = "b".repeat(251);
        let out = format_title(&title);
        assert_eq!(out, format!("{}…", "b".repeat(250)));
        assert_eq!(out.chars().count(), 251);
    }

    #[test]
    fn title_counts_utf16_units_not_bytes() {
        let title = "ä".repeat(250);
        assert_eq!(format_title(&title), title);
    }

    #[test]
    fn astral_characters_count_twice_toward_the_limit() {
        let fits = "✊".repeat(250);
        assert_eq!(format_title(&fits), fits);

        let emoji = "🌍".repeat(125);
        assert_eq!(format_title(&emoji), emoji);

        let over = format!("{}x", "🌍".repeat(125));
        assert_eq!(format_title(&over), format!("{}…", "🌍".repeat(125)));

        let straddling = format!("x{}", "🌍".repeat(125));
        assert_eq!(
            format_title(&straddling),
            format!("x{}…", "🌍".repeat(124))
        );
    }

    #[test]
    fn date_segments_are_reversed() {
        assert_eq!(format_date("2099-01-01"), "01.01.2099");
        assert_eq!(format_date("2024-13-45"), "45.13.2024");
    }

    #[test]
    fn minimal_record_renders_placeholder_and_nothing_else() {
        let post = PostFormatter::default().format_post(&minimal("2099-01-01", "Testkundgebung", "angemeldet"));
        assert_eq!(
            post,
            "Versammlung am 01.01.2099 angemeldet.\n\nTestkundgebung\n\nOrt bisher nicht bekannt."
        );
        assert!(!post.contains("Teilnehmer"));
        assert!(!post.contains("Veranstaltet"));
    }

    #[test]
    fn header_branches_follow_time_shape() {
        let formatter = PostFormatter::default();
        let mut a = minimal("2099-05-01", "Demo", "angemeldet");

        a.time = Some("ganztägig".into());
        assert!(formatter.format_post(&a).starts_with("Ganztägige Versammlung am 01.05.2099 angemeldet."));

        a.time = Some("bis 18:00".into());
        assert!(formatter.format_post(&a).starts_with("Versammlung am 01.05.2099 bis 18:00 angemeldet."));

        a.time = Some("10:00-12:00".into());
        assert!(formatter.format_post(&a).starts_with("Versammlung am 01.05.2099 von 10:00-12:00 angemeldet."));

        a.time = Some("10:00".into());
        assert!(formatter.format_post(&a).starts_with("Versammlung am 01.05.2099 um 10:00 angemeldet."));
    }

    #[test]
    fn cancelled_posts_are_marked_and_use_past_tense() {
        let mut a = minimal("2099-05-01", "Demo", CANCELLED_STATUS);
        a.time = Some("14:00".into());
        a.expected_attendance = Some("200".into());
        let post = PostFormatter::default().format_post(&a);
        assert!(post.starts_with("[Abmeldung] Versammlung am 01.05.2099 um 14:00 abgemeldet."));
        assert!(post.contains("Geplant waren 200 Teilnehmer·innen."));
    }

    #[test]
    fn location_prefers_ort_then_startpunkt() {
        let formatter = PostFormatter::default();
        let mut a = minimal("2099-05-01", "Demo", "angemeldet");
        a.meeting_point = Some("Hauptbahnhof".into());
        assert!(formatter.format_post(&a).contains("Startpunkt: Hauptbahnhof"));
        a.location = Some("Altmarkt".into());
        let post = formatter.format_post(&a);
        assert!(post.contains("Ort: Altmarkt"));
        assert!(!post.contains("Startpunkt"));
    }

    #[test]
    fn organizer_line_uses_rewrites_and_skips_private_persons() {
        let formatter = PostFormatter::default();
        let mut a = minimal("2099-05-01", "Klimastreik", "angemeldet");
        a.organizer = Some("Fridays For Future".into());
        assert!(formatter.format_post(&a).ends_with("Veranstaltet durch #FridaysForFuture"));

        a.organizer = Some(PRIVATE_ORGANIZER.into());
        assert!(!formatter.format_post(&a).contains("Veranstaltet"));

        a.organizer = Some("Stadtteilverein".into());
        assert!(formatter.format_post(&a).ends_with("Veranstaltet durch Stadtteilverein"));
    }

    #[test]
    fn content_warning_matches_whole_names_case_insensitively() {
        let classifier = Classifier::default();
        let mut a = minimal("2099-05-01", "Abendspaziergang", "angemeldet");
        a.organizer = Some("afd dresden".into());
        assert_eq!(classifier.content_warning(&a), Some("Rechte Versammlung"));

        a.organizer = Some("AfD Dresden Jugend".into());
        assert_eq!(classifier.content_warning(&a), None);

        a.organizer = None;
        a.topic = "FREIE SACHSEN".into();
        assert_eq!(classifier.content_warning(&a), Some("Rechte Versammlung"));
    }

    #[test]
    fn compose_attaches_label() {
        let mut a = minimal("2099-05-01", "Kundgebung", "angemeldet");
        a.organizer = Some("PEGIDA Förderverein e. V.".into());
        let post = PostFormatter::default().compose(&a);
        assert_eq!(post.content_warning.as_deref(), Some("Rechte Versammlung"));
        assert!(post.text.contains("Kundgebung"));
    }

    #[test]
    fn identity_key_ignores_attendance_and_organizer() {
        let base = minimal("2099-05-01", "Demo", "angemeldet");
        let mut changed = base.clone();
        changed.expected_attendance = Some("500".into());
        changed.organizer = Some("Verein".into());
        assert_eq!(base.identity_key(), changed.identity_key());

        let mutations: [fn(&mut Assembly); 6] = [
            |a: &mut Assembly| a.date = "2099-05-02".into(),
            |a: &mut Assembly| a.time = Some("10:00".into()),
            |a: &mut Assembly| a.topic = "Demo 2".into(),
            |a: &mut Assembly| a.location = Some("Altmarkt".into()),
            |a: &mut Assembly| a.meeting_point = Some("Postplatz".into()),
            |a: &mut Assembly| a.status = CANCELLED_STATUS.into(),
        ];
        for mutate in mutations {
            let mut other = base.clone();
            mutate(&mut other);
            assert_ne!(base.identity_key(), other.identity_key());
        }
    }

    #[test]
    fn identity_key_keeps_fields_apart() {
        let a = identity_key([Some("ab"), Some("c"), None, None, None, None]);
        let b = identity_key([Some("a"), Some("bc"), None, None, None, None]);
        assert_ne!(a, b);
    }

    #[test]
    fn raw_and_validated_keys_agree() {
        let raw: RawAssembly = serde_json::from_str(
            r#"{"Datum":"2099-01-01","Thema":"Testkundgebung","Status":"angemeldet","Veranstalter":null}"#,
        )
        .unwrap();
        let validated = Assembly::try_from(&raw).unwrap();
        assert_eq!(raw.identity_key(), validated.identity_key());
        assert_eq!(validated.organizer, None);
    }

    #[test]
    fn dataset_keeps_unknown_fields_and_drops_topicless_records() {
        let json = r#"{
            "Versammlungen": [
                {"Datum":"2099-01-01","Thema":"Eins","Status":"angemeldet","Teilnehmer":150,"Aktenzeichen":"X-1"},
                {"Datum":"2099-01-02","Thema":null,"Status":"angemeldet"},
                {"Datum":"2099-01-03","Thema":"","Status":"angemeldet"}
            ],
            "Stand": "heute"
        }"#;
        let dataset: Dataset = serde_json::from_str(json).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.extra.get("Stand"), Some(&JsonValue::from("heute")));
        assert_eq!(
            dataset.versammlungen[0].get("Aktenzeichen"),
            Some(&JsonValue::from("X-1"))
        );

        let valid = dataset.assemblies();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].expected_attendance.as_deref(), Some("150"));

        let reparsed: Dataset = serde_json::from_str(&serde_json::to_string(&dataset).unwrap()).unwrap();
        assert_eq!(reparsed, dataset);
    }

    #[test]
    fn assemblies_on_filters_exact_day() {
        let dataset = Dataset::new(vec![
            RawAssembly::from_value(json!({ "Datum": "2099-01-01", "Thema": "Heute" })),
            RawAssembly::from_value(json!({ "Datum": "2099-01-02", "Thema": "Morgen" })),
        ]);
        let day = NaiveDate::from_ymd_opt(2099, 1, 1).unwrap();
        let today = dataset.assemblies_on(day);
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].topic, "Heute");
    }

    #[test]
    fn nulls_survive_a_snapshot_round_trip() {
        let text = r#"{"Datum":"2099-01-01","Thema":"X","Status":"angemeldet","Veranstalter":null,"Ort":null}"#;
        let raw: RawAssembly = serde_json::from_str(text).unwrap();
        assert_eq!(raw.organizer(), None);
        assert_eq!(
            serde_json::to_value(&raw).unwrap(),
            serde_json::from_str::<JsonValue>(text).unwrap()
        );
    }

    #[test]
    fn mistyped_fields_only_affect_their_own_record() {
        let json = r#"{
            "Versammlungen": [
                {"Datum":"2099-01-01","Thema":"Eins","Ort":12,"Status":"angemeldet"},
                {"Datum":"2099-01-02","Thema":"Zwei","Ort":"Altmarkt","Status":"angemeldet"},
                {"Datum":"2099-01-03","Thema":["kein","Text"]},
                "kein Objekt"
            ]
        }"#;
        let dataset: Dataset = serde_json::from_str(json).unwrap();
        assert_eq!(dataset.len(), 4);

        let valid = dataset.assemblies();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].location, None);
        assert_eq!(valid[1].location.as_deref(), Some("Altmarkt"));

        assert_eq!(dataset.versammlungen[0].get("Ort"), Some(&json!(12)));
        assert_eq!(
            dataset.versammlungen[3].identity_key(),
            identity_key([None; 6])
        );
    }

    #[test]
    fn set_builds_an_entry_from_scratch() {
        let mut raw = RawAssembly::default();
        raw.set("Datum", "2099-01-01");
        raw.set("Thema", "Neu");
        assert_eq!(raw.date(), Some("2099-01-01"));
        assert_eq!(Assembly::try_from(&raw).unwrap().topic, "Neu");
    }
}
