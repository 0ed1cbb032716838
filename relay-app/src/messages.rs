//! User-facing message templates, keyed by locale and message key.
//!
//! File format (`messages.json`):
//!
//! ```json
//! {
//!   "default_locale": "en",
//!   "locales": {
//!     "en": { "denied": "Access denied for {user_id}.", "overloaded": "..." },
//!     "ru": { "denied": "..." }
//!   }
//! }
//! ```
//!
//! Missing keys fall back to the default locale and then to built-in English.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Start,
    Help,
    Denied,
    Unavailable,
    Overloaded,
    Error,
    Queued,
    QueueStatus,
}

impl MessageKey {
    pub const ALL: [MessageKey; 8] = [
        Self::Start,
        Self::Help,
        Self::Denied,
        Self::Unavailable,
        Self::Overloaded,
        Self::Error,
        Self::Queued,
        Self::QueueStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Denied => "denied",
            Self::Unavailable => "unavailable",
            Self::Overloaded => "overloaded",
            Self::Error => "error",
            Self::Queued => "queued",
            Self::QueueStatus => "queue_status",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Self::Start => "Hi! Send me a message and I will pass it to the AI.",
            Self::Help => {
                "Send any text to get an AI reply.\n/queue - show the request queue\n/help - show this message"
            }
            Self::Denied => "Sorry, you are not allowed to use this bot. Your id: {user_id}",
            Self::Unavailable => {
                "The service is temporarily unavailable. Please try again later."
            }
            Self::Overloaded => "Too many requests right now. Please try again in a minute.",
            Self::Error => "Sorry, something went wrong while generating a reply.",
            Self::Queued => "Your request is in the queue. Position: {position}",
            Self::QueueStatus => "Requests waiting: {depth} (capacity: {capacity})",
        }
    }
}

const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Deserialize)]
struct MessagesFile {
    #[serde(default = "default_locale")]
    default_locale: String,
    #[serde(default)]
    locales: HashMap<String, HashMap<String, String>>,
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}

#[derive(Debug, Clone)]
pub struct Localization {
    default_locale: String,
    locales: HashMap<String, HashMap<String, String>>,
}

impl Localization {
    pub fn builtin() -> Self {
        Self {
            default_locale: DEFAULT_LOCALE.to_string(),
            locales: HashMap::new(),
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::info!(path = %path.display(), "loading messages");
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read messages {}: {e}", path.display()))?;
        let loc = Self::from_json(&contents)
            .map_err(|e| anyhow::anyhow!("parse messages {}: {e}", path.display()))?;
        tracing::info!(
            default_locale = %loc.default_locale,
            locales = ?loc.locale_names(),
            "messages loaded"
        );
        Ok(loc)
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let file: MessagesFile = serde_json::from_str(contents)?;
        let default_locale = normalize_locale(&file.default_locale);
        let locales: HashMap<String, HashMap<String, String>> = file
            .locales
            .into_iter()
            .map(|(locale, texts)| (normalize_locale(&locale), texts))
            .collect();

        if !locales.is_empty() && !locales.contains_key(&default_locale) {
            return Err(anyhow::anyhow!(
                "default_locale {default_locale:?} has no entry in locales"
            ));
        }
        for (locale, texts) in &locales {
            for key in texts.keys() {
                if !MessageKey::ALL.iter().any(|k| k.as_str() == key) {
                    tracing::warn!(%locale, %key, "unknown message key ignored");
                }
            }
        }

        Ok(Self {
            default_locale,
            locales,
        })
    }

    pub fn locale_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locales.keys().cloned().collect();
        names.sort();
        names
    }

    /// Raw template for `key`, resolved for `locale`.
    pub fn text(&self, key: MessageKey, locale: Option<&str>) -> &str {
        if let Some(locale) = locale.map(normalize_locale) {
            if let Some(text) = self.lookup(&locale, key) {
                return text;
            }
            if let Some((primary, _)) = locale.split_once('-') {
                if let Some(text) = self.lookup(primary, key) {
                    return text;
                }
            }
        }
        self.lookup(&self.default_locale, key)
            .unwrap_or_else(|| key.builtin())
    }

    fn lookup(&self, locale: &str, key: MessageKey) -> Option<&str> {
        self.locales
            .get(locale)
            .and_then(|texts| texts.get(key.as_str()))
            .map(String::as_str)
    }

    /// Template for `key` with `{name}` placeholders substituted.
    pub fn render(&self, key: MessageKey, locale: Option<&str>, vars: &[(&str, String)]) -> String {
        let mut out = self.text(key, locale).to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}

fn normalize_locale(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGES: &str = r#"{
        "default_locale": "en",
        "locales": {
            "en": {"denied": "No access for {user_id}.", "error": "Oops."},
            "ru": {"denied": "Net dostupa: {user_id}"}
        }
    }"#;

    #[test]
    fn lookup_prefers_exact_then_primary_then_default_then_builtin() {
        let loc = Localization::from_json(MESSAGES).expect("parse");
        assert_eq!(loc.text(MessageKey::Denied, Some("ru")), "Net dostupa: {user_id}");
        assert_eq!(loc.text(MessageKey::Denied, Some("ru-RU")), "Net dostupa: {user_id}");
        assert_eq!(loc.text(MessageKey::Error, Some("ru")), "Oops.");
        assert_eq!(loc.text(MessageKey::Denied, Some("de")), "No access for {user_id}.");
        assert_eq!(
            loc.text(MessageKey::Overloaded, None),
            MessageKey::Overloaded.builtin()
        );
    }

    #[test]
    fn render_substitutes_placeholders() {
        let loc = Localization::from_json(MESSAGES).expect("parse");
        assert_eq!(
            loc.render(MessageKey::Denied, Some("en"), &[("user_id", "42".to_string())]),
            "No access for 42."
        );
        let builtin = Localization::builtin();
        assert_eq!(
            builtin.render(
                MessageKey::QueueStatus,
                None,
                &[("depth", "3".to_string()), ("capacity", "10".to_string())]
            ),
            "Requests waiting: 3 (capacity: 10)"
        );
    }

    #[test]
    fn default_locale_must_exist_when_locales_are_given() {
        let err = Localization::from_json(r#"{"default_locale": "fr", "locales": {"en": {}}}"#)
            .expect_err("missing default locale");
        assert!(err.to_string().contains("fr"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        assert!(Localization::from_json("[1, 2").is_err());
    }

    #[tokio::test]
    async fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("messages.json");
        tokio::fs::write(&path, MESSAGES).await.expect("write");
        let loc = Localization::load(&path).await.expect("load");
        assert_eq!(loc.locale_names(), vec!["en".to_string(), "ru".to_string()]);

        let missing = Localization::load(&dir.path().join("nope.json")).await;
        assert!(missing.is_err());
    }
}
