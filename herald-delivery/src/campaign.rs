//! Campaign definition: the immutable input of a run.

use std::{fmt, path::PathBuf, str::FromStr};

use herald_common::Address;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};

use crate::{error::ConfigError, policy::RetryPolicy, template::Template};

/// Unique identifier of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CampaignId {
    id: ulid::Ulid,
}

impl CampaignId {
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for CampaignId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl Serialize for CampaignId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for CampaignId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Delivery mode of a campaign.
///
/// `Demo` never contacts uploaded recipients: the feed is rebuilt from the
/// configured test addresses instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Demo,
    Real,
}

/// Ordered variable name → value mapping.
///
/// Column order from the upload is preserved; lookups are linear which is
/// fine for spreadsheet-sized rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(Vec<(String, String)>);

impl Variables {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set `name`, replacing an existing value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut variables = Self::new();
        for (k, v) in iter {
            variables.insert(k, v);
        }
        variables
    }
}

impl Serialize for Variables {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VariablesVisitor;

        impl<'de> Visitor<'de> for VariablesVisitor {
            type Value = Variables;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of variable names to values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut variables = Variables::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    variables.insert(key, value);
                }
                Ok(variables)
            }
        }

        deserializer.deserialize_map(VariablesVisitor)
    }
}

/// One uploaded row, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRow {
    pub email: String,
    #[serde(default)]
    pub variables: Variables,
}

impl RecipientRow {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            variables: Variables::new(),
        }
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name, value);
        self
    }
}

/// A file attached to every message of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub path: PathBuf,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl AttachmentRef {
    pub fn new(filename: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            content_type: None,
        }
    }

    /// Explicit content type, or one guessed from the file extension
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or_else(|| mime_type(&self.filename))
    }
}

/// Per-recipient attachment looked up in `folder`.
///
/// `pattern` is rendered with the recipient's variables (e.g.
/// `"Invitation {{name}}.pdf"`) and matched exactly, then ignoring case.
/// Without a pattern, or when it finds nothing, the recipient's name is
/// matched against the words of the file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAttachment {
    pub folder: PathBuf,

    #[serde(default)]
    pub pattern: Option<String>,

    /// Variable holding the recipient's name; common name columns are
    /// tried when unset
    #[serde(default)]
    pub name_column: Option<String>,
}

/// Guess a MIME type from a filename's extension
#[must_use]
pub fn mime_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "zip" => "application/zip",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Generated when absent. Keep it fixed in campaign files so a later run
    /// skips recipients an earlier one delivered to.
    #[serde(default = "CampaignId::generate")]
    pub id: CampaignId,

    pub name: String,

    pub template: Template,

    #[serde(default)]
    pub mode: Mode,

    /// Destinations used instead of the uploaded rows in [`Mode::Demo`]
    #[serde(default)]
    pub demo_addresses: Vec<String>,

    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,

    #[serde(default)]
    pub dynamic_attachment: Option<DynamicAttachment>,

    /// Number of workers (1 to the engine maximum)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Falls back to the engine-wide policy when unset
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Pause taken by a worker after every `batch_size` recipients
    #[serde(default)]
    pub batch_pause_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

const fn default_concurrency() -> usize {
    5
}

const fn default_batch_size() -> usize {
    1
}

impl Campaign {
    pub fn new(name: impl Into<String>, template: Template) -> Self {
        Self {
            id: CampaignId::generate(),
            name: name.into(),
            template,
            mode: Mode::default(),
            demo_addresses: Vec::new(),
            attachments: Vec::new(),
            dynamic_attachment: None,
            concurrency: default_concurrency(),
            retry: None,
            batch_pause_ms: 0,
            batch_size: default_batch_size(),
        }
    }

    /// Check everything that can be known to be wrong before a run starts.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self, max_concurrency: usize) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > max_concurrency {
            return Err(ConfigError::Concurrency {
                value: self.concurrency,
                max: max_concurrency,
            });
        }

        if self.template.subject.trim().is_empty() {
            return Err(ConfigError::EmptyField("subject"));
        }

        if self.template.html.trim().is_empty()
            && self.template.text.as_deref().is_none_or(|t| t.trim().is_empty())
        {
            return Err(ConfigError::EmptyField("body"));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        if self.mode == Mode::Demo {
            if self.demo_addresses.is_empty() {
                return Err(ConfigError::NoDemoAddresses);
            }

            for address in &self.demo_addresses {
                Address::parse(address)
                    .map_err(|_| ConfigError::InvalidDemoAddress(address.clone()))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn campaign() -> Campaign {
        let mut campaign = Campaign::new(
            "Spring launch",
            Template::new("Hello {{name}}", "<p>Hi {{name}}</p>"),
        );
        campaign.demo_addresses = vec!["qa@example.com".to_string()];
        campaign
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert_eq!(campaign().validate(20), Ok(()));
    }

    #[test]
    fn test_validate_concurrency_bounds() {
        let mut c = campaign();
        c.concurrency = 0;
        assert_eq!(
            c.validate(20),
            Err(ConfigError::Concurrency { value: 0, max: 20 })
        );
        c.concurrency = 21;
        assert!(c.validate(20).is_err());
        c.concurrency = 20;
        assert!(c.validate(20).is_ok());
    }

    #[test]
    fn test_validate_empty_subject_and_body() {
        let mut c = campaign();
        c.template.subject = "  ".to_string();
        assert_eq!(c.validate(20), Err(ConfigError::EmptyField("subject")));

        let mut c = campaign();
        c.template.html = String::new();
        assert_eq!(c.validate(20), Err(ConfigError::EmptyField("body")));

        c.template.text = Some("plain only".to_string());
        assert!(c.validate(20).is_ok());
    }

    #[test]
    fn test_validate_demo_addresses() {
        let mut c = campaign();
        c.demo_addresses.clear();
        assert_eq!(c.validate(20), Err(ConfigError::NoDemoAddresses));

        c.demo_addresses.push("broken".to_string());
        assert_eq!(
            c.validate(20),
            Err(ConfigError::InvalidDemoAddress("broken".to_string()))
        );

        c.demo_addresses.clear();
        c.mode = Mode::Real;
        assert!(c.validate(20).is_ok());
    }

    #[test]
    fn test_variables_preserve_order_and_replace() {
        let mut vars: Variables = [("name", "Ann"), ("city", "Lima")].into_iter().collect();
        vars.insert("name", "Bea");
        let collected: Vec<_> = vars.iter().collect();
        assert_eq!(collected, vec![("name", "Bea"), ("city", "Lima")]);
        assert!(vars.contains("city"));
        assert_eq!(vars.get("missing"), None);
    }

    #[test]
    fn test_mime_type_guess() {
        assert_eq!(mime_type("Invoice.PDF"), "application/pdf");
        assert_eq!(mime_type("photo.jpeg"), "image/jpeg");
        assert_eq!(mime_type("archive"), "application/octet-stream");
        let attachment = AttachmentRef::new("list.csv", "/tmp/list.csv");
        assert_eq!(attachment.content_type(), "text/csv");
    }

    #[test]
    fn test_campaign_from_ron() {
        let campaign: Campaign = ron::from_str(
            r#"(
                name: "Newsletter",
                template: (subject: "Hi {{name}}", html: "<p>Hello</p>"),
                mode: Real,
                concurrency: 3,
            )"#,
        )
        .unwrap();

        assert_eq!(campaign.mode, Mode::Real);
        assert_eq!(campaign.concurrency, 3);
        assert_eq!(campaign.batch_size, 1);
        assert!(campaign.retry.is_none());
    }

    #[test]
    fn test_campaign_id_round_trip_through_string() {
        let id = CampaignId::generate();
        let parsed: CampaignId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
