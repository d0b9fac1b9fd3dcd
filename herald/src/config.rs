use std::path::{Path, PathBuf};

use herald_common::internal;
use herald_delivery::{Campaign, EngineConfig, RecipientRow, Variables};
use serde::Deserialize;

const CONFIG_ENV: &str = "HERALD_CONFIG";

/// Contents of `herald.config.ron`
#[derive(Debug, Default, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// JSON-lines attempt log. Attempts are kept in memory when unset, which
    /// disables resuming across invocations.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// A campaign together with its uploaded rows
#[derive(Debug, Deserialize)]
pub struct CampaignFile {
    pub campaign: Campaign,

    #[serde(default)]
    pub recipients: Vec<RecipientRow>,

    /// Variables for test sends; the first row is used when absent
    #[serde(default)]
    pub sample: Option<Variables>,
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;

    ron::Options::default()
        .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
        .from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
}

impl HeraldConfig {
    /// # Errors
    ///
    /// If the file cannot be read or parsed, or the engine settings are out
    /// of range.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Self = parse(path)?;
        config
            .engine
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid engine settings in {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load `explicit` if given, otherwise the first file found by
    /// [`find_config_file`], otherwise the defaults.
    ///
    /// # Errors
    ///
    /// If a config file was found but could not be loaded, or `HERALD_CONFIG`
    /// names a missing file.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match find_config_file()? {
            Some(path) => {
                internal!(level = INFO, "Using configuration {}", path.display());
                Self::load(&path)
            }
            None => {
                internal!(level = INFO, "No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

impl CampaignFile {
    /// # Errors
    ///
    /// If the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        parse(path)
    }
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
///
/// If `HERALD_CONFIG` is set to a path that does not exist.
pub fn find_config_file() -> anyhow::Result<Option<PathBuf>> {
    let candidates = [
        PathBuf::from("./herald.config.ron"),
        PathBuf::from("/etc/herald/herald.config.ron"),
    ];
    locate(std::env::var(CONFIG_ENV).ok(), &candidates)
}

fn locate(env_path: Option<String>, candidates: &[PathBuf]) -> anyhow::Result<Option<PathBuf>> {
    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    Ok(candidates.iter().find(|path| path.exists()).cloned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use herald_delivery::Mode;

    use super::*;

    #[test]
    fn test_env_path_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.ron");
        let fallback = dir.path().join("herald.config.ron");
        std::fs::write(&explicit, "()").unwrap();
        std::fs::write(&fallback, "()").unwrap();

        let found = locate(
            Some(explicit.display().to_string()),
            std::slice::from_ref(&fallback),
        )
        .unwrap();
        assert_eq!(found, Some(explicit));

        assert!(locate(Some("/nonexistent/herald.ron".to_string()), &[fallback]).is_err());
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ron");
        let present = dir.path().join("present.ron");
        std::fs::write(&present, "()").unwrap();

        assert_eq!(
            locate(None, &[missing.clone(), present.clone()]).unwrap(),
            Some(present)
        );
        assert_eq!(locate(None, &[missing]).unwrap(), None);
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.config.ron");
        std::fs::write(
            &path,
            r#"(
                engine: (
                    max_concurrency: 10,
                    unsubscribe_url: "https://example.com/u?e={{email}}",
                ),
                log_path: "/var/lib/herald/attempts.jsonl",
            )"#,
        )
        .unwrap();

        let config = HeraldConfig::load(&path).unwrap();
        assert_eq!(config.engine.max_concurrency, 10);
        assert_eq!(
            config.engine.unsubscribe_url.as_deref(),
            Some("https://example.com/u?e={{email}}")
        );
        assert_eq!(
            config.log_path,
            Some(PathBuf::from("/var/lib/herald/attempts.jsonl"))
        );
    }

    #[test]
    fn test_load_rejects_out_of_range_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.config.ron");
        std::fs::write(&path, "(engine: (max_concurrency: 50))").unwrap();

        let error = HeraldConfig::load(&path).unwrap_err().to_string();
        assert!(error.contains("max_concurrency must be between 1 and 20"), "{error}");
    }

    #[test]
    fn test_load_campaign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaign.ron");
        std::fs::write(
            &path,
            r#"(
                campaign: (
                    name: "Spring",
                    template: (subject: "Hi {{name}}", html: "<p>Hello</p>"),
                    mode: Real,
                    concurrency: 2,
                ),
                recipients: [
                    (email: "ann@example.com", variables: {"name": "Ann"}),
                    (email: "bob@example.com"),
                ],
            )"#,
        )
        .unwrap();

        let file = CampaignFile::load(&path).unwrap();
        assert_eq!(file.campaign.name, "Spring");
        assert_eq!(file.campaign.mode, Mode::Real);
        assert_eq!(file.recipients.len(), 2);
        assert_eq!(file.recipients[0].variables.get("name"), Some("Ann"));
        assert!(file.sample.is_none());
    }

    #[test]
    fn test_shipped_files_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..");

        let config = HeraldConfig::load(&root.join("herald.config.ron")).unwrap();
        assert_eq!(config.engine.sender.email, "news@example.com");
        assert_eq!(config.engine.domains.len(), 2);

        let file = CampaignFile::load(&root.join("demos/campaign.ron")).unwrap();
        assert_eq!(file.campaign.mode, Mode::Demo);
        assert!(file.campaign.validate(config.engine.max_concurrency).is_ok());
        assert_eq!(file.recipients.len(), 3);
        assert!(file.sample.is_some());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ron");
        std::fs::write(&path, "(campaign: ").unwrap();

        let error = CampaignFile::load(&path).unwrap_err().to_string();
        assert!(error.contains("broken.ron"));
    }
}
