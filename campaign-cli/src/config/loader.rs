use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use campaign_engine::EngineConfig;
use directories::ProjectDirs;
use toml::{Table, Value};
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project + explicit file)
    pub fn load(explicit: Option<&Path>) -> Result<EngineConfig> {
        let mut raw = Table::new();

        // Layer 1: User config
        if let Some(user_path) = Self::user_config_path()
            && let Some(user) = Self::read_layer(&user_path)?
        {
            raw = Self::merge_raw(raw, user);
        }

        // Layer 2: Project config
        if let Some(project) = Self::read_layer(&Self::project_config_path())? {
            raw = Self::merge_raw(raw, project);
        }

        // Layer 3: File named on the command line, which must exist
        if let Some(path) = explicit {
            let Some(layer) = Self::read_layer(path)? else {
                bail!("Config file not found: {}", path.display());
            };
            raw = Self::merge_raw(raw, layer);
        }

        Self::finalize(raw)
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with CAMPAIGN_CONFIG_DIR env var (useful for isolated e2e tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("CAMPAIGN_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".campaign/config.toml")
        }
    }

    /// Default database file under the platform data directory
    pub fn default_db_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("campaign.db"))
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "campaign")
    }

    /// Read one TOML layer, `None` when the file does not exist
    fn read_layer(path: &Path) -> Result<Option<Table>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table = contents
            .parse::<Table>()
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        debug!(path = %path.display(), "loaded config layer");
        Ok(Some(table))
    }

    /// Merge two raw layers (overlay keys win, nested tables merge key by key)
    fn merge_raw(mut base: Table, overlay: Table) -> Table {
        for (key, value) in overlay {
            let merged = match (base.remove(&key), value) {
                (Some(Value::Table(b)), Value::Table(o)) => Value::Table(Self::merge_raw(b, o)),
                (_, v) => v,
            };
            base.insert(key, merged);
        }
        base
    }

    /// Convert the merged layers to a validated config with defaults applied
    fn finalize(raw: Table) -> Result<EngineConfig> {
        let config = Value::Table(raw)
            .try_into::<EngineConfig>()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn load_from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<EngineConfig> {
        let mut raw = Table::new();
        for path in paths {
            if let Some(layer) = Self::read_layer(path.as_ref())? {
                raw = Self::merge_raw(raw, layer);
            }
        }
        Self::finalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_engine::{AttributionModel, CampaignId};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_no_layers_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");

        let config = ConfigLoader::load_from_paths(&[&missing]).unwrap();

        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_project_layer_overrides_user_layer() {
        let temp_dir = TempDir::new().unwrap();
        let user = write(
            &temp_dir,
            "user.toml",
            "[fraud]\nclick_threshold = 80\ncost_per_click = 1.5\n",
        );
        let project = write(&temp_dir, "project.toml", "[fraud]\nclick_threshold = 30\n");

        let config = ConfigLoader::load_from_paths(&[&user, &project]).unwrap();

        assert_eq!(config.fraud.click_threshold, 30);
        assert_eq!(config.fraud.cost_per_click, 1.5);
    }

    #[test]
    fn test_campaign_overrides_merge_per_campaign() {
        let temp_dir = TempDir::new().unwrap();
        let user = write(
            &temp_dir,
            "user.toml",
            "[campaigns.spring]\ntotal_budget = 500.0\n\n[campaigns.fall]\nscale_factor = 1.5\n",
        );
        let project = write(
            &temp_dir,
            "project.toml",
            "[attribution]\nmodel = \"linear\"\n\n[campaigns.spring]\npoll_interval_secs = 60\n",
        );

        let config = ConfigLoader::load_from_paths(&[&user, &project]).unwrap();

        let spring = config.override_for(&CampaignId::from("spring")).unwrap();
        assert_eq!(spring.total_budget, Some(500.0));
        assert_eq!(spring.poll_interval_secs, Some(60));
        assert!(config.override_for(&CampaignId::from("fall")).is_some());
        assert_eq!(config.attribution.model, AttributionModel::Linear);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(&temp_dir, "config.toml", "[budget]\nscale_factor = 0.5\n");

        let err = ConfigLoader::load_from_paths(&[&path]).unwrap_err();

        assert!(err.to_string().contains("scale_factor"));
    }

    #[test]
    fn test_malformed_toml_names_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(&temp_dir, "broken.toml", "[fraud\n");

        let err = ConfigLoader::load_from_paths(&[&path]).unwrap_err();

        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");

        let err = ConfigLoader::load(Some(missing.as_path())).unwrap_err();

        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_merge_replaces_scalars_and_keeps_siblings() {
        let base: Table = "[fraud]\nclick_threshold = 10\ncritical_threshold = 20\n"
            .parse()
            .unwrap();
        let overlay: Table = "[fraud]\nclick_threshold = 15\n".parse().unwrap();

        let merged = ConfigLoader::merge_raw(base, overlay);

        let fraud = merged["fraud"].as_table().unwrap();
        assert_eq!(fraud["click_threshold"].as_integer(), Some(15));
        assert_eq!(fraud["critical_threshold"].as_integer(), Some(20));
    }
}
