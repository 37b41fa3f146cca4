use anyhow::{Context, Result};
use clap::ValueEnum;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use s3comply_core::ModuleInputs;
use s3comply_policy::DEFAULT_NAME_PREFIX;

pub const DEFAULT_NAME: &str = "test";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_REGION: &str = "us-west-2";

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runner { Auto, Terraform, Tofu }

impl Runner {
    pub fn preference(self) -> Option<s3comply_tfcompat::Runner> {
        match self {
            Runner::Terraform => Some(s3comply_tfcompat::Runner::Terraform),
            Runner::Tofu => Some(s3comply_tfcompat::Runner::Tofu),
            Runner::Auto => None,
        }
    }
}

/// Optional YAML file; every field can also come from the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub module_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub runner: Option<Runner>,
    pub endpoint: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
        serde_yaml::from_slice(&raw).with_context(|| format!("parse config {}", path.display()))
    }
}

/// Values given on the command line; `None` defers to the file, then the default.
#[derive(Debug, Default)]
pub struct Overrides {
    pub module_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub runner: Option<Runner>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub module_dir: PathBuf,
    pub inputs: ModuleInputs,
    pub prefix: String,
    pub runner: Runner,
    pub endpoint: Option<String>,
}

impl Settings {
    pub fn resolve(cli: Overrides, file: FileConfig) -> Result<Self> {
        let module_dir = cli.module_dir.or(file.module_dir)
            .context("module directory not set; pass --module-dir or set module_dir in the config file")?;
        let settings = Settings {
            module_dir,
            inputs: ModuleInputs {
                name: cli.name.or(file.name).unwrap_or_else(|| DEFAULT_NAME.to_string()),
                environment: cli.environment.or(file.environment).unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
                region: cli.region.or(file.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            },
            prefix: cli.prefix.or(file.prefix).unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string()),
            runner: cli.runner.or(file.runner).unwrap_or(Runner::Auto),
            endpoint: cli.endpoint.or(file.endpoint),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let label = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$")?;
        for (field, value) in [("prefix", &self.prefix), ("name", &self.inputs.name), ("environment", &self.inputs.environment)] {
            if !label.is_match(value) {
                anyhow::bail!("{field} '{value}' must be lowercase letters, digits and single hyphens");
            }
        }
        let region = Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$")?;
        if !region.is_match(&self.inputs.region) {
            anyhow::bail!("region '{}' is not a valid AWS region name", self.inputs.region);
        }
        let bucket_len = self.prefix.len() + self.inputs.name.len() + self.inputs.environment.len() + 2;
        if !(3..=63).contains(&bucket_len) {
            anyhow::bail!("resulting bucket name would be {bucket_len} characters; S3 allows 3 to 63");
        }
        if !self.module_dir.is_dir() {
            anyhow::bail!("module directory {} does not exist", self.module_dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> tempfile::TempDir { tempfile::tempdir().unwrap() }

    #[test]
    fn defaults_match_the_reference_run() {
        let d = dir();
        let s = Settings::resolve(Overrides { module_dir: Some(d.path().into()), ..Default::default() }, FileConfig::default()).unwrap();
        assert_eq!(s.inputs, ModuleInputs {
            name: "test".into(), environment: "development".into(), region: "us-west-2".into(),
        });
        assert_eq!(s.prefix, "wizardai");
        assert_eq!(s.runner, Runner::Auto);
    }

    #[test]
    fn cli_overrides_file() {
        let d = dir();
        let path = d.path().join("s3comply.yaml");
        std::fs::write(&path, format!(
            "module_dir: {}\nname: logs\nenvironment: staging\nrunner: tofu\n", d.path().display()
        )).unwrap();
        let file = FileConfig::load(&path).unwrap();
        let s = Settings::resolve(Overrides { environment: Some("production".into()), ..Default::default() }, file).unwrap();
        assert_eq!(s.module_dir, d.path());
        assert_eq!(s.inputs.name, "logs");
        assert_eq!(s.inputs.environment, "production");
        assert_eq!(s.runner, Runner::Tofu);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let d = dir();
        let path = d.path().join("bad.yaml");
        std::fs::write(&path, "bucket: nope\n").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn module_dir_is_required() {
        let err = Settings::resolve(Overrides::default(), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--module-dir"));
    }

    #[test]
    fn rejects_uppercase_names() {
        let d = dir();
        let o = Overrides { module_dir: Some(d.path().into()), name: Some("Test".into()), ..Default::default() };
        assert!(Settings::resolve(o, FileConfig::default()).is_err());
    }

    #[test]
    fn rejects_bad_region() {
        let d = dir();
        let o = Overrides { module_dir: Some(d.path().into()), region: Some("oregon".into()), ..Default::default() };
        assert!(Settings::resolve(o, FileConfig::default()).is_err());
    }

    #[test]
    fn rejects_overlong_bucket_name() {
        let d = dir();
        let o = Overrides { module_dir: Some(d.path().into()), name: Some("a".repeat(60)), ..Default::default() };
        let err = Settings::resolve(o, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("3 to 63"));
    }

    #[test]
    fn rejects_missing_module_dir() {
        let o = Overrides { module_dir: Some("/nonexistent/wizardai_s3_bucket_module".into()), ..Default::default() };
        assert!(Settings::resolve(o, FileConfig::default()).is_err());
    }
}
