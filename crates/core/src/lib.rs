use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The three inputs the bucket module declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInputs {
    pub name: String,
    pub environment: String,
    pub region: String,
}

impl ModuleInputs {
    pub fn to_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("environment".to_string(), self.environment.clone()),
            ("region".to_string(), self.region.clone()),
        ])
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OutputError {
    #[error("module output '{0}' not found")]
    Missing(String),
}

/// Named outputs read back from the module after apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleOutputs(pub BTreeMap<String, String>);

impl ModuleOutputs {
    pub fn get(&self, name: &str) -> Result<&str, OutputError> {
        self.0.get(name).map(String::as_str).ok_or_else(|| OutputError::Missing(name.to_string()))
    }
}

/// Name of the output carrying the provisioned bucket's name.
pub const BUCKET_NAME_OUTPUT: &str = "bucket_name";

#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub module_dir: PathBuf,
    pub inputs: ModuleInputs,
    pub outputs: Option<ModuleOutputs>,
}

impl ProvisioningSession {
    pub fn new(module_dir: impl Into<PathBuf>, inputs: ModuleInputs) -> Self {
        Self { module_dir: module_dir.into(), inputs, outputs: None }
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.outputs.as_ref().and_then(|o| o.get(BUCKET_NAME_OUTPUT).ok())
    }
}

/// Creates and destroys the resource under test.
pub trait Provisioner {
    fn init_and_apply(&self, session: &ProvisioningSession) -> anyhow::Result<ModuleOutputs>;
    fn destroy(&self, session: &ProvisioningSession) -> anyhow::Result<()>;
}

/// Owns the session and destroys its resource when dropped unless released first.
///
/// Arm it before apply: a half-applied module still holds cloud resources.
pub struct ReleaseGuard<'a, P: Provisioner + ?Sized> {
    provisioner: &'a P,
    session: ProvisioningSession,
    armed: bool,
}

impl<'a, P: Provisioner + ?Sized> ReleaseGuard<'a, P> {
    pub fn arm(provisioner: &'a P, session: ProvisioningSession) -> Self {
        Self { provisioner, session, armed: true }
    }

    pub fn session(&self) -> &ProvisioningSession { &self.session }

    pub fn apply(&mut self) -> anyhow::Result<()> {
        tracing::info!(module_dir=%self.session.module_dir.display(), "provisioning");
        let outputs = self.provisioner.init_and_apply(&self.session)?;
        self.session.outputs = Some(outputs);
        Ok(())
    }

    /// Destroys now and disarms, so the drop path never runs a second destroy.
    pub fn release(mut self) -> anyhow::Result<()> {
        self.armed = false;
        tracing::info!(module_dir=%self.session.module_dir.display(), "releasing provisioned resources");
        self.provisioner.destroy(&self.session)
    }
}

impl<P: Provisioner + ?Sized> Drop for ReleaseGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed { return; }
        self.armed = false;
        tracing::warn!(module_dir=%self.session.module_dir.display(), "run ended early; destroying provisioned resources");
        if let Err(e) = self.provisioner.destroy(&self.session) {
            tracing::error!(error=%format!("{e:#}"), "destroy failed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRule {
    /// `None` when the rule carries no default-encryption block.
    pub default_algorithm: Option<String>,
    pub kms_master_key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclGrant {
    pub grantee_type: String,
    pub grantee_uri: Option<String>,
    pub permission: Option<String>,
}

/// Read-only queries against one bucket. Implementations bind the region.
#[async_trait]
pub trait BucketInspector: Send + Sync {
    async fn encryption_rules(&self, bucket: &str) -> anyhow::Result<Vec<EncryptionRule>>;
    async fn acl_grants(&self, bucket: &str) -> anyhow::Result<Vec<AclGrant>>;
    /// `None` when the bucket has no policy.
    async fn policy_is_public(&self, bucket: &str) -> anyhow::Result<Option<bool>>;
    async fn policy_document(&self, bucket: &str) -> anyhow::Result<Option<String>>;
    /// `None` when versioning was never configured.
    async fn versioning_status(&self, bucket: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    NamingConvention,
    EncryptionAtRest,
    EncryptionInTransit,
    PublicAccessBlocked,
    Versioning,
}

impl CheckKind {
    pub const ALL: [CheckKind; 5] = [
        CheckKind::NamingConvention,
        CheckKind::EncryptionAtRest,
        CheckKind::EncryptionInTransit,
        CheckKind::PublicAccessBlocked,
        CheckKind::Versioning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::NamingConvention => "naming_convention",
            CheckKind::EncryptionAtRest => "encryption_at_rest",
            CheckKind::EncryptionInTransit => "encryption_in_transit",
            CheckKind::PublicAccessBlocked => "public_access_blocked",
            CheckKind::Versioning => "versioning",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Verdict { Pass, Fail(String) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: CheckKind,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<String>,
}

impl CheckOutcome {
    pub fn pass(check: CheckKind) -> Self {
        Self { check, verdict: Verdict::Pass, observations: Vec::new() }
    }
    pub fn fail(check: CheckKind, reason: impl Into<String>) -> Self {
        Self { check, verdict: Verdict::Fail(reason.into()), observations: Vec::new() }
    }
    pub fn with_observations(mut self, observations: Vec<String>) -> Self {
        self.observations = observations;
        self
    }
    pub fn passed(&self) -> bool { self.verdict == Verdict::Pass }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub bucket: Option<String>,
    pub outcomes: Vec<CheckOutcome>,
}

impl Report {
    pub fn record(&mut self, outcome: CheckOutcome) {
        match &outcome.verdict {
            Verdict::Pass => tracing::info!(check=%outcome.check, "check passed"),
            Verdict::Fail(reason) => tracing::warn!(check=%outcome.check, %reason, "check failed"),
        }
        self.outcomes.push(outcome);
    }

    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(CheckOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bucket: {}", self.bucket.as_deref().unwrap_or("<none>"))?;
        for o in &self.outcomes {
            match &o.verdict {
                Verdict::Pass => writeln!(f, "PASS {}", o.check)?,
                Verdict::Fail(reason) => writeln!(f, "FAIL {}: {}", o.check, reason)?,
            }
            for obs in &o.observations { writeln!(f, "     {}", obs)?; }
        }
        let failed = self.failures().count();
        write!(f, "{} checks, {} failed", self.outcomes.len(), failed)
    }
}

fn teardown_note(teardown: &Option<anyhow::Error>) -> String {
    teardown.as_ref().map(|e| format!("; destroy also failed: {e:#}")).unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum SuiteError {
    /// `teardown` holds the destroy error when cleanup after the failed apply also failed.
    #[error("provisioning failed: {error:#}{}", teardown_note(.teardown))]
    Provision { error: anyhow::Error, teardown: Option<anyhow::Error> },
    #[error("teardown failed: {error:#}")]
    Teardown { report: Report, error: anyhow::Error },
}
