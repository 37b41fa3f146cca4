use s3comply_core::{
    AclGrant, BucketInspector, CheckKind, CheckOutcome, ModuleInputs, ModuleOutputs, ProvisioningSession,
    Report, BUCKET_NAME_OUTPUT,
};
use tracing::Instrument;

mod suite;
pub use suite::run_suite;

pub const DEFAULT_NAME_PREFIX: &str = "wizardai";
pub const KMS_ALGORITHM: &str = "aws:kms";
pub const SECURE_TRANSPORT_DENY: &str = r#""aws:SecureTransport":"false""#;
pub const VERSIONING_ENABLED: &str = "Enabled";
pub const ALL_USERS_URI: &str = "http://acs.amazonaws.com/groups/global/AllUsers";

/// Live-resource checks for the provisioned bucket.
#[derive(Debug, Clone)]
pub struct Policy {
    pub name_prefix: String,
    pub sse_algorithm: String,
    pub secure_transport_clause: String,
    pub versioning_status: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            sse_algorithm: KMS_ALGORITHM.to_string(),
            secure_transport_clause: SECURE_TRANSPORT_DENY.to_string(),
            versioning_status: VERSIONING_ENABLED.to_string(),
        }
    }
}

fn check_span(kind: CheckKind) -> tracing::Span {
    tracing::info_span!("check", check = %kind)
}

fn is_public_grant(g: &AclGrant) -> bool {
    g.grantee_type == "Group" && g.grantee_uri.as_deref() == Some(ALL_USERS_URI)
}

impl Policy {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self { name_prefix: name_prefix.into(), ..Self::default() }
    }

    pub fn expected_bucket_name(&self, name: &str, environment: &str) -> String {
        format!("{}-{}-{}", self.name_prefix, name, environment)
    }

    /// Runs every check against the session's bucket. Failures never stop later checks.
    pub async fn evaluate(&self, inspector: &dyn BucketInspector, session: &ProvisioningSession) -> Report {
        let empty = ModuleOutputs::default();
        let outputs = session.outputs.as_ref().unwrap_or(&empty);
        let mut report = Report { bucket: session.bucket_name().map(str::to_string), outcomes: Vec::new() };

        report.record(check_span(CheckKind::NamingConvention).in_scope(|| self.check_naming(outputs, &session.inputs)));
        report.record(self.check_encryption_at_rest(inspector, outputs).instrument(check_span(CheckKind::EncryptionAtRest)).await);
        report.record(self.check_encryption_in_transit(inspector, outputs).instrument(check_span(CheckKind::EncryptionInTransit)).await);
        report.record(self.check_public_access_blocked(inspector, outputs).instrument(check_span(CheckKind::PublicAccessBlocked)).await);
        report.record(self.check_versioning(inspector, outputs).instrument(check_span(CheckKind::Versioning)).await);
        report
    }

    pub fn check_naming(&self, outputs: &ModuleOutputs, inputs: &ModuleInputs) -> CheckOutcome {
        let kind = CheckKind::NamingConvention;
        let actual = match outputs.get(BUCKET_NAME_OUTPUT) {
            Ok(b) => b,
            Err(e) => return CheckOutcome::fail(kind, e.to_string()),
        };
        let expected = self.expected_bucket_name(&inputs.name, &inputs.environment);
        if actual == expected {
            CheckOutcome::pass(kind)
        } else {
            CheckOutcome::fail(kind, format!("bucket name '{actual}' does not follow naming convention, expected '{expected}'"))
        }
    }

    pub async fn check_encryption_at_rest(&self, inspector: &dyn BucketInspector, outputs: &ModuleOutputs) -> CheckOutcome {
        let kind = CheckKind::EncryptionAtRest;
        let bucket = match outputs.get(BUCKET_NAME_OUTPUT) {
            Ok(b) => b,
            Err(e) => return CheckOutcome::fail(kind, e.to_string()),
        };
        let rules = match inspector.encryption_rules(bucket).await {
            Ok(r) => r,
            Err(e) => return CheckOutcome::fail(kind, format!("{e:#}")),
        };
        if rules.is_empty() {
            return CheckOutcome::fail(kind, "no default encryption rules configured");
        }
        let mut observations = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            let Some(alg) = rule.default_algorithm.as_deref() else {
                return CheckOutcome::fail(kind, format!("rule {i} has no default encryption"))
                    .with_observations(observations);
            };
            if alg != self.sse_algorithm {
                return CheckOutcome::fail(kind, format!("rule {i} uses {alg}, expected {}", self.sse_algorithm))
                    .with_observations(observations);
            }
            if let Some(key) = &rule.kms_master_key_id {
                observations.push(format!("rule {i} key: {key}"));
            }
        }
        CheckOutcome::pass(kind).with_observations(observations)
    }

    pub async fn check_encryption_in_transit(&self, inspector: &dyn BucketInspector, outputs: &ModuleOutputs) -> CheckOutcome {
        let kind = CheckKind::EncryptionInTransit;
        let bucket = match outputs.get(BUCKET_NAME_OUTPUT) {
            Ok(b) => b,
            Err(e) => return CheckOutcome::fail(kind, e.to_string()),
        };
        match inspector.policy_document(bucket).await {
            Ok(Some(doc)) if doc.contains(&self.secure_transport_clause) => CheckOutcome::pass(kind),
            Ok(Some(_)) => CheckOutcome::fail(kind, "bucket policy does not enforce encryption in transit"),
            Ok(None) => CheckOutcome::fail(kind, "bucket has no policy"),
            Err(e) => CheckOutcome::fail(kind, format!("{e:#}")),
        }
    }

    pub async fn check_public_access_blocked(&self, inspector: &dyn BucketInspector, outputs: &ModuleOutputs) -> CheckOutcome {
        let kind = CheckKind::PublicAccessBlocked;
        let bucket = match outputs.get(BUCKET_NAME_OUTPUT) {
            Ok(b) => b,
            Err(e) => return CheckOutcome::fail(kind, e.to_string()),
        };
        let mut observations = Vec::new();

        let grants = match inspector.acl_grants(bucket).await {
            Ok(g) => g,
            Err(e) => return CheckOutcome::fail(kind, format!("{e:#}")),
        };
        let public: Vec<&str> = grants.iter().filter(|g| is_public_grant(g))
            .map(|g| g.permission.as_deref().unwrap_or("UNKNOWN"))
            .collect();
        let via_acl = !public.is_empty();
        observations.push(if via_acl {
            format!("bucket is publicly accessible via ACL ({})", public.join(", "))
        } else {
            "no public ACL grants".to_string()
        });

        let via_policy = match inspector.policy_is_public(bucket).await {
            Ok(p) => p,
            Err(e) => return CheckOutcome::fail(kind, format!("{e:#}")).with_observations(observations),
        };
        observations.push(match via_policy {
            Some(true) => "bucket is publicly accessible via policy",
            Some(false) => "bucket is not publicly accessible via policy",
            None => "bucket has no policy",
        }.to_string());
        for o in &observations { tracing::info!(bucket, "{o}"); }

        let outcome = match (via_acl, via_policy == Some(true)) {
            (false, false) => CheckOutcome::pass(kind),
            (true, true) => CheckOutcome::fail(kind, "bucket is public via ACL and policy"),
            (true, false) => CheckOutcome::fail(kind, "bucket is public via ACL"),
            (false, true) => CheckOutcome::fail(kind, "bucket is public via policy"),
        };
        outcome.with_observations(observations)
    }

    pub async fn check_versioning(&self, inspector: &dyn BucketInspector, outputs: &ModuleOutputs) -> CheckOutcome {
        let kind = CheckKind::Versioning;
        let bucket = match outputs.get(BUCKET_NAME_OUTPUT) {
            Ok(b) => b,
            Err(e) => return CheckOutcome::fail(kind, e.to_string()),
        };
        match inspector.versioning_status(bucket).await {
            Ok(Some(s)) if s == self.versioning_status => CheckOutcome::pass(kind),
            Ok(Some(s)) => CheckOutcome::fail(kind, format!("versioning status is {s}, expected {}", self.versioning_status)),
            Ok(None) => CheckOutcome::fail(kind, "versioning has never been enabled"),
            Err(e) => CheckOutcome::fail(kind, format!("{e:#}")),
        }
    }
}
