use s3comply_core::{BucketInspector, Provisioner, ProvisioningSession, ReleaseGuard, Report, SuiteError};

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::Policy;

/// Runs blocking provisioner work without stalling other tasks on a
/// multi-thread runtime. A current-thread runtime has nothing else to run, so
/// the closure is called inline there.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(h) if h.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Provision, check, destroy.
///
/// A failed apply is fatal: no checks run, but destroy is still attempted and
/// its error, if any, rides along in [`SuiteError::Provision`].
/// Check failures land in the report and never skip teardown.
pub async fn run_suite<P: Provisioner + ?Sized>(
    provisioner: &P,
    inspector: &dyn BucketInspector,
    policy: &Policy,
    session: ProvisioningSession,
) -> Result<Report, SuiteError> {
    let mut guard = ReleaseGuard::arm(provisioner, session);
    if let Err(error) = blocking(|| guard.apply()) {
        tracing::error!(error=%format!("{error:#}"), "provisioning failed; skipping checks");
        let teardown = blocking(|| guard.release()).err();
        if let Some(d) = &teardown {
            tracing::error!(error=%format!("{d:#}"), "destroy after failed apply also failed");
        }
        return Err(SuiteError::Provision { error, teardown });
    }

    let report = policy.evaluate(inspector, guard.session()).await;
    tracing::info!(passed=report.passed(), failed=report.failures().count(), "checks complete");

    match blocking(|| guard.release()) {
        Ok(()) => Ok(report),
        Err(error) => Err(SuiteError::Teardown { report, error }),
    }
}
