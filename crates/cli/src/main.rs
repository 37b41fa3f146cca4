use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::fmt::format::FmtSpan;

use s3comply_aws::S3Inspector;
use s3comply_core::{ProvisioningSession, Report, SuiteError};
use s3comply_policy::{run_suite, Policy};
use s3comply_tfcompat::{pick_runner, TerraformModule};

mod config;
use config::{FileConfig, Overrides, Runner, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about="s3comply: provision an S3 bucket module, check it, destroy it")]
struct Cli {
    /// Config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Terraform/OpenTofu module directory
    #[arg(short, long)]
    module_dir: Option<PathBuf>,

    /// Bucket name input
    #[arg(long)]
    name: Option<String>,

    /// Environment tag input
    #[arg(long)]
    environment: Option<String>,

    /// AWS region input
    #[arg(long)]
    region: Option<String>,

    /// Bucket naming prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Runner
    #[arg(long, value_enum)]
    runner: Option<Runner>,

    /// Custom S3 endpoint (S3-compatible stores)
    #[arg(long)]
    endpoint: Option<String>,

    /// Let terraform/tofu colour its output
    #[arg(long, default_value_t=false)]
    color: bool,

    /// Report format on stdout
    #[arg(long, value_enum, default_value_t=Format::Text)]
    format: Format,

    /// Debug logging
    #[arg(short, long, default_value_t=false)]
    verbose: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Format { Text, Json }

fn print_report(out: &mut impl Write, report: &Report, format: Format) -> Result<()> {
    match format {
        Format::Text => writeln!(out, "{report}")?,
        Format::Json => writeln!(out, "{}", serde_json::to_string_pretty(report)?)?,
    }
    Ok(())
}

/// Process exit status: 0 all checks passed, 1 a check failed, 2 teardown failed.
const EXIT_CHECKS_FAILED: u8 = 1;
const EXIT_TEARDOWN_FAILED: u8 = 2;

/// Prints the report, if the run produced one, and maps the run to an exit
/// status. Provisioning failure stays an error.
fn finish(out: &mut impl Write, res: Result<Report, SuiteError>, format: Format) -> Result<u8> {
    match res {
        Ok(report) => {
            print_report(out, &report, format)?;
            Ok(if report.passed() { 0 } else { EXIT_CHECKS_FAILED })
        }
        Err(SuiteError::Teardown { report, error }) => {
            print_report(out, &report, format)?;
            tracing::error!(error=%format!("{error:#}"), "teardown failed; resources may still exist");
            Ok(EXIT_TEARDOWN_FAILED)
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().json()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    let file = match &cli.config {
        Some(p) => FileConfig::load(p)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(Overrides {
        module_dir: cli.module_dir,
        name: cli.name,
        environment: cli.environment,
        region: cli.region,
        prefix: cli.prefix,
        runner: cli.runner,
        endpoint: cli.endpoint,
    }, file)?;

    let runner = pick_runner(settings.runner.preference())?;
    let module = TerraformModule { runner, no_color: !cli.color };
    let inspector = S3Inspector::connect(&settings.inputs.region, settings.endpoint.as_deref()).await;
    let policy = Policy::new(settings.prefix.clone());
    let session = ProvisioningSession::new(settings.module_dir, settings.inputs);

    let res = run_suite(&module, &inspector, &policy, session).await;
    let code = finish(&mut std::io::stdout().lock(), res, cli.format)?;
    Ok(ExitCode::from(code))
}
