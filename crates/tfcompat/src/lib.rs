use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};

use s3comply_core::{ModuleOutputs, Provisioner, ProvisioningSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner> {
    pick_runner_in(prefer, std::env::var_os("PATH"))
}

/// Like [`pick_runner`] but searches `paths` instead of the process `PATH`.
pub fn pick_runner_in(prefer: Option<Runner>, paths: Option<OsString>) -> Result<Runner> {
    if let Some(p) = prefer { return Ok(p); }
    let cwd = std::env::current_dir()?;
    let found = |name: &str| which::which_in(name, paths.clone(), &cwd).is_ok();
    if found("tofu") { Ok(Runner::Tofu) }
    else if found("terraform") { Ok(Runner::Terraform) }
    else { anyhow::bail!("Neither 'tofu' nor 'terraform' found in PATH") }
}

fn bin(r: Runner) -> &'static str { match r { Runner::Terraform => "terraform", Runner::Tofu => "tofu" } }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step { Init, Apply, Destroy, Output }

impl Step {
    fn as_str(self) -> &'static str {
        match self { Step::Init => "init", Step::Apply => "apply", Step::Destroy => "destroy", Step::Output => "output" }
    }
}

/// Arguments for one invocation, `-chdir` first as the CLI requires.
pub fn step_args(step: Step, dir: &Path, vars: &BTreeMap<String, String>, no_color: bool) -> Vec<String> {
    let mut args = vec![format!("-chdir={}", dir.display()), step.as_str().to_string()];
    match step {
        Step::Init => args.push("-input=false".into()),
        Step::Apply | Step::Destroy => {
            args.push("-input=false".into());
            args.push("-auto-approve".into());
            for (k, v) in vars {
                args.push("-var".into());
                args.push(format!("{k}={v}"));
            }
        }
        Step::Output => args.push("-json".into()),
    }
    if no_color { args.push("-no-color".into()); }
    args
}

/// Runs `program`, forwarding each stdout line to the log as it arrives.
///
/// Stdout belongs to the report, so the child never inherits it.
pub fn run_program(program: &OsStr, args: &[String], step: &str) -> Result<Vec<String>> {
    let label = Path::new(program).file_name().unwrap_or(program).to_string_lossy().into_owned();
    let mut child = Command::new(program).args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawn {label} {step}"))?;
    let mut lines = Vec::new();
    if let Some(out) = child.stdout.take() {
        for line in BufReader::new(out).lines() {
            let line = line.with_context(|| format!("read {label} {step} output"))?;
            tracing::info!(runner=%label, step, "{line}");
            lines.push(line);
        }
    }
    let st = child.wait().with_context(|| format!("wait for {label} {step}"))?;
    if !st.success() { anyhow::bail!("{label} {step} failed ({st})") }
    Ok(lines)
}

fn run_step(r: Runner, step: Step, dir: &Path, vars: &BTreeMap<String, String>, no_color: bool) -> Result<()> {
    tracing::info!(runner=bin(r), step=step.as_str(), dir=%dir.display(), "running");
    run_program(OsStr::new(bin(r)), &step_args(step, dir, vars, no_color), step.as_str())?;
    Ok(())
}

pub fn run_init(r: Runner, dir: &Path, no_color: bool) -> Result<()> {
    run_step(r, Step::Init, dir, &BTreeMap::new(), no_color)
}
pub fn run_apply(r: Runner, dir: &Path, vars: &BTreeMap<String, String>, no_color: bool) -> Result<()> {
    run_step(r, Step::Apply, dir, vars, no_color)
}
pub fn run_destroy(r: Runner, dir: &Path, vars: &BTreeMap<String, String>, no_color: bool) -> Result<()> {
    run_step(r, Step::Destroy, dir, vars, no_color)
}

pub fn read_outputs(r: Runner, dir: &Path) -> Result<ModuleOutputs> {
    let out = Command::new(bin(r)).args(step_args(Step::Output, dir, &BTreeMap::new(), true))
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawn {} output", bin(r)))?;
    if !out.status.success() {
        anyhow::bail!("{} output failed: {}", bin(r), String::from_utf8_lossy(&out.stderr).trim())
    }
    parse_outputs(&out.stdout)
}

#[derive(Deserialize)]
struct OutputEntry { value: Json }

/// Parses `output -json`. Strings are taken verbatim, other values as compact JSON.
pub fn parse_outputs(raw: &[u8]) -> Result<ModuleOutputs> {
    let entries: BTreeMap<String, OutputEntry> = serde_json::from_slice(raw).context("parse output -json")?;
    Ok(ModuleOutputs(entries.into_iter().map(|(k, e)| {
        let v = match e.value { Json::String(s) => s, other => other.to_string() };
        (k, v)
    }).collect()))
}

/// A module directory driven through the terraform/tofu CLI.
#[derive(Debug, Clone, Copy)]
pub struct TerraformModule { pub runner: Runner, pub no_color: bool }

impl TerraformModule {
    pub fn new(runner: Runner) -> Self { Self { runner, no_color: true } }
}

impl Provisioner for TerraformModule {
    fn init_and_apply(&self, session: &ProvisioningSession) -> Result<ModuleOutputs> {
        let dir = session.module_dir.as_path();
        run_init(self.runner, dir, self.no_color)?;
        run_apply(self.runner, dir, &session.inputs.to_vars(), self.no_color)?;
        read_outputs(self.runner, dir)
    }

    fn destroy(&self, session: &ProvisioningSession) -> Result<()> {
        run_destroy(self.runner, &session.module_dir, &session.inputs.to_vars(), self.no_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("environment".to_string(), "development".to_string()),
            ("name".to_string(), "test".to_string()),
            ("region".to_string(), "us-west-2".to_string()),
        ])
    }

    #[test]
    fn apply_passes_vars_and_skips_prompts() {
        let args = step_args(Step::Apply, Path::new("mod"), &vars(), true);
        assert_eq!(args, vec![
            "-chdir=mod", "apply", "-input=false", "-auto-approve",
            "-var", "environment=development",
            "-var", "name=test",
            "-var", "region=us-west-2",
            "-no-color",
        ]);
    }

    #[test]
    fn destroy_uses_same_vars_as_apply() {
        let apply = step_args(Step::Apply, Path::new("mod"), &vars(), false);
        let destroy = step_args(Step::Destroy, Path::new("mod"), &vars(), false);
        assert_eq!(apply[2..], destroy[2..]);
        assert_eq!(destroy[1], "destroy");
    }

    #[test]
    fn init_takes_no_vars() {
        let args = step_args(Step::Init, Path::new("mod"), &vars(), false);
        assert_eq!(args, vec!["-chdir=mod", "init", "-input=false"]);
    }

    #[test]
    fn parses_string_and_structured_outputs() {
        let raw = br#"{
            "bucket_name": {"sensitive": false, "type": "string", "value": "wizardai-test-development"},
            "tags": {"sensitive": false, "type": ["map","string"], "value": {"env": "development"}}
        }"#;
        let outputs = parse_outputs(raw).unwrap();
        assert_eq!(outputs.get("bucket_name").unwrap(), "wizardai-test-development");
        assert_eq!(outputs.get("tags").unwrap(), r#"{"env":"development"}"#);
    }

    #[test]
    fn empty_output_object_has_no_bucket() {
        let outputs = parse_outputs(b"{}").unwrap();
        assert!(outputs.get("bucket_name").is_err());
    }

    #[test]
    fn rejects_non_json_output() {
        assert!(parse_outputs(b"No outputs found").is_err());
    }

    #[test]
    fn explicit_runner_wins() {
        assert_eq!(pick_runner(Some(Runner::Terraform)).unwrap(), Runner::Terraform);
    }

    #[cfg(unix)]
    fn fake_bin(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn auto_prefers_tofu_over_terraform() {
        let d = tempfile::tempdir().unwrap();
        fake_bin(d.path(), "terraform", "exit 0");
        fake_bin(d.path(), "tofu", "exit 0");
        assert_eq!(pick_runner_in(None, Some(d.path().as_os_str().to_owned())).unwrap(), Runner::Tofu);
    }

    #[cfg(unix)]
    #[test]
    fn auto_falls_back_to_terraform() {
        let d = tempfile::tempdir().unwrap();
        fake_bin(d.path(), "terraform", "exit 0");
        assert_eq!(pick_runner_in(None, Some(d.path().as_os_str().to_owned())).unwrap(), Runner::Terraform);
    }

    #[test]
    fn auto_without_any_runner_fails() {
        let d = tempfile::tempdir().unwrap();
        assert!(pick_runner_in(None, Some(d.path().as_os_str().to_owned())).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn child_stdout_is_captured_not_inherited() {
        let args = ["-c".to_string(), "echo 'Terraform has been successfully run: apply'".to_string()];
        let lines = run_program(OsStr::new("sh"), &args, "apply").unwrap();
        assert_eq!(lines, vec!["Terraform has been successfully run: apply"]);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_error() {
        let args = ["-c".to_string(), "echo partial; exit 1".to_string()];
        let err = run_program(OsStr::new("sh"), &args, "apply").unwrap_err();
        assert!(err.to_string().starts_with("sh apply failed"));
    }
}
