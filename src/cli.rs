//! Command-line surface for validating a change set without the rest of the
//! pipeline. Commands return their output as a string; the binary prints it.

use crate::changeset::ChangeSet;
use crate::config::{apply_env_overrides, load_settings, Settings};
use crate::runtime::{bootstrap_state_root, StatePaths};
use crate::sandbox::{Ecosystem, SandboxEngine, ValidationRequest};
use crate::shared::{generate_run_id, now_secs, RuntimeLog};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliVerb {
    Validate,
    Config,
    Help,
    Unknown,
}

fn parse_cli_verb(raw: &str) -> CliVerb {
    match raw {
        "validate" => CliVerb::Validate,
        "config" => CliVerb::Config,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn help_text() -> String {
    [
        "Usage:",
        "  depshift validate <project> --ecosystem <node|python> [--change-set <file.json>] [--config <file.yaml>] [--retain]",
        "  depshift config [--config <file.yaml>]",
        "  depshift help",
    ]
    .join("\n")
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }
    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Validate => cmd_validate(&args[1..]),
        CliVerb::Config => cmd_config(&args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`\n\n{}", args[0], help_text())),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ValidateArgs {
    project: Option<PathBuf>,
    ecosystem: Option<String>,
    change_set: Option<PathBuf>,
    config: Option<PathBuf>,
    retain: bool,
}

fn flag_value<'a>(
    flag: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<&'a String, String> {
    iter.next()
        .ok_or_else(|| format!("`{flag}` requires a value"))
}

fn parse_validate_args(args: &[String]) -> Result<ValidateArgs, String> {
    let mut parsed = ValidateArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--ecosystem" => parsed.ecosystem = Some(flag_value(arg, &mut iter)?.clone()),
            "--change-set" => {
                parsed.change_set = Some(PathBuf::from(flag_value(arg, &mut iter)?))
            }
            "--config" => parsed.config = Some(PathBuf::from(flag_value(arg, &mut iter)?)),
            "--retain" => parsed.retain = true,
            other if other.starts_with("--") => return Err(format!("unknown flag `{other}`")),
            other => {
                if parsed.project.is_some() {
                    return Err(format!("unexpected argument `{other}`"));
                }
                parsed.project = Some(PathBuf::from(other));
            }
        }
    }
    Ok(parsed)
}

fn parse_config_flag(args: &[String]) -> Result<Option<PathBuf>, String> {
    match args {
        [] => Ok(None),
        [flag, path] if flag == "--config" => Ok(Some(PathBuf::from(path))),
        _ => Err("usage: depshift config [--config <file.yaml>]".to_string()),
    }
}

fn resolve_settings(config: Option<&PathBuf>) -> Result<Settings, String> {
    match config {
        Some(path) => load_settings(path).map_err(|e| e.to_string()),
        None => {
            let mut settings = Settings::default();
            apply_env_overrides(&mut settings, |name| std::env::var(name).ok())
                .map_err(|e| e.to_string())?;
            settings.validate().map_err(|e| e.to_string())?;
            Ok(settings)
        }
    }
}

fn read_change_set(path: &PathBuf) -> Result<ChangeSet, String> {
    let raw =
        fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let change_set: ChangeSet = serde_json::from_str(&raw)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    change_set
        .validate()
        .map_err(|e| format!("invalid change set {}: {e}", path.display()))?;
    Ok(change_set)
}

fn cmd_validate(args: &[String]) -> Result<String, String> {
    let parsed = parse_validate_args(args)?;
    let project = parsed
        .project
        .ok_or_else(|| "`validate` requires a project path".to_string())?;
    let ecosystem = parsed
        .ecosystem
        .as_deref()
        .ok_or_else(|| "`validate` requires --ecosystem".to_string())
        .and_then(|raw| Ecosystem::parse(raw).map_err(|e| e.to_string()))?;
    let change_set = parsed.change_set.as_ref().map(read_change_set).transpose()?;

    let mut settings = resolve_settings(parsed.config.as_ref())?;
    if parsed.retain {
        settings.sandbox.retain_environments = true;
    }
    let paths = StatePaths::new(&settings.state_root);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    let log = RuntimeLog::at(paths.runtime_log_path());

    let engine = SandboxEngine::with_docker(settings.sandbox.clone(), paths.staging_dir(), log);
    let request = ValidationRequest {
        run_id: generate_run_id(now_secs())?,
        attempt: 0,
        project_path: project,
        ecosystem,
        change_set,
    };
    let verdict = engine.validate(&request).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&verdict).map_err(|e| format!("failed to encode verdict: {e}"))
}

fn cmd_config(args: &[String]) -> Result<String, String> {
    let config = parse_config_flag(args)?;
    let settings = resolve_settings(config.as_ref())?;
    serde_yaml::to_string(&settings).map_err(|e| format!("failed to encode settings: {e}"))
}
