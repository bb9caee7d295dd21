//! Minimal CLI: config documents → (compile | validate)
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::Value;

use confcc::{Catalog, CompilationRun, CompileError, CompileOptions, Diagnostic};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// compile device configuration documents into an ordered setup sequence plus build metadata
#[derive(Parser, Debug)]
#[command(name = "confcc", version)]
pub struct CommandLineInterface {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// validate, resolve and generate; print emissions and build metadata
    Compile(CompileOut),
    /// validate only; print the normalized configuration
    Validate(ValidateOut),
}

#[derive(Args, Debug, Clone)]
struct InputSettings {
    /// JSON Pointer to select the config subnode in each document (e.g. /device)
    #[arg(long)]
    json_pointer: Option<String>,

    /// JQ pre-process filter for each document; every output is one document.
    #[arg(long)]
    jq_expr: Option<String>,

    /// One or more inputs. May be literal paths or quoted glob patterns.
    /// Documents are merged at the top level, in the given order.
    #[arg(long, short, num_args = 1.., required = true)]
    input: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct CompileSettings {
    /// pass unknown keys through instead of rejecting them
    #[arg(long, default_value_t = false)]
    allow_extra_keys: bool,

    /// how often one generation job may suspend before it counts as stuck
    #[arg(long, default_value_t = CompileOptions::default().resume_budget)]
    resume_budget: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

#[derive(clap::Parser, Debug)]
struct CompileOut {
    #[command(flatten)]
    input_settings: InputSettings,

    #[command(flatten)]
    settings: CompileSettings,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// output file (stdout if omitted)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(clap::Parser, Debug)]
struct ValidateOut {
    #[command(flatten)]
    input_settings: InputSettings,

    #[command(flatten)]
    settings: CompileSettings,

    /// output .json file (stdout if omitted)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

/// How a command ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Configuration problems were reported on stderr.
    Rejected,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl InputSettings {
    /// Every input document after pointer selection and jq, in order.
    fn load_documents(&self) -> Result<Vec<Value>> {
        let source_paths = resolve_file_path_patterns(&self.input)?;
        let mut docs = Vec::new();
        for source_path in source_paths {
            let source_path_str = source_path.to_string_lossy().to_string();
            let source = std::fs::read_to_string(&source_path)
                .with_context(|| format!("failed to read source file ({source_path_str})"))?;
            let mut json_value = serde_json::from_str::<Value>(&source)
                .with_context(|| format!("failed to parse JSON source file ({source_path_str})"))?;
            if let Some(pointer) = self.json_pointer.as_deref() {
                json_value = json_value
                    .pointer(pointer)
                    .cloned()
                    .ok_or_else(|| anyhow!("JSON pointer `{pointer}` selects nothing in {source_path_str}"))?;
            }
            match self.jq_expr.as_ref() {
                None => docs.push(json_value),
                Some(jq_expr) => {
                    let outputs = crate::jq_exec::run_jaq(jq_expr, &json_value).with_context(|| {
                        format!("failed to apply jq expression to source file ({source_path_str})")
                    })?;
                    docs.extend(outputs);
                }
            }
            tracing::debug!(path = %source_path_str, documents = docs.len(), "loaded input");
        }
        Ok(docs)
    }
}

impl CompileSettings {
    fn options(&self) -> CompileOptions {
        CompileOptions { allow_extra_keys: self.allow_extra_keys, resume_budget: self.resume_budget }
    }
}

impl CommandLineInterface {
    pub fn load() -> Self { Self::parse() }

    pub fn run(&self) -> Result<Outcome> {
        let catalog = Catalog::builtin();
        match &self.cmd {
            Command::Compile(target) => {
                let Some(raw) = merged(&target.input_settings)? else { return Ok(Outcome::Rejected) };
                let run = CompilationRun::with_options(&catalog, target.settings.options());
                let output = match run.compile(&raw) {
                    Ok(x) => x,
                    Err(error) => return Ok(reject(&error)),
                };
                let text = match target.format {
                    Format::Text => output.to_string(),
                    Format::Json => serde_json::to_string_pretty(&output)?,
                };
                write_out(target.out.as_deref(), &text)?;
            }
            Command::Validate(target) => {
                let Some(raw) = merged(&target.input_settings)? else { return Ok(Outcome::Rejected) };
                let run = CompilationRun::with_options(&catalog, target.settings.options());
                let validated = match run.validate(&raw) {
                    Ok(x) => x,
                    Err(error) => return Ok(reject(&error)),
                };
                write_out(target.out.as_deref(), &serde_json::to_string_pretty(validated.config())?)?;
            }
        }
        Ok(Outcome::Success)
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

/// Load and merge the inputs; merge conflicts are reported and yield `None`.
fn merged(input: &InputSettings) -> Result<Option<Value>> {
    let docs = input.load_documents()?;
    if docs.is_empty() {
        bail!("no input documents");
    }
    match confcc::config::merge_documents(docs) {
        Ok(raw) => Ok(Some(raw)),
        Err(diagnostics) => {
            report(&diagnostics);
            Ok(None)
        }
    }
}

fn reject(error: &CompileError) -> Outcome {
    report(&error.diagnostics());
    Outcome::Rejected
}

fn report(diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        let location = format!("{}{}", d.component, d.path);
        eprintln!("{} {}: {}", format!("{}:", d.kind).red().bold(), location.bold(), d.message);
        if let Some(id) = &d.identifier {
            eprintln!("  {} {id}", "identifier:".dimmed());
        }
    }
    let summary = format!("{} problem(s) found", diagnostics.len());
    eprintln!("{}", summary.red());
}

fn write_out(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(out) => {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(out, text).with_context(|| format!("failed to write {}", out.display()))?;
        }
        None => print!("{text}{}", if text.ends_with('\n') { "" } else { "\n" }),
    }
    Ok(())
}

fn resolve_file_path_patterns<I>(patterns: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    fn has_glob_chars(s: &str) -> bool {
        // Minimal glob detection for the `glob` crate syntax.
        s.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'{'))
    }

    let mut out = Vec::<PathBuf>::new();

    for raw in patterns {
        let pattern = raw.as_ref();

        if has_glob_chars(pattern) {
            let mut matched = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
            if matched.is_empty() {
                bail!("glob pattern matched no files: {pattern}");
            }
            matched.sort();
            out.append(&mut matched);
        } else {
            out.push(PathBuf::from(pattern));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn settings(input: Vec<String>) -> InputSettings {
        InputSettings { json_pointer: None, jq_expr: None, input }
    }

    #[test]
    fn globbed_documents_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), r#"{"uart": [{"tx_pin": 2, "baud_rate": 9600}]}"#).unwrap();
        fs::write(dir.path().join("a.json"), r#"{"device": {"uart": [{"tx_pin": 1, "baud_rate": 9600}]}}"#).unwrap();
        let pattern = dir.path().join("*.json").to_string_lossy().into_owned();

        let mut input = settings(vec![pattern]);
        input.jq_expr = Some(".device // .".into());
        let raw = merged(&input).unwrap().unwrap();
        assert_eq!(raw["uart"][0]["tx_pin"], 1);
        assert_eq!(raw["uart"][1]["tx_pin"], 2);
    }

    #[test]
    fn pointer_must_select_something() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, r#"{"device": {}}"#).unwrap();
        let mut input = settings(vec![path.to_string_lossy().into_owned()]);
        input.json_pointer = Some("/missing".into());
        assert!(input.load_documents().is_err());
        input.json_pointer = Some("/device".into());
        assert_eq!(input.load_documents().unwrap(), [serde_json::json!({})]);
    }

    #[test]
    fn empty_glob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.yaml").to_string_lossy().into_owned();
        assert!(resolve_file_path_patterns([pattern]).is_err());
    }
}
