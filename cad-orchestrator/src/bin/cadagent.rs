//! CadAgent CLI - generate a CAD model from a text description
//!
//! Usage:
//!   cadagent [--out <FILE>] [--config <FILE>] [--verbose] <DESCRIPTION...>
//!
//! Example:
//!   cadagent "Create a 50mm cube with a 10mm hole through the center"
//!   cadagent -o bracket.gltf "simple bracket with mounting holes" -v

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cadagent::pipeline::Source;
use cadagent::{CadAgentConfig, CadPipeline, PipelineResult};
use colored::Colorize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn print_usage() {
    eprintln!(
        r#"
{} - Generate CAD models from text descriptions

{}
    cadagent [OPTIONS] [DESCRIPTION...]

{}
    [DESCRIPTION...]    Part description; omit for interactive mode

{}
    -o, --out <FILE>        Output file (default: output.gltf, or output.glb for binary exports)
    -c, --config <FILE>     TOML config file (default: built-in defaults)
    -v, --verbose           Show the full script and debug logs
    -h, --help              Print this help message

{}
    cadagent "Create a 50mm cube with a 10mm hole through the center"
    cadagent -o pipe.gltf "cylindrical pipe 100mm long, 20mm outer diameter"

{}
    ANTHROPIC_API_KEY    Enables LLM generation (without it the fallback generator is used)
    OPENAI_API_KEY       Same, for provider_type = "openai"
"#,
        "CadAgent CLI".bold(),
        "USAGE:".bold(),
        "ARGS:".bold(),
        "OPTIONS:".bold(),
        "EXAMPLES:".bold(),
        "ENVIRONMENT:".bold(),
    );
}

struct CliArgs {
    prompt: String,
    out: Option<PathBuf>,
    config: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(0);
    }

    let mut words = Vec::new();
    let mut out = None;
    let mut config = None;
    let mut verbose = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" | "-o" => {
                out = Some(PathBuf::from(
                    iter.next().context("--out requires a file name")?,
                ));
            }
            "--config" | "-c" => {
                config = Some(PathBuf::from(
                    iter.next().context("--config requires a file name")?,
                ));
            }
            "--verbose" | "-v" => verbose = true,
            _ => words.push(arg),
        }
    }

    Ok(CliArgs {
        prompt: words.join(" "),
        out,
        config,
        verbose,
    })
}

fn print_header(pipeline: &CadPipeline) {
    eprintln!();
    eprintln!("{}", "AI-Driven CAD Generator".bold());
    eprintln!("{}", "=".repeat(50).blue());
    if pipeline.llm_configured() {
        eprintln!(
            "{} LLM generation, up to {} attempts",
            "Mode:".dimmed(),
            pipeline.max_attempts()
        );
    } else {
        eprintln!(
            "{} {}",
            "Mode:".dimmed(),
            "fallback only (no API key configured)".yellow()
        );
    }
    eprintln!();
}

fn print_result(result: &PipelineResult, verbose: bool) {
    let source = match result.source {
        Source::Llm => "LLM".green(),
        Source::Fallback => "fallback".yellow(),
        Source::Synthetic => "synthetic preview".yellow(),
        Source::Direct => "script".normal(),
    };
    eprintln!("{} {}", "Source:".dimmed(), source);

    if let Some(plan) = &result.json_plan {
        eprintln!("{}", "▶ Plan:".yellow());
        if let Ok(pretty) = serde_json::to_string_pretty(plan) {
            for line in pretty.lines() {
                eprintln!("    {}", line.yellow());
            }
        }
    }
    if let Some(code) = &result.python_code {
        eprintln!("{}", "▶ Script:".cyan());
        let lines: Vec<&str> = code.lines().collect();
        let shown = if verbose { lines.len() } else { lines.len().min(25) };
        for line in &lines[..shown] {
            eprintln!("    {}", line.cyan());
        }
        if shown < lines.len() {
            eprintln!("    {}", format!("... ({} more lines, -v to show)", lines.len() - shown).dimmed());
        }
    }

    if let Some(message) = &result.message {
        eprintln!("{} {}", "Message:".dimmed(), message);
    }
    if let Some(error) = &result.error {
        eprintln!("{} {}", "Error:".red().bold(), error.red());
    }
}

/// Decode a base64 data URI export, or pass text through
fn export_bytes(export: &str) -> Result<(Vec<u8>, bool)> {
    match export.split_once(";base64,") {
        Some((header, payload)) if header.starts_with("data:") => {
            let bytes = STANDARD
                .decode(payload)
                .context("Export is not valid base64")?;
            Ok((bytes, true))
        }
        _ => Ok((export.as_bytes().to_vec(), false)),
    }
}

/// File name derived from the description, for interactive mode
fn slug(prompt: &str) -> String {
    let slug: String = prompt
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(30)
        .collect();
    if slug.trim_matches('_').is_empty() {
        "output".to_string()
    } else {
        slug
    }
}

fn write_outputs(result: &PipelineResult, out: Option<&Path>, stem: &str) -> Result<()> {
    let Some(export) = &result.export else {
        return Ok(());
    };

    let (bytes, binary) = export_bytes(export)?;
    let path = match out {
        Some(path) => path.to_path_buf(),
        None if binary => PathBuf::from(format!("{stem}.glb")),
        None => PathBuf::from(format!("{stem}.gltf")),
    };
    std::fs::write(&path, bytes)
        .with_context(|| format!("Failed to write export: {}", path.display()))?;
    eprintln!("{} {}", "Saved:".green().bold(), path.display());

    if let Some(step) = &result.step {
        let step_path = path.with_extension("step");
        std::fs::write(&step_path, step)
            .with_context(|| format!("Failed to write STEP file: {}", step_path.display()))?;
        eprintln!("{} {}", "Saved:".green().bold(), step_path.display());
    }

    Ok(())
}

async fn run_once(
    pipeline: &CadPipeline,
    prompt: &str,
    out: Option<&Path>,
    stem: &str,
    verbose: bool,
) -> Result<bool> {
    eprintln!("{} {}", "Description:".dimmed(), prompt);
    let result = pipeline.generate(prompt).await;
    print_result(&result, verbose);
    write_outputs(&result, out, stem)?;
    Ok(result.success)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = CadAgentConfig::load(args.config.as_deref()).with_context(|| {
        format!(
            "Failed to load config: {}",
            args.config
                .as_deref()
                .map_or_else(|| "<defaults>".into(), |p| p.display().to_string())
        )
    })?;
    config.apply_env()?;

    let pipeline =
        CadPipeline::from_config(&config).context("Failed to configure the LLM provider")?;
    print_header(&pipeline);

    if !args.prompt.trim().is_empty() {
        let ok = run_once(&pipeline, &args.prompt, args.out.as_deref(), "output", args.verbose)
            .await?;
        std::process::exit(if ok { 0 } else { 1 });
    }

    eprintln!("Enter your 3D model description (or 'quit' to exit):");
    eprintln!("{}", "Examples:".dimmed());
    eprintln!("  - Create a 50mm cube with a 10mm hole through the center");
    eprintln!("  - Make a cylindrical pipe 100mm long, 20mm outer diameter, 5mm thick");
    eprintln!("  - Design a simple bracket with mounting holes");
    eprintln!();

    let stdin = std::io::stdin();
    loop {
        eprint!("{} ", "Description:".bold());
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if matches!(prompt.to_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }
        if prompt.is_empty() {
            continue;
        }

        eprintln!();
        match run_once(&pipeline, prompt, None, &slug(prompt), args.verbose).await {
            Ok(true) => eprintln!("{}", "Model generated successfully!".green()),
            Ok(false) => eprintln!("{}", "Try rephrasing your description or being more specific.".yellow()),
            Err(e) => eprintln!("{} {:#}", "Unexpected error:".red(), e),
        }
        eprintln!("{}", "-".repeat(50).dimmed());
    }

    Ok(())
}
