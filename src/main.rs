use anyhow::{Context, Result};
use clap::Parser;
use patchsmith::agent::SelfCorrectingAgent;
use patchsmith::config::RunConfig;
use patchsmith::finding::Finding;
use patchsmith::llm::OpenRouterClient;
use patchsmith::prompt::PromptComposer;
use patchsmith::runner::{self, PursuitStatus, RunnerOptions};
use patchsmith::trace::TraceRecorder;
use patchsmith::validator::PatchValidator;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "patchsmith",
    about = "Generate applicable patches for static-analysis findings",
    version
)]
struct Args {
    /// JSON file with normalized findings (an array of finding objects)
    findings: PathBuf,

    /// Path to the repository (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Maximum attempts per finding group (overrides config)
    #[arg(short = 'n', long)]
    max_retries: Option<u32>,

    /// Apply validated patches to the working tree
    #[arg(long)]
    apply: bool,

    /// Skip writing attempt traces
    #[arg(long)]
    no_trace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RunConfig::load();

    let findings = load_findings(&args.findings)?;
    if findings.is_empty() {
        println!("No findings to process.");
        return Ok(());
    }

    let client = Arc::new(OpenRouterClient::new(&config)?);
    let validator = PatchValidator::open(&args.repo)?;
    let repo_root = validator.repo_root().to_path_buf();
    let tracer = if config.trace && !args.no_trace {
        Arc::new(TraceRecorder::open(&repo_root))
    } else {
        Arc::new(TraceRecorder::disabled())
    };
    let composer = PromptComposer::new(&repo_root, config.context_lines);
    let agent = SelfCorrectingAgent::new(client, validator, composer, tracer);

    let groups = runner::group_by_file(findings);
    let options = RunnerOptions {
        max_retries: args.max_retries.unwrap_or(config.max_retries),
        concurrency: config.concurrency,
        goal_timeout: config.goal_timeout(),
    };

    eprintln!(
        "Processing {} finding group(s) with up to {} attempt(s) each...",
        groups.len(),
        options.max_retries
    );

    let reports = runner::run_pursuits(&agent, groups, &options).await;

    let apply_validator = PatchValidator::open(&repo_root)?;
    let patches_dir = repo_root.join(".patchsmith").join("patches");
    let mut written = 0usize;
    let mut fixed = 0usize;
    let mut unresolved = 0usize;
    let mut total_cost = 0.0;

    for report in &reports {
        match &report.status {
            PursuitStatus::Completed(result) => {
                total_cost += result.total_cost_usd();
                if result.success {
                    fixed += 1;
                    println!(
                        "+ {} ({} finding(s), {} attempt(s))",
                        report.file.display(),
                        report.findings,
                        result.attempts.len()
                    );
                    for patch in &result.patches {
                        written += 1;
                        let name = format!(
                            "{:03}_{}.diff",
                            written,
                            patch
                                .file_path
                                .file_stem()
                                .map(|s| s.to_string_lossy().to_string())
                                .unwrap_or_else(|| "patch".to_string())
                        );
                        fs::create_dir_all(&patches_dir).ok();
                        if let Err(err) = fs::write(patches_dir.join(&name), &patch.diff) {
                            eprintln!("  Warning: could not write {}: {}", name, err);
                        }
                        if args.apply {
                            apply_validator.apply(patch)?;
                        }
                    }
                } else {
                    unresolved += 1;
                    let last_error = result
                        .attempts
                        .last()
                        .and_then(|r| r.error.clone())
                        .unwrap_or_else(|| "no attempts made".to_string());
                    println!(
                        "· {} — no patch generated ({})",
                        report.file.display(),
                        patchsmith::util::truncate(&last_error, 120)
                    );
                }
            }
            PursuitStatus::TimedOut => {
                unresolved += 1;
                println!("· {} — timed out", report.file.display());
            }
            PursuitStatus::Failed(err) => {
                unresolved += 1;
                println!("· {} — {}", report.file.display(), err);
            }
        }
    }

    println!();
    println!(
        "Fixed {}/{} group(s); {} unresolved; {} patch file(s) in {} (est. ${:.4})",
        fixed,
        reports.len(),
        unresolved,
        written,
        patches_dir.display(),
        total_cost
    );
    if args.apply && written > 0 {
        println!("Applied {} patch(es) to the working tree.", written);
    }

    Ok(())
}

fn load_findings(path: &PathBuf) -> Result<Vec<Finding>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read findings file {}", path.display()))?;
    let findings: Vec<Finding> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse findings from {}", path.display()))?;
    Ok(findings)
}
