//! LSPatch command-line front end

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lspatch::apk::patcher::CancellationToken;
use lspatch::apk::signing::{IdentitySource, reset_default_identity};
use lspatch::exit_codes::*;
use lspatch::logger::is_json_logging;
use lspatch::{
    ErrorKind, PatchError, PatchOptions, PatchRequest, PatchResult, RunControl, patch_apk,
    update_loader, verify_apk,
};
use serde_json::json;
use std::{env, panic, path::PathBuf, process};

const VERSION: &str = lspatch::version::VERSION;

#[derive(Parser, Debug)]
#[command(version = VERSION, about = "Patch Android apps to load Xposed modules without root")]
struct Cli {
    /// Log level (trace, debug, info, warn, error, off), prefix with "json:" for JSON output
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Patch a base archive and its splits
    Patch(PatchArgs),
    /// Replace the loader of already patched archives
    UpdateLoader(CommonArgs),
    /// Report per-scheme signature validity
    Verify {
        apk: PathBuf,
    },
    /// Regenerate the managed signing identity
    ResetIdentity,
}

/// Options shared by `patch` and `update-loader`
#[derive(Args, Debug)]
struct CommonArgs {
    /// Base archive followed by its splits
    #[arg(required = true)]
    apks: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Overwrite existing outputs
    #[arg(short, long)]
    force: bool,

    /// Directory holding loader.dex, the bootstrap dex and native libraries
    #[arg(long)]
    loader_dir: Option<PathBuf>,

    /// PEM bundle (private key + certificate) to sign with
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Keep debug records in the patch log
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct PatchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Set android:debuggable
    #[arg(short, long)]
    debuggable: bool,

    /// Signature bypass level
    #[arg(short = 'l', long = "sigbypasslv", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    sig_bypass_level: u8,

    /// Produce a v1 (JAR) signature
    #[arg(long)]
    v1: Option<bool>,

    /// Produce a v2 signature
    #[arg(long)]
    v2: Option<bool>,

    /// Produce a v3 signature
    #[arg(long)]
    v3: Option<bool>,

    /// Local mode: modules are loaded from the manager instead of embedded
    #[arg(long)]
    manager: bool,

    /// Module archive or glob pattern to embed
    #[arg(short = 'm', long = "embed")]
    embed: Vec<String>,

    /// Override the version code to 1 so downgrades install
    #[arg(short = 'r', long = "allowdown")]
    allow_downgrade: bool,

    /// Add this to the version code
    #[arg(long)]
    bump_version_code: Option<u32>,
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Patch(args) => args.common.verbose,
            Command::UpdateLoader(args) => args.verbose,
            Command::Verify { .. } | Command::ResetIdentity => false,
        }
    }
}

fn main() {
    // Set up panic handler to return specific exit code
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        process::exit(EXIT_PANIC);
    }));

    let result = panic::catch_unwind(run);

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(_) => {
            eprintln!("Fatal: Unhandled panic in lspatch");
            process::exit(EXIT_PANIC);
        }
    }
}

fn run() -> i32 {
    // Handle --version before clap
    if env::args().nth(1).as_deref() == Some("--version") {
        println!("lspatch {}", lspatch::version::full_version());
        return EXIT_SUCCESS;
    }

    let cli = Cli::parse();

    if let Some(ref level) = cli.log_level {
        lspatch::logger::JsonLogger::init_with_level(level, "CLI --log-level");
    } else if cli.command.verbose() {
        lspatch::logger::JsonLogger::init_with_level("debug", "CLI --verbose");
    } else {
        lspatch::logger::JsonLogger::init();
    }

    match cli.command {
        Command::Patch(args) => patch(args),
        Command::UpdateLoader(args) => update(args),
        Command::Verify { apk } => verify(&apk),
        Command::ResetIdentity => reset_identity(),
    }
}

/// Expand module globs; a pattern matching nothing is passed through so the
/// pipeline reports the missing file
fn expand_modules(patterns: &[String]) -> Result<Vec<PathBuf>, glob::PatternError> {
    let mut modules = Vec::new();
    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)?.filter_map(Result::ok).collect();
        if matches.is_empty() {
            modules.push(PathBuf::from(pattern));
        } else {
            modules.extend(matches);
        }
    }
    Ok(modules)
}

/// Cancel the run on Ctrl-C
fn control() -> RunControl {
    let token = CancellationToken::new();
    if let Err(e) = token.cancel_on_sigint() {
        log::warn!("⚠️ Ctrl-C will not cancel cleanly: {e}");
    }
    RunControl {
        cancellation: Some(token),
        listener: None,
    }
}

fn build_request(args: &PatchArgs) -> anyhow::Result<PatchRequest> {
    let modules = expand_modules(&args.embed).context("invalid --embed pattern")?;

    let common = &args.common;
    let mut builder = PatchRequest::builder(common.apks.clone(), &common.output)
        .debuggable(args.debuggable)
        .bypass_level(args.sig_bypass_level)
        .use_manager(args.manager)
        .override_version_code(args.allow_downgrade)
        .modules(modules)
        .force(common.force)
        .verbose(common.verbose);
    if let Some(v1) = args.v1 {
        builder = builder.v1(v1);
    }
    if let Some(v2) = args.v2 {
        builder = builder.v2(v2);
    }
    if let Some(v3) = args.v3 {
        builder = builder.v3(v3);
    }
    if let Some(delta) = args.bump_version_code {
        builder = builder.bump_version_code(delta);
    }
    if let Some(dir) = &common.loader_dir {
        builder = builder.loader_dir(dir);
    }
    if let Some(pem) = &common.identity {
        builder = builder.identity(IdentitySource::Pem(pem.clone()));
    }
    let request = builder
        .build()
        .with_context(|| format!("cannot patch into {}", common.output.display()))?;
    Ok(request)
}

fn patch(args: PatchArgs) -> i32 {
    match build_request(&args) {
        Ok(request) => report(patch_apk(request, control())),
        Err(e) => {
            eprintln!("Invalid arguments: {e:#}");
            match PatchError::from(e).kind() {
                ErrorKind::Other => EXIT_INVALID_ARGS,
                kind => for_kind(kind),
            }
        }
    }
}

fn update(args: CommonArgs) -> i32 {
    let options = PatchOptions {
        output_dir: Some(args.output.clone()),
        force: args.force,
        verbose: args.verbose,
        loader_dir: args.loader_dir.clone(),
        identity: args.identity.clone().map(IdentitySource::Pem),
        control: control(),
    };
    let result = update_loader(&args.apks, options)
        .with_context(|| format!("cannot update loader of {} archive(s)", args.apks.len()));
    match result {
        Ok(result) => report(result),
        Err(e) => {
            eprintln!("Update error: {e:#}");
            for_kind(PatchError::from(e).kind())
        }
    }
}

fn report(result: PatchResult) -> i32 {
    match result {
        Ok(report) => {
            if is_json_logging() {
                let summary = json!({
                    "output": report.output,
                    "splits": report.split_outputs,
                    "mutations": report.mutations,
                    "config": report.config,
                });
                println!("{summary}");
            } else {
                println!("{}", report.output.display());
                for split in &report.split_outputs {
                    println!("{}", split.display());
                }
            }
            EXIT_SUCCESS
        }
        Err(failure) => {
            if is_json_logging() {
                let summary = json!({
                    "error": failure.error.to_string(),
                    "kind": failure.kind().to_string(),
                    "stage": failure.stage.to_string(),
                });
                eprintln!("{summary}");
            } else {
                eprintln!("Patch error: {}", failure);
            }
            for_kind(failure.kind())
        }
    }
}

fn verify(apk: &std::path::Path) -> i32 {
    match verify_apk(apk) {
        Ok(result) => {
            if is_json_logging() {
                println!("{}", json!(result));
            } else {
                println!("v1: {}", result.v1);
                println!("v2: {}", result.v2);
                println!("v3: {}", result.v3);
                if let Some(signer) = &result.signer_sha256 {
                    println!("signer: {}", signer);
                }
            }
            if result.is_verified() {
                EXIT_SUCCESS
            } else {
                EXIT_SIGNATURE_ERROR
            }
        }
        Err(e) => {
            eprintln!("Verify error: {}", e);
            for_kind(e.kind())
        }
    }
}

fn reset_identity() -> i32 {
    let result = IdentitySource::default_home().and_then(|home| reset_default_identity(&home));
    match result {
        Ok(identity) => {
            println!("{}", identity.fingerprint());
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Identity error: {}", e);
            for_kind(e.kind())
        }
    }
}
