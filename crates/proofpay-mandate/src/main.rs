//! ProofPay mandate verifier CLI
//!
//! Reads one envelope from `--file`, `--json` or stdin and prints a single
//! JSON line `{ok, violations, kid, payloadHash}`.
//!
//! Exit codes:
//! - 0: verification ran (the result is in the output)
//! - 1: the envelope could not be read or parsed, or no key matched its kid
//! - 2: `--strict` was given and the envelope did not verify

use std::io::Read;
use std::process::ExitCode;

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use proofpay_mandate::{
    EnvKeyResolver, MandateVerifier, VerifyOptions, DEFAULT_CLOCK_SKEW_MS, PUBLIC_KEYS_JSON_VAR,
    PUBLIC_KEY_VAR_PREFIX,
};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "proofpay-verify")]
#[command(about = "Verify an AP2 mandate envelope")]
#[command(version)]
struct Cli {
    /// Path to the envelope JSON file
    #[arg(long, conflicts_with = "json")]
    file: Option<String>,

    /// Envelope JSON given inline
    #[arg(long)]
    json: Option<String>,

    /// Exit with code 2 when the envelope does not verify
    #[arg(long)]
    strict: bool,

    /// Verification time (RFC 3339), defaults to now
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// Tolerated clock skew in milliseconds
    #[arg(long, default_value_t = DEFAULT_CLOCK_SKEW_MS)]
    clock_skew_ms: i64,

    /// Environment variable holding a JSON map of kid to public key PEM
    #[arg(long, env = "PROOFPAY_PUBLIC_KEYS_VAR", default_value = PUBLIC_KEYS_JSON_VAR)]
    keys_var: String,
}

fn read_input(cli: &Cli) -> Result<String, String> {
    if let Some(json) = &cli.json {
        return Ok(json.clone());
    }
    if let Some(path) = &cli.file {
        return std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("cannot read stdin: {e}"))?;
    Ok(buf)
}

fn fail(error: impl std::fmt::Display) -> ExitCode {
    println!("{}", json!({ "ok": false, "error": error.to_string() }));
    ExitCode::from(1)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let raw = match read_input(&cli) {
        Ok(raw) => raw,
        Err(e) => return fail(e),
    };
    let envelope: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => return fail(format!("invalid JSON: {e}")),
    };

    let verifier = MandateVerifier::new(EnvKeyResolver::new(
        cli.keys_var.clone(),
        PUBLIC_KEY_VAR_PREFIX,
    ));
    let options = VerifyOptions {
        now: cli.now.unwrap_or_else(Utc::now),
        clock_skew: Duration::milliseconds(cli.clock_skew_ms),
    };

    match verifier.verify(&envelope, options) {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{line}"),
                Err(e) => return fail(e),
            }
            if cli.strict && !report.ok {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => fail(e),
    }
}
