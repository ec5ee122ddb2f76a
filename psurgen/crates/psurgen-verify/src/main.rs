use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::*;
use sha2::{Digest, Sha256};

use psurgen::ledger::{validate_records, DecisionTraceRecord};
use psurgen::provenance;

/// Standalone verification utility for PSUR audit bundles.
///
/// Recomputes every decision trace record's content hash, checks the
/// previous-pointer chain and the Merkle root, and verifies the bundle
/// manifest, without requiring the generating pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the bundle (.zip) or a bare audit.jsonl file
    bundle: PathBuf,

    /// Output format (human or json)
    #[arg(long, default_value = "human")]
    format: OutputFormat,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationReport {
    bundle: String,
    records_total: usize,
    records_verified: usize,
    chain_valid: bool,
    merkle_valid: bool,
    manifest_entries_total: usize,
    manifest_entries_verified: usize,
    overall_result: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let report = verify_bundle(&cli.bundle)?;

    match cli.format {
        OutputFormat::Human => print_human_report(&report),
        OutputFormat::Json => print_json_report(&report)?,
    }

    if report.overall_result {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

/// Load the audit trail from either a bundle zip or a bare jsonl file.
fn load_audit_trail(path: &PathBuf) -> Result<String> {
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    match extension {
        "zip" => {
            let file = fs::File::open(path)
                .with_context(|| format!("failed to open bundle: {}", path.display()))?;
            let mut archive = zip::ZipArchive::new(file)
                .with_context(|| format!("failed to read zip archive: {}", path.display()))?;
            let mut entry = archive
                .by_name("audit/audit.jsonl")
                .context("bundle must contain audit/audit.jsonl")?;
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .context("failed to read audit/audit.jsonl from bundle")?;
            Ok(contents)
        }
        _ => fs::read_to_string(path)
            .with_context(|| format!("failed to read audit trail: {}", path.display())),
    }
}

fn parse_records(jsonl: &str) -> Result<Vec<DecisionTraceRecord>> {
    jsonl
        .lines()
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line)
                .map_err(|err| anyhow!("line {}: failed to parse trace record: {err}", index + 1))
        })
        .collect()
}

/// Check that every record's stored Merkle root matches the root folded over
/// the content hashes up to and including that record.
fn verify_merkle_roots(records: &[DecisionTraceRecord]) -> Result<()> {
    let mut prefix: Vec<String> = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        prefix.push(record.hash_chain.content_hash.clone());
        let expected = provenance::merkle_root(&prefix);
        if record.hash_chain.merkle_root != expected {
            return Err(anyhow!(
                "Merkle root mismatch at record #{index}\nExpected: {expected}\nFound: {}",
                record.hash_chain.merkle_root
            ));
        }
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    path: String,
    sha256: String,
}

/// Verify every manifest entry's byte hash against the zip contents. Bare
/// jsonl inputs have no manifest and skip this step.
fn verify_manifest(path: &PathBuf) -> Result<(usize, usize)> {
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    if extension != "zip" {
        return Ok((0, 0));
    }

    let file = fs::File::open(path)
        .with_context(|| format!("failed to open bundle: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive: {}", path.display()))?;

    let entries: Vec<ManifestEntry> = {
        let mut manifest_file = archive
            .by_name("manifest.json")
            .context("bundle must contain manifest.json")?;
        let mut contents = String::new();
        manifest_file
            .read_to_string(&mut contents)
            .context("failed to read manifest.json")?;
        serde_json::from_str(&contents).context("failed to parse manifest.json")?
    };

    let mut verified = 0;
    for entry in &entries {
        let mut bytes = Vec::new();
        archive
            .by_name(&entry.path)
            .with_context(|| format!("manifest entry missing from bundle: {}", entry.path))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read bundle entry: {}", entry.path))?;
        let computed = hex::encode(Sha256::digest(&bytes));
        if computed != entry.sha256 {
            return Err(anyhow!(
                "content mismatch for {}\nExpected (manifest): {}\nComputed: {computed}",
                entry.path,
                entry.sha256,
            ));
        }
        verified += 1;
    }
    Ok((entries.len(), verified))
}

fn verify_bundle(path: &PathBuf) -> Result<VerificationReport> {
    let mut report = VerificationReport {
        bundle: path.display().to_string(),
        records_total: 0,
        records_verified: 0,
        chain_valid: false,
        merkle_valid: false,
        manifest_entries_total: 0,
        manifest_entries_verified: 0,
        overall_result: false,
        errors: Vec::new(),
    };

    let jsonl = load_audit_trail(path)?;
    let records = match parse_records(&jsonl) {
        Ok(records) => records,
        Err(err) => {
            report.errors.push(err.to_string());
            return Ok(report);
        }
    };
    report.records_total = records.len();

    if records.is_empty() {
        report.errors.push("audit trail contains no records".to_string());
        return Ok(report);
    }

    let verification = validate_records(&records);
    report.chain_valid = verification.valid;
    report.errors.extend(verification.errors);
    if report.chain_valid {
        report.records_verified = records.len();
    }

    match verify_merkle_roots(&records) {
        Ok(()) => report.merkle_valid = true,
        Err(err) => report.errors.push(err.to_string()),
    }

    match verify_manifest(path) {
        Ok((total, verified)) => {
            report.manifest_entries_total = total;
            report.manifest_entries_verified = verified;
        }
        Err(err) => {
            report.errors.push(err.to_string());
            return Ok(report);
        }
    }

    report.overall_result = report.chain_valid
        && report.merkle_valid
        && report.manifest_entries_verified == report.manifest_entries_total;
    Ok(report)
}

fn print_human_report(report: &VerificationReport) {
    println!("\n{}", "PSUR Audit Bundle Verification".bold().cyan());
    println!("{}", "=".repeat(50));
    println!();

    println!("Bundle: {}", report.bundle.bright_black());
    println!();

    print_check(
        &format!(
            "Hash Chain ({}/{} records)",
            report.records_verified, report.records_total
        ),
        report.chain_valid,
    );
    print_check("Merkle Roots", report.merkle_valid);
    print_check(
        &format!(
            "Bundle Manifest ({}/{} entries)",
            report.manifest_entries_verified, report.manifest_entries_total
        ),
        report.manifest_entries_verified == report.manifest_entries_total,
    );

    println!();
    println!("{}", "-".repeat(50));

    if report.overall_result {
        println!(
            "{} {}",
            "✓ VERIFIED:".green().bold(),
            "This audit bundle is internally consistent and has not been tampered with.".green()
        );
    } else {
        println!("{} {}", "✗ FAILED:".red().bold(), "Verification failed.".red());
        for error in &report.errors {
            println!("{} {}", "Error:".red(), error);
        }
    }

    println!();
}

fn print_json_report(report: &VerificationReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{}", json);
    Ok(())
}

fn print_check(label: &str, passed: bool) {
    if passed {
        println!("  {} {}", "✓".green(), label);
    } else {
        println!("  {} {}", "✗".red(), label);
    }
}
