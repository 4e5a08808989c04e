mod package;
mod releases;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wicid_core::identity::{DeviceIdentity, OsIdentity};
use wicid_core::layout::BUNDLE_MANIFEST;
use wicid_core::ledger::CompatibilityLedger;
use wicid_core::manifest::{BundleManifest, Channel, ReleaseManifest};
use wicid_core::update::{Bundle, Resolver};

const DEFAULT_BASE_URL: &str = "https://www.wicid.ai/releases";

#[derive(Parser)]
#[command(name = "wicid-tool")]
#[command(about = "WICID firmware release tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an update bundle and publish it in releases.json
    Package {
        /// Firmware source directory
        #[arg(short, long, default_value = "src")]
        source: PathBuf,
        #[arg(short, long)]
        version: String,
        /// Target machine type (repeatable)
        #[arg(short, long = "machine", required = true)]
        machines: Vec<String>,
        /// Target operating system, e.g. circuitpython_10_0 (repeatable)
        #[arg(long = "os", required = true)]
        oses: Vec<String>,
        #[arg(long, default_value = "production")]
        release_type: Channel,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        pre_install: bool,
        #[arg(long)]
        post_install: bool,
        #[arg(long)]
        script_only: bool,
        #[arg(short, long, default_value = "releases/wicid_install.zip")]
        output: PathBuf,
        #[arg(long, default_value = "releases.json")]
        releases: PathBuf,
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,
    },
    /// Show which release a device would pick from a releases.json
    Check {
        /// Local path or http(s) URL
        manifest: String,
        #[arg(short, long)]
        machine: String,
        #[arg(long)]
        os: String,
        /// Installed version on the device
        #[arg(short, long)]
        installed: String,
        #[arg(long, default_value = "production")]
        channel: Channel,
    },
    /// List the contents of an update bundle
    Inspect { bundle: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Package {
            source,
            version,
            machines,
            oses,
            release_type,
            notes,
            pre_install,
            post_install,
            script_only,
            output,
            releases,
            base_url,
        }) => {
            let opts = package::PackageOptions {
                source,
                version,
                machines,
                oses,
                release_type,
                notes,
                release_date: chrono::Utc::now().to_rfc3339(),
                pre_install,
                post_install,
                script_only,
            };
            run_package(&opts, &output, &releases, &base_url)
        }
        Some(Commands::Check {
            manifest,
            machine,
            os,
            installed,
            channel,
        }) => run_check(&manifest, &machine, &os, &installed, channel),
        Some(Commands::Inspect { bundle }) => run_inspect(&bundle),
        None => {
            println!("{}", "WICID Release Tool".bold().blue());
            println!("\nUsage:");
            println!("  {} package -v <VERSION> -m <MACHINE> --os <OS>   Build and publish a bundle", "wicid-tool".green());
            println!("  {} check <MANIFEST> -m <MACHINE> --os <OS> -i <V>   Preview release selection", "wicid-tool".green());
            println!("  {} inspect <BUNDLE>                                 List bundle contents", "wicid-tool".green());
            println!("\nExamples:");
            println!("  wicid-tool package -v 1.2.0 -m \"Adafruit QT Py ESP32S3 4MB 2MB PSRAM\" --os circuitpython_10_0");
            println!("  wicid-tool check https://www.wicid.ai/releases.json -m \"Adafruit QT Py ESP32S3 4MB 2MB PSRAM\" --os circuitpython_10_1 -i 1.1.0");
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn run_package(opts: &package::PackageOptions, output: &Path, releases_path: &Path, base_url: &str) -> Result<()> {
    println!("📦 {} {} from {}", "Packaging".cyan(), opts.version, opts.source.display());

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let built = package::build_package(opts, &pb);
    pb.finish_and_clear();
    let built = built?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, &built.data).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "   {} {} files, {} bytes ({:.2} MB)",
        "✓".green(),
        built.files,
        built.data.len(),
        built.data.len() as f64 / 1024.0 / 1024.0
    );
    println!("   sha256: {}", built.sha256);

    let mut manifest = releases::load(releases_path)?;
    releases::publish(
        &mut manifest,
        &built.manifest,
        base_url,
        &built.sha256,
        &chrono::Utc::now().to_rfc3339(),
    );
    releases::save(releases_path, &manifest)?;

    println!(
        "\n✨ {} {} {} release written to {}",
        "Published".green(),
        built.manifest.version,
        opts.release_type,
        releases_path.display()
    );
    Ok(())
}

fn fetch_manifest(location: &str) -> Result<Vec<u8>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let response = client.get(location).send()?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} fetching {}", response.status(), location);
        }
        Ok(response.bytes()?.to_vec())
    } else {
        fs::read(location).with_context(|| format!("reading {}", location))
    }
}

fn run_check(location: &str, machine: &str, os: &str, installed: &str, channel: Channel) -> Result<()> {
    let os: OsIdentity = os.parse().map_err(anyhow::Error::msg)?;
    let device = DeviceIdentity::new(machine, os);
    let manifest = ReleaseManifest::from_json(&fetch_manifest(location)?).context("parsing release manifest")?;

    println!("🔍 {} {}", "Checking releases for".cyan(), device.user_agent(installed));

    // The tool has no device history, so nothing is ever blocked
    let ledger = CompatibilityLedger::new(std::env::temp_dir().join("wicid-tool-empty-ledger.json"));
    let resolver = Resolver {
        device: &device,
        installed_version: installed,
        channel,
        max_attempts: u32::MAX,
        require_checksum: true,
        ledger: &ledger,
    };

    for group in manifest.releases.iter().filter(|g| {
        device.matches_machine(&g.target_machine_types) && device.os.matches_any(&g.target_operating_systems)
    }) {
        let current = [
            (Channel::Production, group.production.as_ref()),
            (Channel::Development, group.development.as_ref()),
        ];
        let archived = group.archive.iter().map(|a| (a.release_type, Some(&a.release)));
        for (release_type, entry) in current.into_iter().chain(archived) {
            let Some(entry) = entry else { continue };
            let verdict = match resolver.eligibility(entry) {
                Ok(_) if channel.accepts(release_type) => "eligible".green(),
                Ok(_) => "wrong channel".yellow(),
                Err(reason) => reason.to_string().as_str().red(),
            };
            println!("   {} {:<12} {}", release_type, entry.version, verdict);
        }
    }

    match resolver.resolve(&manifest) {
        Some(release) => {
            let source = if release.from_archive { " (archive)" } else { "" };
            println!(
                "\n✨ {} {} {}{}",
                "Would install".green(),
                release.version,
                release.release_type,
                source
            );
            println!("   {}", release.zip_url);
        }
        None => println!("\n{}", "No eligible update".yellow()),
    }
    Ok(())
}

fn run_inspect(path: &Path) -> Result<()> {
    let mut bundle = Bundle::open_file(path).with_context(|| format!("opening {}", path.display()))?;
    let entries = bundle.entries().to_vec();

    println!("📦 {} ({} entries)", path.display().to_string().cyan(), entries.len());
    for entry in entries.iter().filter(|e| !e.is_dir()) {
        println!("   {:>9}  {}", entry.size, entry.name);
    }

    let Some(entry) = entries.iter().find(|e| e.name == BUNDLE_MANIFEST) else {
        println!("\n{}", "❌ Bundle has no manifest.json".red());
        return Ok(());
    };
    let mut json = Vec::new();
    bundle.read_entry(entry, &mut json)?;
    let manifest = BundleManifest::from_json(&json).context("parsing bundle manifest")?;

    println!("\n   version:      {}", manifest.version.as_str().bold());
    if let Some(release_type) = manifest.release_type {
        println!("   release type: {}", release_type);
    }
    println!("   machines:     {}", manifest.target_machine_types.join(", "));
    println!("   os:           {}", manifest.target_operating_systems.join(", "));
    if manifest.is_script_only() {
        println!("   {}", "script-only release".yellow());
    }
    Ok(())
}
