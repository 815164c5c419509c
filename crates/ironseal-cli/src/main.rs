//! ironseal command-line interface for resolving, provisioning and checking devices.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ironseal_core::{
    config::{RuntimeConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    crypto::{self, Credential},
    keyfile::{read_key_file, write_key_file, KeyEncoding, KEY_LEN},
    logging,
    template::{DecryptorSpec, AUTO_DEVICE},
    unlock::{self, UnlockRequest},
    workflow::{self, InspectOptions, ProvisionOptions, WorkflowLevel, WorkflowReport},
    BuildVersion, DeviceFormatPlan, FormatTemplate,
};
use ironseal_luks::SystemDeviceBackend;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

fn load_cli_config(path: &Path) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (set {CONFIG_PATH_ENV} or --config to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "ironseal",
    version,
    about = "Build, inspect and unlock sealed ironseal devices."
)]
struct Cli {
    /// Path to the ironseal configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a format template and print the plan (secrets redacted).
    Resolve {
        /// Format template (JSON).
        template: PathBuf,

        /// Target block device; fills the `_dev` parameter.
        #[arg(long)]
        device: String,

        /// Parameter assignment, repeatable (`name=value`).
        #[arg(long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,

        /// Output format for the plan summary.
        #[arg(long, value_enum, default_value = "plain")]
        format: OutputFormat,
    },

    /// Partition, encrypt and seal a device from a format template. Destroys its contents.
    Provision {
        /// Format template (JSON).
        template: PathBuf,

        /// Target block device; fills the `_dev` parameter.
        #[arg(long)]
        device: String,

        /// Parameter assignment, repeatable (`name=value`).
        #[arg(long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,

        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Report the metadata, layout and signature state of a device.
    Inspect {
        /// Device to inspect; defaults to device.path from the configuration.
        #[arg(long)]
        device: Option<String>,

        #[command(flatten)]
        credential: CredentialArgs,
    },

    /// Check metadata signatures against the configured trusted signers.
    Verify {
        /// Device to verify; defaults to device.path from the configuration.
        #[arg(long)]
        device: Option<String>,
    },

    /// Open every encrypted partition directly, bypassing the daemon.
    Unlock {
        /// Device to unlock; defaults to device.path from the configuration.
        #[arg(long)]
        device: Option<String>,

        #[command(flatten)]
        credential: CredentialArgs,
    },

    /// Generate a random 32-byte key for a key decryptor or a signer.
    Keygen {
        /// Where to write the key (created read-only, mode 0400).
        #[arg(short, long)]
        output: PathBuf,

        /// Store the key hex-encoded instead of raw.
        #[arg(long)]
        hex: bool,

        /// Print the ed25519 public key for the generated secret.
        #[arg(long)]
        signing: bool,
    },

    /// Sign a system image and publish it to an update mirror directory.
    PublishUpdate {
        /// Mirror directory served to devices (updates.source_dir).
        #[arg(long)]
        mirror: PathBuf,

        /// Image file to publish.
        #[arg(long)]
        image: PathBuf,

        /// Dotted numeric build version of the image.
        #[arg(long)]
        version: String,

        /// ed25519 signing key file (raw or hex).
        #[arg(long)]
        signing_key: PathBuf,
    },

    /// Validate a configuration file or emit the config schema.
    ConfigSchema {
        /// Validate this file instead of printing the schema.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },
}

/// How a command obtains the credential it presents.
#[derive(clap::Args, Debug, Default)]
struct CredentialArgs {
    /// Prompt interactively for a password.
    #[arg(long)]
    prompt_password: bool,

    /// Key file for a key decryptor (raw or hex).
    #[arg(long)]
    key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand and map results into rich output.
fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Resolve {
            template,
            device,
            values,
            format,
        } => {
            let plan = resolve_plan(&template, &device, values)?;
            match format {
                OutputFormat::Plain => print_plan_plain(&plan),
                OutputFormat::Json => println!("{}", to_string_pretty(&plan_summary(&plan))?),
            }
        }
        Commands::Provision {
            template,
            device,
            values,
            yes,
        } => {
            let config = load_cli_config(&config_path)?;
            let plan = resolve_plan(&template, &device, values)?;
            print_plan_plain(&plan);
            if !yes && !confirm(&format!("All data on {} will be destroyed. Continue?", plan.device))? {
                bail!("provisioning aborted");
            }
            let backend = SystemDeviceBackend::from_config(&config);
            let options = ProvisionOptions {
                metadata_reserved_mb: config.device.metadata_reserved_mb,
                pbkdf2_iterations: config.crypto.pbkdf2_iterations,
            };
            let report = workflow::provision(&backend, &plan, &options)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("provision {}", plan.device))?;
            finish_report(report)?;
        }
        Commands::Inspect { device, credential } => {
            let config = load_cli_config(&config_path)?;
            let device = device.unwrap_or_else(|| config.device.path.clone());
            let options = InspectOptions {
                trusted_signers: config.unlock.trusted_signers.clone(),
                credential: credential.resolve()?,
            };
            let backend = SystemDeviceBackend::from_config(&config);
            let report = workflow::inspect(&backend, &device, &options).map_err(anyhow::Error::new)?;
            finish_report(report)?;
        }
        Commands::Verify { device } => {
            let config = load_cli_config(&config_path)?;
            let device = device.unwrap_or_else(|| config.device.path.clone());
            let backend = SystemDeviceBackend::from_config(&config);
            let metadata = unlock::load_metadata(&backend, &device).map_err(anyhow::Error::new)?;
            metadata
                .verify(&config.unlock.trusted_signers)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("verify {device}"))?;
            unlock::check_validity(&metadata, chrono::Utc::now()).map_err(anyhow::Error::new)?;
            metadata
                .verify_contents(&backend, &device)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("verify {device}"))?;
            if config.unlock.trusted_signers.is_empty() {
                println!("{device}: signatures and digests valid (embedded keys; no signers pinned)");
            } else {
                println!("{device}: signatures and digests valid against pinned signers");
            }
        }
        Commands::Unlock { device, credential } => {
            let config = load_cli_config(&config_path)?;
            let Some(credential) = credential.resolve()? else {
                bail!("provide --prompt-password or --key-file");
            };
            let request = UnlockRequest {
                device: device.unwrap_or_else(|| config.device.path.clone()),
                mapping_prefix: config.device.mapping_prefix.clone(),
                trusted_signers: config.unlock.trusted_signers.clone(),
            };
            let backend = SystemDeviceBackend::from_config(&config);
            let outcome = unlock::unlock_device(&backend, &request, &credential)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("unlock {}", request.device))?;
            println!("Unlocked {} via `{}`", request.device, outcome.decryptor);
            for mapped in outcome.opened {
                println!("  {mapped}");
            }
        }
        Commands::Keygen {
            output,
            hex: as_hex,
            signing,
        } => {
            ensure!(
                !output.exists(),
                "{} already exists; refusing to overwrite key material",
                output.display()
            );
            let key = crypto::random_bytes::<KEY_LEN>();
            let encoding = if as_hex { KeyEncoding::Hex } else { KeyEncoding::Raw };
            write_key_file(&output, key.as_slice(), encoding).map_err(anyhow::Error::new)?;
            println!("Wrote {} key to {}", encoding_name(encoding), output.display());
            if signing {
                let public = crypto::signing_key_from_bytes(&key).verifying_key();
                println!("public key: {}", hex::encode(public.as_bytes()));
            }
        }
        Commands::PublishUpdate {
            mirror,
            image,
            version,
            signing_key,
        } => {
            let Some(version) = BuildVersion::parse(&version) else {
                bail!("`{version}` is not a dotted numeric version");
            };
            let material = read_key_file(&signing_key).map_err(anyhow::Error::new)?;
            let key = crypto::signing_key_from_bytes(&material.bytes);
            let published = ironseal_core::publish_image(&mirror, &image, &version, &key)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("publish {}", image.display()))?;
            println!("Published build {version} as {}", published.display());
        }
        Commands::ConfigSchema { file } => match file {
            None => {
                let schema = schema_for!(RuntimeConfig);
                println!("{}", to_string_pretty(&schema)?);
            }
            Some(file) => {
                let config = RuntimeConfig::load(&file)
                    .with_context(|| format!("failed to parse {}", file.display()))?;
                let issues = config.validate();
                if issues.is_empty() {
                    println!("{} is valid", file.display());
                } else {
                    for issue in &issues {
                        println!("  - {issue}");
                    }
                    bail!("{} has {} issue(s)", file.display(), issues.len());
                }
            }
        },
    }

    Ok(())
}

impl CredentialArgs {
    fn resolve(&self) -> Result<Option<Credential>> {
        ensure!(
            !(self.prompt_password && self.key_file.is_some()),
            "cannot combine --prompt-password with --key-file"
        );
        if let Some(path) = &self.key_file {
            let material = read_key_file(path).map_err(anyhow::Error::new)?;
            return Ok(Some(Credential::Key(material.bytes)));
        }
        if self.prompt_password {
            return Ok(Some(Credential::password(prompt_password("Password: ")?)));
        }
        Ok(None)
    }
}

/// Parse `name=value`; the value may itself contain `=`.
fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected `name=value`, got `{raw}`")),
    }
}

fn resolve_plan(
    template: &Path,
    device: &str,
    values: Vec<(String, String)>,
) -> Result<DeviceFormatPlan> {
    let template = FormatTemplate::load(template)
        .with_context(|| format!("failed to read template {}", template.display()))?;
    let values = parameter_values(device, values)?;
    ironseal_core::resolve(&template, &values)
        .map_err(anyhow::Error::new)
        .context("template resolution failed")
}

fn parameter_values(
    device: &str,
    values: Vec<(String, String)>,
) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for (name, value) in values {
        ensure!(name != AUTO_DEVICE, "`{AUTO_DEVICE}` is set from --device");
        ensure!(
            map.insert(name.clone(), value).is_none(),
            "parameter `{name}` given more than once"
        );
    }
    map.insert(AUTO_DEVICE.to_string(), device.to_string());
    Ok(map)
}

/// Plan view that leaves out passwords and key paths.
fn plan_summary(plan: &DeviceFormatPlan) -> serde_json::Value {
    let partitions: Vec<_> = plan
        .slots()
        .into_iter()
        .flat_map(|assignment| {
            let live = (Some(assignment.slot.number), assignment.live);
            std::iter::once(live).chain(assignment.dormant.into_iter().map(|index| (None, index)))
        })
        .map(|(slot, index)| {
            let part = &plan.partitions[index];
            serde_json::json!({
                "id": part.id,
                "slot": slot,
                "type": part.kind,
                "label": part.label,
                "filesystem": part.filesystem,
                "encryption": part.encryption,
                "immutable": part.immutable,
                "size-mb": part.size_mb,
            })
        })
        .collect();
    let decryptors: BTreeMap<_, _> = plan
        .decryptors
        .iter()
        .map(|(name, spec)| {
            let kind = match spec {
                DecryptorSpec::Password { .. } => "password",
                DecryptorSpec::Key { .. } => "key",
            };
            (name.clone(), kind)
        })
        .collect();
    serde_json::json!({
        "device": plan.device,
        "type": plan.table,
        "partitions": partitions,
        "unprotected": plan.unprotected,
        "protected": plan.protected.keys().collect::<Vec<_>>(),
        "decryptors": decryptors,
        "signatures": plan.signatures.keys().collect::<Vec<_>>(),
    })
}

fn print_plan_plain(plan: &DeviceFormatPlan) {
    println!("Plan for {} ({:?} table)", plan.device, plan.table);
    for assignment in plan.slots() {
        let live = &plan.partitions[assignment.live];
        println!(
            "  slot {:>2}  {:<12} {:<8} {:<7} {}{}",
            assignment.slot.number,
            live.id,
            format!("{:?}", live.filesystem).to_lowercase(),
            live.size_mb
                .map(|mb| format!("{mb}MB"))
                .unwrap_or_else(|| "rest".to_string()),
            if live.encryption.is_some() { "encrypted" } else { "plain" },
            if live.immutable { ", immutable" } else { "" },
        );
        for index in assignment.dormant {
            println!("           {:<12} (hybrid member, not materialised)", plan.partitions[index].id);
        }
    }
    let decryptors: Vec<_> = plan.decryptors.keys().map(String::as_str).collect();
    println!("  decryptors: {}", decryptors.join(", "));
    let signers: Vec<_> = plan.signatures.keys().map(String::as_str).collect();
    println!("  signers:    {}", signers.join(", "));
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

fn finish_report(report: WorkflowReport) -> Result<()> {
    let failed = report.has_errors();
    print_report(report);
    if failed {
        bail!("workflow reported errors");
    }
    Ok(())
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}

fn encoding_name(encoding: KeyEncoding) -> &'static str {
    match encoding {
        KeyEncoding::Raw => "raw",
        KeyEncoding::Hex => "hex",
    }
}
