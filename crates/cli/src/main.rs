use clap::{Parser, Subcommand, ValueEnum};
use godon_core::config::BreederConfig;
use godon_core::preflight;
use godon_core::registry::{self, Category};
use godon_core::worker::BreederWorker;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "godon-cli", version, about = "Godon breeder worker CLI")]
struct Cli {
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one breeder worker to completion.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Parallel run slot; overrides the value in the config file.
        #[arg(long)]
        run_id: Option<u32>,
        /// Target index; overrides the value in the config file.
        #[arg(long)]
        target_id: Option<u32>,
        /// Treat unknown parameters as warnings instead of errors.
        #[arg(long, default_value = "false")]
        permissive: bool,
    },
    /// Preflight-validate a breeder configuration.
    Validate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "false")]
        permissive: bool,
    },
    /// List the parameter registry for one category.
    Registry {
        #[arg(long, default_value = "sysctl")]
        category: String,
    },
}

fn init_tracing(log_format: LogFormat, log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .into_diagnostic()?;
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match log_format {
        LogFormat::Json => fmt.json().init(),
        LogFormat::Pretty => fmt.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level)?;

    match cli.command {
        Commands::Run {
            config,
            run_id,
            target_id,
            permissive,
        } => run_command(&config, run_id, target_id, permissive),
        Commands::Validate { config, permissive } => validate_command(&config, permissive),
        Commands::Registry { category } => registry_command(&category),
    }
}

fn load_config(path: &Path) -> Result<BreederConfig> {
    BreederConfig::from_file(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to load breeder config {}", path.display()))
}

fn run_command(
    config_path: &Path,
    run_id: Option<u32>,
    target_id: Option<u32>,
    permissive: bool,
) -> Result<()> {
    tracing::info!(command = "run", config = %config_path.display());
    let mut config = load_config(config_path)?;
    if let Some(run_id) = run_id {
        config.run_id = run_id;
    }
    if let Some(target_id) = target_id {
        config.target_id = target_id;
    }

    let report = preflight::validate(&config, !permissive);
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "preflight");
    }
    if !report.is_success() {
        return Err(miette!("{}", report.error_message()));
    }

    let mut worker = BreederWorker::from_env(config).into_diagnostic()?;
    let summary = worker.run().into_diagnostic()?;

    let output = serde_json::to_string_pretty(&summary).into_diagnostic()?;
    println!("{output}");
    Ok(())
}

fn validate_command(config_path: &Path, permissive: bool) -> Result<()> {
    tracing::info!(command = "validate", config = %config_path.display());
    let config = load_config(config_path)?;
    let report = preflight::validate(&config, !permissive);

    if report.is_success() {
        let output = serde_json::json!({
            "result": "SUCCESS",
            "data": {
                "message": "Preflight validation passed",
                "warnings": report.warnings,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
        Ok(())
    } else {
        let output = serde_json::json!({
            "result": "FAILURE",
            "error": report.error_message(),
        });
        println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
        Err(miette!("preflight validation failed"))
    }
}

fn registry_command(category: &str) -> Result<()> {
    let category = Category::from_name(category)
        .ok_or_else(|| miette!("unknown category '{category}' (sysctl|sysfs|cpufreq|ethtool)"))?;

    let entries: Vec<serde_json::Value> = registry::list_by_category(category)
        .into_iter()
        .map(|meta| {
            serde_json::json!({
                "name": meta.name,
                "kind": meta.kind.as_str(),
                "category": meta.category.to_string(),
                "causes_downtime": meta.causes_downtime,
                "description": meta.description,
                "typical_range": meta.typical_range,
                "available_values": meta.available_values,
                "path": meta.path,
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&entries).into_diagnostic()?
    );
    Ok(())
}
