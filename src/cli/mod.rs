/*
* Affinity Label Command Line Interface
* -------------------------------------
* @project: ovirt-affinity-labels
*
* Command Structure:
* ---------------
* ovirt-affinity-labels
* ├── apply                   // desired state from flags, human (or --json) output
* ├── module <ARGS_FILE>      // binary-module mode: JSON args in, JSON result out
* └── init                    // writes config/default.toml
*
* Whatever the front door, a run is: validate params -> connect -> reconcile ->
* close the session (always, even when the reconciliation blew up) -> report.
* stdout belongs to the result; logs go to stderr.
*
* Usage Examples:
* -------------
* ```bash
* # label vm1 and vm2 in mycluster, leave hosts alone
* ovirt-affinity-labels apply --name mylabel --cluster mycluster --vms vm1,vm2
*
* # detach every host, but only show what would happen
* ovirt-affinity-labels apply --name mylabel --cluster mycluster --no-hosts --check
*
* # get rid of the label entirely
* ovirt-affinity-labels apply --name mylabel --state absent
* ```
*/

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{LoggingSettings, Settings};
use crate::core::RestEngine;
use crate::errors::{ErrorContext, LabelError, LabelResult};
use crate::module::{run_module, AuthParams, ModuleParams, ModuleResult, State};
use crate::with_context;

#[derive(Parser)]
#[command(name = "ovirt-affinity-labels")]
#[command(about = "Manage oVirt affinity labels and their VM/host assignments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a label from command line flags
    Apply(ApplyArgs),
    /// Run as an automation-framework binary module
    Module {
        /// JSON file holding the module arguments
        args_file: PathBuf,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct ApplyArgs {
    #[arg(short, long)]
    name: String,
    #[arg(short, long, value_enum, default_value_t = State::Present)]
    state: State,
    #[arg(long)]
    cluster: Option<String>,
    /// Comma separated VM names that should carry the label
    #[arg(long, value_delimiter = ',', conflicts_with = "no_vms")]
    vms: Option<Vec<String>>,
    /// Detach the label from every VM
    #[arg(long)]
    no_vms: bool,
    /// Comma separated host names that should carry the label
    #[arg(long, value_delimiter = ',', conflicts_with = "no_hosts")]
    hosts: Option<Vec<String>>,
    /// Detach the label from every host
    #[arg(long)]
    no_hosts: bool,
    /// Report what would change without changing it
    #[arg(long)]
    check: bool,
    /// Print the JSON result instead of a summary
    #[arg(long)]
    json: bool,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    username: Option<String>,
    /// Prefer OVIRT_PASSWORD or a settings file over this flag
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    ca_file: Option<PathBuf>,
    #[arg(long)]
    insecure: bool,
}

impl ApplyArgs {
    fn into_params(self) -> ModuleParams {
        let list = |names: Option<Vec<String>>, none: bool| {
            if none {
                Some(Vec::new())
            } else {
                names
            }
        };

        ModuleParams {
            vms: list(self.vms, self.no_vms),
            hosts: list(self.hosts, self.no_hosts),
            name: self.name,
            state: self.state,
            cluster: self.cluster,
            auth: Some(AuthParams {
                url: self.url,
                username: self.username,
                password: self.password,
                token: self.token,
                ca_file: self.ca_file,
                insecure: self.insecure.then_some(true),
                timeout: None,
            }),
            check_mode: self.check,
        }
    }
}

/// Returns whether the run succeeded; the caller turns that into the exit code.
pub async fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();

    let settings = configure(cli.config.as_deref())?;

    match cli.command {
        Commands::Apply(args) => {
            let json = args.json;
            let params = args.into_params();
            let result = invoke(params.clone(), &settings).await;
            if json {
                println!("{}", result.to_json());
            } else {
                print_summary(&params, &result);
            }
            Ok(!result.failed)
        }
        Commands::Module { args_file } => {
            let result = match read_params(&args_file).await {
                Ok(params) => invoke(params, &settings).await,
                Err(e) => {
                    let ctx = ErrorContext::new(file!(), "read module arguments");
                    ModuleResult::failure(e, &ctx)
                }
            };
            println!("{}", result.to_json());
            Ok(!result.failed)
        }
        Commands::Init { force } => {
            handle_init_command(force)?;
            Ok(true)
        }
    }
}

/// Loads settings and installs the subscriber they ask for. Nothing may log
/// before the subscriber is up.
fn configure(config: Option<&Path>) -> LabelResult<Settings> {
    let (settings, source) = match config {
        Some(path) => (Settings::new_from_file(path)?, path.display().to_string()),
        None => (Settings::new()?, Settings::config_path()),
    };
    init_tracing(&settings.logging);
    info!(source = %source, level = %settings.logging.level, "Loaded configuration");
    Ok(settings)
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    // a second init (tests, embedding) is not an error worth reporting
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn read_params(path: &Path) -> anyhow::Result<ModuleParams> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        LabelError::invalid(format!("cannot read module arguments from {}: {e}", path.display()))
    })?;
    Ok(ModuleParams::from_json(&raw)?)
}

/// Validates, connects, reconciles, and always releases the session.
pub async fn invoke(params: ModuleParams, settings: &Settings) -> ModuleResult {
    let ctx = ErrorContext::new(file!(), format!("affinity label '{}'", params.name));

    if let Err(e) = with_context!(params.validate(), "validate module arguments") {
        return ModuleResult::failure(e.into(), &ctx);
    }

    let engine_settings = settings.engine.merged(params.auth.as_ref());
    let engine = match with_context!(RestEngine::connect(&engine_settings).await, "connect to engine") {
        Ok(engine) => engine,
        Err(e) => return ModuleResult::failure(e.into(), &ctx),
    };

    info!(label = %params.name, state = ?params.state, check_mode = params.check_mode, "Reconciling affinity label");
    let result = run_module(&engine, &params, &ctx).await;
    if result.failed {
        error!(label = %params.name, msg = result.msg.as_deref().unwrap_or_default(), "Reconciliation failed");
    }
    result
}

fn print_summary(params: &ModuleParams, result: &ModuleResult) {
    if result.failed {
        println!(
            "{} {}",
            "✗".red(),
            result.msg.as_deref().unwrap_or("reconciliation failed")
        );
        return;
    }

    let status = match (result.changed, params.check_mode) {
        (false, _) => "ok".green(),
        (true, false) => "changed".yellow(),
        (true, true) => "would change".yellow(),
    };
    let target = match &result.id {
        Some(id) => format!("'{}' ({})", params.name, id),
        None => format!("'{}'", params.name),
    };
    println!("{} affinity label {} [{}]", "✓".green(), target.bold(), status);
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        error!("Configuration file already exists. Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
