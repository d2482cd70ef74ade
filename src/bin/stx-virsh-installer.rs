//! Installs a StarlingX lab on local libvirt virtual machines.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use stxauto::deploy::{self, Installer, ScpStager, SshHostList, VarDict};
use stxauto::Session;

#[derive(Parser)]
#[command(name = "stx-virsh-installer")]
#[command(author, version, about = "Install a StarlingX lab through virsh consoles", long_about = None)]
struct Args {
    /// Variable file (TOML with variable/file/url/log_location sections)
    #[arg(short, long, default_value = "variable.toml")]
    config: PathBuf,

    /// System mode: simplex, duplex, standard or storage
    #[arg(short, long)]
    mode: Option<String>,

    /// File of `name=value` lines overriding the variable file
    #[arg(short, long)]
    overwrite: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    verbosity: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Installation didn't finish. Please check logs for debugging: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_vars(args: &Args) -> anyhow::Result<VarDict> {
    if !args.config.exists() {
        bail!("Variable file '{}' does not exist", args.config.display());
    }
    let mut vars = VarDict::load(&args.config)?;
    if let Some(mode) = &args.mode {
        vars.set("system_mode", mode.as_str());
    }
    if let Some(path) = &args.overwrite {
        vars.apply_overwrite_file(path)?;
    }
    vars.normalize()?;
    Ok(vars)
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let vars = load_vars(&args)?;

    let time_stamp = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
    let run_dir = PathBuf::from(vars.get("base_log_dir")?).join(&time_stamp);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create {}", run_dir.display()))?;

    deploy::log::init(
        Some(&run_dir.join("stx_virsh_installer.log")),
        args.verbosity.as_deref(),
    )?;
    deploy::log::vars(&vars);

    let nodes = vars.node_names()?;
    info!("Installing {} on {nodes:?}", vars.get("system_mode")?);

    let builder = Session::builder().log_dir(&run_dir);
    let mut installer = Installer::new(
        vars,
        nodes,
        builder.clone(),
        SshHostList::new(builder.clone()),
        ScpStager::new(builder),
    )?;

    let report = installer.run().await?;
    println!(
        "{} steps finished, {} skipped. Logs: {}",
        report.completed.len(),
        report.skipped.len(),
        run_dir.display()
    );
    Ok(())
}
