use std::path::PathBuf;
use std::process::exit;

use anyhow::{anyhow, Context};
use structopt::StructOpt;

use steward_core::repo::{FileRepo, HttpRepo, Repo};
use steward_core::selfserve::SelfServeStore;
use steward_core::{Adapters, Config, Permission, RunMode, Session, SessionOutcome};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "steward",
    about = "Managed software installation agent for client workstations"
)]
struct Args {
    /// Managed-installs directory (default: the platform location)
    #[structopt(long, global = true, parse(from_os_str))]
    managed_dir: Option<PathBuf>,

    /// Client identifier override for manifest selection
    #[structopt(long, global = true)]
    id: Option<String>,

    /// More output; repeat for debug detail
    #[structopt(short, long, global = true, parse(from_occurrences))]
    verbose: u8,

    /// Full debug output
    #[structopt(long, global = true)]
    debug: bool,

    /// Errors only
    #[structopt(short, long, global = true)]
    quiet: bool,

    /// Only act on items marked for unattended install/removal
    #[structopt(long, global = true)]
    unattended: bool,

    #[structopt(subcommand)]
    command: CliCommand,
}

#[derive(Debug, StructOpt)]
enum CliCommand {
    /// Refresh catalogs and manifests, resolve, and report what would
    /// change; exit 1 when updates are available
    #[structopt(name = "check", alias = "checkonly")]
    Check,

    /// Execute a previously persisted install plan
    #[structopt(name = "install", alias = "installonly")]
    Install,

    /// Full reconciliation: check, download, install, report
    #[structopt(name = "auto")]
    Auto,

    /// Manage the user's optional-install choices
    #[structopt(name = "selfserve")]
    SelfServe(SelfServeCommand),
}

#[derive(Debug, StructOpt)]
enum SelfServeCommand {
    /// Choose an optional item for installation
    Add { name: String },
    /// Withdraw an optional item (schedules removal)
    Remove { name: String },
    /// Show current choices
    List,
}

fn main() {
    let args = Args::from_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => exit(code),
        Err(e) => {
            log::error!("{:#}", e);
            exit(2);
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.quiet {
        "error"
    } else if args.debug || args.verbose >= 2 {
        "trace"
    } else if args.verbose == 1 {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut config = match &args.managed_dir {
        Some(dir) => Config::load(dir, Permission::ReadWrite)?,
        None => Config::load_default()?,
    };
    if let Some(id) = &args.id {
        config.settings_mut().client_identifier = Some(id.clone());
    }

    if let CliCommand::SelfServe(command) = &args.command {
        return self_serve(&config, command);
    }

    let repo = open_repo(&config)?;
    let mode = match args.command {
        CliCommand::Check => RunMode::CheckOnly,
        CliCommand::Install => RunMode::InstallOnly,
        CliCommand::Auto => RunMode::Auto,
        CliCommand::SelfServe(_) => unreachable!("handled above"),
    };

    let spinner = progress_spinner(&mode);
    let mut session = Session::new(config, repo, Adapters::native(), args.unattended);

    let outcome = match session.run(mode) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(pb) = spinner {
                pb.finish_and_clear();
            }
            log::error!("{}", e);
            return Ok(e.exit_code());
        }
    };
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    print_summary(&outcome, mode);
    Ok(outcome.exit_code(mode))
}

fn open_repo(config: &Config) -> anyhow::Result<Box<dyn Repo>> {
    let url = config
        .settings()
        .repo_url
        .clone()
        .ok_or_else(|| anyhow!("no repo_url configured in settings.toml"))?;

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("invalid file URL: {}", url))?;
            Ok(Box::new(FileRepo::new(path)))
        }
        "http" | "https" => {
            let repo = HttpRepo::new(url).context("could not build HTTP client")?;
            Ok(Box::new(repo))
        }
        other => Err(anyhow!("unsupported repo scheme: {}", other)),
    }
}

fn self_serve(config: &Config, command: &SelfServeCommand) -> anyhow::Result<i32> {
    let mut store = SelfServeStore::load(config.self_serve_manifest_path());
    match command {
        SelfServeCommand::Add { name } => {
            store.add_install(name);
            store.remove_uninstall(name);
            store.save()?;
            println!("{} will be installed at the next run", name);
        }
        SelfServeCommand::Remove { name } => {
            store.add_uninstall(name);
            store.remove_install(name);
            store.save()?;
            println!("{} will be removed at the next run", name);
        }
        SelfServeCommand::List => {
            for name in &store.manifest().managed_installs {
                println!("install: {}", name);
            }
            for name in &store.manifest().managed_uninstalls {
                println!("remove: {}", name);
            }
        }
    }
    Ok(0)
}

fn progress_spinner(mode: &RunMode) -> Option<indicatif::ProgressBar> {
    let pb = indicatif::ProgressBar::new_spinner();
    if pb.is_hidden() {
        return None;
    }
    pb.set_style(
        indicatif::ProgressStyle::default_spinner().template("{spinner:.green} {msg}"),
    );
    pb.set_message(match mode {
        RunMode::CheckOnly => "Checking for updates…",
        RunMode::InstallOnly => "Installing pending updates…",
        RunMode::Auto => "Reconciling managed software…",
    });
    pb.enable_steady_tick(120);
    Some(pb)
}

fn print_summary(outcome: &SessionOutcome, mode: RunMode) {
    if outcome.stopped {
        println!("Stopped on request; remaining items stay scheduled.");
    }
    match mode {
        RunMode::CheckOnly => {
            if outcome.updates_available {
                println!("Updates are available. Run `steward install` or `steward auto`.");
            } else {
                println!("Everything is up to date.");
            }
        }
        _ => {
            if outcome.install_failures {
                println!("Some items failed; see the report for details.");
            } else if outcome.updates_available {
                println!("Some items remain scheduled for a later run.");
            } else {
                println!("All managed software is in the desired state.");
            }
            if outcome.restart_needed {
                println!("A restart is required to finish installation.");
            }
        }
    }
}
