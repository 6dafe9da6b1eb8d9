//! gantry CLI
#![deny(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use gantry::{Cli, Commands, commands};
use gantry_core::cancel::CancelToken;
use gantry_core::config::ConfigLoader;
use tracing::{debug, warn};

mod observability;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.color.apply();

    if let Some(ref dir) = cli.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to change directory to {}", dir.display()))?;
    }

    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let cwd = camino::Utf8PathBuf::try_from(cwd).map_err(|e| {
        anyhow::anyhow!(
            "current directory is not valid UTF-8: {}",
            e.into_path_buf().display()
        )
    })?;
    let mut loader = ConfigLoader::new().with_project_search(&cwd);
    if let Some(ref config_path) = cli.config {
        let config_path = camino::Utf8PathBuf::try_from(config_path.clone()).map_err(|e| {
            anyhow::anyhow!(
                "config path is not valid UTF-8: {}",
                e.into_path_buf().display()
            )
        })?;
        loader = loader.with_file(&config_path);
    }
    let config = loader.load().context("failed to load configuration")?;

    let obs_config = observability::ObservabilityConfig::from_env_with_overrides(
        config
            .log_dir
            .as_ref()
            .map(|dir| dir.as_std_path().to_path_buf()),
    );
    let env_filter = observability::env_filter(cli.quiet, cli.verbose, config.log_level.as_str());
    let _guard = observability::init_observability(&obs_config, env_filter)
        .context("failed to initialize logging/tracing")?;

    debug!(
        verbose = cli.verbose,
        quiet = cli.quiet,
        json = cli.json,
        color = ?cli.color,
        chdir = ?cli.chdir,
        "CLI initialized"
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let project = commands::Project::discover(&cwd, &config);

    // Execute command
    let result = match cli.command {
        Commands::Lint(args) => commands::stages::cmd_stages("lint", args, cli.json, &project, &cancel),
        Commands::Test(args) => commands::stages::cmd_stages("test", args, cli.json, &project, &cancel),
        Commands::Build(args) => {
            commands::stages::cmd_stages("build", args, cli.json, &project, &cancel)
        }
        Commands::Clean(args) => commands::clean::cmd_clean(args, cli.json, &project),
        Commands::Version(args) => commands::version::cmd_version(args, cli.json, &project),
        Commands::Tag(args) => commands::tag::cmd_tag(args, cli.json, &project),
        Commands::All(args) => commands::all::cmd_all(args, cli.json, &project, &cancel),
        Commands::Info(args) => commands::info::cmd_info(args, cli.json, &project, &cwd),
    };
    if let Err(ref err) = result {
        tracing::error!(error = %err, "fatal error");
    }
    result
}
