use std::process;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use standctl::cli::{
    delete_command, deploy_command, format_deletion_report, format_deployment_result,
    format_distribution, format_template_mapping, format_template_records,
    format_validation_report, plan_command, templates_forget, templates_list, templates_prepare,
    validate_command, Cli, Commands, Session, TemplatesAction,
};
use standctl::config::{default_settings_path, load_settings_from};
use standctl::StandError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    match run(cli).await {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Execute the command; the returned value is the process exit code
async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::Validate(args) = &cli.command {
        let report = validate_command(&args.file)?;
        print!("{}", format_validation_report(&report, &args.file.display().to_string()));
        return Ok(if report.has_errors() { 1 } else { 0 });
    }

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings_from(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    cli.connection.apply(&mut settings.connection);
    let session = Session::connect(settings).context("connecting to the cluster")?;

    match &cli.command {
        Commands::Validate(_) => Ok(0),
        Commands::Deploy(args) => {
            let result = deploy_command(&session, args).await?;
            print!("{}", format_deployment_result(&result));
            exit_code(result.ensure_complete())
        }
        Commands::Delete(args) => {
            let report = delete_command(&session, args).await?;
            print!("{}", format_deletion_report(&report));
            if report.is_success() {
                Ok(0)
            } else {
                exit_code(Err(StandError::PartialFailure {
                    failed: report.failed_count(),
                    total: report.outcomes.len(),
                }))
            }
        }
        Commands::Plan(args) => {
            let distribution = plan_command(&session, args).await?;
            print!("{}", format_distribution(&distribution));
            Ok(0)
        }
        Commands::Templates(args) => match &args.action {
            TemplatesAction::List => {
                print!("{}", format_template_records(&templates_list(&session)?));
                Ok(0)
            }
            TemplatesAction::Forget { vmid, node } => {
                if templates_forget(&session, *vmid, node).await? {
                    println!("Forgot template {} on {}", vmid, node);
                } else {
                    println!("No mapping for template {} on {}", vmid, node);
                }
                Ok(0)
            }
            TemplatesAction::Prepare { file, node } => {
                let mapping = templates_prepare(&session, file, node).await?;
                print!("{}", format_template_mapping(&mapping, node));
                Ok(0)
            }
        },
    }
}

fn exit_code(outcome: Result<(), StandError>) -> anyhow::Result<i32> {
    match outcome {
        Ok(()) => Ok(0),
        Err(e) => {
            info!("Batch incomplete: {}", e);
            eprintln!("{}", e);
            Ok(1)
        }
    }
}
