use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use height_upgrade::app;
use height_upgrade::config::Settings;
use height_upgrade::engine::Collaborators;
use height_upgrade::error::UpgradeFailure;
use height_upgrade::height::{CurlStatusClient, HeightSource, PollOutcome};
use height_upgrade::observability::ObservabilityGuard;
use height_upgrade::pause::ShutdownAwarePause;
use height_upgrade::validator::{BinaryRole, BinaryValidator, ValidationOutcome};

#[derive(Parser, Debug)]
#[command(name = "height-upgrade")]
#[command(
    about = "Swap a node service binary exactly at a target block height",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for the target height, then stop, back up, swap and restart the service.
    Run,
    /// Validate settings and binaries without locking or polling.
    Doctor,
    /// Query the status endpoint once and show the polling decision.
    Height,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _observability = ObservabilityGuard::init();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_upgrade(),
        Commands::Doctor => doctor(),
        Commands::Height => query_height(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(
                kind = failure.kind.as_str(),
                exit_code = failure.exit_code(),
                "{}",
                failure.message
            );
            ExitCode::from(failure.exit_code())
        }
    }
}

fn run_upgrade() -> Result<(), UpgradeFailure> {
    let settings = Settings::load()?;
    let pause = ShutdownAwarePause::install_signal_handler().map_err(|err| {
        UpgradeFailure::configuration(format!("failed installing signal handler: {:#}", err))
    })?;
    let collaborators = Collaborators::system(&settings, Arc::new(pause));

    // A busy lock is a clean exit.
    app::run_upgrade(&settings, &BinaryValidator::for_current_user(), collaborators)?;
    Ok(())
}

fn doctor() -> Result<(), UpgradeFailure> {
    let settings = Settings::load()?;
    let report = settings.doctor_report();

    println!("height-upgrade doctor");
    println!("target_height: {}", report.target_height);
    println!("rpc_endpoint: {}", report.rpc_endpoint);
    println!("service: {}", report.service_id);
    println!("candidate_binary: {}", report.candidate_binary.display());
    println!("active_binary: {}", report.active_binary.display());
    println!("expected_sha256_loaded: {}", report.expected_sha256_loaded);
    println!("threshold_blocks: {}", report.threshold_blocks);
    println!("far_interval_secs: {}", report.far_interval_secs);
    println!("near_interval_secs: {}", report.near_interval_secs);
    println!("fallback_interval_secs: {}", report.fallback_interval_secs);
    println!("retry_attempts: {}", report.retry_attempts);
    println!("retry_delay_secs: {}", report.retry_delay_secs);
    println!("backup_enabled: {}", report.backup_enabled);
    println!("backup_dir: {}", report.backup_dir.display());
    println!("lock_dir: {}", report.lock_dir.display());
    println!(
        "env_file: {}",
        report
            .env_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unset>".to_string())
    );

    let validator = BinaryValidator::for_current_user();
    println!("trusted_uid: {}", validator.trusted_uid());
    let candidate = validator.validate_executable(
        &settings.target.candidate_binary,
        BinaryRole::Candidate,
        settings.target.expected_sha256.as_deref(),
    );
    let active =
        validator.validate_executable(&settings.target.active_binary, BinaryRole::Active, None);
    println!("candidate_check: {}", describe_validation(&candidate));
    println!("active_check: {}", describe_validation(&active));

    if report.warnings.is_empty() {
        println!("status: ok");
    } else {
        println!("status: warning");
        for warning in &report.warnings {
            println!("- {}", warning);
        }
    }

    candidate?;
    active?;
    Ok(())
}

fn describe_validation(result: &Result<ValidationOutcome, UpgradeFailure>) -> String {
    match result {
        Ok(ValidationOutcome::Verified { digest_checked }) => {
            format!("ok (digest_checked={})", digest_checked)
        }
        Ok(ValidationOutcome::Absent) => "absent (fresh install)".to_string(),
        Err(failure) => format!("failed: {}", failure.message),
    }
}

fn query_height() -> Result<(), UpgradeFailure> {
    let settings = Settings::load()?;
    let source = HeightSource::new(
        Box::new(CurlStatusClient::new(&settings.rpc)),
        settings.target.rpc_endpoint.clone(),
        &settings.polling,
        Arc::new(ShutdownAwarePause::default()),
    );
    let target = settings.target.target_height;

    match source.poll()? {
        PollOutcome::Height(height) => {
            println!("endpoint: {}", source.endpoint());
            println!("observed_height: {}", height);
            println!("target_height: {}", target);
            if height > target {
                println!("decision: safety_abort (target already passed)");
            } else if height == target {
                println!("blocks_remaining: 0");
                println!("decision: trigger");
            } else {
                let remaining = target - height;
                println!("blocks_remaining: {}", remaining);
                println!(
                    "next_interval_secs: {}",
                    settings.polling.interval_for(remaining).as_secs()
                );
                println!("decision: wait");
            }
            Ok(())
        }
        PollOutcome::Unavailable {
            attempts,
            last_error,
        } => {
            println!("endpoint: {}", source.endpoint());
            println!("observed_height: <unavailable>");
            println!(
                "fallback_interval_secs: {}",
                settings.polling.fallback_interval_secs
            );
            Err(UpgradeFailure::sequence(format!(
                "status endpoint unavailable after {} attempts: {}",
                attempts, last_error
            )))
        }
    }
}
