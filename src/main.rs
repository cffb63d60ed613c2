use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bussola::config::{CommandLineArgs, Config};
use bussola::models::{ProcessingState, Submission};
use bussola::services::analysis::AnalyseOptions;
use bussola::utils::clean_optional_string;
use bussola::{AnalysisCore, BudgetTier};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();

    let (config, args) = Config::load()?;
    init_tracing(&config);

    tracing::info!("Bussola starting (db: {})", config.database.url);

    let run_all_stages = config.analysis.run_all_stages && !args.core_only;
    let core = Arc::new(AnalysisCore::new(config).await?);

    // Background learning from accumulated user edits.
    let learner_handle = core.spawn_learner_job();

    let submission = submission_from_args(&args)?;
    tracing::info!(
        "Analysing submission {}: {} ({})",
        submission.id,
        submission.company,
        submission.industry
    );

    let options = AnalyseOptions {
        run_all_stages,
        external_data: None,
        research_data: None,
        budget: Some(BudgetTier::Paid),
    };

    let report = core.analyse(&submission, options).await;
    learner_handle.shutdown();

    match report {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        },
        Err(e) => {
            // The external submission store records this state plus the
            // failing stage from the error message.
            tracing::error!("analysis failed ({}): {}", ProcessingState::Failed.as_str(), e);
            Err(e.into())
        },
    }
}

fn submission_from_args(args: &CommandLineArgs) -> Result<Submission, anyhow::Error> {
    let company = args
        .company
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--company is required"))?;
    let industry = args
        .industry
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--industry is required"))?;

    let mut submission = Submission::new(args.submission_id.unwrap_or(0), company, industry);
    submission.website = clean_optional_string(args.website.as_ref());
    submission.challenge = clean_optional_string(args.challenge.as_ref());
    Ok(submission)
}

fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if let Some(file) = &config.logging.file {
        let path = std::path::Path::new(file);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("bussola.log"));
        let appender = tracing_appender::rolling::daily(dir, name);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(appender).with_ansi(false))
            .init();
    } else {
        registry.init();
    }
}
