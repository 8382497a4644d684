use anyhow::{Context, Result};
use harbor_sync::app::{self, Core};
use harbor_sync::codeship::auth::Credentials;
use harbor_sync::config::{self, Config};
use harbor_sync::engine::{aggregate, BuildStatus, Project, RefreshOutcome};
use std::path::Path;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

enum Command {
    Run,
    Once,
    SignIn { email: String, password: Option<String> },
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => Ok(Command::Run),
        Some("--once") => Ok(Command::Once),
        Some("sign-in") => {
            let email = args
                .get(1)
                .cloned()
                .context("usage: harbor-sync sign-in EMAIL [PASSWORD]")?;
            Ok(Command::SignIn { email, password: args.get(2).cloned() })
        }
        Some(other) => anyhow::bail!("unknown argument: {}", other),
    }
}

fn status_label(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Passing => "passing",
        BuildStatus::Failing => "FAILING",
        BuildStatus::Building => "building",
        BuildStatus::Unknown => "unknown",
    }
}

fn print_projects(projects: &[Project]) {
    let now = chrono::Local::now().format("%H:%M:%S");
    println!("  [{}] overall: {}", now, aggregate(projects));
    for project in projects.iter().filter(|p| p.is_enabled()) {
        let branch = project.latest_build().map_or("-", |b| b.branch.as_str());
        println!("    {:<9} {:<40} {}", status_label(project.status()), project.name, branch);
    }
    let disabled = projects.iter().filter(|p| !p.is_enabled()).count();
    if disabled > 0 {
        println!("    ({} disabled)", disabled);
    }
}

fn report_outcome(outcome: RefreshOutcome) {
    match outcome {
        RefreshOutcome::Updated { projects } => println!("  Synced {} projects.", projects),
        RefreshOutcome::Failed(kind) => println!("  Sync failed: {:?} (see harbor-sync.log)", kind),
        RefreshOutcome::Skipped => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_file = std::fs::File::create("harbor-sync.log")?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("harbor_sync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let command = parse_args()?;
    let config = Config::load(Path::new("config.toml"))?;

    // Load saved keys from .env (real env vars take precedence)
    Config::load_env_file();

    println!();
    println!("  Harbor Sync v{}", env!("CARGO_PKG_VERSION"));
    println!("  ================");
    println!();

    if let Command::SignIn { email, password } = command {
        let password = match password {
            Some(p) => p,
            None => config::prompt("Codeship password")?,
        };
        app::sign_in(&config, Credentials::Password { email, password }).await?;
        println!("  Signed in. Credentials saved to {}.", config.storage.credentials_path.display());
        return Ok(());
    }

    let core = Core::from_config(&config, Handle::current(), Config::credentials_from_env())?;
    if core.settings.credentials().is_none() {
        println!("  No credentials. Run `harbor-sync sign-in EMAIL` or set HARBOR_API_KEY.");
        return Ok(());
    }

    core.provider.add_error_observer(|e| {
        if !e.is_retryable() {
            eprintln!("  ! {}", e);
        }
    });

    if let Command::Once = command {
        let outcome = core.provider.refresh().await;
        print_projects(&core.provider.projects());
        report_outcome(outcome);
        return Ok(());
    }

    core.provider.add_listener(print_projects);
    let outcome = core.start().await;
    report_outcome(outcome);
    println!("  Polling every {}s. Ctrl-C to quit.", core.settings.refresh_interval_secs());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    core.shutdown();
    tracing::info!("shutting down");
    Ok(())
}
