use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tailor::auth::{AuthController, LoginForm, LoginOutcome, RegisterForm, RegisterOutcome};
use tailor::carousel::{Carousel, LoadState};
use tailor::catalog::{CatalogError, HttpCatalog, ProductCard, fetch_cards};
use tailor::config::{AuthConfig, CatalogConfig};
use tailor::delay::{Sleeper, TokioSleeper};
use tailor::notifier::NoOpener;
use tailor::storage::{FileStore, StorageError};
use tailor::validation::FormErrors;
use tracing_subscriber::EnvFilter;

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("catalog failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("output failed: {0}")]
    Output(#[from] io::Error),
    #[error("{0}")]
    Form(String),
    #[error("already logged in; run `logout` first")]
    AlreadyLoggedIn,
    #[error("failed to load products")]
    ProductsUnavailable,
}

#[derive(Parser, Debug)]
#[command(name = "tailor", about = "Storefront auth flow and product catalog from the terminal")]
struct Cli {
    /// Directory holding the user list and session files.
    #[arg(long, env = "TAILOR_DATA_DIR", default_value = ".tailor")]
    data_dir: PathBuf,

    /// Skip the simulated request latency.
    #[arg(long, default_value_t = false)]
    no_delay: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Auth(AuthCommand),
    Products {
        #[arg(long, help = "Category substring; defaults to TAILOR_PRODUCTS_CATEGORY")]
        category: Option<String>,
        #[arg(long, default_value_t = 1280)]
        viewport: u32,
        #[arg(long, default_value_t = 0, help = "Pages to advance before printing")]
        page: usize,
    },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Defaults to `--password`.
        #[arg(long)]
        confirm: Option<String>,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Status,
    CheckAuth,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut out = io::stdout().lock();
    run(cli, &mut out).await
}

async fn run(cli: Cli, out: &mut impl Write) -> Result<(), CliError> {
    match cli.command {
        Command::Products { category, viewport, page } => run_products(out, category, viewport, page).await,
        Command::Auth(command) => {
            let mut config = AuthConfig::from_env();
            if cli.no_delay {
                config.login_delay = Duration::ZERO;
                config.register_delay = Duration::ZERO;
            }
            let mut auth = open_controller(config, &cli.data_dir)?;
            run_auth(&mut auth, command, out).await
        }
    }
}

fn open_controller(config: AuthConfig, data_dir: &Path) -> Result<AuthController, CliError> {
    let store = FileStore::open(data_dir)?;
    Ok(AuthController::new(config, Box::new(store.clone()), Box::new(store), Box::new(NoOpener)))
}

/// Register without the login-form handoff; there is no form to hand off to.
async fn submit_registration(
    auth: &mut AuthController,
    form: &RegisterForm,
    sleeper: &impl Sleeper,
) -> RegisterOutcome {
    let token = match auth.begin_register(form) {
        Ok(token) => token,
        Err(outcome) => return outcome,
    };
    sleeper.sleep(auth.config().register_delay).await;
    auth.finish_register(token)
}

async fn run_auth(auth: &mut AuthController, command: AuthCommand, out: &mut impl Write) -> Result<(), CliError> {
    if auth.is_storage_degraded() {
        tracing::warn!("storage is degraded; changes may not persist");
    }
    match command {
        AuthCommand::Register { name, email, password, confirm } => {
            let form = RegisterForm { name, email, confirm_password: confirm.unwrap_or_else(|| password.clone()), password };
            match submit_registration(auth, &form, &TokioSleeper).await {
                RegisterOutcome::Registered { email } => {
                    writeln!(out, "Registered {email}. Log in with `login --email {email}`.")?;
                    Ok(())
                }
                RegisterOutcome::Busy => Err(CliError::AlreadyLoggedIn),
                RegisterOutcome::Duplicate | RegisterOutcome::Invalid | RegisterOutcome::Stale => {
                    Err(CliError::Form(describe_errors(auth.errors())))
                }
            }
        }
        AuthCommand::Login { email, password } => {
            let form = LoginForm { email, password };
            match auth.login(&form, &TokioSleeper).await {
                LoginOutcome::Authenticated(_) => {
                    if let Some(profile) = auth.profile() {
                        writeln!(out, "{}\n{}", profile.greeting, profile.email)?;
                    }
                    Ok(())
                }
                LoginOutcome::Busy => Err(CliError::AlreadyLoggedIn),
                LoginOutcome::Rejected | LoginOutcome::Invalid | LoginOutcome::Stale => {
                    Err(CliError::Form(describe_errors(auth.errors())))
                }
            }
        }
        AuthCommand::Logout => {
            auth.logout();
            writeln!(out, "Logged out")?;
            Ok(())
        }
        AuthCommand::Status => {
            match auth.profile() {
                Some(profile) => writeln!(out, "{}\n{}", profile.greeting, profile.email)?,
                None => writeln!(out, "Not logged in")?,
            }
            Ok(())
        }
        AuthCommand::CheckAuth => {
            let request = serde_json::json!({ "type": "checkAuth" });
            if let Some(reply) = auth.handle_message(&request) {
                print_json(out, &serde_json::to_value(reply)?)?;
            }
            Ok(())
        }
    }
}

async fn run_products(
    out: &mut impl Write,
    category: Option<String>,
    viewport: u32,
    page: usize,
) -> Result<(), CliError> {
    let config = CatalogConfig::from_env();
    let category = category.unwrap_or_else(|| config.category.clone());
    let source = HttpCatalog::new(&config)?;
    writeln!(out, "{}", LoadState::Loading.message().unwrap_or_default())?;

    let state = LoadState::from(fetch_cards(&source, &category).await);
    if let Some(message) = state.message() {
        writeln!(out, "{message}")?;
        return Err(CliError::ProductsUnavailable);
    }

    let mut carousel = Carousel::new(viewport);
    carousel.set_total(state.cards().len());
    for _ in 0..page {
        carousel.next();
    }
    for card in &state.cards()[carousel.visible()] {
        writeln!(out, "{}", card_line(card))?;
    }
    writeln!(out, "showing {:?} of {}", carousel.visible(), carousel.total())?;
    Ok(())
}

fn describe_errors(errors: &FormErrors) -> String {
    errors
        .iter()
        .map(|(field, error)| format!("{}: {}", field.dom_id(), error.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn card_line(card: &ProductCard) -> String {
    let mut line = format!("{:>4}  {:<33}  {}", card.id, card.display_title(), card.price_label());
    if let Some(old) = card.original_price() {
        line.push_str(&format!(" (was ${old})"));
    }
    if let Some(badge) = card.badge() {
        line.push_str(&format!(" {badge}"));
    }
    line
}

fn print_json(out: &mut impl Write, value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(out, "{rendered}")?;
    Ok(())
}
