use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use savour::config::{Config, ConfigError};
use savour::error::ErrorCode;
use savour::payment::CardDetails;
use savour::places::PlacesError;
use savour::routes::{self, HOME_PATH, LOGIN_PATH, RouteDecision};
use savour::services::account::{self, AccountError, CreateAccountOutcome};
use savour::services::campaign::{self, CampaignError, CampaignForm};
use savour::services::onboarding::{self, BusinessForm, OnboardingError};
use savour::services::profile::{self, Dashboard, ProfileError};
use savour::session::{LoginOutcome, SessionError, SignUpProfile};
use savour::state::{AppState, StartupError};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Onboarding(#[from] OnboardingError),
    #[error(transparent)]
    Campaign(#[from] CampaignError),
    #[error(transparent)]
    Places(#[from] PlacesError),
    #[error("address lookup is disabled; set SAVOUR_PLACES_KEY")]
    PlacesDisabled,
    #[error("not signed in; run `savour login` first")]
    NotSignedIn,
    #[error("sign-in needs a {0} response, which this CLI cannot provide")]
    ChallengeRequired(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl ErrorCode for CliError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.error_code(),
            Self::Startup(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Account(e) => e.error_code(),
            Self::Profile(e) => e.error_code(),
            Self::Onboarding(e) => e.error_code(),
            Self::Campaign(e) => e.error_code(),
            Self::Places(e) => e.error_code(),
            Self::PlacesDisabled => "E_PLACES_DISABLED",
            Self::NotSignedIn => "E_NOT_SIGNED_IN",
            Self::ChallengeRequired(_) => "E_CHALLENGE_REQUIRED",
            Self::InvalidJson(_) => "E_INVALID_JSON",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "savour", about = "Savour business owner console")]
struct Cli {
    /// Overrides SAVOUR_API_URL.
    #[arg(long)]
    api_url: Option<String>,

    /// Overrides SAVOUR_SESSION_CACHE.
    #[arg(long)]
    session_cache: Option<PathBuf>,

    /// Overrides SAVOUR_PLACES_KEY.
    #[arg(long)]
    places_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        if let Some(url) = &self.api_url {
            map.insert("SAVOUR_API_URL", url.clone());
        }
        if let Some(path) = &self.session_cache {
            map.insert("SAVOUR_SESSION_CACHE", path.display().to_string());
        }
        if let Some(key) = &self.places_key {
            map.insert("SAVOUR_PLACES_KEY", key.clone());
        }
        map
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current session.
    Session,
    Login(Credentials),
    Signup(SignupArgs),
    /// Confirm a new account with the emailed code.
    Confirm {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: String,
    },
    Logout,
    /// Email a password-reset code.
    ResetPassword {
        #[arg(long)]
        email: String,
    },
    /// Set a new password with the emailed code.
    ConfirmReset(ResetArgs),
    /// Print the signed-in owner's profile and businesses.
    Dashboard,
    Places(PlacesArgs),
    AddBusiness(AddBusinessArgs),
    Campaign(CampaignCommand),
}

#[derive(Args)]
struct Credentials {
    #[arg(long)]
    email: String,
    #[arg(long, env = "SAVOUR_PASSWORD")]
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[derive(Args)]
struct ResetArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    code: String,
    #[arg(long, env = "SAVOUR_NEW_PASSWORD")]
    new_password: String,
}

impl fmt::Debug for ResetArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetArgs")
            .field("email", &self.email)
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

#[derive(Args, Debug)]
struct SignupArgs {
    #[command(flatten)]
    credentials: Credentials,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    phone: String,
}

#[derive(Args, Debug)]
struct PlacesArgs {
    /// Text to autocomplete.
    #[arg(required_unless_present = "place_id")]
    input: Option<String>,
    /// Fetch name and address for a suggestion instead.
    #[arg(long)]
    place_id: Option<String>,
}

#[derive(Args)]
struct AddBusinessArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    address: String,
    #[arg(long)]
    onboard_message: String,
    /// Repeat for each preset message.
    #[arg(long = "preset", required = true)]
    presets: Vec<String>,
    #[arg(long, env = "SAVOUR_CARD_NUMBER")]
    card_number: String,
    #[arg(long)]
    exp_month: u8,
    #[arg(long)]
    exp_year: u16,
    #[arg(long, env = "SAVOUR_CARD_CVC")]
    cvc: String,
    #[arg(long)]
    card_name: String,
}

impl fmt::Debug for AddBusinessArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last4 = self.card_number.get(self.card_number.len().saturating_sub(4)..).unwrap_or_default();
        f.debug_struct("AddBusinessArgs")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("onboard_message", &self.onboard_message)
            .field("presets", &self.presets)
            .field("card_last4", &last4)
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .field("card_name", &self.card_name)
            .finish_non_exhaustive()
    }
}

#[derive(Args, Debug)]
struct CampaignCommand {
    #[command(subcommand)]
    command: CampaignSubcommand,
}

#[derive(Subcommand, Debug)]
enum CampaignSubcommand {
    List,
    Create {
        #[arg(long)]
        business_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        message: String,
        /// RFC 3339 timestamp, e.g. 2026-03-01T09:30:00Z.
        #[arg(long, value_parser = parse_timestamp)]
        at: OffsetDateTime,
    },
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {e}", e.error_code());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let overrides = cli.overrides();
    let config = Config::from_lookup(|key| overrides.get(key).cloned().or_else(|| std::env::var(key).ok()))?;
    let state = AppState::from_config(&config)?;
    let session = state.session.check_existing_session().await;

    match cli.command {
        Command::Session => print_json(&serde_json::to_value(session.snapshot())?),
        Command::Login(creds) => run_login(&state, creds).await,
        Command::Signup(args) => run_signup(&state, args).await,
        Command::Confirm { email, code } => {
            account::confirm_account(state.auth.as_ref(), &email, &code).await?;
            println!("account confirmed; run `savour login`");
            Ok(())
        }
        Command::Logout => {
            state.session.logout().await?;
            println!("signed out");
            Ok(())
        }
        Command::ResetPassword { email } => {
            account::request_password_reset(state.auth.as_ref(), &email).await?;
            println!("reset code sent to {email}");
            Ok(())
        }
        Command::ConfirmReset(ResetArgs { email, code, new_password }) => {
            account::confirm_password_reset(state.auth.as_ref(), &email, &code, &new_password).await?;
            println!("password updated");
            Ok(())
        }
        Command::Dashboard => {
            let dashboard = load_home(&state).await?;
            print_json(&dashboard_json(&dashboard)?)
        }
        Command::Places(args) => run_places(&state, args).await,
        Command::AddBusiness(args) => run_add_business(&state, args).await,
        Command::Campaign(cmd) => run_campaign(&state, cmd).await,
    }
}

/// Gate a command that needs the home screen, then load its data.
async fn load_home(state: &AppState) -> Result<Dashboard, CliError> {
    let session = state.session.current();
    match routes::resolve(&session, HOME_PATH) {
        RouteDecision::Render(_) => {}
        RouteDecision::Redirect(_) => return Err(CliError::NotSignedIn),
    }
    let user = session.user().ok_or(CliError::NotSignedIn)?;
    Ok(profile::load_dashboard(state.api.as_ref(), &user.user_sub).await?)
}

/// True when the account screens are reachable, i.e. nobody is signed in.
fn signed_out(state: &AppState) -> bool {
    matches!(routes::resolve(&state.session.current(), LOGIN_PATH), RouteDecision::Render(_))
}

async fn run_login(state: &AppState, creds: Credentials) -> Result<(), CliError> {
    if !signed_out(state) {
        tracing::info!("replacing existing session");
    }
    match state.session.login(creds.email.trim(), &creds.password).await? {
        LoginOutcome::Authenticated(identity) => {
            println!("signed in as {}", identity.email().unwrap_or(&identity.username));
            Ok(())
        }
        LoginOutcome::ChallengeRequired(pending) => Err(CliError::ChallengeRequired(pending.challenge.to_string())),
    }
}

async fn run_signup(state: &AppState, args: SignupArgs) -> Result<(), CliError> {
    let form = SignUpProfile {
        email: args.credentials.email,
        password: args.credentials.password,
        first_name: args.first_name,
        last_name: args.last_name,
        phone_number: args.phone,
    };
    match account::create_account(&state.session, &form).await? {
        CreateAccountOutcome::SignedIn(identity) => {
            println!("account created; signed in as {}", identity.email().unwrap_or(&identity.username));
            Ok(())
        }
        CreateAccountOutcome::ConfirmationRequired { email, .. } => {
            println!("account created; check {email} for a code and run `savour confirm`");
            Ok(())
        }
        CreateAccountOutcome::ChallengeRequired(pending) => {
            Err(CliError::ChallengeRequired(pending.challenge.to_string()))
        }
    }
}

async fn run_places(state: &AppState, args: PlacesArgs) -> Result<(), CliError> {
    let places = state.places.as_ref().ok_or(CliError::PlacesDisabled)?;

    if let Some(place_id) = args.place_id {
        let details = places.details(&place_id).await?;
        return print_json(&serde_json::to_value(details)?);
    }

    let input = args.input.unwrap_or_default();
    let near = match state.geolocator.current_position().await {
        Ok(position) => Some(position),
        Err(e) => {
            tracing::warn!(error = %e, "no position; searching without location bias");
            None
        }
    };
    for prediction in places.autocomplete(&input, near).await? {
        let main: String = prediction
            .highlighted_parts()
            .into_iter()
            .map(|part| if part.highlight { format!("[{}]", part.text) } else { part.text })
            .collect();
        println!("{}\t{main}\t{}", prediction.place_id, prediction.structured_formatting.secondary_text);
    }
    Ok(())
}

async fn run_add_business(state: &AppState, args: AddBusinessArgs) -> Result<(), CliError> {
    let mut dashboard = load_home(state).await?;
    let form = BusinessForm {
        card: CardDetails {
            number: args.card_number,
            exp_month: args.exp_month,
            exp_year: args.exp_year,
            cvc: args.cvc,
        },
        card_name: args.card_name,
        business_name: args.name,
        address: args.address,
        onboard_message: args.onboard_message,
        preset_messages: args.presets,
    };
    let onboarded = onboarding::onboard_business(state, &dashboard.business_user, &form).await?;
    dashboard.business_user = onboarded.business_user;
    dashboard.add_business(onboarded.business);
    print_json(&dashboard_json(&dashboard)?)
}

async fn run_campaign(state: &AppState, cmd: CampaignCommand) -> Result<(), CliError> {
    let dashboard = load_home(state).await?;
    match cmd.command {
        CampaignSubcommand::List => {
            let campaigns = campaign::list_campaigns(state.api.as_ref(), &dashboard).await?;
            print_json(&serde_json::to_value(campaigns)?)
        }
        CampaignSubcommand::Create { business_id, name, message, at } => {
            let form = CampaignForm { business_id, campaign_name: name, message, scheduled_at: at };
            let created =
                campaign::create_campaign(state.api.as_ref(), &dashboard, &form, OffsetDateTime::now_utc()).await?;
            print_json(&serde_json::to_value(created)?)
        }
    }
}

fn dashboard_json(dashboard: &Dashboard) -> Result<Value, CliError> {
    Ok(json!({
        "businessUser": serde_json::to_value(&dashboard.business_user)?,
        "businesses": serde_json::to_value(&dashboard.businesses)?,
        "totalSubscribers": dashboard.total_subscribers(),
    }))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment_keys() {
        let cli = Cli::parse_from(["savour", "--api-url", "http://localhost:9", "session"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.get("SAVOUR_API_URL").map(String::as_str), Some("http://localhost:9"));
        assert!(!overrides.contains_key("SAVOUR_PLACES_KEY"));
    }

    #[test]
    fn campaign_create_parses_rfc3339() {
        let cli = Cli::parse_from([
            "savour", "campaign", "create", "--business-id", "b1", "--name", "Spring", "--message", "20% off", "--at",
            "2026-03-01T09:30:00Z",
        ]);
        match cli.command {
            Command::Campaign(CampaignCommand { command: CampaignSubcommand::Create { at, .. } }) => {
                assert_eq!(at.unix_timestamp(), 1_772_357_400);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn debug_output_hides_secrets() {
        let login = Cli::parse_from(["savour", "login", "--email", "a@b.com", "--password", "hunter22"]);
        let rendered = format!("{login:?}");
        assert!(rendered.contains("a@b.com"));
        assert!(!rendered.contains("hunter22"));

        let reset = Cli::parse_from([
            "savour", "confirm-reset", "--email", "a@b.com", "--code", "123456", "--new-password", "s3cret-new",
        ]);
        assert!(!format!("{reset:?}").contains("s3cret-new"));

        let add = Cli::parse_from([
            "savour", "add-business", "--name", "Cafe", "--address", "1 Main", "--onboard-message", "hi", "--preset",
            "deal", "--card-number", "4242424242421234", "--exp-month", "1", "--exp-year", "2030", "--cvc", "987",
            "--card-name", "A",
        ]);
        let rendered = format!("{add:?}");
        assert!(!rendered.contains("4242424242421234"));
        assert!(!rendered.contains("987"));
        assert!(rendered.contains("1234"));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        assert!(parse_timestamp("tomorrow").is_err());
    }

    #[test]
    fn add_business_requires_a_preset() {
        let result = Cli::try_parse_from([
            "savour", "add-business", "--name", "Cafe", "--address", "1 Main", "--onboard-message", "hi",
            "--card-number", "4242", "--exp-month", "1", "--exp-year", "2030", "--cvc", "123", "--card-name", "A",
        ]);
        assert!(result.is_err());
    }
}
