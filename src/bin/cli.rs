use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use keyward::drivers::backoffice::{BackofficeConfig, OutputFormat};
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[arg(short, long, help = "Cli config path file", env = "CLI_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum Output {
    Table,
    Json,
}

#[derive(Parser, Clone)]
pub struct KeysArgs {
    /// format that will be returned, table or json
    #[arg(short, long, value_enum, default_value = "table")]
    output: Output,
}

#[derive(Parser, Clone)]
pub struct VerifyArgs {
    /// Compact serialized JWT
    pub token: String,

    /// Audience the token must carry
    #[arg(short, long)]
    pub audience: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List signing keys
    Keys(KeysArgs),

    /// Print the public key set
    Jwks,

    /// Verify a token against the stored keys
    Verify(VerifyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let cli = Cli::parse();
    let config = Config::new(&cli.config)?;

    match cli.command {
        Commands::Keys(args) => {
            let output = match args.output {
                Output::Table => OutputFormat::Table,
                Output::Json => OutputFormat::Json,
            };
            keyward::drivers::backoffice::fetch_keys(config.into(), output).await?;
        }
        Commands::Jwks => {
            keyward::drivers::backoffice::fetch_jwks(config.into()).await?;
        }
        Commands::Verify(args) => {
            keyward::drivers::backoffice::verify_token(config.into(), &args.token, args.audience)
                .await?;
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct Config {
    db_path: String,
    provider: String,
    issuer_url: String,
    audience: String,
}
impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

impl From<Config> for BackofficeConfig {
    fn from(value: Config) -> Self {
        Self {
            db_path: value.db_path,
            provider: value.provider,
            issuer_url: value.issuer_url,
            audience: value.audience,
        }
    }
}
