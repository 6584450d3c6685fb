//! cloudlink CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use cloudlink::auth::{SessionStore, SignIn};
use cloudlink::config::Config;
use cloudlink::ui;

#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Sign into the cloud from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign into the cloud through your browser
    #[command(alias = "login")]
    Signin {
        /// Also open the linking URL in the default browser
        #[arg(long)]
        open: bool,
    },

    /// Show the current session
    Whoami,

    /// List stored sessions
    Sessions,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr with the sign in instructions, stdout stays for results
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        ui::print_failure(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env().context("load configuration")?;

    match cli.command {
        Commands::Signin { open } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            ctrlc::set_handler(move || on_interrupt.cancel())
                .context("install Ctrl+C handler")?;

            let session = SignIn::new(config)
                .context("sign into cloud")?
                .open_browser(open)
                .run(&cancel, &mut std::io::stderr())
                .await
                .context("sign into cloud")?;

            ui::print_signed_in(&session);
        }

        Commands::Whoami => {
            let session = SessionStore::new(config.store_path)
                .current_session()
                .context("get current session")?;

            ui::print_current(&session);
        }

        Commands::Sessions => {
            let store = SessionStore::new(config.store_path)
                .load()
                .context("read session store")?;

            ui::print_sessions(&store.sessions, &store.current);
        }
    }

    Ok(())
}
