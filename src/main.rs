use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use riftgate::config::{ClientConfig, ClientTls, ServerConfig, ServerTls};
use riftgate::{DEFAULT_CODE_LENGTH, DEFAULT_HOST, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "riftgate")]
#[command(about = "Send files between machines through a rendezvous relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Rendezvous server host
    #[arg(long, global = true, env = "RIFTGATE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Rendezvous server port (also the port `relay` listens on)
    #[arg(short, long, global = true, env = "RIFTGATE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// PEM file with the CA certificate(s) to trust instead of the system roots
    #[arg(long, global = true, env = "RIFTGATE_CA", conflicts_with = "insecure")]
    ca: Option<PathBuf>,

    /// Accept any server certificate
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or folder
    Send {
        /// Path to the file or folder to send
        file_path: PathBuf,

        /// Password the receiver must present
        #[arg(long)]
        password: Option<String>,
    },
    /// Receive a file or folder
    Receive {
        /// Code shown by the sender (will prompt if not provided)
        code: Option<String>,

        /// Password set by the sender
        #[arg(long)]
        password: Option<String>,

        /// Directory to write the payload into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Run the rendezvous server
    Relay {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// PEM certificate chain
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Serve a freshly generated self-signed certificate
        #[arg(long, conflicts_with_all = ["cert", "key"])]
        self_signed: bool,

        /// Length of issued codes
        #[arg(long, default_value_t = DEFAULT_CODE_LENGTH)]
        code_length: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let client = ClientConfig {
        host: cli.host,
        port: cli.port,
        tls: ClientTls {
            ca_path: cli.ca,
            insecure: cli.insecure,
        },
    };

    match cli.command {
        Commands::Send {
            file_path,
            password,
        } => {
            riftgate::commands::send::run(&file_path, password, &client).await?;
        }
        Commands::Receive {
            code,
            password,
            output,
        } => {
            riftgate::commands::receive::run(code, password, &output, &client).await?;
        }
        Commands::Relay {
            bind,
            cert,
            key,
            self_signed,
            code_length,
        } => {
            let config = ServerConfig {
                bind,
                port: client.port,
                code_length,
                tls: ServerTls {
                    cert_path: cert,
                    key_path: key,
                    self_signed,
                },
            };
            riftgate::commands::relay::run(config).await?;
        }
    }

    Ok(())
}
