//! The `secsigner` binary.
//!
//! `run` starts the signer and keeps it running until interrupted. `exec`
//! starts it in-process, applies a batch of JSON requests and prints one
//! JSON result per request.
#[macro_use]
extern crate log;

use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
    process,
};

use clap::{Parser, Subcommand};
use serde::Serialize;

use secsigner::{
    commons::error::ErrorResponse,
    config::Config,
    constants::{SIGNER_APP, SIGNER_DEFAULT_CONFIG_FILE, SIGNER_ENV_DATA_DIR},
    handlers::{Request, Response},
    server::{self, SHUTDOWN_GRACE},
};

#[derive(Debug, Parser)]
#[command(name = "secsigner", version, about = SIGNER_APP)]
struct Options {
    /// Path to the config file
    #[arg(short, long, value_name = "FILE", default_value = SIGNER_DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the data directory from the config file
    #[arg(short, long, value_name = "DIR", env = SIGNER_ENV_DATA_DIR)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the signer until interrupted
    Run,

    /// Apply a JSON array of requests and print the results
    Exec {
        /// File with the requests, '-' for stdin
        #[arg(short, long, value_name = "FILE", default_value = "-")]
        file: String,
    },

    /// Print all tokens, keys and certificates as JSON
    List,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum Outcome {
    Ok(Response),
    Error(ErrorResponse),
}

impl From<Result<Response, ErrorResponse>> for Outcome {
    fn from(res: Result<Response, ErrorResponse>) -> Self {
        match res {
            Ok(response) => Outcome::Ok(response),
            Err(e) => Outcome::Error(e),
        }
    }
}

fn error(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    process::exit(1);
}

fn read_requests(file: &str) -> Result<Vec<Request>, String> {
    let mut content = String::new();
    if file == "-" {
        io::stdin()
            .read_to_string(&mut content)
            .map_err(|e| format!("Cannot read requests from stdin: {}", e))?;
    } else {
        content = fs::read_to_string(file).map_err(|e| format!("Cannot read requests from '{}': {}", file, e))?;
    }
    serde_json::from_str(&content).map_err(|e| format!("Cannot parse requests: {}", e))
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error(format!("Cannot serialize result: {}", e)),
    }
}

async fn execute(config: Config, command: Command) -> Result<(), String> {
    let service = server::start(&config).map_err(|e| format!("{} failed to start: {}", SIGNER_APP, e))?;
    let handle = service.handle();

    match command {
        Command::Run => {
            info!("{} running with data dir {}", SIGNER_APP, config.data_dir.display());
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| format!("Cannot listen for interrupt: {}", e))?;
        }
        Command::Exec { file } => {
            for request in read_requests(&file)? {
                print_json(&Outcome::from(handle.call(request).await));
            }
        }
        Command::List => {
            print_json(&Outcome::from(handle.call(Request::ListTokens).await));
        }
    }

    service.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn main() {
    let options = Options::parse();

    let mut config = match Config::create(&options.config) {
        Ok(config) => config,
        Err(e) => error(e),
    };
    if let Some(data_dir) = options.data_dir {
        config.data_dir = data_dir;
    }

    if let Err(e) = config.init_logging() {
        error(e);
    }
    info!("{} uses configuration file: {}", SIGNER_APP, options.config.display());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => error(format!("Cannot start runtime: {}", e)),
    };

    if let Err(e) = runtime.block_on(execute(config, options.command)) {
        error(e);
    }
}
