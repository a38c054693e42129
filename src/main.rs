// ========================================================================================
//
//                       disrate: the command line front end
//
// ========================================================================================
//
// Two read-only views of the library:
//
// 1.  `layout` loads a model structure and prints the flat variable vector, one line
//     per position, so an optimizer's output can be read back by name.
//
// 2.  `forward` loads a forward run (constant rates and a list of integrand requests),
//     evaluates every request in parallel and prints one line per request. A failed
//     request prints `NA` and makes the command exit with status 1.
//
// Logging goes to stderr and is controlled with `RUST_LOG`.

use clap::{Parser, Subcommand};
use disrate::config::{ConfigError, ForwardConfig};
use disrate::forward::ForwardIntegrand;
use disrate::pack::{ModelStructure, PackError, VariablePacker};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use thiserror::Error;

#[derive(Parser)]
#[command(
    name = "disrate",
    version,
    about = "Disease-rate forward model and variable layout",
    long_about = "Evaluates integrands of the two-compartment disease model from constant rates, \
                 and prints the layout of the flat variable vector for a model structure."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the variable layout of a model structure
    #[command(about = "Print every position of the flat variable vector")]
    Layout {
        /// Path to the model structure TOML file
        structure: PathBuf,
    },

    /// Evaluate integrands for a forward run
    #[command(about = "Evaluate the requests of a forward run TOML file")]
    Forward {
        /// Path to the forward run TOML file
        config: PathBuf,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("Failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("{failed} of {total} requests failed")]
    FailedRequests { failed: usize, total: usize },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Layout { structure } => layout_command(&structure),
        Commands::Forward { config } => forward_command(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn layout_command(structure_path: &Path) -> Result<(), CliError> {
    let structure = ModelStructure::load(structure_path)?;
    let packer = VariablePacker::new(&structure)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "# {} variables", packer.size())?;
    for index in 0..packer.size() {
        let label = packer.variable_label(index)?;
        writeln!(out, "{index}\t{label}")?;
    }
    out.flush()?;
    Ok(())
}

fn forward_command(config_path: &Path) -> Result<(), CliError> {
    let config = ForwardConfig::load(config_path)?;
    let rates = config.rates.to_rate_set();
    let requests = config.requests();
    let forward = ForwardIntegrand::new(config.options);

    log::info!("Evaluating {} requests", requests.len());
    let results = forward.evaluate_batch(&rates, &requests, config.abs_tol);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "integrand\tage_lower\tage_upper\ttime_lower\ttime_upper\tvalue")?;
    let mut failed = 0;
    for (request, result) in requests.iter().zip(results) {
        let value = match result {
            Ok(value) => value.to_string(),
            Err(e) => {
                failed += 1;
                eprintln!("Error: {}: {}", request.integrand, e);
                "NA".to_string()
            }
        };
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}",
            request.integrand,
            request.age_lower,
            request.age_upper,
            request.time_lower,
            request.time_upper,
            value
        )?;
    }
    out.flush()?;
    if failed > 0 {
        return Err(CliError::FailedRequests {
            failed,
            total: requests.len(),
        });
    }
    Ok(())
}
