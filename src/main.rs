// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::{Parser, Subcommand};
use quota_dirlock::commands::simulate::SimulateCommand;
use quota_dirlock::config::{QuotaLockConfig, default_config_path};
use quota_dirlock::error::{Result, format_error_chain, get_exit_code};
use quota_dirlock::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quota-dirlock")]
#[command(author, version, about = "Directory lock arbitration for per-origin quota storage", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to <config dir>/quota-dirlock/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a lock scenario and show how requests were arbitrated
    #[command(long_about = "Replay a lock scenario and show how requests were arbitrated

The scenario is a TOML file with [[lock]] tables declaring locks and
[[step]] tables naming an action (acquire, acquire-immediately, release,
invalidate) and the lock it applies to.")]
    Simulate {
        /// Scenario file to replay
        scenario: PathBuf,

        /// Output the step log and final lock states as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    logging::setup_logger(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match QuotaLockConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", format_error_chain(&e));
            std::process::exit(get_exit_code(&e));
        }
    };

    let result: Result<()> = match &cli.command {
        Commands::Simulate { scenario, json } => {
            SimulateCommand::new(&config).and_then(|command| command.execute(scenario, *json))
        }
    };

    if let Err(e) = result {
        eprintln!("{}", format_error_chain(&e));
        std::process::exit(get_exit_code(&e));
    }
}
