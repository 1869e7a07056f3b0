// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#[macro_use]
extern crate scopeguard;

use clap::{Parser, Subcommand};
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::ExitCode;
use vmm::VmExitStatus;

mod utils;

pub enum MiniVmmExitCode {
    /// Success exit code.
    Ok = 0,
    /// Generic error exit code.
    GenericError = 1,
    /// Bad configuration for minivmm's resources.
    BadConfiguration = 153,
}

#[derive(Debug, thiserror::Error)]
enum CliInputError {
    #[error("Failed to open file: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("Failed to execute vmm: {0}")]
    Utils(#[from] utils::UtilsError),
    #[error("The guest crashed")]
    GuestCrashed,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("Unexpected input error: {0}")]
    CliError(#[from] CliInputError),
}

impl From<MainError> for ExitCode {
    fn from(value: MainError) -> Self {
        let exit_code = match value {
            MainError::CliError(e) => match e {
                CliInputError::FileIo(_) => MiniVmmExitCode::BadConfiguration,
                CliInputError::Utils(utils::UtilsError::CreateVmResources(_)) => {
                    MiniVmmExitCode::BadConfiguration
                }
                CliInputError::Utils(_) | CliInputError::GuestCrashed => {
                    MiniVmmExitCode::GenericError
                }
            },
        };
        ExitCode::from(exit_code as u8)
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Virtual Machine related operations
    #[command(subcommand)]
    Vm(VmOperation),
}

#[derive(Debug, Subcommand)]
enum VmOperation {
    /// Run guest VM
    Run {
        /// Path of the config file
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
}

fn run(cli: Cli) -> Result<(), CliInputError> {
    match cli.command {
        Command::Vm(op) => match op {
            VmOperation::Run { config } => {
                let config = read_to_string(config)?;
                match utils::run_vm_from_config(&config)? {
                    VmExitStatus::Crashed => Err(CliInputError::GuestCrashed),
                    _ => Ok(()),
                }
            }
        },
    }
}

fn main_exec() -> Result<(), MainError> {
    let cli = Cli::parse();
    let result = run(cli);
    if let Err(e) = result {
        log::error!("{}", e);
        return Err(MainError::CliError(e));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let result = main_exec();
    if let Err(err) = result {
        eprintln!("Error: {err:?}");
        ExitCode::from(err)
    } else {
        ExitCode::from(MiniVmmExitCode::Ok as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::utils::tempfile::TempFile;
    use std::io::Write;

    pub fn generate_config(image_path: &str, drive_path: &str) -> String {
        format!(
            r#"{{
                "boot-source": {{
                    "image_path": "{}"
                }},
                "drives": [
                    {{
                        "path_on_host": "{}",
                        "is_read_only": false
                    }}
                ],
                "machine-config": {{
                    "vcpu_count": 1,
                    "mem_size_mib": 128
                }}
            }}"#,
            image_path, drive_path,
        )
    }

    fn generate_config_file(image_path: &str, drive_path: &str) -> TempFile {
        let config = generate_config(image_path, drive_path);
        let config_file = TempFile::new().unwrap();
        config_file.as_file().write_all(config.as_bytes()).unwrap();
        config_file
    }

    #[test]
    fn test_vm_run_command() {
        let image_file = TempFile::new().unwrap();
        let drive_file = TempFile::new().unwrap();
        let config_file = generate_config_file(
            image_file.as_path().to_str().unwrap(),
            drive_file.as_path().to_str().unwrap(),
        );
        let args = vec![
            "minivmm",
            "vm",
            "run",
            "--config",
            config_file.as_path().to_str().unwrap(),
        ];
        let cli = Cli::parse_from(args);
        match cli.command {
            Command::Vm(VmOperation::Run { config }) => {
                assert_eq!(config, config_file.as_path());
            }
        }
    }

    #[test]
    fn test_exit_codes() {
        let missing = run(Cli::parse_from(vec![
            "minivmm",
            "vm",
            "run",
            "--config",
            "/invalid/path",
        ]));
        match missing {
            Err(CliInputError::FileIo(_)) => (),
            _ => unreachable!(),
        }

        // An empty image is a configuration error.
        let image_file = TempFile::new().unwrap();
        let drive_file = TempFile::new().unwrap();
        let config_file = generate_config_file(
            image_file.as_path().to_str().unwrap(),
            drive_file.as_path().to_str().unwrap(),
        );
        let err = run(Cli::parse_from(vec![
            "minivmm",
            "vm",
            "run",
            "--config",
            config_file.as_path().to_str().unwrap(),
        ]))
        .unwrap_err();
        assert_eq!(
            ExitCode::from(MainError::CliError(err)),
            ExitCode::from(MiniVmmExitCode::BadConfiguration as u8)
        );
    }
}
