#![forbid(unsafe_code)]

//! `vm-relay-ctl`: master-side CLI for a `vm-relay-agent`.
//!
//! Runs one agent operation and prints its result. `exec` streams the
//! remote process output live and exits with its exit code.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use vm_relay::protocol::{ExecuteRequest, ExecuteStreamFrame, ItemKind, DEFAULT_RPC_PORT};
use vm_relay::proxy::AgentClient;
use vm_relay::{AppError, Result};

/// Exit code reported when the remote process was killed for timing out.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Parser)]
#[command(
    name = "vm-relay-ctl",
    about = "Drive a vm-relay agent from the command line",
    version,
    long_about = None
)]
struct Cli {
    /// Agent host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Agent RPC port.
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    /// Seconds allowed for connecting.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a process on the agent's machine.
    Exec {
        /// Program to launch.
        executable: String,
        /// Arguments passed to the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Working directory of the process.
        #[arg(long)]
        cwd: Option<String>,
        /// Environment variable as `NAME=VALUE`; repeatable.
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Kill the process after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print a remote file to stdout, or save it locally.
    Read {
        /// Remote file path.
        path: String,
        /// Write to this local file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Upload a local file.
    Write {
        /// Local file to send.
        local: PathBuf,
        /// Remote destination path.
        remote: String,
        /// Fail if the remote file already exists.
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Create a remote directory and its parents.
    Mkdir {
        /// Remote directory path.
        path: String,
    },

    /// List remote paths matching a glob.
    Ls {
        /// Base directory followed by a glob, e.g. `/build/out/*.log`.
        pattern: String,
        /// Descend into subdirectories.
        #[arg(long, short)]
        recursive: bool,
    },
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<i32> {
    let client = AgentClient::connect(
        &args.host,
        args.port,
        Duration::from_secs(args.connect_timeout),
    )
    .await?;

    match args.command {
        Command::Exec {
            executable,
            args,
            cwd,
            env,
            timeout,
        } => {
            let request = ExecuteRequest {
                executable,
                arguments: Some(args),
                working_directory: cwd,
                environment: (!env.is_empty()).then(|| env.into_iter().collect::<HashMap<_, _>>()),
                timeout_seconds: timeout,
            };
            let outcome = client
                .execute(request, |frame| match frame {
                    ExecuteStreamFrame::Stdout(line) => println!("{line}"),
                    ExecuteStreamFrame::Stderr(line) => eprintln!("{line}"),
                })
                .await;
            match outcome {
                Ok(response) => Ok(response.exit_code),
                Err(AppError::Operation(failure)) if failure.is_timeout() => {
                    eprintln!("Error: {failure}");
                    Ok(TIMEOUT_EXIT_CODE)
                }
                Err(err) => Err(err),
            }
        }
        Command::Read { path, output } => {
            let contents = client.read_file(&path).await?;
            match output {
                Some(local) => std::fs::write(&local, &contents)?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&contents)?;
                    stdout.flush()?;
                }
            }
            Ok(0)
        }
        Command::Write {
            local,
            remote,
            no_overwrite,
        } => {
            let contents = std::fs::read(&local)?;
            client.write_file(&remote, contents, !no_overwrite).await?;
            println!("OK");
            Ok(0)
        }
        Command::Mkdir { path } => {
            client.create_directory(&path).await?;
            println!("OK");
            Ok(0)
        }
        Command::Ls { pattern, recursive } => {
            for item in client.enumerate(&pattern, recursive).await? {
                let marker = match item.kind {
                    ItemKind::Directory => "d",
                    ItemKind::File => "-",
                };
                println!("{marker} {}", item.relative_path);
            }
            Ok(0)
        }
    }
}
