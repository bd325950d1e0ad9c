use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use servergroup::{Config, ServerGroup, Snapshot};
use tracing_subscriber::EnvFilter;

use crate::signal::{self, SignalTo};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(FromArgs)]
#[argh(
    description = "Discover a group of servers and print their URLs whenever they change",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(
        option,
        short = 'c',
        long = "config",
        description = "read configuration from this file, YAML or JSON"
    )]
    config: PathBuf,

    #[argh(
        option,
        short = 'n',
        default = "\"default\".to_string()",
        description = "name of the server group, shown in logs"
    )]
    name: String,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,

    #[argh(
        option,
        default = "30",
        description = "seconds to wait for the first set of targets"
    )]
    ready_timeout: u64,
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!(
            "{} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
    }

    fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("--threads must be greater than 0".to_string());
        }

        Ok(())
    }

    fn load_config(&self) -> Result<Config, ExitCode> {
        Config::load(&self.config).map_err(|err| {
            error!(message = "Load config failed", path = ?self.config, %err);
            exitcode::CONFIG
        })
    }

    fn print_targets(&self, snapshot: &Snapshot) {
        println!("# {} version {}", self.name, snapshot.version());
        for target in snapshot.iter() {
            println!("{target}");
        }
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        if let Err(err) = self.validate() {
            eprintln!("{err}");
            return Err(exitcode::USAGE);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("servergroup-worker")
            .worker_threads(self.threads)
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                eprintln!("build tokio runtime failed, {err}");
                exitcode::OSERR
            })?;

        let levels = std::env::var("SERVERGROUP_LOG")
            .unwrap_or_else(|_| format!("servergroup={}", self.log_level));
        tracing_subscriber::fmt()
            .with_ansi(std::io::stdout().is_terminal())
            .with_env_filter(EnvFilter::new(levels))
            .init();

        runtime.block_on(async move {
            info!(
                message = "Start servergroup",
                name = %self.name,
                threads = self.threads,
                config = ?self.config,
            );

            let mut signals = signal::os_signals().map_err(|err| {
                error!(message = "Set up signal handlers failed", %err);
                exitcode::OSERR
            })?;

            let config = self.load_config()?;
            let group = Arc::new(ServerGroup::builder().name(self.name.clone()).build());
            group.apply_config(config).map_err(|err| {
                error!(message = "Apply config failed", %err);
                exitcode::CONFIG
            })?;

            tokio::select! {
                result = tokio::time::timeout(Duration::from_secs(self.ready_timeout), group.ready()) => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(message = "Server group stopped before ready", %err);
                        return Err(exitcode::SOFTWARE);
                    }
                    Err(_) => {
                        warn!(message = "No targets discovered yet", timeout = self.ready_timeout);
                    }
                },
                signal = signals.recv() => {
                    if signal == SignalTo::Shutdown {
                        group.cancel();
                        return Ok(());
                    }
                }
            }

            let mut printed = 0;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = group.targets();
                        if snapshot.version() != printed {
                            printed = snapshot.version();
                            self.print_targets(&snapshot);
                        }
                    }

                    signal = signals.recv() => match signal {
                        SignalTo::Reload => match self.load_config() {
                            Ok(config) => match group.apply_config(config) {
                                Ok(()) => info!(message = "Reload config successes"),
                                Err(err) => warn!(message = "Reload config failed", %err),
                            },
                            Err(_) => warn!(message = "Reload config failed"),
                        },
                        SignalTo::Shutdown => break,
                    }
                }
            }

            info!(message = "Shutdown signal received");
            group.cancel();

            Ok(())
        })
    }
}
