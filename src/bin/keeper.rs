// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{value_parser, Arg, ArgMatches, Command};
use futures::future::FutureExt;
use futures::{pin_mut, select};
use tokio::runtime;
use tokio::signal::{self, unix::SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vermilion_keeper::procs::Builder;
use vermilion_keeper::{CommandTemplate, Error, KeeperConfig, Supervisor};

const CONFIG: &str = "config";
const TOKEN: &str = "token";
const GRACEFUL_TIMEOUT: &str = "graceful-timeout";
const PROGRAM: &str = "program";

fn cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new(CONFIG)
                .short('c')
                .long(CONFIG)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("TOML file describing the daemon to keep alive"),
        )
        .arg(
            Arg::new(TOKEN)
                .short('t')
                .long(TOKEN)
                .env("KEEPER_TOKEN")
                .hide_env_values(true)
                .value_name("TOKEN")
                .help("identity token passed to the daemon, overrides the config file"),
        )
        .arg(
            Arg::new(GRACEFUL_TIMEOUT)
                .long(GRACEFUL_TIMEOUT)
                .value_name("MILLIS")
                .value_parser(value_parser!(u64))
                .help("time to wait after interrupting the daemon before killing it"),
        )
        .arg(
            Arg::new(PROGRAM)
                .value_name("PROGRAM")
                .num_args(1..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .value_parser(value_parser!(OsString))
                .conflicts_with(CONFIG)
                .required_unless_present(CONFIG)
                .help("program and arguments to run, inherits the keeper's environment"),
        )
}

fn main() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli().get_matches();
    let supervisor = builder(&args)?.build();

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(supervisor))
}

fn builder(args: &ArgMatches) -> Result<Builder, Error> {
    let token = args.get_one::<String>(TOKEN).cloned();

    let mut builder = match args.get_one::<PathBuf>(CONFIG) {
        Some(path) => KeeperConfig::read(path)?.builder(token)?,
        None => {
            let mut program = args
                .get_many::<OsString>(PROGRAM)
                .ok_or("a config file or program is required")?;
            let path = program.next().ok_or("a program is required")?;
            let command = CommandTemplate::new(path).args(program).inherit_env();
            let token = token.ok_or("an identity token is required, see --token")?;

            Supervisor::builder(command, token)
        }
    };

    if let Some(millis) = args.get_one::<u64>(GRACEFUL_TIMEOUT) {
        builder = builder.graceful_timeout(Duration::from_millis(*millis));
    }

    Ok(builder)
}

/// Keep the daemon running until the keeper is asked to exit
async fn run(supervisor: Supervisor) -> Result<(), Error> {
    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;

    supervisor.start()?;
    info!(path = %supervisor.command().path().display(), "keeper started");

    let interrupt = signal::ctrl_c().fuse();
    let terminate = sigterm.recv().fuse();
    pin_mut!(interrupt, terminate);

    select! {
        res = interrupt => res?,
        _ = terminate => (),
    }

    info!("stopping daemon");
    supervisor.stop().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn test_program_args() {
        let args = cli()
            .try_get_matches_from(["keeper", "--token", "secret", "/bin/daemon", "-v", "--flag"])
            .expect("bad args");
        let supervisor = builder(&args).expect("no builder").build();

        let argv = supervisor.command().get_args();
        assert_eq!(argv, &["/bin/daemon", "-v", "--flag"]);
    }

    #[test]
    fn test_token_required() {
        let args = cli()
            .try_get_matches_from(["keeper", "/bin/daemon"])
            .expect("bad args");

        if std::env::var_os("KEEPER_TOKEN").is_none() {
            assert!(builder(&args).is_err());
        }
    }

    #[test]
    fn test_config_or_program_required() {
        assert!(cli().try_get_matches_from(["keeper"]).is_err());
        assert!(cli()
            .try_get_matches_from(["keeper", "-c", "keeper.toml", "/bin/daemon"])
            .is_err());
    }
}
