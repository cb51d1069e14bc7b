// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::process::Stdio;

use nix::sys::signal::{self, SigHandler, Signal};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::command::{CommandTemplate, Sink};
use crate::procs::ENV_IDENTITY_TOKEN;

/// Where the daemon's stdio should be sent
#[derive(Clone, Debug, Default)]
pub struct StdIoConf {
    pub stdout: Sink,
    pub stderr: Sink,
}

/// Launch a new instance of the daemon
///
/// Rules:
/// - a new `Command` is built for every launch, the template is only read
/// - the environment is exactly the template's, with the identity token appended
/// - stdin is never shared with the daemon
/// - SIGINT starts out with its default action, even if the keeper ignores it
/// - the token is never logged
pub fn launch(template: &CommandTemplate, token: &str, stdio: &StdIoConf) -> io::Result<Child> {
    let mut cmd = Command::new(template.path());

    // argv[0] must always be present, default it to the executable
    match template.get_args().split_first() {
        Some((arg0, args)) => {
            cmd.arg0(arg0).args(args);
        }
        None => {
            cmd.arg0(template.path());
        }
    }

    if let Some(dir) = template.dir() {
        cmd.current_dir(dir);
    }

    cmd.env_clear()
        .envs(template.get_env().iter().map(|(k, v)| (k, v)))
        .env(ENV_IDENTITY_TOKEN, token)
        .stdin(Stdio::null())
        .stdout(stdio.stdout.to_stdio()?)
        .stderr(stdio.stderr.to_stdio()?)
        .kill_on_drop(true);

    // an ignored disposition survives exec, which would defeat the graceful stop
    unsafe {
        cmd.pre_exec(|| {
            signal::signal(Signal::SIGINT, SigHandler::SigDfl)
                .map(drop)
                .map_err(io::Error::from)
        });
    }

    debug!(
        path = %template.path().display(),
        args = ?template.get_args().get(1..).unwrap_or_default(),
        "starting daemon"
    );

    cmd.spawn()
}
