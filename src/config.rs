// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TOML configuration for the keeper binary
//!
//! ```toml
//! path = "/usr/local/bin/proxy"
//! args = ["-listen", "127.0.0.1:8080"]
//! dir = "/var/lib/proxy"
//! env = ["LOG_LEVEL=debug"]
//! inherit_env = true
//! graceful_timeout_ms = 5000
//!
//! [backoff]
//! healthy_secs = 10
//! min_attempts = 3
//! max_wait_secs = 60
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::command::CommandTemplate;
use crate::procs::{Backoff, Builder, Supervisor, DEFAULT_HEALTHY, DEFAULT_MAX_WAIT};
use crate::procs::{DEFAULT_GRACEFUL_TIMEOUT, DEFAULT_MIN_ATTEMPTS};
use crate::Error;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeeperConfig {
    /// Executable to run
    pub path: PathBuf,
    /// Arguments, not including argv[0]
    #[serde(default)]
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// `KEY=VALUE` entries, in order
    #[serde(default)]
    pub env: Vec<String>,
    /// Copy the keeper's environment ahead of `env`
    #[serde(default)]
    pub inherit_env: bool,
    pub graceful_timeout_ms: Option<u64>,
    /// Identity token, normally supplied on the command line instead
    pub token: Option<String>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub healthy_secs: u64,
    pub min_attempts: u32,
    pub max_wait_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            healthy_secs: DEFAULT_HEALTHY.as_secs(),
            min_attempts: DEFAULT_MIN_ATTEMPTS,
            max_wait_secs: DEFAULT_MAX_WAIT.as_secs(),
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Backoff {
            healthy: Duration::from_secs(config.healthy_secs),
            min_attempts: config.min_attempts,
            max_wait: Duration::from_secs(config.max_wait_secs),
        }
    }
}

impl KeeperConfig {
    pub fn from_toml(input: &str) -> Result<Self, Error> {
        Ok(toml::from_str(input)?)
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

        Self::from_toml(&contents)
    }

    pub fn command(&self) -> Result<CommandTemplate, Error> {
        let mut command = CommandTemplate::new(&self.path).args(&self.args);

        if let Some(dir) = &self.dir {
            command = command.current_dir(dir);
        }

        if self.inherit_env {
            command = command.inherit_env();
        }

        for entry in &self.env {
            let (key, value) = match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => (key, value),
                _ => return Err(format!("env entry is not KEY=VALUE: {}", entry).into()),
            };

            command = command.env(key, value);
        }

        Ok(command)
    }

    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACEFUL_TIMEOUT)
    }

    /// A supervisor builder for this configuration, `token` takes precedence over the configured one
    pub fn builder(&self, token: Option<String>) -> Result<Builder, Error> {
        let token = token
            .or_else(|| self.token.clone())
            .ok_or("an identity token is required")?;

        Ok(Supervisor::builder(self.command()?, token)
            .graceful_timeout(self.graceful_timeout())
            .backoff(Backoff::from(&self.backoff)))
    }
}
