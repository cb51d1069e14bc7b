// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Keep a single daemon process alive
//!
//! ```no_run
//! use vermilion_keeper::{CommandTemplate, Supervisor};
//!
//! # async fn run() -> Result<(), vermilion_keeper::Error> {
//! let command = CommandTemplate::new("/usr/local/bin/proxy").arg("-listen=:8080");
//! let supervisor = Supervisor::new(command, "identity-token");
//!
//! supervisor.start()?;
//! // ... until the daemon is no longer wanted
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
mod error;
pub mod procs;

pub use command::{CommandTemplate, Sink};
pub use config::KeeperConfig;
pub use error::{Error, ErrorKind};
pub use procs::{Backoff, State, Supervisor};
