// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod backoff;
mod launcher;
mod supervisor;

pub use backoff::{Attempts, Backoff, DEFAULT_HEALTHY, DEFAULT_MAX_WAIT, DEFAULT_MIN_ATTEMPTS};
pub use launcher::{launch, StdIoConf};
pub use supervisor::{Builder, State, Supervisor, DEFAULT_GRACEFUL_TIMEOUT};

/// Environment variable carrying the identity token into every launch of the daemon
pub const ENV_IDENTITY_TOKEN: &str = "CONNECT_PROXY_TOKEN";
