// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Description of the command a daemon runs, and where its output goes

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

/// An immutable description of a process to execute.
///
/// `args` follows the execv convention, the first entry is argv\[0\] and is not
/// passed as an argument. `env` is the complete environment of the child, the
/// keeper's own environment is not inherited unless copied in with
/// [`CommandTemplate::inherit_env`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    path: PathBuf,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl CommandTemplate {
    /// Create a template for `path`, argv\[0\] is set to the path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        Self {
            args: vec![path.clone().into_os_string()],
            path,
            dir: None,
            env: Vec::new(),
        }
    }

    /// Create a template with an explicit argv, which may be empty
    pub fn with_argv<P, I, S>(path: P, argv: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self {
            path: path.as_ref().to_path_buf(),
            args: argv.into_iter().map(|a| a.as_ref().to_owned()).collect(),
            dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Append an environment entry, entries are kept in insertion order
    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Append every variable from the current process environment
    pub fn inherit_env(mut self) -> Self {
        self.env.extend(std::env::vars_os());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get_env(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

/// Destination for one of the child's output streams
#[derive(Clone, Debug, Default)]
pub enum Sink {
    /// Share the keeper's own stream
    #[default]
    Inherit,
    /// Discard the output
    Null,
    /// Write to an already opened file, shared across every launch
    File(Arc<File>),
}

impl Sink {
    pub fn file(file: File) -> Self {
        Sink::File(Arc::new(file))
    }

    /// A fresh `Stdio` for a single launch
    pub(crate) fn to_stdio(&self) -> io::Result<Stdio> {
        match self {
            Sink::Inherit => Ok(Stdio::inherit()),
            Sink::Null => Ok(Stdio::null()),
            Sink::File(file) => file.try_clone().map(Stdio::from),
        }
    }
}
