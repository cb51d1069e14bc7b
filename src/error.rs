use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("daemon has been stopped")]
    AlreadyStopped,
    #[error("no tokio runtime available to run the daemon")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("error launching daemon: {0}")]
    Launch(#[source] io::Error),
    #[error("error killing daemon: {0}")]
    Kill(#[source] nix::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    pub(crate) fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// True if this error was returned because the daemon is permanently stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self.0, ErrorKind::AlreadyStopped)
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
