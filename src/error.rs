use std::io;

/// Errors raised by the diff/patch codec and the series stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A structural invariant of the patch was violated.
    #[error("corrupt patch: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unsupported series type {0}")]
    UnsupportedSeriesType(u32),

    /// The series reader was driven in the wrong order by its caller.
    #[error("series reader used out of sequence: {0}")]
    OutOfSequence(&'static str),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) => Error::Io(io),
            other => Error::Corrupt(format!("undecodable message: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
