use std::convert::From;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::result;

/// StatusCode describes various failure modes of building or reading a db
/// image.
#[derive(Clone, Debug, PartialEq)]
#[allow(dead_code)]
pub enum StatusCode {
    OK,

    CompressionFailed,
    Corruption,
    InvalidArgument,
    InvalidState,
    IOError,
    MphBuildFailed,
    OutOfMemory,
}

/// Status encapsulates a `StatusCode` and an error message. It can be
/// displayed, and also implements `Error`.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub err: String,
}

impl Default for Status {
    fn default() -> Status {
        Status {
            code: StatusCode::OK,
            err: String::new(),
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter) -> result::Result<(), fmt::Error> {
        fmt.write_str(&self.err)
    }
}

impl Error for Status {
    fn description(&self) -> &str {
        &self.err
    }
}

impl Status {
    pub fn new(code: StatusCode, msg: &str) -> Status {
        let err = if msg.is_empty() {
            format!("{:?}", code)
        } else {
            format!("{:?}: {}", code, msg)
        };
        Status { code, err }
    }
    pub fn annotate<S: AsRef<str>>(self, msg: S) -> Status {
        Status {
            code: self.code,
            err: format!("{}: {}", msg.as_ref(), self.err),
        }
    }
}

/// The crate's result type.
pub type Result<T> = result::Result<T, Status>;

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Status {
        let c = match e.kind() {
            io::ErrorKind::InvalidData => StatusCode::Corruption,
            io::ErrorKind::InvalidInput => StatusCode::InvalidArgument,
            io::ErrorKind::UnexpectedEof => StatusCode::Corruption,
            _ => StatusCode::IOError,
        };

        Status::new(c, &e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_annotate() {
        let s = Status::new(StatusCode::Corruption, "truncated toc");
        assert_eq!(s.err, "Corruption: truncated toc");
        let s = s.annotate("key2values");
        assert_eq!(s.code, StatusCode::Corruption);
        assert_eq!(s.err, "key2values: Corruption: truncated toc");
    }

    #[test]
    fn test_status_from_io() {
        let s: Status = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(s.code, StatusCode::Corruption);
    }
}
