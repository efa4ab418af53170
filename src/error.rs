use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(Corruption, msg: "checksum mismatch in {}", block)
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fd.read(&mut buf))
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fd.read(&mut buf), "reading cfile {}", name)
/// ```
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// `file:line-no` of where the error originated, followed by a
/// formatted message.
#[derive(Clone, Debug)]
pub enum Error {
    /// Insert of a primary-key that is already live in the tablet.
    AlreadyPresent(String, String),
    /// Point lookup or mutation of a primary-key that is not present.
    KeyNotFound(String, String),
    /// Update of a column marked immutable.
    Immutable(String, String),
    /// API used with invalid arguments, unsupported projection, stale
    /// snapshot, and the like.
    InvalidInput(String, String),
    /// Scan or maintenance op cancelled via deadline or stop flag.
    Aborted(String, String),
    /// Write rejected because of backpressure or tablet shutdown.
    ServiceUnavailable(String, String),
    /// Wait on an MVCC snapshot or worker exceeded its deadline.
    TimedOut(String, String),
    /// Checksum mismatch, bad magic, or undecodable on-disk data.
    Corruption(String, String),
    IOError(String, String),
    InvalidFile(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            AlreadyPresent(p, m) => write!(f, "{} AlreadyPresent: {}", p, m),
            KeyNotFound(p, m) => write!(f, "{} KeyNotFound: {}", p, m),
            Immutable(p, m) => write!(f, "{} Immutable: {}", p, m),
            InvalidInput(p, m) => write!(f, "{} InvalidInput: {}", p, m),
            Aborted(p, m) => write!(f, "{} Aborted: {}", p, m),
            ServiceUnavailable(p, m) => write!(f, "{} ServiceUnavailable: {}", p, m),
            TimedOut(p, m) => write!(f, "{} TimedOut: {}", p, m),
            Corruption(p, m) => write!(f, "{} Corruption: {}", p, m),
            IOError(p, m) => write!(f, "{} IOError: {}", p, m),
            InvalidFile(p, m) => write!(f, "{} InvalidFile: {}", p, m),
            FailConvert(p, m) => write!(f, "{} FailConvert: {}", p, m),
            FailCbor(p, m) => write!(f, "{} FailCbor: {}", p, m),
            IPCFail(p, m) => write!(f, "{} IPCFail: {}", p, m),
            ThreadFail(p, m) => write!(f, "{} ThreadFail: {}", p, m),
            Fatal(p, m) => write!(f, "{} Fatal: {}", p, m),
        }
    }
}

impl error::Error for Error {}

impl Error {
    /// Whether a maintenance op hitting this error should log-and-yield
    /// rather than stop the tablet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ServiceUnavailable(_, _) | Error::TimedOut(_, _) | Error::Aborted(_, _)
        )
    }
}
