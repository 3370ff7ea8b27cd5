use std::fmt;
use std::io;

use thiserror::Error;

/// Classification of an NNTP failure, derived from the reply status code for
/// command errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    ServiceUnavailable,
    Authentication,
    AuthRequired,
    EncryptionRequired,
    NoSuchGroup,
    NoGroupSelected,
    NoSuchArticle,
    PostingFailed,
    TransferFailed,
    ServerError,
    CommandFailed,
    Io,
    PoolNotOnline,
    PoolClosed,
    Config,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 502 => ErrorKind::ServiceUnavailable,
            481 | 482 => ErrorKind::Authentication,
            480 => ErrorKind::AuthRequired,
            483 => ErrorKind::EncryptionRequired,
            411 => ErrorKind::NoSuchGroup,
            412 => ErrorKind::NoGroupSelected,
            420..=423 | 430 => ErrorKind::NoSuchArticle,
            440 | 441 => ErrorKind::PostingFailed,
            435..=437 => ErrorKind::TransferFailed,
            500 | 501 | 503 | 504 => ErrorKind::ServerError,
            _ => ErrorKind::CommandFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "NNTP_CONNECTION_ERROR",
            ErrorKind::Protocol => "NNTP_PROTOCOL_ERROR",
            ErrorKind::ServiceUnavailable => "NNTP_SERVICE_UNAVAILABLE",
            ErrorKind::Authentication => "NNTP_AUTH_ERROR",
            ErrorKind::AuthRequired => "NNTP_AUTH_REQUIRED",
            ErrorKind::EncryptionRequired => "NNTP_ENCRYPTION_REQUIRED",
            ErrorKind::NoSuchGroup => "NNTP_NO_SUCH_GROUP",
            ErrorKind::NoGroupSelected => "NNTP_NO_GROUP_SELECTED",
            ErrorKind::NoSuchArticle => "NNTP_NO_SUCH_ARTICLE",
            ErrorKind::PostingFailed => "NNTP_POSTING_FAILED",
            ErrorKind::TransferFailed => "NNTP_TRANSFER_FAILED",
            ErrorKind::ServerError => "NNTP_SERVER_ERROR",
            ErrorKind::CommandFailed => "NNTP_COMMAND_FAILED",
            ErrorKind::Io => "NNTP_IO_ERROR",
            ErrorKind::PoolNotOnline => "NNTP_POOL_NOT_ONLINE",
            ErrorKind::PoolClosed => "NNTP_POOL_CLOSED",
            ErrorKind::Config => "NNTP_CONFIG_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NntpError {
    #[error("NNTP_CONNECTION_ERROR: {message}: {source}")]
    Connection {
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("NNTP_PROTOCOL_ERROR ({status}): {message}")]
    Protocol { status: u16, message: String },

    #[error("{kind} ({status} {text}): {command} failed")]
    Command {
        kind: ErrorKind,
        status: u16,
        text: String,
        command: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("pool not online")]
    PoolNotOnline,

    #[error("pool closed")]
    PoolClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NntpError>;

impl NntpError {
    pub fn connection(message: impl Into<String>, source: io::Error) -> Self {
        NntpError::Connection {
            message: message.into(),
            source,
        }
    }

    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        NntpError::Protocol {
            status,
            message: message.into(),
        }
    }

    /// Builds a command error classified from the reply status.
    pub fn command(command: impl Into<String>, status: u16, text: impl Into<String>) -> Self {
        NntpError::Command {
            kind: ErrorKind::from_status(status),
            status,
            text: text.into(),
            command: command.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NntpError::Connection { .. } => ErrorKind::Connection,
            NntpError::Protocol { .. } => ErrorKind::Protocol,
            NntpError::Command { kind, .. } => *kind,
            NntpError::Io(_) => ErrorKind::Io,
            NntpError::PoolNotOnline => ErrorKind::PoolNotOnline,
            NntpError::PoolClosed => ErrorKind::PoolClosed,
            NntpError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            NntpError::Protocol { status, .. } | NntpError::Command { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        match self {
            NntpError::Command { kind, text, .. } => {
                matches!(kind, ErrorKind::Authentication | ErrorKind::AuthRequired)
                    || text.to_ascii_lowercase().contains("authentication failed")
            }
            NntpError::Protocol { message, .. } => {
                message.to_ascii_lowercase().contains("authentication failed")
            }
            _ => false,
        }
    }

    pub fn is_no_such_article(&self) -> bool {
        self.kind() == ErrorKind::NoSuchArticle
    }

    /// Raw socket failures and "service unavailable" replies, which are worth
    /// retrying on a fresh connection.
    pub fn is_transient(&self) -> bool {
        match self {
            NntpError::Io(err) => is_transient_io(err),
            NntpError::Connection { source, .. } => is_transient_io(source),
            NntpError::Command { status, .. } => matches!(status, 400 | 502),
            _ => false,
        }
    }

    /// True for errors that never reached the classification layer.
    pub fn is_raw(&self) -> bool {
        matches!(self, NntpError::Io(_))
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}

/// `io::Error` is not `Clone`, so copies keep the kind and message only.
impl Clone for NntpError {
    fn clone(&self) -> Self {
        fn copy_io(e: &io::Error) -> io::Error {
            io::Error::new(e.kind(), e.to_string())
        }
        match self {
            NntpError::Connection { message, source } => NntpError::Connection {
                message: message.clone(),
                source: copy_io(source),
            },
            NntpError::Protocol { status, message } => NntpError::Protocol {
                status: *status,
                message: message.clone(),
            },
            NntpError::Command {
                kind,
                status,
                text,
                command,
            } => NntpError::Command {
                kind: *kind,
                status: *status,
                text: text.clone(),
                command: command.clone(),
            },
            NntpError::Io(e) => NntpError::Io(copy_io(e)),
            NntpError::PoolNotOnline => NntpError::PoolNotOnline,
            NntpError::PoolClosed => NntpError::PoolClosed,
            NntpError::Config(message) => NntpError::Config(message.clone()),
        }
    }
}

impl From<NntpError> for io::Error {
    fn from(err: NntpError) -> Self {
        match err {
            NntpError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(430), ErrorKind::NoSuchArticle);
        assert_eq!(ErrorKind::from_status(423), ErrorKind::NoSuchArticle);
        assert_eq!(ErrorKind::from_status(411), ErrorKind::NoSuchGroup);
        assert_eq!(ErrorKind::from_status(481), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_status(480), ErrorKind::AuthRequired);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::ServiceUnavailable);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(299), ErrorKind::CommandFailed);
    }

    #[test]
    fn test_display() {
        let err = NntpError::command("BODY <a@b>", 430, "No such article");
        assert_eq!(
            err.to_string(),
            "NNTP_NO_SUCH_ARTICLE (430 No such article): BODY <a@b> failed"
        );
        assert!(err.is_no_such_article());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_auth_and_transient() {
        assert!(NntpError::command("AUTHINFO PASS <password>", 481, "rejected").is_auth_error());
        assert!(NntpError::command("X", 500, "authentication failed").is_auth_error());
        assert!(!NntpError::command("GROUP a", 411, "no such group").is_auth_error());

        assert!(NntpError::command("DATE", 400, "bye").is_transient());
        assert!(NntpError::Io(io::ErrorKind::UnexpectedEof.into()).is_transient());
        assert!(!NntpError::Io(io::ErrorKind::InvalidData.into()).is_transient());
    }
}
