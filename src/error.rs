//! Crate-wide fatal error type, plus small per-component recoverable errors.

/// Fatal, unrecoverable daemon errors. Anything reaching [`main`](crate::main)
/// ends the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Configory(#[from] configory::Error),
    #[error("{0}")]
    EventLoop(#[from] calloop::Error),
    #[error("{0}")]
    DBus(#[from] zbus::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("mDNS discovery failed to start: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

impl<T> From<calloop::InsertError<T>> for Error {
    fn from(err: calloop::InsertError<T>) -> Self {
        Self::EventLoop(err.error)
    }
}

/// Errors produced while trying to refresh a [`WebSourceEngine`](crate::web_source::WebSourceEngine).
///
/// These are recoverable: a refresh failure just means the current location
/// stays stale until the next attempt.
#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("source is not active")]
    NotInitialized,
    #[error("locate URL is not reachable")]
    NetworkUnreachable,
    #[error("a query is already in flight")]
    Pending,
    #[error("failed to build query: {0}")]
    Query(#[from] crate::mozilla::QueryError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    HttpStatus(u16),
}

/// Errors surfaced by the NMEA line reader / sentence parser.
#[derive(thiserror::Error, Debug)]
pub enum NmeaError {
    #[error("malformed sentence: {0:?}")]
    Malformed(String),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("timestamp out of range")]
    BadTimestamp,
}

/// Errors surfaced by the ModemManager1 adapter in [`crate::dbus::modem_manager`].
#[derive(thiserror::Error, Debug)]
pub enum ModemError {
    #[error("D-Bus call failed: {0}")]
    DBus(#[from] zbus::Error),
}
