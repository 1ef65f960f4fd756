use thiserror::Error;

/// Opening or reading a capture handle.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The OS refused raw capture for this process.
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two-byte status a capture child writes before its frame stream.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("capture child reported an unexpected error")]
    UnexpectedError,

    #[error("garbled handshake code {0:?}")]
    Garbled([u8; 2]),

    #[error("capture child closed its output before the handshake: {0}")]
    Truncated(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("no escalation method could be found")]
    NoEscalationMethod,

    #[error("no terminal could be found")]
    NoTerminal,

    #[error("could not construct elevation command: {0}")]
    Construct(String),

    #[error("could not execute elevation command (status {status}): {output}")]
    CommandFailed { status: String, output: String },

    #[error("could not spawn elevation command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Checking or downloading the offline geolocation database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database not in archive")]
    NotInArchive,

    #[error("invalid download URL: {0}")]
    InvalidUrl(String),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not open database: {0}")]
    Open(#[from] maxminddb::MaxMindDBError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while dispatching or issuing RPC calls.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("method not found: {0}")]
    NotFound(String),

    #[error("unprocessable call to {name}: {reason}")]
    Unprocessable { name: String, reason: String },

    /// A handler ran and returned an error.
    #[error("{0}")]
    Handler(String),

    /// The other side answered a call with an error.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("could not decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no message within heartbeat interval")]
    HeartbeatTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("method already bound: {0}")]
    Duplicate(String),
}

/// Why a `TraceDevice` request failed.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("user declined privilege escalation")]
    ConsentDenied,

    #[error("no answer to escalation request: {0}")]
    ConsentUnanswered(#[source] RpcError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error("capture still denied after {0} escalation attempt(s)")]
    StillDenied(u32),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
