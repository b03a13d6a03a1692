/// Delivery failures of callback sinks. Never surfaced to clients.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The request could not be sent.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The destination answered with a non-success status.
    #[error("{url} responded with {status}: {body}")]
    Status {
        /// Destination.
        url: String,
        /// Response status.
        status: u16,
        /// Response body.
        body: String,
    },
    /// A configured header is not valid.
    #[error("invalid header: {0}")]
    Header(String),
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}
