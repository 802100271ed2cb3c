use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("config error: {0}")]
    Config(String),
    #[error("control error: {0}")]
    Control(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("vm runtime error: {0}")]
    Runtime(String),
}

/// Failures of a single launch sequence. The display text is what the client
/// sees after `Errored: `.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0}")]
    Fetch(String),
    #[error("module fetch returned {status} {status_text}")]
    Status { status: u16, status_text: String },
    #[error("failed to read module body: {0}")]
    Body(String),
    #[error("Incorrect response MIME type. Expected 'application/wasm', got '{found}'.")]
    MimeType { found: String },
    #[error("{0}")]
    Instantiate(String),
    #[error("vm thread exited before the module was instantiated")]
    VmGone,
}
