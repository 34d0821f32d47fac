//! Error types for the dnsnameresolver plugin.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    /// Unexpected argument or block in the plugin's setup.
    #[error("dnsnameresolver: {0}")]
    Config(String),

    /// The binding feed could not be obtained.
    #[error("dnsnameresolver: unable to connect to the binding source: {0}")]
    Bootstrap(String),

    #[error("dnsnameresolver: watch controller already started")]
    AlreadyStarted,

    #[error("dnsnameresolver: shutdown already in progress")]
    ShutdownInProgress,
}
