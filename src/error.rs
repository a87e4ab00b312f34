use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    // Configuration errors
    #[error("Failed to load config file '{path}': {source}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    // State errors
    #[error("Failed to save state to '{path}': {source}")]
    StateSave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load state from '{path}': {source}")]
    StateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // RSI fetch errors
    #[error("Page not found: {url}")]
    PageNotFound { url: String },

    #[error("RSI handle not found: {handle}")]
    HandleNotFound { handle: String },

    #[error("Fetch failed: {message}")]
    Fetch { message: String },

    // Verification errors
    #[error("Handle '{handle}' is already verified by user {owner}")]
    HandleConflict { handle: String, owner: String },

    #[error("No verification record for user {user_id}")]
    NotVerified { user_id: String },

    // Discord errors
    #[error("Discord API error: {message}")]
    Discord { message: String },

    #[error("Guild not found: {id}")]
    GuildNotFound { id: String },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BotError {
    /// Whether this error means the remote handle no longer exists.
    /// Not-found is terminal for a handle: it is never cached and never
    /// retried as transient.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BotError::HandleNotFound { .. } | BotError::PageNotFound { .. }
        )
    }
}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        BotError::Discord {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::Fetch {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

use poise::serenity_prelude as serenity;
