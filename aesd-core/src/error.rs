use thiserror::Error;

#[derive(Error, Debug)]
pub enum AesdError {
    /// Accept, receive or send failure on a client socket
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Append, read or open failure on the shared log
    #[error("Storage error: {0}")]
    Storage(#[source] std::io::Error),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Connection limit reached: {active} active, limit {limit}")]
    ResourceExhausted { active: usize, limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task join failed: {0}")]
    Join(String),
}

impl AesdError {
    /// True for errors that must halt startup rather than one connection
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, AesdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_and_config_are_fatal() {
        assert!(AesdError::Setup("bind".into()).is_fatal());
        assert!(AesdError::Config("bad".into()).is_fatal());
        assert!(!AesdError::Storage(std::io::Error::other("disk")).is_fatal());
        assert!(!AesdError::Transport(std::io::Error::other("reset")).is_fatal());
        assert!(!AesdError::ResourceExhausted { active: 4, limit: 4 }.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = AesdError::ResourceExhausted {
            active: 8,
            limit: 8,
        };
        assert_eq!(err.to_string(), "Connection limit reached: 8 active, limit 8");

        let err = AesdError::Storage(std::io::Error::other("short write"));
        assert_eq!(err.to_string(), "Storage error: short write");
    }
}
