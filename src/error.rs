use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not draw a collision-free token set after {attempts} attempts")]
    TokenGeneration { attempts: usize },

    #[error("registration lost {attempts} consecutive compare-and-swap races")]
    RegistrationContended { attempts: usize },
}
