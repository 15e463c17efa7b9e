use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution not supported for language: {0}")]
    LanguageDisabled(String),

    #[error("Language {0} is markup and is not executed")]
    NotExecutable(String),

    #[error("Empty source is not accepted for language: {0}")]
    EmptySource(String),

    #[error("Execution rejected: {running} running, {queued} queued")]
    AdmissionRejected { running: usize, queued: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}
