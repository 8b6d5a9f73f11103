use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(stws_presence::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(stws_presence::config::invalid))]
    Invalid { message: String },

    #[error("Expected {expected} for `{key}`")]
    #[diagnostic(
        code(stws_presence::config::wrong_type),
        help("check the value type of `{key}` in your config file")
    )]
    WrongType { key: String, expected: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
