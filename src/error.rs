use std::io;

/// The error kinds the engine distinguishes (spec.md §7).
///
/// Every variant affects only the exit status of the command that raised
/// it; the shell process itself keeps running (the shell only exits under
/// `-e`, on `HUP`, or on explicit `exit`/EOF at top level — see the driver).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fork exhausted after {attempts} attempts: {source}")]
    ForkExhaustion { attempts: u32, source: io::Error },

    #[error("{name}: command not found")]
    ExecNotFound { name: String },

    #[error("{name}: not executable")]
    ExecNotExecutable { name: String },

    #[error("redirection failed: {source}")]
    RedirectionFailure { source: io::Error },

    #[error("{name}: readonly variable")]
    ReadonlyAssign { name: String },

    #[error("restricted: {what}")]
    RestrictedViolation { what: String },

    #[error("ambiguous job spec: {spec}")]
    AmbiguousJobSpec { spec: String },

    #[error("resource cap exceeded: {what}")]
    ResourceCap { what: &'static str },

    #[error("interrupted by signal {signal}")]
    SignalInterruption { signal: i32 },

    #[error("parse error: {message}")]
    ParserFailure { message: String },
}

impl EngineError {
    /// The exit status a command takes when it fails with this error
    /// (spec.md §7 / GLOSSARY: 126/127 reserved, 128+n for signal-n).
    pub fn exit_status(&self) -> i32 {
        match self {
            EngineError::ForkExhaustion { .. } => 1,
            EngineError::ExecNotFound { .. } => 127,
            EngineError::ExecNotExecutable { .. } => 126,
            EngineError::RedirectionFailure { .. } => 1,
            EngineError::ReadonlyAssign { .. } => 1,
            EngineError::RestrictedViolation { .. } => 1,
            EngineError::AmbiguousJobSpec { .. } => 1,
            EngineError::ResourceCap { .. } => 1,
            EngineError::SignalInterruption { signal } => 128 + signal,
            EngineError::ParserFailure { .. } => 2,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
