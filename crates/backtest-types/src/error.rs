use thiserror::Error;

/// Errors raised by the declarative backtesting core.
///
/// Variant groups follow the propagation policy in the spec: configuration
/// and data errors fail a run before the hot loop starts, DSL type errors
/// fail at parse/normalize time, and runtime invariant violations abort
/// immediately. `RejectedOrder` and `TerminalStop` are not failures — the
/// engine surfaces them as ordinary run outcomes, not through this enum.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("configuration error in {field}: {message} (expected: {expected})")]
    Configuration {
        field: String,
        message: String,
        expected: String,
    },

    #[error("data error for {symbol}/{tf}: {message}")]
    Data {
        symbol: String,
        tf: String,
        message: String,
    },

    #[error("DSL type error at {location}: {message}")]
    DslType { location: String, message: String },

    #[error("runtime invariant violated: {0}")]
    RuntimeInvariant(String),
}

impl BacktestError {
    pub fn configuration(
        field: impl Into<String>,
        message: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
            expected: expected.into(),
        }
    }

    pub fn data(symbol: impl Into<String>, tf: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Data {
            symbol: symbol.into(),
            tf: tf.into(),
            message: message.into(),
        }
    }

    pub fn dsl_type(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DslType {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn runtime_invariant(message: impl Into<String>) -> Self {
        Self::RuntimeInvariant(message.into())
    }
}
