//! Error taxonomy for the bridge.
//!
//! Two levels: [`ConversionError`] covers value-level marshaling failures
//! (a single script value refusing to become a native value, or vice
//! versa), while [`BridgeError`] covers operation-level failures (a whole
//! call, binding, or lookup going wrong). Script-facing entry points never
//! panic; they surface one of these and degrade.

use thiserror::Error;

/// Failure to convert a single value across the script/native boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("integer {value} out of range for {target}")]
    IntegerOverflow { value: i64, target: &'static str },

    #[error("null or dead object where {target} was required")]
    NullObject { target: &'static str },

    #[error("struct mismatch: expected {expected}")]
    StructMismatch { expected: String },

    #[error("enum {enum_name} has no entry {entry}")]
    UnknownEnumEntry { enum_name: String, entry: String },

    #[error("conversion failed: {message}")]
    Failed { message: String },
}

impl ConversionError {
    pub fn type_mismatch(expected: &'static str, actual: &'static str) -> Self {
        ConversionError::TypeMismatch { expected, actual }
    }

    pub fn integer_overflow(value: i64, target: &'static str) -> Self {
        ConversionError::IntegerOverflow { value, target }
    }

    pub fn null_object(target: &'static str) -> Self {
        ConversionError::NullObject { target }
    }

    pub fn struct_mismatch(expected: impl Into<String>) -> Self {
        ConversionError::StructMismatch {
            expected: expected.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ConversionError::Failed {
            message: message.into(),
        }
    }
}

/// Failure raised by script code running under a protected call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("script runtime error: {message}")]
    Runtime { message: String },

    #[error("bad argument #{index}: {message}")]
    BadArgument { index: usize, message: String },
}

impl ScriptError {
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime {
            message: message.into(),
        }
    }

    pub fn bad_argument(index: usize, message: impl Into<String>) -> Self {
        ScriptError::BadArgument {
            index,
            message: message.into(),
        }
    }
}

/// Operation-level bridge failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("unknown type '{name}'")]
    UnknownType { name: String },

    #[error("unknown function '{name}' on '{owner}'")]
    UnknownFunction { name: String, owner: String },

    #[error("invalid target for '{function}'")]
    InvalidTarget { function: String },

    #[error("stale {what} descriptor")]
    StaleDescriptor { what: &'static str },

    #[error("latent function '{function}' called outside a coroutine")]
    LatentOnPrimaryThread { function: String },

    #[error("function '{function}' is not overridable")]
    NotOverridable { function: String },

    #[error("delegate is not bound")]
    UnboundDelegate,

    #[error("{message}")]
    Failed { message: String },
}

impl BridgeError {
    pub fn unknown_type(name: impl Into<String>) -> Self {
        BridgeError::UnknownType { name: name.into() }
    }

    pub fn unknown_function(name: impl Into<String>, owner: impl Into<String>) -> Self {
        BridgeError::UnknownFunction {
            name: name.into(),
            owner: owner.into(),
        }
    }

    pub fn invalid_target(function: impl Into<String>) -> Self {
        BridgeError::InvalidTarget {
            function: function.into(),
        }
    }

    pub fn not_overridable(function: impl Into<String>) -> Self {
        BridgeError::NotOverridable {
            function: function.into(),
        }
    }

    pub fn latent_on_primary_thread(function: impl Into<String>) -> Self {
        BridgeError::LatentOnPrimaryThread {
            function: function.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        BridgeError::Failed {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
