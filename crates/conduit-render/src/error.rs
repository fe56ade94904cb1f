//! Merge errors
//!
//! Every variant is terminal for the fragment set that produced it; it is
//! surfaced in status and never retried.

use thiserror::Error;

/// Why a set of fragments could not be merged
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    /// A component body is not a JSON object
    #[error("component {component}: configuration must be an object")]
    NotAnObject {
        /// Fully-qualified component id
        component: String,
    },

    /// A component has no string `type`
    #[error("component {component}: missing string field 'type'")]
    MissingType {
        /// Fully-qualified component id
        component: String,
    },

    /// A transform or sink has no `inputs`
    #[error("component {component}: missing field 'inputs'")]
    MissingInputs {
        /// Fully-qualified component id
        component: String,
    },

    /// `inputs` is not a list of strings
    #[error("component {component}: 'inputs' must be a list of strings")]
    InvalidInputs {
        /// Fully-qualified component id
        component: String,
    },

    /// An input names a component that exists nowhere in the merged config
    #[error("component {component}: input '{input}' does not match any source or transform")]
    UnknownInput {
        /// Fully-qualified component id
        component: String,
        /// The unresolved input
        input: String,
    },

    /// Two fragments produced the same fully-qualified id
    #[error("component {component} is defined by more than one pipeline")]
    DuplicateComponent {
        /// Fully-qualified component id
        component: String,
    },

    /// The merged config has sources but nowhere to send them
    #[error("configuration has sources but no sinks")]
    NoSinks,
}
