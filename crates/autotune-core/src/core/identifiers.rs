// autotune-core/src/core/identifiers.rs
// ============================================================================
// Module: Identifiers
// Description: Newtype identifiers used throughout the autotune data model.
// Purpose: Prevent mixing up string-typed ids across unrelated domains.
// Dependencies: serde
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

macro_rules! string_identifier {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_identifier!(TraceId, "Unique identifier of one completed conversation trace.");
string_identifier!(ExperimentId, "Identifier of the source bucket a trace was recorded under.");
string_identifier!(CaseId, "Identifier of one row within a frozen dataset.");
string_identifier!(DatasetName, "Logical name of a frozen dataset.");
string_identifier!(DatasetVersion, "Version tag of a frozen dataset.");
string_identifier!(VariantName, "Stable name of a prompt variant within one run.");
string_identifier!(PromptHash, "Content hash identifying one prompt text.");
string_identifier!(RunDirId, "Sortable timestamp identifier naming one run directory.");
string_identifier!(ExperimentRef, "Opaque handle returned by the trace store for a written experiment.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let id = TraceId::new("trace-123");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"trace-123\"");
        let back: TraceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn displays_as_inner_string() {
        let id = CaseId::from("case-7");
        assert_eq!(id.to_string(), "case-7");
        assert_eq!(id.as_str(), "case-7");
    }
}
