// Copyright (C) 2026 The etwtrace Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use etwtrace_sys::*;
use thiserror::Error;

/// Trace session errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    /// A session with the same name is already registered with the subsystem.
    #[error("A trace session with this name already exists.")]
    AlreadyExists,
    /// The calling process lacks the privilege required for the operation.
    #[error("Insufficient privilege to control the trace session.")]
    AccessDenied,
    /// The subsystem rejected one of the supplied parameters.
    #[error("Invalid parameter passed to the tracing subsystem.")]
    InvalidParameter,
    /// A buffer or structure length did not match what the subsystem expects.
    #[error("Bad length passed to the tracing subsystem.")]
    BadLength,
    /// Failed to obtain a processing handle for the session.
    #[error("Failed to open the trace session for processing.")]
    OpenFailure,
    /// The operation requires the session to be registered first.
    #[error("The trace session has not been registered.")]
    NotRegistered,
    /// The operation is not supported by this OS version or platform.
    #[error("Operation not supported by the tracing subsystem on this platform.")]
    Unsupported,
    /// More distinct filter types were supplied than the subsystem accepts.
    #[error("Too many event filters: {0} exceeds the {MAX_EVENT_FILTERS_COUNT} descriptor slots.")]
    TooManyFilters(usize),
    /// A property was requested as a type that does not match its wire type.
    #[error("Property `{property}`: requested type {requested} does not match wire type {actual}.")]
    TypeMismatch {
        /// Field name as declared by the provider manifest.
        property: String,
        /// The type the caller asked for.
        requested: &'static str,
        /// The type the event actually carries.
        actual: &'static str,
    },
    /// Any other non-success status reported by the subsystem.
    #[error("Tracing subsystem call failed with status {0}.")]
    Native(u32),
}

/// Translates a Win32 status from a trace control call into the error
/// taxonomy. Benign statuses (`ERROR_WMI_INSTANCE_NOT_FOUND` on stop/update,
/// `ERROR_CTX_CLOSE_PENDING` on close) are the caller's business and are
/// mapped like any other status here.
pub(crate) fn check_status(status: u32) -> Result<(), TraceError> {
    match status {
        ERROR_SUCCESS => Ok(()),
        ERROR_ALREADY_EXISTS => Err(TraceError::AlreadyExists),
        ERROR_ACCESS_DENIED => Err(TraceError::AccessDenied),
        ERROR_INVALID_PARAMETER => Err(TraceError::InvalidParameter),
        ERROR_BAD_LENGTH => Err(TraceError::BadLength),
        ERROR_NOT_SUPPORTED => Err(TraceError::Unsupported),
        other => Err(TraceError::Native(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation() {
        assert_eq!(check_status(ERROR_SUCCESS), Ok(()));
        assert_eq!(check_status(ERROR_ALREADY_EXISTS), Err(TraceError::AlreadyExists));
        assert_eq!(check_status(ERROR_ACCESS_DENIED), Err(TraceError::AccessDenied));
        assert_eq!(check_status(ERROR_INVALID_PARAMETER), Err(TraceError::InvalidParameter));
        assert_eq!(check_status(ERROR_NOT_SUPPORTED), Err(TraceError::Unsupported));
        assert_eq!(check_status(ERROR_WMI_INSTANCE_NOT_FOUND), Err(TraceError::Native(4201)));
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let err = TraceError::TypeMismatch {
            property: "ImageName".into(),
            requested: "u32",
            actual: "UnicodeString",
        };
        let text = err.to_string();
        assert!(text.contains("ImageName"));
        assert!(text.contains("u32"));
        assert!(text.contains("UnicodeString"));
    }
}
