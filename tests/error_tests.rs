//! Tests for error types.
//!
//! Validates display formatting and the retry/cancellation classification
//! the reconciler relies on.

use imagebuilder::{EngineError, Error};
use std::time::Duration;

// =============================================================================
// Engine Error Display Tests
// =============================================================================

#[test]
fn test_commit_failed_display() {
    let err = EngineError::CommitFailed {
        container: "abc123".to_string(),
        reason: "snapshot busy".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "failed to commit container 'abc123': snapshot busy"
    );
}

#[test]
fn test_push_errors_include_reference() {
    let reference = "registry.local/img:v1".to_string();
    let errors = [
        EngineError::AuthFailed {
            reference: reference.clone(),
            reason: "denied".into(),
        },
        EngineError::ManifestConflict {
            reference: reference.clone(),
            reason: "blob unknown".into(),
        },
        EngineError::PushFailed {
            reference: reference.clone(),
            reason: "502".into(),
        },
        EngineError::SaveFailed {
            reference: reference.clone(),
            reason: "disk full".into(),
        },
    ];

    for err in errors {
        assert!(err.to_string().contains(&reference), "{}", err);
    }
}

#[test]
fn test_connect_display() {
    let err = EngineError::Connect {
        socket: "/run/containerd/containerd.sock".into(),
        reason: "no such file".into(),
    };
    assert!(err.to_string().contains("/run/containerd/containerd.sock"));
}

// =============================================================================
// Request Error Display Tests
// =============================================================================

#[test]
fn test_validation_is_bare_message() {
    assert_eq!(
        Error::Validation("cr podName is empty".into()).to_string(),
        "cr podName is empty"
    );
}

#[test]
fn test_not_found_display() {
    let err = Error::NotFound {
        kind: "pod",
        name: "default/p1".into(),
    };
    assert_eq!(err.to_string(), "pod not found: default/p1");
    assert!(err.is_not_found());
}

#[test]
fn test_job_failure_display() {
    let err = Error::Job {
        name: "default-b1".into(),
        message: "BackoffLimitExceeded".into(),
    };
    assert_eq!(
        err.to_string(),
        "job default-b1 failed: BackoffLimitExceeded"
    );
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "push registry.local/img:v1".into(),
        duration: Duration::from_secs(1800),
    };
    let msg = err.to_string();
    assert!(msg.contains("1800s"));
    assert!(msg.contains("push registry.local/img:v1"));
}

// =============================================================================
// Classification Tests
// =============================================================================

#[test]
fn test_only_conflicts_and_throttling_are_transient() {
    assert!(Error::Conflict("rv".into()).is_transient());
    assert!(Error::Throttled("429".into()).is_transient());

    for err in [
        Error::Api("500".into()),
        Error::Config("bad".into()),
        Error::Internal("oops".into()),
        Error::Cancelled("push".into()),
    ] {
        assert!(!err.is_transient(), "{}", err);
    }
}

#[test]
fn test_cancellation_is_recognised_in_both_layers() {
    assert!(Error::Cancelled("watch".into()).is_cancelled());
    assert!(Error::from(EngineError::Cancelled("push".into())).is_cancelled());
    assert!(!Error::Api("500".into()).is_cancelled());
}

#[test]
fn test_serde_error_converts() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
    let err: Error = parse.unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}
