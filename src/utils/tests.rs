use super::error::{ErrorKind, RelayError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn unknown_levels_fall_back_to_info() {
    assert_eq!(logging::normalize_level("WARNING"), "warn");
    assert_eq!(logging::normalize_level("verbose"), "info");
}

#[test]
fn only_connection_errors_are_retryable() {
    assert!(RelayError::Connection("refused".into()).is_connection());
    assert!(!RelayError::Processing("boom".into()).is_connection());
    assert!(
        !RelayError::FatalConnection {
            attempts: 5,
            last_error: "refused".into()
        }
        .is_connection()
    );
}

#[test]
fn decode_errors_are_tagged() {
    let err: RelayError = serde_json::from_str::<serde_json::Value>("{not json")
        .unwrap_err()
        .into();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[test]
fn into_publish_keeps_underlying_text() {
    let err = RelayError::Connection("refused".into()).into_publish("messages");
    assert_eq!(err.kind(), ErrorKind::Publish);
    assert!(err.to_string().contains("refused"));
    assert!(err.to_string().contains("messages"));
}
