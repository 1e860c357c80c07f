//! Global tracing setup. Kept in its own test binary since it installs the
//! process-wide subscriber.

use fibsem_hal::config::LoggingConfig;
use fibsem_hal::logging::{init_tracing, LOG_FILE_NAME};
use fibsem_hal::session::Session;

#[test]
fn logs_to_session_file_and_refuses_second_init() {
    let base = tempfile::tempdir().unwrap();
    let session = Session::create(base.path(), "logging").unwrap();
    let config = LoggingConfig {
        level: "info".to_string(),
        json: false,
        log_file: true,
    };

    let path = init_tracing(&config, Some(session.path())).unwrap().unwrap();
    assert_eq!(path, session.path().join(LOG_FILE_NAME));

    tracing::warn!(target: "fibsem_hal", "stage drift above threshold");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("stage drift above threshold"));

    assert!(init_tracing(&config, None).is_err());
}
