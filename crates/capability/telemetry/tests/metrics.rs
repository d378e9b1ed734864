use ems_telemetry::{metrics, new_session_id, record_auth, record_frame_sent, record_rpc};

#[test]
fn session_ids_are_unique() {
    let first = new_session_id();
    let second = new_session_id();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[test]
fn counters_only_grow() {
    let before = metrics().snapshot();
    record_frame_sent();
    record_auth(true);
    record_auth(false);
    record_rpc(false);
    let after = metrics().snapshot();

    assert!(after.frames_sent > before.frames_sent);
    assert!(after.auth_accepted > before.auth_accepted);
    assert!(after.auth_rejected > before.auth_rejected);
    assert!(after.rpc_failure > before.rpc_failure);
}
