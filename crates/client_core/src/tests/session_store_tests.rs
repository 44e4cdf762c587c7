use super::*;

#[test]
fn file_backend_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("session.json");

    let store = SessionStore::open(FileSessionBackend::new(&path)).expect("open");
    assert!(store.current_token().is_none());
    store.set_session("tok-1", "alice").expect("set");

    let reopened = SessionStore::open(FileSessionBackend::new(&path)).expect("reopen");
    assert_eq!(reopened.current_token().as_deref(), Some("tok-1"));
    assert_eq!(reopened.display_name().as_deref(), Some("alice"));
}

#[test]
fn clear_session_removes_persisted_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");

    let store = SessionStore::open(FileSessionBackend::new(&path)).expect("open");
    store.set_session("tok-1", "alice").expect("set");
    assert!(path.exists());

    store.clear_session().expect("clear");
    assert!(store.current().is_none());
    assert!(!path.exists());

    // clearing twice is harmless
    store.clear_session().expect("clear again");
}

#[test]
fn corrupt_session_file_is_treated_as_signed_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    std::fs::write(&path, "{not json").expect("write");

    let store = SessionStore::open(FileSessionBackend::new(&path)).expect("open");
    assert!(store.current_token().is_none());
}

#[test]
fn separate_stores_do_not_share_state() {
    let first = SessionStore::in_memory();
    let second = SessionStore::in_memory();
    first.set_session("tok-a", "alice").expect("set");

    assert_eq!(first.current_token().as_deref(), Some("tok-a"));
    assert!(second.current_token().is_none());
}

#[test]
fn empty_token_counts_as_absent() {
    let store = SessionStore::open(MemorySessionBackend::with_session(Session {
        token: String::new(),
        display_name: "ghost".into(),
    }))
    .expect("open");
    assert!(store.current_token().is_none());
}

#[test]
fn debug_output_redacts_token() {
    let session = Session {
        token: "super-secret".into(),
        display_name: "alice".into(),
    };
    let rendered = format!("{session:?}");
    assert!(!rendered.contains("super-secret"));
    assert!(rendered.contains("alice"));
}
