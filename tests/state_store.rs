//! Integration test: the session state store as driven by decoded calls.

use mirage_term::decoder::apply;
use mirage_term::tools::ToolCall;
use mirage_term::vfs::{normalize, resolve, NodeKind, SessionState};
use serde_json::json;

fn call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::from_value(name, args).expect("valid call")
}

#[test]
fn listing_then_content_marks_file_cached() {
    let mut state = SessionState::new();
    apply(
        &call(
            "file_listing",
            json!({"cwd": "/", "entries": [{"name": "core.log", "type": "file", "size": "2K"}]}),
        ),
        &mut state,
    );
    assert_eq!(state.node("/core.log").map(|n| n.kind), Some(NodeKind::File));
    assert!(!state.has_content("/core.log"));

    apply(
        &call("file_content", json!({"path": "/core.log", "content": "ok\n"})),
        &mut state,
    );
    assert!(state.has_content("/core.log"));
    assert_eq!(state.content("/core.log"), Some("ok\n"));
    assert!(state.serialize().contains("/core.log (2K) [cached]"));
}

#[test]
fn removing_a_directory_removes_descendants() {
    let mut state = SessionState::new();
    assert_eq!(state.node_count(), 0);
    apply(
        &call(
            "state_update",
            json!({"create": [
                {"path": "/var", "type": "directory"},
                {"path": "/var/log", "type": "directory"},
                {"path": "/var/log/boot.log", "type": "file", "content": "booted\n"}
            ]}),
        ),
        &mut state,
    );
    assert!(state.node("/var/log").is_some());
    assert!(state.has_content("/var/log/boot.log"));
    assert_eq!(state.node_count(), 3);

    apply(&call("state_update", json!({"remove": ["/var"]})), &mut state);
    assert_eq!(state.node_count(), 0);
    assert!(state.node("/var").is_none());
    assert!(state.node("/var/log").is_none());
    assert!(!state.has_content("/var/log/boot.log"));
}

#[test]
fn state_update_moves_cwd_and_sets_env() {
    let mut state = SessionState::new();
    apply(
        &call(
            "state_update",
            json!({"directory": "/home/operator", "environment": {"SHIFT": 3}}),
        ),
        &mut state,
    );
    assert_eq!(state.current_directory(), "/home/operator");
    assert_eq!(state.env_var("SHIFT"), Some("3"));
    let snap = state.serialize();
    assert!(snap.starts_with("cwd: /home/operator"));
    assert!(snap.contains("SHIFT=3"));
}

#[test]
fn relative_listing_resolves_against_cwd() {
    let mut state = SessionState::new();
    state.set_current_directory("/srv");
    apply(
        &call(
            "file_listing",
            json!({"cwd": "data", "entries": [{"name": "samples.csv", "type": "file"}]}),
        ),
        &mut state,
    );
    assert!(state.node("/srv/data/samples.csv").is_some());
}

#[test]
fn resolve_is_absolute_and_idempotent() {
    let cases = [
        ("a/b/../c", "/x"),
        ("./././", "/"),
        ("../../..", "/one/two"),
        ("logs/./today/", "/var"),
        ("", "/etc"),
    ];
    for (path, cwd) in cases {
        let once = resolve(path, cwd);
        assert!(once.starts_with('/'), "{once} should be absolute");
        assert!(
            !once.split('/').any(|seg| seg == "." || seg == ".."),
            "{once} should have no dot segments"
        );
        assert_eq!(resolve(&once, "/elsewhere"), once);
        assert_eq!(normalize(&once), once);
    }
}

#[test]
fn snapshot_is_deterministic() {
    let build = || {
        let mut state = SessionState::new();
        apply(
            &call(
                "file_listing",
                json!({"cwd": "/etc", "entries": [
                    {"name": "passwd", "type": "file"},
                    {"name": "hosts", "type": "file"}
                ]}),
            ),
            &mut state,
        );
        state.serialize()
    };
    assert_eq!(build(), build());
}
