use std::collections::BTreeMap;
use std::path::Path;

use dap_bridge::workspace::{validate_path, write_file, write_files};
use dap_bridge::AppError;

#[test]
fn allows_path_inside_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");

    let validated = validate_path(temp.path(), "src/index.js").expect("path valid");

    let canonical_root = temp.path().canonicalize().expect("canonicalize root");
    assert!(validated.starts_with(&canonical_root));
    assert!(validated.ends_with("src/index.js"));
}

#[test]
fn rejects_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");

    let result = validate_path(temp.path(), "../secret.txt");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[test]
fn rejects_deep_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");

    let result = validate_path(temp.path(), "lib/../../secret.txt");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[test]
fn inner_parent_segments_are_resolved() {
    let temp = tempfile::tempdir().expect("tempdir");

    let validated = validate_path(temp.path(), "lib/../main.js").expect("path valid");

    assert_eq!(
        validated,
        temp.path().canonicalize().unwrap().join("main.js")
    );
}

#[test]
fn absolute_path_is_rerooted() {
    let temp = tempfile::tempdir().expect("tempdir");

    let validated = validate_path(temp.path(), "/etc/passwd").expect("path valid");

    let canonical_root = temp.path().canonicalize().expect("canonicalize root");
    assert_eq!(validated, canonical_root.join("etc/passwd"));
}

#[test]
fn rejects_empty_path() {
    let temp = tempfile::tempdir().expect("tempdir");

    assert!(matches!(
        validate_path(temp.path(), "./"),
        Err(AppError::PathViolation(_))
    ));
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escaping_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside");
    std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");

    let result = validate_path(temp.path(), "link");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[test]
fn write_file_creates_parents_and_content() {
    let temp = tempfile::tempdir().expect("tempdir");

    let written = write_file(temp.path(), "nested/dir/a.js", "console.log(1)").expect("write");

    assert_eq!(
        std::fs::read_to_string(&written).expect("read"),
        "console.log(1)"
    );
    assert!(written.ends_with(Path::new("nested/dir/a.js")));
}

#[test]
fn write_file_replaces_existing_content() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_file(temp.path(), "a.js", "old").expect("first write");

    let written = write_file(temp.path(), "a.js", "new").expect("second write");

    assert_eq!(std::fs::read_to_string(written).expect("read"), "new");
}

#[tokio::test]
async fn write_files_writes_every_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let files = BTreeMap::from([
        ("a.js".to_owned(), "console.log(1)".to_owned()),
        ("lib/b.js".to_owned(), "module.exports = 2".to_owned()),
    ]);

    let written = write_files(temp.path().to_path_buf(), files)
        .await
        .expect("write files");

    assert_eq!(written.len(), 2);
    assert_eq!(
        std::fs::read_to_string(temp.path().join("lib/b.js")).expect("read"),
        "module.exports = 2"
    );
}

#[tokio::test]
async fn write_files_stops_on_escape() {
    let temp = tempfile::tempdir().expect("tempdir");
    let files = BTreeMap::from([("../escape.js".to_owned(), "x".to_owned())]);

    let result = write_files(temp.path().to_path_buf(), files).await;

    assert!(matches!(result, Err(AppError::PathViolation(_))));
}

#[cfg(unix)]
#[test]
fn write_through_symlinked_parent_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside");
    std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");

    let result = write_file(temp.path(), "link/new.js", "console.log(1)");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
    assert!(!outside.path().join("new.js").exists());
}

#[cfg(unix)]
#[test]
fn new_directories_below_symlinked_parent_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside");
    std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");

    let result = write_file(temp.path(), "link/deep/er/new.js", "x");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
    assert!(!outside.path().join("deep").exists());
}

#[cfg(unix)]
#[test]
fn dangling_symlinked_parent_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("outside");
    let missing = outside.path().join("not-yet");
    std::os::unix::fs::symlink(&missing, temp.path().join("link")).expect("symlink");

    let result = write_file(temp.path(), "link/new.js", "x");

    assert!(matches!(result, Err(AppError::PathViolation(_))));
    assert!(!missing.exists());
}

#[cfg(unix)]
#[test]
fn symlinked_parent_inside_workspace_is_allowed() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("real")).expect("mkdir");
    std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias"))
        .expect("symlink");

    write_file(temp.path(), "alias/ok.js", "1").expect("write inside workspace");

    assert_eq!(
        std::fs::read_to_string(temp.path().join("real/ok.js")).expect("read"),
        "1"
    );
}
