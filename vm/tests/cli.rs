use assert_cmd::Command;

#[test]
fn prints_usage_without_a_main_class() {
    let output = Command::cargo_bin("valka").unwrap().output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn help_lists_the_classpath_flag() {
    let output = Command::cargo_bin("valka")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("classpath"));
}

#[test]
fn missing_main_class_exits_nonzero() {
    let output = Command::cargo_bin("valka")
        .unwrap()
        .args(["--heap-size", "65536", "no.Such.Class"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
