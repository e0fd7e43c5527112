use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

fn run_rexx(expr: &str) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_rexx"))
        .args(["-e", expr])
        .output()
        .expect("failed to run rexx");
    assert!(
        output.status.success(),
        "rexx exited with error: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .expect("non-utf8 output")
        .trim()
        .to_string()
}

fn run_rexx_file(source: &str, args: &[&str]) -> Output {
    let mut tmp = tempfile::NamedTempFile::with_suffix(".rexx").expect("failed to create temp file");
    tmp.write_all(source.as_bytes()).expect("failed to write");
    tmp.flush().expect("failed to flush");
    Command::new(env!("CARGO_BIN_EXE_rexx"))
        .arg(tmp.path())
        .args(args)
        .output()
        .expect("failed to run rexx")
}

fn run_in(dir: &Path, file: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rexx"))
        .arg(dir.join(file))
        .env_remove("REXXPATH")
        .output()
        .expect("failed to run rexx")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

#[test]
fn say_expression() {
    assert_eq!(run_rexx("say 2 + 3 * 4"), "14");
}

#[test]
fn statements_on_one_line() {
    assert_eq!(run_rexx("x = 3; y = 4; say x * y"), "12");
}

#[test]
fn pipe_through_builtins() {
    assert_eq!(run_rexx("say 'hello' |> UPPER |> REVERSE"), "OLLEH");
}

#[test]
fn shebang_line_ignored() {
    let out = run_rexx_file("#!/usr/bin/env rexx\nSAY 'hello from shebang'\n", &[]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "hello from shebang");
}

#[test]
fn program_arguments() {
    let out = run_rexx_file("parse arg first rest\nsay rest '/' first\n", &["one", "two", "three"]);
    assert_eq!(stdout(&out), "two three / one");
}

#[test]
fn exit_value_is_process_status() {
    let out = run_rexx_file("EXIT 7\n", &[]);
    assert_eq!(out.status.code(), Some(7));
}

#[test]
fn condition_error_exits_1() {
    let out = run_rexx_file("say 1 + 'abc'\n", &[]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Error 41"), "stderr: {stderr}");
}

#[test]
fn parse_error_exits_2_before_running() {
    let out = run_rexx_file("say 'first'\nsay 'unterminated\n", &[]);
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(stdout(&out), "");
}

#[test]
fn fail_fast_flag_makes_dispatch_fatal() {
    let source = "address nowhere\n'anything'\nsay 'continued' rc\n";
    let soft = run_rexx_file(source, &[]);
    assert_eq!(stdout(&soft), "continued -3");

    let mut tmp = tempfile::NamedTempFile::with_suffix(".rexx").unwrap();
    tmp.write_all(source.as_bytes()).unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_rexx"))
        .arg("--fail-fast")
        .arg(tmp.path())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(3));
    assert_eq!(stdout(&out), "");
}

#[test]
fn interpret_depth_flag() {
    let out = Command::new(env!("CARGO_BIN_EXE_rexx"))
        .args(["--max-interpret-depth", "5", "-e", "c = 'interpret c'; interpret c"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(5));
}

#[test]
fn system_commands_set_rc() {
    let out = run_rexx_file("'exit 3'\nsay rc\n'echo hi'\nsay rc\n", &[]);
    assert_eq!(stdout(&out), "3\nhi\n0");
}

#[test]
fn require_finds_library_next_to_script() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("greet.rexx"),
        "exit\nhello: return 'hello,' arg(1)\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.rexx"),
        "require 'greet'\nsay hello('world')\n",
    )
    .unwrap();
    let out = run_in(dir.path(), "main.rexx");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "hello, world");
}

#[test]
fn require_cycle_exits_4() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.rexx"), "require 'b'\nfa: return 1\n").unwrap();
    std::fs::write(dir.path().join("b.rexx"), "require 'a'\nfb: return 2\n").unwrap();
    std::fs::write(dir.path().join("main.rexx"), "require 'a'\nsay 'unreachable'\n").unwrap();
    let out = run_in(dir.path(), "main.rexx");
    assert_eq!(out.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Error 91"), "stderr: {stderr}");
}

#[test]
fn config_file_sets_default_address() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("rexx.toml");
    std::fs::write(&config, "default_address = \"ECHO\"\n").unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_rexx"))
        .arg("--config")
        .arg(&config)
        .args(["-e", "'ping a=1'; say address() result.params.a"])
        .output()
        .unwrap();
    assert_eq!(stdout(&out), "ECHO 1");
}
