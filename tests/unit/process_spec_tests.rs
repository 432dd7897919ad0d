//! Unit tests for process descriptions and environment filtering.

use std::collections::HashMap;
use std::time::Duration;

use serial_test::serial;

use vm_relay::proxy::{
    build_execute_request, filter_environment, process_environment, LineCallbacks, OutputSink,
    ProcessSpec,
};

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

// ── Environment filtering ────────────────────────────────────────────────────

/// Variables already present with the same value are dropped; changed and
/// new ones are kept.
#[test]
fn filter_keeps_only_differing_variables() {
    let requested: HashMap<String, String> =
        vars(&[("HOME", "/home/ci"), ("CONFIG", "release"), ("NEW", "1")])
            .into_iter()
            .collect();
    let baseline = vars(&[("HOME", "/home/ci"), ("CONFIG", "debug")]);

    let filtered = filter_environment(&requested, baseline);

    assert_eq!(filtered.len(), 2);
    assert_eq!(filtered.get("CONFIG").map(String::as_str), Some("release"));
    assert_eq!(filtered.get("NEW").map(String::as_str), Some("1"));
    assert!(!filtered.contains_key("HOME"));
}

/// Values always compare exactly, including case.
#[test]
fn filter_compares_values_case_sensitively() {
    let requested: HashMap<String, String> = vars(&[("MODE", "Fast")]).into_iter().collect();
    let filtered = filter_environment(&requested, vars(&[("MODE", "fast")]));
    assert_eq!(filtered.len(), 1);
}

#[cfg(windows)]
#[test]
fn filter_matches_names_case_insensitively_on_windows() {
    let requested: HashMap<String, String> =
        vars(&[("Path", "C:\\bin")]).into_iter().collect();
    let filtered = filter_environment(&requested, vars(&[("PATH", "C:\\bin")]));
    assert!(filtered.is_empty());
}

#[cfg(not(windows))]
#[test]
fn filter_matches_names_exactly_elsewhere() {
    let requested: HashMap<String, String> = vars(&[("Path", "/bin")]).into_iter().collect();
    let filtered = filter_environment(&requested, vars(&[("PATH", "/bin")]));
    assert_eq!(filtered.len(), 1);
}

/// The master's own environment is the baseline for remote requests.
#[test]
#[serial]
fn process_environment_reflects_current_variables() {
    std::env::set_var("VM_RELAY_TEST_MARKER", "present");
    let env = process_environment();
    std::env::remove_var("VM_RELAY_TEST_MARKER");

    assert!(env
        .iter()
        .any(|(k, v)| k == "VM_RELAY_TEST_MARKER" && v == "present"));
}

// ── Request building ─────────────────────────────────────────────────────────

#[test]
fn request_carries_only_set_fields() {
    let spec = ProcessSpec::new("msbuild");
    let request = build_execute_request(&spec, Vec::new());

    assert_eq!(request.executable, "msbuild");
    assert!(request.arguments.is_none());
    assert!(request.working_directory.is_none());
    assert!(request.environment.is_none());
    assert!(request.timeout_seconds.is_none());
}

/// An environment that is entirely redundant is not sent at all.
#[test]
fn redundant_environment_is_omitted() {
    let spec = ProcessSpec::new("make").env("LANG", "C");
    let request = build_execute_request(&spec, vars(&[("LANG", "C")]));
    assert!(request.environment.is_none());
}

#[test]
fn builder_sets_every_field() {
    let spec = ProcessSpec::new("cargo")
        .arg("build")
        .arg("--release")
        .working_directory("/src")
        .env("RUSTFLAGS", "-Dwarnings")
        .timeout(Duration::from_secs(90));
    let request = build_execute_request(&spec, Vec::new());

    assert_eq!(
        request.arguments,
        Some(vec!["build".to_owned(), "--release".to_owned()])
    );
    assert_eq!(request.working_directory.as_deref(), Some("/src"));
    assert_eq!(
        request
            .environment
            .as_ref()
            .and_then(|env| env.get("RUSTFLAGS"))
            .map(String::as_str),
        Some("-Dwarnings")
    );
    assert_eq!(request.timeout_seconds, Some(90));
}

#[test]
fn explicit_empty_argument_list_is_kept() {
    let spec = ProcessSpec::new("true").args(Vec::<String>::new());
    assert_eq!(spec.to_request().arguments, Some(Vec::new()));
}

/// Sub-second remainders round up so a limit is never shortened.
#[test]
fn timeout_rounds_up_to_whole_seconds() {
    let spec = ProcessSpec::new("x").timeout(Duration::from_millis(1500));
    assert_eq!(spec.timeout_seconds(), Some(2));

    let spec = ProcessSpec::new("x").timeout(Duration::ZERO);
    assert_eq!(spec.timeout_seconds(), Some(0));
}

// ── Success predicate and sinks ──────────────────────────────────────────────

#[test]
fn default_predicate_accepts_only_zero() {
    let spec = ProcessSpec::new("x");
    assert!(spec.is_success(0));
    assert!(!spec.is_success(1));
}

#[test]
fn custom_predicate_replaces_default() {
    let spec = ProcessSpec::new("robocopy").success_when(|code| code < 8);
    assert!(spec.is_success(3));
    assert!(!spec.is_success(8));
}

#[test]
fn line_callbacks_route_by_stream() {
    let mut out = Vec::new();
    let mut err = Vec::new();
    {
        let mut sink = LineCallbacks::new(
            |line: &str| out.push(line.to_owned()),
            |line: &str| err.push(line.to_owned()),
        );
        sink.stdout_line("one");
        sink.stderr_line("two");
        sink.stdout_line("three");
    }
    assert_eq!(out, vec!["one", "three"]);
    assert_eq!(err, vec!["two"]);
}
