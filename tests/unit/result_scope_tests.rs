use vm_relay::orchestrator::{ResultScope, StepStatus};

#[test]
fn new_scope_is_successful() {
    let scope = ResultScope::new();
    assert!(scope.is_success());
    assert_eq!(scope.status(), StepStatus::Success);
    assert!(scope.failure_reason().is_none());
}

/// The first failure's status and reason survive later failures.
#[test]
fn first_failure_wins() {
    let mut scope = ResultScope::new();
    scope.fail("compile failed");
    scope.error("transport dropped");

    assert_eq!(scope.status(), StepStatus::Failure);
    assert_eq!(scope.failure_reason(), Some("compile failed"));
}

#[test]
fn merge_keeps_first_failure_and_appends_output() {
    let mut overall = ResultScope::new();
    overall.set_property("build", "42");

    let mut first = overall.child();
    first.log("step one ok");
    first.add_artifact("out/a.log");
    overall.merge(first);
    assert!(overall.is_success());

    let mut second = overall.child();
    second.error("agent unreachable");
    overall.merge(second);

    let mut third = overall.child();
    third.fail("later failure");
    overall.merge(third);

    assert_eq!(overall.status(), StepStatus::Error);
    assert_eq!(overall.failure_reason(), Some("agent unreachable"));
    assert_eq!(overall.messages(), ["step one ok"]);
    assert_eq!(overall.artifacts().len(), 1);
}

/// Children inherit properties but start clean.
#[test]
fn child_inherits_properties_only() {
    let mut parent = ResultScope::new();
    parent.set_property("config", "release");
    parent.log("parent line");
    parent.fail("parent failed");

    let child = parent.child();
    assert!(child.is_success());
    assert!(child.messages().is_empty());
    assert_eq!(child.property("config"), Some("release"));
}
