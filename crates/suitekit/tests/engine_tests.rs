use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use suitekit::filter::full_name;
use suitekit::runner::EventLog;
use suitekit::{
    FilterCriteria, OnlySelector, Pattern, Registry, RunEvent, RunOptions, SkipReason, Table, UsageError,
};

type Trail = Arc<Mutex<Vec<String>>>;

fn trail() -> Trail {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(trail: &Trail, entry: &str) -> impl Fn() + Send + Sync + 'static {
    let trail = trail.clone();
    let entry = entry.to_string();
    move || trail.lock().push(entry.clone())
}

fn outcomes(events: &EventLog) -> Vec<(String, &'static str)> {
    events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::Pass { suite, test, .. } => Some((full_name(&suite, &test), "pass")),
            RunEvent::Fail { suite, test, .. } => Some((full_name(&suite, &test), "fail")),
            RunEvent::Skip { suite, test, .. } => Some((full_name(&suite, &test), "skip")),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn scenario_a_pass_and_fail_are_counted() {
    let mut ctx = Registry::new();
    ctx.describe("S", |ctx| {
        ctx.it("pass", || {});
        ctx.it("fail", || assert_eq!(1, 2));
    });

    let result = ctx.run(RunOptions::default()).unwrap();
    assert_eq!(result.summary.total, 2);
    assert_eq!(result.summary.passed, 1);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.skipped, 0);
    assert!(!result.summary.success);
    assert_eq!(result.failures[0].suite, "S");
    assert_eq!(result.failures[0].test, "fail");
}

#[test]
fn scenario_b_only_suite_selects_subtree() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("A", |ctx| {
        ctx.it("a", push(&runs, "a"));
        ctx.describe("B", |ctx| {
            ctx.it("b", push(&runs, "b"));
            ctx.describe("C", |ctx| {
                ctx.it("c", push(&runs, "c"));
            });
        });
    });
    ctx.describe("Sibling", |ctx| {
        ctx.it("s", push(&runs, "s"));
    });

    let criteria = FilterCriteria {
        only: Some(OnlySelector::suite("A > B")),
        ..Default::default()
    };
    let listed: Vec<String> = ctx
        .list(&criteria)
        .unwrap()
        .iter()
        .map(|l| full_name(&l.suite, &l.test))
        .collect();

    let events = EventLog::new();
    let options = RunOptions::default()
        .with_criteria(criteria)
        .on_event(events.handler());
    let result = ctx.run(options).unwrap();

    assert_eq!(*runs.lock(), vec!["b", "c"]);
    assert_eq!(result.summary.total, 2);
    let reported = outcomes(&events);
    assert_eq!(
        reported,
        vec![
            ("A > B > b".to_string(), "pass"),
            ("A > B > C > c".to_string(), "pass")
        ]
    );
    let reported_names: Vec<String> = reported.into_iter().map(|(name, _)| name).collect();
    assert_eq!(listed, reported_names);
}

#[test]
fn scenario_c_each_expands_into_independent_tests() {
    let mut ctx = Registry::new();
    ctx.each(Table::new(vec![json!([1, 2, 3]), json!([2, 3, 5])]))
        .it("adds %d+%d=%d", |row| {
            let n = |i: usize| row[i].as_i64().unwrap();
            assert_eq!(n(0) + n(1), n(2));
        });

    let events = EventLog::new();
    let result = ctx
        .run(RunOptions::default().on_event(events.handler()))
        .unwrap();
    assert_eq!(result.summary.passed, 2);
    assert_eq!(
        outcomes(&events),
        vec![
            ("adds 1+2=3".to_string(), "pass"),
            ("adds 2+3=5".to_string(), "pass")
        ]
    );
}

#[test]
fn scenario_d_before_each_failure_skips_body_but_runs_after_each() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("S", |ctx| {
        ctx.before_each_try(|| -> Result<(), String> { Err("fixture missing".into()) });
        ctx.after_each(push(&runs, "afterEach"));
        ctx.it("t", push(&runs, "body"));
    });

    let result = ctx.run(RunOptions::default()).unwrap();
    assert_eq!(*runs.lock(), vec!["afterEach"]);
    assert_eq!(result.summary.failed, 1);
    let error = &result.failures[0].error;
    assert_eq!(error.name.as_deref(), Some("HookFailure"));
    assert_eq!(error.message, "beforeEach hook failed: fixture missing");
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn hook_order_nests_and_unwinds() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("A", |ctx| {
        ctx.before_each(push(&runs, "before A"));
        ctx.after_each(push(&runs, "after A"));
        ctx.describe("B", |ctx| {
            ctx.before_each(push(&runs, "before B"));
            ctx.after_each(push(&runs, "after B"));
            ctx.describe("C", |ctx| {
                ctx.before_each(push(&runs, "before C"));
                ctx.after_each(push(&runs, "after C"));
                ctx.it("t", push(&runs, "body"));
            });
        });
    });

    ctx.run(RunOptions::default()).unwrap();
    assert_eq!(
        *runs.lock(),
        vec!["before A", "before B", "before C", "body", "after C", "after B", "after A"]
    );
}

#[test]
fn before_all_runs_once_per_suite() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("outer", |ctx| {
        ctx.before_all(push(&runs, "outer beforeAll"));
        ctx.after_all(push(&runs, "outer afterAll"));
        ctx.it("o1", || {});
        ctx.it("o2", || {});
        ctx.describe("inner", |ctx| {
            ctx.before_all(push(&runs, "inner beforeAll"));
            ctx.after_all(push(&runs, "inner afterAll"));
            ctx.it("i1", || {});
            ctx.it("i2", || {});
        });
    });

    let result = ctx.run(RunOptions::default()).unwrap();
    assert_eq!(result.summary.passed, 4);
    assert_eq!(
        *runs.lock(),
        vec![
            "outer beforeAll",
            "inner beforeAll",
            "inner afterAll",
            "outer afterAll"
        ]
    );
}

#[test]
fn before_all_of_ancestors_runs_when_only_a_nested_suite_is_selected() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("outer", |ctx| {
        ctx.before_all(push(&runs, "outer beforeAll"));
        ctx.it("skipped by grep", || {});
        ctx.describe("inner", |ctx| {
            ctx.it("wanted", push(&runs, "wanted"));
        });
    });

    let options = RunOptions::default().with_criteria(FilterCriteria {
        grep: Some(Pattern::literal("wanted")),
        ..Default::default()
    });
    ctx.run(options).unwrap();
    assert_eq!(*runs.lock(), vec!["outer beforeAll", "wanted"]);
}

#[test]
fn skipped_ancestor_skips_every_descendant() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.xdescribe("parked", |ctx| {
        ctx.before_all(push(&runs, "beforeAll"));
        ctx.it("one", push(&runs, "one"));
        ctx.describe("deeper", |ctx| {
            ctx.fit("focused but parked", push(&runs, "two"));
        });
    });
    ctx.it("elsewhere", || {});

    let options = RunOptions {
        include_skipped: true,
        ..Default::default()
    };
    let result = ctx.run(options).unwrap();
    assert!(runs.lock().is_empty());
    let skipped = result.skipped.unwrap();
    assert_eq!(skipped.len(), 3);
    assert!(skipped
        .iter()
        .filter(|s| s.suite.starts_with("parked"))
        .all(|s| s.reason == SkipReason::ExplicitlySkipped));
}

#[test]
fn only_mode_runs_exactly_the_focused_set() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("plain", |ctx| {
        ctx.it("p", push(&runs, "p"));
    });
    ctx.fdescribe("focused suite", |ctx| {
        ctx.it("f1", push(&runs, "f1"));
        ctx.describe("nested", |ctx| {
            ctx.it("f2", push(&runs, "f2"));
        });
    });
    ctx.describe("mixed", |ctx| {
        ctx.it("m1", push(&runs, "m1"));
        ctx.fit("m2", push(&runs, "m2"));
    });

    let events = EventLog::new();
    let result = ctx
        .run(RunOptions::default().on_event(events.handler()))
        .unwrap();
    assert_eq!(*runs.lock(), vec!["f1", "f2", "m2"]);
    assert_eq!(result.summary.skipped, 2);
    let not_focused: Vec<String> = events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::Skip { suite, test, reason } if reason == SkipReason::NotFocused => {
                Some(full_name(&suite, &test))
            }
            _ => None,
        })
        .collect();
    assert_eq!(not_focused, vec!["plain > p", "mixed > m1"]);
}

#[test]
fn bail_stops_scheduling_but_still_tears_down() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("first", |ctx| {
        ctx.before_all(push(&runs, "first beforeAll"));
        ctx.after_all(push(&runs, "first afterAll"));
        ctx.it("boom", || panic!("boom"));
        ctx.it("after boom", push(&runs, "after boom"));
        ctx.describe("child", |ctx| {
            ctx.it("child test", push(&runs, "child test"));
        });
    });
    ctx.describe("second", |ctx| {
        ctx.before_all(push(&runs, "second beforeAll"));
        ctx.it("later", push(&runs, "later"));
    });

    let options = RunOptions {
        bail: true,
        ..Default::default()
    };
    let result = ctx.run(options).unwrap();
    assert_eq!(*runs.lock(), vec!["first beforeAll", "first afterAll"]);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.total, 1);
}

#[test]
fn failures_are_isolated_without_bail() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.describe("first", |ctx| {
        ctx.it("boom", || panic!("boom"));
        ctx.it("next", push(&runs, "next"));
    });
    ctx.describe("second", |ctx| {
        ctx.it("later", push(&runs, "later"));
    });

    let result = ctx.run(RunOptions::default()).unwrap();
    assert_eq!(*runs.lock(), vec!["next", "later"]);
    assert_eq!(result.summary.failed, 1);
    assert_eq!(result.summary.passed, 2);
}

#[test]
fn list_agrees_with_run() {
    let mut ctx = Registry::new();
    ctx.describe("Auth @api", |ctx| {
        ctx.it("logs in @smoke", || {});
        ctx.xit("logs out", || {});
        ctx.describe("Tokens", |ctx| {
            ctx.it("refreshes @slow", || {});
        });
    });
    ctx.describe("Billing", |ctx| {
        ctx.it("charges @smoke", || {});
    });

    let criteria = FilterCriteria {
        tags: vec!["smoke".into(), "slow".into()],
        exclude_tags: vec!["@slow".into()],
        ..Default::default()
    };
    let listed: Vec<String> = ctx
        .list(&criteria)
        .unwrap()
        .iter()
        .map(|l| full_name(&l.suite, &l.test))
        .collect();

    let events = EventLog::new();
    ctx.run(
        RunOptions::default()
            .with_criteria(criteria)
            .on_event(events.handler()),
    )
    .unwrap();
    let ran: Vec<String> = outcomes(&events).into_iter().map(|(name, _)| name).collect();

    assert_eq!(listed, vec!["Auth > logs in", "Billing > charges"]);
    assert_eq!(listed, ran);
}

#[test]
fn usage_errors_surface_before_running() {
    let runs = trail();
    let mut ctx = Registry::new();
    ctx.it("t", push(&runs, "t"));

    let bad = RunOptions::default().with_criteria(FilterCriteria {
        tags: vec!["@".into()],
        ..Default::default()
    });
    assert!(matches!(ctx.run(bad), Err(UsageError::InvalidValue { .. })));

    let err = RunOptions::from_json(&serde_json::Value::Null).unwrap_err();
    assert!(err.to_string().contains("received null"), "{err}");
    assert!(runs.lock().is_empty());
}

#[test]
fn result_serializes_to_wire_shape() {
    let mut ctx = Registry::new();
    ctx.describe("S", |ctx| {
        ctx.it("ok", || {});
        ctx.it_try("bad", || -> Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        });
    });
    let options = RunOptions {
        include_passed: true,
        ..Default::default()
    };
    let result = ctx.run(options).unwrap();
    let wire = serde_json::to_value(&result).unwrap();

    assert_eq!(wire["summary"]["total"], json!(2));
    assert_eq!(wire["summary"]["success"], json!(false));
    assert_eq!(wire["failures"][0]["test"], json!("bad"));
    assert_eq!(wire["failures"][0]["error"]["message"], json!("disk full"));
    assert_eq!(wire["failures"][0]["error"]["name"], json!("Error"));
    assert!(wire["failures"][0]["error"].get("stack").is_none());
    assert_eq!(wire["passed"][0]["test"], json!("ok"));
    assert!(wire.get("skipped").is_none());
}
