use proptest::prelude::*;
use suitekit::filter::full_name;
use suitekit::runner::EventLog;
use suitekit::{FilterCriteria, OnlySelector, Pattern, Registry, RunEvent, RunOptions};

const TAGS: [&str; 4] = ["api", "db", "slow", "smoke"];

#[derive(Debug, Clone)]
struct TestPlan {
    tags: Vec<usize>,
    skip: bool,
    only: bool,
}

#[derive(Debug, Clone)]
struct SuitePlan {
    tags: Vec<usize>,
    skip: bool,
    only: bool,
    tests: Vec<TestPlan>,
    children: Vec<SuitePlan>,
}

fn tag_set() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..TAGS.len(), 0..3)
}

fn test_plan() -> impl Strategy<Value = TestPlan> {
    (tag_set(), prop::bool::weighted(0.15), prop::bool::weighted(0.1))
        .prop_map(|(tags, skip, only)| TestPlan { tags, skip, only })
}

fn suite_plan() -> impl Strategy<Value = SuitePlan> {
    let leaf = (
        tag_set(),
        prop::bool::weighted(0.1),
        prop::bool::weighted(0.08),
        prop::collection::vec(test_plan(), 0..4),
    )
        .prop_map(|(tags, skip, only, tests)| SuitePlan {
            tags,
            skip,
            only,
            tests,
            children: Vec::new(),
        });
    leaf.prop_recursive(3, 24, 3, |inner| {
        (
            tag_set(),
            prop::bool::weighted(0.1),
            prop::bool::weighted(0.08),
            prop::collection::vec(test_plan(), 0..3),
            prop::collection::vec(inner, 0..3),
        )
            .prop_map(|(tags, skip, only, tests, children)| SuitePlan {
                tags,
                skip,
                only,
                tests,
                children,
            })
    })
}

fn only_selector() -> impl Strategy<Value = OnlySelector> {
    let suites = prop::sample::subsequence(vec!["s0", "s1", "s0 > s0.0", "s0.1", "s1.0 @api"], 0..3);
    let tests = prop::sample::subsequence(vec!["t0", "t1 @slow", "t2"], 0..2);
    (suites, tests).prop_map(|(suites, tests)| OnlySelector {
        suites: suites.into_iter().map(String::from).collect(),
        tests: tests.into_iter().map(String::from).collect(),
    })
}

fn criteria() -> impl Strategy<Value = FilterCriteria> {
    (
        prop::collection::vec(0..TAGS.len(), 0..2),
        prop::collection::vec(0..TAGS.len(), 0..2),
        prop::option::of(prop::sample::select(vec!["t0", "s1", ".0", "t2"])),
        prop::option::of(prop::sample::select(vec!["t1", "s0.", ".1 > "])),
        prop::option::of(only_selector()),
    )
        .prop_map(|(tags, exclude, grep, grep_invert, only)| FilterCriteria {
            tags: tags.into_iter().map(|i| TAGS[i].to_string()).collect(),
            exclude_tags: exclude.into_iter().map(|i| TAGS[i].to_string()).collect(),
            grep: grep.map(Pattern::literal),
            grep_invert: grep_invert.map(Pattern::literal),
            only,
            ..Default::default()
        })
}

fn labelled(name: &str, tags: &[usize]) -> String {
    let mut label = name.to_string();
    for t in tags {
        label.push_str(" @");
        label.push_str(TAGS[*t]);
    }
    label
}

fn declare_tests(ctx: &mut Registry, tests: &[TestPlan]) {
    for (i, plan) in tests.iter().enumerate() {
        let mut builder = ctx.it(&labelled(&format!("t{i}"), &plan.tags), || {});
        if plan.skip {
            builder = builder.skip();
        }
        if plan.only {
            builder = builder.only();
        }
        drop(builder);
    }
}

fn declare(ctx: &mut Registry, plan: &SuitePlan, name: &str) {
    let label = labelled(name, &plan.tags);
    let body = |ctx: &mut Registry| {
        declare_tests(ctx, &plan.tests);
        for (i, child) in plan.children.iter().enumerate() {
            declare(ctx, child, &format!("{name}.{i}"));
        }
    };
    if plan.skip {
        ctx.xdescribe(&label, body);
    } else if plan.only {
        ctx.fdescribe(&label, body);
    } else {
        ctx.describe(&label, body);
    }
}

fn build(plans: &[SuitePlan]) -> Registry {
    let mut ctx = Registry::new();
    for (i, plan) in plans.iter().enumerate() {
        declare(&mut ctx, plan, &format!("s{i}"));
    }
    ctx
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn listing_names_exactly_the_reported_tests(
        plans in prop::collection::vec(suite_plan(), 1..4),
        criteria in criteria(),
    ) {
        let ctx = build(&plans);
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
        let reported: Vec<String> = events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Pass { suite, test, .. }
                | RunEvent::Fail { suite, test, .. }
                | RunEvent::Skip { suite, test, .. } => Some(full_name(&suite, &test)),
                _ => None,
            })
            .collect();

        let mut listed_sorted = listed.clone();
        listed_sorted.sort();
        let mut reported_sorted = reported;
        reported_sorted.sort();
        prop_assert_eq!(listed_sorted, reported_sorted);
        prop_assert_eq!(result.summary.total, listed.len());
    }

    #[test]
    fn tests_carry_every_ancestor_tag_once(plans in prop::collection::vec(suite_plan(), 1..4)) {
        let ctx = build(&plans);
        for id in ctx.tests_in_order() {
            let tags = ctx.test_tags(id);
            let mut deduped = tags.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), tags.len());
            for suite in ctx.ancestors(ctx.unit(id).suite) {
                for tag in &ctx.suite(suite).tags {
                    prop_assert!(tags.contains(tag));
                }
            }
        }
    }
}
