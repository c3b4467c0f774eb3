use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use waypoint_engine::conductor::{
    Conductor, Critique, DefaultPlaceholderPolicy, ParameterValidator, Plan, PlaceholderPolicy,
    Recommendation, Step, StepStatus,
};
use waypoint_engine::config::{Config, ValidatorConfig};
use waypoint_engine::reasoner::scripted::ScriptedReasoner;
use waypoint_engine::reasoner::Reasoner;
use waypoint_engine::tools::InMemoryToolRunner;
use sdk::{Arguments, ParamSpec, ToolRunner, ToolSpec};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Step `i` may depend on any earlier step, and may be set up to fail
fn dag() -> impl Strategy<Value = Vec<(Vec<usize>, bool)>> {
    (1usize..8).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                (
                    prop::collection::vec(0..i.max(1), 0..=i.min(3))
                        .prop_map(move |deps| if i == 0 { Vec::new() } else { deps }),
                    prop::bool::weighted(0.2),
                )
            })
            .collect::<Vec<_>>()
    })
}

fn dag_plan(spec: &[(Vec<usize>, bool)]) -> Plan {
    let steps = spec
        .iter()
        .enumerate()
        .map(|(i, (deps, fails))| {
            let action = if *fails { "broken" } else { "record" };
            let mut step = Step::new(format!("s{}", i), i as u32 + 1, action)
                .with_param("marker", json!(format!("m{}", i)));
            for d in deps {
                step = step.depends_on(format!("s{}", d));
            }
            step
        })
        .collect();
    Plan::new("property", steps)
}

fn dag_conductor(runner: &Arc<InMemoryToolRunner>) -> Conductor {
    let mut config = Config::default();
    config.executor.retry_delay_ms = 0;
    config.executor.max_retries = 1;
    let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner::new());
    Conductor::new(
        &config,
        Some(reasoner),
        Arc::clone(runner) as Arc<dyn ToolRunner>,
        None,
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // A step runs only after every dependency succeeded; anything downstream
    // of a failure is skipped and never invoked.
    #[test]
    fn test_steps_run_only_after_dependencies(spec in dag()) {
        let runner = Arc::new(
            InMemoryToolRunner::new()
                .with_tool(ToolSpec::new("record", "Record a marker"), |_| Ok(json!("ok")))
                .with_tool(ToolSpec::new("broken", "Always fails"), |_| {
                    Err("permanent failure".to_string())
                }),
        );
        let conductor = dag_conductor(&runner);
        let mut plan = dag_plan(&spec);
        let mut critique = Critique::neutral(&plan.id, 1);
        critique.recommendation = Recommendation::Approve;

        let result = runtime()
            .block_on(conductor.execute(&mut plan, &critique))
            .unwrap();

        let call_order: Vec<String> = runner
            .calls()
            .into_iter()
            .filter_map(|c| c.arguments.get("marker").and_then(|m| m.as_str()).map(str::to_string))
            .collect();
        let position = |i: usize| call_order.iter().position(|m| *m == format!("m{}", i));

        let mut status: BTreeMap<usize, StepStatus> = BTreeMap::new();
        for (i, (deps, fails)) in spec.iter().enumerate() {
            let deps_ok = deps.iter().all(|d| status[d] == StepStatus::Succeeded);
            let expected = match (deps_ok, *fails) {
                (false, _) => StepStatus::Skipped,
                (true, true) => StepStatus::Failed,
                (true, false) => StepStatus::Succeeded,
            };
            let actual = plan.step(&format!("s{}", i)).unwrap().status;
            prop_assert_eq!(actual, expected, "step s{}", i);
            status.insert(i, actual);

            match position(i) {
                Some(at) => {
                    prop_assert!(deps_ok);
                    for d in deps {
                        prop_assert!(position(*d).is_some_and(|dep_at| dep_at < at));
                    }
                }
                None => prop_assert!(!deps_ok),
            }
        }

        let all_ok = status.values().all(|s| *s == StepStatus::Succeeded);
        prop_assert_eq!(result.overall_success, all_ok);
    }
}

fn validation_runner() -> Arc<InMemoryToolRunner> {
    Arc::new(
        InMemoryToolRunner::new()
            .with_tool(ToolSpec::new("list_facilities", "List facilities"), |_| {
                Ok(json!([{"id": "f-1"}]))
            })
            .with_tool(
                ToolSpec::new("get_facility", "Get a facility")
                    .with_required("facilityId", ParamSpec::of_type("string")),
                |_| Ok(json!({})),
            )
            .with_tool(
                ToolSpec::new("open_ticket", "Open a ticket")
                    .with_required("title", ParamSpec::of_type("string"))
                    .with_required(
                        "priority",
                        ParamSpec::of_type("string").with_enum(vec![json!("low"), json!("high")]),
                    )
                    .with_required("dueDate", ParamSpec::of_type("string")),
                |_| Ok(json!({})),
            ),
    )
}

/// Random parameter value: real, placeholder, or absent
fn param_value() -> impl Strategy<Value = Option<serde_json::Value>> {
    prop_oneof![
        Just(None),
        Just(Some(json!("TBD"))),
        Just(Some(json!("<fill me>"))),
        Just(Some(json!("2001-01-01"))),
        "[a-z]{4,8}-[0-9]{2}".prop_map(|s| Some(json!(s))),
    ]
}

fn validation_plan() -> impl Strategy<Value = Plan> {
    prop::collection::vec(
        (0usize..3, param_value(), param_value(), param_value()),
        1..5,
    )
    .prop_map(|raw| {
        let steps = raw
            .into_iter()
            .enumerate()
            .map(|(i, (kind, a, b, c))| {
                let (action, names): (&str, &[&str]) = match kind {
                    0 => ("list_facilities", &[]),
                    1 => ("get_facility", &["facilityId"]),
                    _ => ("open_ticket", &["title", "priority", "dueDate"]),
                };
                let mut step = Step::new(format!("step-{}", i + 1), i as u32 + 1, action);
                for (name, value) in names.iter().zip([a, b, c]) {
                    if let Some(value) = value {
                        step = step.with_param(*name, value);
                    }
                }
                step
            })
            .collect();
        Plan::new("validate", steps)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Validation stops within its iteration bound, never reports more missing
    // parameters than the pass before, and a second run over the resolved
    // plan changes nothing.
    #[test]
    fn test_validation_terminates_and_is_idempotent(mut plan in validation_plan()) {
        let config = ValidatorConfig::default();
        let policy: Arc<dyn PlaceholderPolicy> =
            Arc::new(DefaultPlaceholderPolicy::new(&config).unwrap());
        let validator = ParameterValidator::new(
            validation_runner() as Arc<dyn ToolRunner>,
            policy,
            config.clone(),
        );
        let context = Arguments::new();
        let rt = runtime();

        let first = rt.block_on(validator.validate_and_resolve(&mut plan, &context)).unwrap();
        prop_assert!(first.iterations >= 1);
        prop_assert!(first.iterations <= config.max_iterations);
        prop_assert_eq!(first.missing_history.len(), first.iterations);
        prop_assert!(
            first.missing_history.windows(2).all(|w| w[1] <= w[0]),
            "missing parameters grew: {:?}",
            first.missing_history
        );

        let resolved = plan.clone();
        let second = rt.block_on(validator.validate_and_resolve(&mut plan, &context)).unwrap();
        prop_assert!(second.filled.is_empty());
        prop_assert_eq!(&plan, &resolved);

        let open = |r: &waypoint_engine::conductor::ValidationReport| -> BTreeSet<(String, String)> {
            r.findings
                .iter()
                .map(|f| (f.step_id.clone(), f.parameter_name.clone()))
                .collect()
        };
        prop_assert_eq!(open(&first), open(&second));
    }
}
