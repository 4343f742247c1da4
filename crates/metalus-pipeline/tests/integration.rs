//! End-to-end tests for the Metalus engine.
//!
//! Each test exercises the full path: parse application JSON -> build the
//! execution plan -> run the scheduler -> assert on terminal states and
//! final contexts.

use std::collections::HashMap;
use std::sync::Arc;

use metalus_model::parse_application;
use metalus_pipeline::{
    build_plan, register_builtin_steps, ExecutionPlan, PlanOptions, PlanResult, ProviderRegistry,
    StepRegistry,
};
use metalus_types::{ExecutionStatus, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn plan_for(json: &str) -> ExecutionPlan {
    let application = parse_application(json).expect("application should parse");
    let mut registry = StepRegistry::new();
    register_builtin_steps(&mut registry);
    build_plan(
        &application,
        Arc::new(registry),
        &ProviderRegistry::new(),
        &PlanOptions::default(),
    )
    .expect("plan should build")
}

async fn run(json: &str) -> PlanResult {
    plan_for(json).run().await.expect("plan should run")
}

fn primary<'a>(result: &'a PlanResult, execution: &str, pipeline: &str, step: &str) -> &'a Value {
    result
        .execution(execution)
        .unwrap_or_else(|| panic!("missing execution {execution}"))
        .context
        .as_ref()
        .unwrap_or_else(|| panic!("execution {execution} has no context"))
        .response(pipeline, step)
        .unwrap_or_else(|| panic!("missing response {pipeline}/{step}"))
        .primary()
}

// ---------------------------------------------------------------------------
// S1: chain, globals inheritance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_child_inherits_parent_globals_and_parameters() {
    let result = run(r#"{
        "globals": { "x": 42 },
        "executions": [
            {
                "id": "A",
                "pipelines": [{
                    "id": "pa",
                    "steps": [{
                        "id": "emit",
                        "params": [{ "name": "message", "value": "from-a" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }]
                }]
            },
            {
                "id": "B",
                "parents": ["A"],
                "pipelines": [{
                    "id": "pb",
                    "steps": [{
                        "id": "readInherited",
                        "params": [{ "name": "message", "value": "!A.globals.x" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }]
                }]
            }
        ]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);

    let b_ctx = result.execution("B").unwrap().context.as_ref().unwrap();
    // B's globals contain A -> { globals: {x: 42}, pipelineParameters: ... }.
    assert_eq!(b_ctx.global("A").get_path(["globals", "x"]), &Value::Integer(42));
    assert_eq!(
        b_ctx
            .global("A")
            .get_path(["pipelineParameters", "pa", "emit", "primaryReturn"]),
        &Value::String("from-a".into())
    );
    // And B's own step read the inherited value through a sigil.
    assert_eq!(primary(&result, "B", "pb", "readInherited"), &Value::Integer(42));
}

// ---------------------------------------------------------------------------
// S2: branch routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_branch_takes_matching_parameter_and_skips_the_rest() {
    let result = run(r#"{
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "p1",
                "steps": [
                    {
                        "id": "s1",
                        "type": "branch",
                        "params": [
                            { "name": "message", "value": "left" },
                            { "name": "left", "type": "result", "value": "s2" },
                            { "name": "right", "type": "result", "value": "s3" }
                        ],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    },
                    {
                        "id": "s2",
                        "params": [{ "name": "message", "value": "two" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    },
                    {
                        "id": "s3",
                        "params": [{ "name": "message", "value": "three" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }
                ]
            }]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    let ctx = result.execution("only").unwrap().context.as_ref().unwrap();
    assert!(ctx.response("p1", "s1").is_some());
    assert!(ctx.response("p1", "s2").is_some());
    assert!(ctx.response("p1", "s3").is_none(), "s3 must not run");
}

// ---------------------------------------------------------------------------
// S3: sigil resolution and embedded concatenation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_globals_sigil_and_template_concatenation() {
    let result = run(r#"{
        "globals": { "greeting": "hi" },
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "p1",
                "steps": [
                    {
                        "id": "whole",
                        "params": [{ "name": "message", "value": "!greeting" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" },
                        "nextStepId": "embedded"
                    },
                    {
                        "id": "embedded",
                        "params": [{ "name": "message", "value": "prefix-${!greeting}-suffix" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }
                ]
            }]
        }]
    }"#)
    .await;

    assert_eq!(primary(&result, "only", "p1", "whole"), &Value::String("hi".into()));
    assert_eq!(
        primary(&result, "only", "p1", "embedded"),
        &Value::String("prefix-hi-suffix".into())
    );
}

// ---------------------------------------------------------------------------
// S4: executeIfEmpty short-circuit across chained pipelines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_execute_if_empty_uses_preseeded_result_and_skips_the_body() {
    // The second pipeline's "read" step body would fail the run if invoked;
    // the pre-seeded result from pipeline p1 prevents that.
    let result = run(r#"{
        "executions": [{
            "id": "only",
            "pipelines": [
                {
                    "id": "p1",
                    "steps": [{
                        "id": "readDF",
                        "params": [{ "name": "message", "value": "DF1" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }]
                },
                {
                    "id": "p2",
                    "steps": [{
                        "id": "read",
                        "executeIfEmpty": { "name": "existing", "value": "@p1.readDF" },
                        "params": [{ "name": "message", "value": "must not run" }],
                        "engineMeta": { "command": "FlowSteps.fail" }
                    }]
                }
            ]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    assert_eq!(primary(&result, "only", "p2", "read"), &Value::String("DF1".into()));
}

// ---------------------------------------------------------------------------
// S5: pause propagates through the DAG
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_paused_execution_skips_descendants() {
    let result = run(r#"{
        "executions": [
            {
                "id": "A",
                "pipelines": [{
                    "id": "pa",
                    "steps": [{
                        "id": "wait",
                        "params": [{ "name": "message", "value": "waiting for approval" }],
                        "engineMeta": { "command": "FlowSteps.pause" }
                    }]
                }]
            },
            { "id": "B", "parents": ["A"], "pipelines": [{
                "id": "pb",
                "steps": [{
                    "id": "s",
                    "params": [{ "name": "message", "value": "b" }],
                    "engineMeta": { "command": "LoggingSteps.logMessage" }
                }]
            }] },
            { "id": "C", "parents": ["B"], "pipelines": [{
                "id": "pc",
                "steps": [{
                    "id": "s",
                    "params": [{ "name": "message", "value": "c" }],
                    "engineMeta": { "command": "LoggingSteps.logMessage" }
                }]
            }] }
        ]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Paused);
    assert_eq!(result.execution("A").unwrap().status, ExecutionStatus::Paused);
    assert_eq!(
        result.execution("A").unwrap().message.as_deref(),
        Some("waiting for approval")
    );
    assert_eq!(result.execution("B").unwrap().status, ExecutionStatus::Skipped);
    assert_eq!(result.execution("C").unwrap().status, ExecutionStatus::Skipped);
    assert!(result.execution("C").unwrap().context.is_none());
}

// ---------------------------------------------------------------------------
// S6: parallel siblings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_siblings_observe_identical_inherited_globals() {
    let json = r#"{
        "globals": { "shared": 7 },
        "executions": [
            {
                "id": "root",
                "pipelines": [{
                    "id": "p0",
                    "steps": [{
                        "id": "seed",
                        "params": [{ "name": "message", "value": "seed" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }]
                }]
            },
            { "id": "a", "parents": ["root"], "pipelines": [{
                "id": "pa",
                "steps": [{
                    "id": "s",
                    "params": [{ "name": "message", "value": "!root.globals.shared" }],
                    "engineMeta": { "command": "LoggingSteps.logMessage" }
                }]
            }] },
            { "id": "b", "parents": ["root"], "pipelines": [{
                "id": "pb",
                "steps": [{
                    "id": "s",
                    "params": [{ "name": "message", "value": "!root.globals.shared" }],
                    "engineMeta": { "command": "LoggingSteps.logMessage" }
                }]
            }] }
        ]
    }"#;
    let result = run(json).await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    let a_ctx = result.execution("a").unwrap().context.as_ref().unwrap();
    let b_ctx = result.execution("b").unwrap().context.as_ref().unwrap();
    assert_eq!(a_ctx.global("root"), b_ctx.global("root"));
    assert_eq!(primary(&result, "a", "pa", "s"), &Value::Integer(7));
    assert_eq!(primary(&result, "b", "pb", "s"), &Value::Integer(7));
}

// ---------------------------------------------------------------------------
// Timing invariant: children start after their parents complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn child_start_is_after_parent_completion() {
    let result = run(r#"{
        "executions": [
            { "id": "A", "pipelines": [{ "id": "pa", "steps": [{
                "id": "s",
                "params": [{ "name": "message", "value": "a" }],
                "engineMeta": { "command": "LoggingSteps.logMessage" }
            }] }] },
            { "id": "B", "parents": ["A"], "pipelines": [{ "id": "pb", "steps": [{
                "id": "s",
                "params": [{ "name": "message", "value": "b" }],
                "engineMeta": { "command": "LoggingSteps.logMessage" }
            }] }] }
        ]
    }"#)
    .await;

    let a_completed = result.execution("A").unwrap().completed_at.unwrap();
    let b_started = result.execution("B").unwrap().started_at.unwrap();
    assert!(b_started >= a_completed);
}

// ---------------------------------------------------------------------------
// Errors: structured fail vs missing step body
// ---------------------------------------------------------------------------

#[tokio::test]
async fn structured_fail_errors_the_execution_and_reports_the_step() {
    let result = run(r#"{
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "p1",
                "steps": [{
                    "id": "bad",
                    "params": [{ "name": "message", "value": "input missing" }],
                    "engineMeta": { "command": "FlowSteps.fail" }
                }]
            }]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Errored);
    let only = result.execution("only").unwrap();
    assert_eq!(only.last_step.as_deref(), Some("bad"));
    assert_eq!(only.message.as_deref(), Some("input missing"));
}

#[tokio::test]
async fn unknown_step_body_is_fatal_for_the_execution() {
    let result = run(r#"{
        "executions": [
            {
                "id": "A",
                "pipelines": [{
                    "id": "pa",
                    "steps": [{
                        "id": "ghost",
                        "engineMeta": { "command": "NoSuchSteps.run" }
                    }]
                }]
            },
            { "id": "B", "parents": ["A"], "pipelines": [{ "id": "pb", "steps": [{
                "id": "s",
                "params": [{ "name": "message", "value": "b" }],
                "engineMeta": { "command": "LoggingSteps.logMessage" }
            }] }] }
        ]
    }"#)
    .await;

    assert_eq!(result.execution("A").unwrap().status, ExecutionStatus::Errored);
    assert_eq!(result.execution("B").unwrap().status, ExecutionStatus::Skipped);
}

// ---------------------------------------------------------------------------
// Step-groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn step_group_runs_library_pipeline_in_isolation() {
    let result = run(r#"{
        "globals": { "outerOnly": "invisible" },
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "outer",
                "steps": [{
                    "id": "group",
                    "type": "step-group",
                    "params": [
                        { "name": "pipelineId", "value": "sub" },
                        { "name": "pipelineMappings", "value": { "seed": "mapped" } }
                    ]
                }]
            }]
        }],
        "pipelines": [{
            "id": "sub",
            "category": "step-group",
            "stepGroupResult": "transform",
            "steps": [{
                "id": "transform",
                "params": [{ "name": "value", "value": "!seed" }],
                "engineMeta": { "command": "StringSteps.upperCase" }
            }]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    // The designated stepGroupResult value became the group's primary.
    assert_eq!(
        primary(&result, "only", "outer", "group"),
        &Value::String("MAPPED".into())
    );
    // Named returns map each child step to its primary.
    let ctx = result.execution("only").unwrap().context.as_ref().unwrap();
    let named = ctx
        .response("outer", "group")
        .unwrap()
        .named_returns
        .clone()
        .unwrap();
    assert_eq!(named.get("transform"), Some(&Value::String("MAPPED".into())));
}

// ---------------------------------------------------------------------------
// Fork / join
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fork_region_groups_per_element_results() {
    let result = run(r#"{
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "p1",
                "steps": [
                    {
                        "id": "fanOut",
                        "type": "fork",
                        "params": [{ "name": "forkByValues", "value": ["a", "b"] }],
                        "nextStepId": "upper"
                    },
                    {
                        "id": "upper",
                        "params": [{ "name": "value", "value": "@fanOut" }],
                        "engineMeta": { "command": "StringSteps.upperCase" },
                        "nextStepId": "merge"
                    },
                    { "id": "merge", "type": "join", "nextStepId": "after" },
                    {
                        "id": "after",
                        "params": [{ "name": "message", "value": "@merge" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }
                ]
            }]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    let grouped = Value::List(vec![Value::String("A".into()), Value::String("B".into())]);
    assert_eq!(primary(&result, "only", "p1", "upper"), &grouped);
    assert_eq!(primary(&result, "only", "p1", "merge"), &grouped);
    assert_eq!(primary(&result, "only", "p1", "after"), &grouped);
}

// ---------------------------------------------------------------------------
// Round-trip and plan construction failures
// ---------------------------------------------------------------------------

#[test]
fn application_round_trip_is_lossless() {
    let json = r#"{
        "globals": { "greeting": "hi", "flags": { "dryRun": false } },
        "executions": [
            {
                "id": "root",
                "pipelines": [{
                    "id": "p1",
                    "steps": [{
                        "id": "s1",
                        "displayName": "First",
                        "params": [
                            { "name": "message", "type": "text", "value": "!greeting" }
                        ],
                        "engineMeta": { "command": "LoggingSteps.logMessage" }
                    }]
                }],
                "pipelineParameters": { "p1": { "preseeded": "DF1" } }
            },
            { "id": "child", "parents": ["root"], "pipelineIds": ["lib"] }
        ],
        "pipelines": [{ "id": "lib", "steps": [{ "id": "s1" }] }],
        "securityManager": { "className": "PassthroughSecurity" },
        "sparkConf": { "setOptions": [{ "name": "spark.local", "value": "true" }] }
    }"#;

    let original: serde_json::Value = serde_json::from_str(json).unwrap();
    let application = parse_application(json).unwrap();
    assert_eq!(serde_json::to_value(&application).unwrap(), original);
}

#[test]
fn cyclic_execution_graph_fails_at_plan_construction() {
    let application = parse_application(r#"{
        "executions": [
            { "id": "A", "parents": ["B"], "pipelines": [{ "id": "pa", "steps": [{ "id": "s" }] }] },
            { "id": "B", "parents": ["A"], "pipelines": [{ "id": "pb", "steps": [{ "id": "s" }] }] }
        ]
    }"#)
    .unwrap();

    let err = build_plan(
        &application,
        Arc::new(StepRegistry::new()),
        &ProviderRegistry::new(),
        &PlanOptions::default(),
    )
    .unwrap_err();
    assert!(err.is_config());
}

// ---------------------------------------------------------------------------
// Exactly-once responses for every step that ran
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_ran_step_has_exactly_one_response() {
    let result = run(r#"{
        "globals": { "greeting": "hello" },
        "executions": [{
            "id": "only",
            "pipelines": [{
                "id": "p1",
                "steps": [
                    {
                        "id": "first",
                        "params": [{ "name": "message", "value": "!greeting" }],
                        "engineMeta": { "command": "LoggingSteps.logMessage" },
                        "nextStepId": "second"
                    },
                    {
                        "id": "second",
                        "params": [
                            { "name": "left", "value": "@first" },
                            { "name": "right", "value": "world" },
                            { "name": "separator", "value": " " }
                        ],
                        "engineMeta": { "command": "StringSteps.concat" }
                    }
                ]
            }]
        }]
    }"#)
    .await;

    assert_eq!(result.status, ExecutionStatus::Complete);
    let ctx = result.execution("only").unwrap().context.as_ref().unwrap();
    let steps: HashMap<_, _> = ctx.parameters.get("p1").unwrap().iter().collect();
    assert_eq!(steps.len(), 2);
    assert_eq!(
        primary(&result, "only", "p1", "second"),
        &Value::String("hello world".into())
    );
}
