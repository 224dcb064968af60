//! Engine-level scenarios: arbitration, slow mode, globals, fixtures

use std::collections::BTreeMap;

use kaleidoscope_core::{
    AliasEntry, Event, EventKind, ParameterSetRequest, UniverseConfig,
};
use kaleidoscope_host::fixture::{FixtureConfig, ProgramEntry};
use kaleidoscope_host::{Engine, EngineSettings, TickContext};

fn universe() -> UniverseConfig {
    UniverseConfig {
        inputs: vec![AliasEntry { alias: "btn".into(), address: 17 }],
        outputs: vec![
            AliasEntry { alias: "out10".into(), address: 10 },
            AliasEntry { alias: "out11".into(), address: 11 },
            AliasEntry { alias: "out20".into(), address: 20 },
            AliasEntry { alias: "out30".into(), address: 30 },
            AliasEntry { alias: "out31".into(), address: 31 },
        ],
        groups: BTreeMap::new(),
    }
}

fn engine_with(settings: EngineSettings) -> Engine {
    Engine::new(&universe(), settings).unwrap()
}

fn engine() -> Engine {
    engine_with(EngineSettings::default())
}

fn ctx(now: f64) -> TickContext {
    TickContext { now, time_of_day: 0 }
}

#[test]
fn priority_shadowing() {
    let mut engine = engine();
    engine
        .add_script_program(
            "a",
            r#"
            fn setup() {
                set_priority(3);
                add_output_alias("out10");
                add_output_alias("out11");
            }
            fn tick(now) {
                set_alias("out10", 1000);
                set_alias("out11", 1000);
            }
        "#,
        )
        .unwrap();
    engine
        .add_script_program(
            "b",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out11");
            }
            fn tick(now) {
                set_alias("out11", 2000);
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.executed, 2);
    assert_eq!(report.frame.get(&10), Some(&1000));
    assert_eq!(report.frame.get(&11), Some(&2000));
}

#[test]
fn minimal_cover_evaluates_only_the_covering_program() {
    let mut engine = engine();
    engine
        .add_script_program(
            "a",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out10");
                add_output_alias("out11");
            }
            fn tick(now) {
                set_alias("out10", 42);
                set_alias("out11", 42);
            }
        "#,
        )
        .unwrap();
    engine
        .add_script_program(
            "b",
            r#"
            fn setup() {
                set_priority(3);
                add_output_alias("out10");
            }
            fn tick(now) {
                set_alias("out10", 9);
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.executed, 1);
    assert_eq!(report.frame.get(&10), Some(&42));
    assert_eq!(report.frame.get(&11), Some(&42));
}

#[test]
fn slow_mode_runs_once_per_period_and_wakes_on_events() {
    let mut engine = engine_with(EngineSettings {
        slow_mode_period: 10,
        ..EngineSettings::default()
    });
    engine
        .add_script_program(
            "slow",
            r#"
            fn setup() {
                set_priority(4);
                set_slow_mode(true);
                add_output_alias("out20");
                add_event_subscription("btn", "button_clicked", "on_click");
            }
            fn on_click(duration) {}
            fn tick(now) {
                set_alias("out20", 7);
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    // Tick 1: enable edge forces the first run.
    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&20), Some(&7));

    // Ticks 2..10: skipped, but the address stays reserved (absent frame).
    for i in 0..9 {
        let report = engine.tick(&ctx(i as f64), vec![]);
        assert!(report.frame.is_empty(), "unexpected run at skip {}", i);
        assert_eq!(report.skipped_slow, 1);
    }

    // Tick 11: the counter expired.
    let report = engine.tick(&ctx(1.0), vec![]);
    assert_eq!(report.frame.get(&20), Some(&7));

    // Two skips, then an event forces a run and resets the counter.
    engine.tick(&ctx(1.1), vec![]);
    engine.tick(&ctx(1.2), vec![]);
    let click = Event {
        address: 17,
        kind: EventKind::ButtonClicked { duration: 0.25 },
    };
    let report = engine.tick(&ctx(1.3), vec![click]);
    assert_eq!(report.frame.get(&20), Some(&7));

    // Counter was reset: the next 9 ticks are skipped again.
    for _ in 0..9 {
        let report = engine.tick(&ctx(2.0), vec![]);
        assert!(report.frame.is_empty());
    }
    let report = engine.tick(&ctx(3.0), vec![]);
    assert_eq!(report.frame.get(&20), Some(&7));
}

#[test]
fn global_deltas_become_visible_next_tick() {
    let mut engine = engine();
    engine
        .add_script_program(
            "writer",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out10");
            }
            fn tick(now) {
                set_global("k", 7);
                set_alias("out10", 1);
            }
        "#,
        )
        .unwrap();
    engine
        .add_script_program(
            "reader",
            r#"
            fn setup() {
                set_priority(3);
                add_output_alias("out11");
            }
            fn tick(now) {
                let v = get_global("k");
                if v == () {
                    set_alias("out11", 1);
                } else {
                    set_alias("out11", v);
                }
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    // Tick N: the reader still sees the prior (absent) value.
    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&11), Some(&1));

    // Tick N+1: the delta was reconciled and redistributed.
    let report = engine.tick(&ctx(0.1), vec![]);
    assert_eq!(report.frame.get(&11), Some(&7));
}

#[test]
fn unwritten_declared_output_is_absent() {
    let mut engine = engine();
    engine
        .add_script_program(
            "p",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out20");
            }
            fn tick(now) {}
        "#,
        )
        .unwrap();
    engine.finalize();

    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.executed, 1);
    assert!(!report.frame.contains_key(&20));
}

#[test]
fn parameter_increment_wraps_and_notifies_once() {
    let mut engine = engine();
    engine
        .add_script_program(
            "p",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out10");
                declare_discrete_parameter("mode", "mode",
                    [["m0", 0], ["m1", 1], ["m2", 2], ["m3", 3]], 2, "on_mode");
            }
            fn on_mode(value) {
                set_alias("out10", 10000 + value);
            }
            fn tick(now) {}
        "#,
        )
        .unwrap();
    engine.finalize();

    engine
        .parameters()
        .lock()
        .unwrap()
        .increment_discrete("p", "mode", 5)
        .unwrap();

    // 2 + 5 mod 4 = 3; the handler fires exactly once, before tick().
    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&10), Some(&10003));

    let report = engine.tick(&ctx(0.1), vec![]);
    assert!(!report.frame.contains_key(&10), "handler fired twice");
}

#[test]
fn failing_program_is_disabled_after_threshold() {
    let mut engine = engine_with(EngineSettings {
        max_consecutive_failures: 3,
        ..EngineSettings::default()
    });
    engine
        .add_script_program(
            "bad",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out10");
            }
            fn tick(now) {
                this_function_does_not_exist();
            }
        "#,
        )
        .unwrap();
    engine
        .add_script_program(
            "good",
            r#"
            fn setup() {
                set_priority(1);
                add_output_alias("out10");
            }
            fn tick(now) {
                set_alias("out10", 5);
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    // While the bad program owns the address its failed ticks leave the
    // frame empty (contributions dropped, shadowed program not selected).
    for _ in 0..3 {
        let report = engine.tick(&ctx(0.0), vec![]);
        assert!(!report.frame.contains_key(&10));
    }

    // After auto-disable the lower-priority program takes over.
    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&10), Some(&5));
}

#[test]
fn program_enable_signals_apply_at_the_boundary() {
    let mut engine = engine();
    engine
        .add_script_program(
            "controller",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out10");
                add_event_subscription("btn", "button_down", "on_down");
            }
            fn on_down() {
                program_disable("target");
            }
            fn tick(now) {
                set_alias("out10", 1);
            }
        "#,
        )
        .unwrap();
    engine
        .add_script_program(
            "target",
            r#"
            fn setup() {
                set_priority(5);
                add_output_alias("out11");
            }
            fn tick(now) {
                set_alias("out11", 2);
            }
        "#,
        )
        .unwrap();
    engine.finalize();

    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&11), Some(&2));

    let down = Event { address: 17, kind: EventKind::ButtonDown };
    // The disable is harvested this tick and applied at the boundary; the
    // target still ran this tick.
    let report = engine.tick(&ctx(0.1), vec![down]);
    assert_eq!(report.frame.get(&11), Some(&2));

    let report = engine.tick(&ctx(0.2), vec![]);
    assert!(!report.frame.contains_key(&11));
}

fn write_script(dir: &std::path::Path, name: &str, contents: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), contents).unwrap();
}

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("kaleidoscope-test-{}-{}", tag, std::process::id()))
}

#[test]
fn fixture_lifecycle_and_switching() {
    let dir = scratch_dir("fixture");
    write_script(
        &dir,
        "wave.rhai",
        r#"
        fn setup() {
            set_priority(2);
            add_output_alias("out30");
            add_output_alias("out31");
        }
        fn tick(now) {
            set_alias("out30", 1234);
            set_alias("out31", 1234);
        }
    "#,
    );

    let config = FixtureConfig {
        name: "garden".to_string(),
        outputs: vec!["out30".to_string(), "out31".to_string()],
        programs: vec![ProgramEntry {
            name: "wave".to_string(),
            path: "wave.rhai".into(),
        }],
        disable_builtin_programs: false,
        disable_manual_program: false,
    };

    let mut engine = engine();
    engine.add_fixture(&config, &dir).unwrap();
    engine.finalize();

    // OFF starts active and drives every owned output LOW each tick.
    let report = engine.tick(&ctx(0.0), vec![]);
    assert_eq!(report.frame.get(&30), Some(&0));
    assert_eq!(report.frame.get(&31), Some(&0));

    // Switch to the script program.
    engine.set_active_program("garden", "wave").unwrap();
    let report = engine.tick(&ctx(0.1), vec![]);
    assert_eq!(report.frame.get(&30), Some(&1234));

    // Cycle skips MANUAL and EXTERNAL: wave -> OFF.
    let next = engine.cycle_active_program("garden").unwrap();
    assert_eq!(next, "OFF");
    let report = engine.tick(&ctx(0.2), vec![]);
    assert_eq!(report.frame.get(&30), Some(&0));

    // MANUAL copies its scaled parameters to the outputs each tick.
    engine.set_active_program("garden", "MANUAL").unwrap();
    engine
        .set_parameter(
            "garden",
            "MANUAL",
            "out30",
            &ParameterSetRequest::Continuous { value: 1.0 },
        )
        .unwrap();
    let report = engine.tick(&ctx(0.3), vec![]);
    assert_eq!(report.frame.get(&30), Some(&u16::MAX));
    assert_eq!(report.frame.get(&31), Some(&0));

    // EXTERNAL drives nothing.
    engine.set_active_program("garden", "EXTERNAL").unwrap();
    let report = engine.tick(&ctx(0.4), vec![]);
    assert!(report.frame.is_empty());

    let snapshot = engine.snapshot();
    let garden = snapshot.fixtures.get("garden").unwrap();
    assert_eq!(garden.active_program, "EXTERNAL");
    assert_eq!(garden.programs.len(), 5);
    assert!(garden.programs.get("wave").is_some());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn overlapping_fixture_outputs_are_rejected() {
    let mut engine = engine();
    let first = FixtureConfig {
        name: "a".to_string(),
        outputs: vec!["out10".to_string(), "out11".to_string()],
        programs: vec![],
        disable_builtin_programs: false,
        disable_manual_program: false,
    };
    let second = FixtureConfig {
        name: "b".to_string(),
        outputs: vec!["out11".to_string()],
        programs: vec![],
        disable_builtin_programs: false,
        disable_manual_program: false,
    };

    engine.add_fixture(&first, std::path::Path::new(".")).unwrap();
    assert!(engine.add_fixture(&second, std::path::Path::new(".")).is_err());
}

#[test]
fn broken_script_keeps_failed_placeholder() {
    let dir = scratch_dir("broken");
    write_script(&dir, "broken.rhai", "fn setup() { add_output_alias(\"nope\"); } fn tick(now) {}");

    let config = FixtureConfig {
        name: "f".to_string(),
        outputs: vec!["out10".to_string()],
        programs: vec![ProgramEntry {
            name: "broken".to_string(),
            path: "broken.rhai".into(),
        }],
        disable_builtin_programs: false,
        disable_manual_program: false,
    };

    let mut engine = engine();
    engine.add_fixture(&config, &dir).unwrap();
    engine.finalize();

    let snapshot = engine.snapshot();
    let program = snapshot.fixtures["f"].programs.get("broken").unwrap();
    assert!(program.load_failed);

    // Selecting the broken program is allowed but drives nothing.
    engine.set_active_program("f", "broken").unwrap();
    let report = engine.tick(&ctx(0.0), vec![]);
    assert!(report.frame.is_empty());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn control_plane_parameter_errors_are_typed() {
    let config = FixtureConfig {
        name: "f".to_string(),
        outputs: vec!["out10".to_string()],
        programs: vec![],
        disable_builtin_programs: false,
        disable_manual_program: false,
    };

    let mut engine = engine();
    engine.add_fixture(&config, std::path::Path::new(".")).unwrap();
    engine.finalize();

    // Unknown fixture / program / parameter.
    assert!(engine
        .set_parameter("nope", "MANUAL", "out10", &ParameterSetRequest::Continuous { value: 0.0 })
        .is_err());
    assert!(engine
        .set_parameter("f", "nope", "out10", &ParameterSetRequest::Continuous { value: 0.0 })
        .is_err());
    assert!(engine
        .set_parameter("f", "MANUAL", "nope", &ParameterSetRequest::Continuous { value: 0.0 })
        .is_err());

    // Kind mismatch on a continuous parameter.
    assert!(engine
        .set_parameter("f", "MANUAL", "out10", &ParameterSetRequest::Discrete { value: 1 })
        .is_err());

    // Cycling a continuous parameter is invalid.
    assert!(engine.cycle_parameter("f", "MANUAL", "out10").is_err());
}
