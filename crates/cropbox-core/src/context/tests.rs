use super::*;
use crate::entity::stage_type;
use crate::rule::{Dep, TimeSource};
use crate::Spawn;
use approx::assert_abs_diff_eq;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn constant(name: &str, v: f64) -> Rule {
    Rule::derive(name, move |_| Ok(v.into()))
}

fn unit(text: &str) -> Unit {
    Unit::parse(text).unwrap()
}

fn num(ctx: &mut Context, path: &str) -> f64 {
    ctx.get(path).unwrap().as_number().unwrap()
}

#[test]
fn test_plain_recompute() {
    let ty = EntityType::builder("T")
        .rule(constant("a", 1.0))
        .rule(constant("b", 2.0))
        .rule(Rule::derive("c", |s| Ok((s.number("a")? + s.number("b")?).into())).deps(["a", "b"]))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    for _ in 0..5 {
        assert_eq!(num(&mut ctx, "c"), 3.0);
        ctx.advance().unwrap();
    }
}

#[test]
fn test_mutual_accumulation() {
    let ty = EntityType::builder("T")
        .rule(Rule::accumulate("a", |s| Ok((s.number("b")? + 1.0).into())).deps(["b"]))
        .rule(Rule::accumulate("b", |s| Ok((s.number("a")? + 1.0).into())).deps(["a"]))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "a"), 0.0);
    for expected in [1.0, 3.0, 7.0] {
        ctx.advance().unwrap();
        assert_eq!(num(&mut ctx, "a"), expected);
        assert_eq!(num(&mut ctx, "b"), expected);
    }
}

#[test]
fn test_difference_resets_every_tick() {
    let ty = EntityType::builder("T")
        .rule(constant("a", 1.0))
        .rule(Rule::difference("b", |s| Ok((s.number("a")? + 1.0).into())).deps(["a"]))
        .rule(Rule::accumulate("c", |s| Ok((s.number("a")? + 1.0).into())).deps(["a"]))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    for tick in 1..=5 {
        ctx.advance().unwrap();
        assert_eq!(num(&mut ctx, "b"), 2.0);
        assert_eq!(num(&mut ctx, "c"), 2.0 * tick as f64);
    }
}

#[test]
fn test_parameter_override() {
    let ty = EntityType::builder("T")
        .rule(Rule::parameter("a", |_| Ok(1.0.into())))
        .build();

    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "a"), 1.0);

    let config = Config::new().with(&["T", "a"], 2.0);
    let mut ctx = Context::instantiate(&ty, config).unwrap();
    for _ in 0..3 {
        assert_eq!(num(&mut ctx, "a"), 2.0);
        ctx.advance().unwrap();
    }
}

#[test]
fn test_parameter_section_by_base_type_alias_and_unit() {
    let organ = EntityType::builder("Organ")
        .rule(
            Rule::parameter("growth_rate", |_| Ok(1.0.into()))
                .alias("rate")
                .unit(unit("m")),
        )
        .build();
    let leaf = EntityType::builder("Leaf").extends(&organ).build();

    let config = Config::from_ron(r#"{ "Organ": { "rate": "2 cm" } }"#).unwrap();
    let mut ctx = Context::instantiate(&leaf, config).unwrap();
    let q = ctx.get("growth_rate").unwrap().quantity().unwrap();
    assert_eq!(q.unit(), Some(&unit("m")));
    assert_abs_diff_eq!(q.magnitude(), 0.02, epsilon = 1e-12);

    // the most specific section wins
    let config = Config::new()
        .with(&["Organ", "rate"], 3.0)
        .with(&["Leaf", "growth_rate"], 4.0);
    let mut ctx = Context::instantiate(&leaf, config).unwrap();
    assert_eq!(num(&mut ctx, "growth_rate"), 4.0);
}

#[test]
fn test_cycle_detection() {
    let ty = EntityType::builder("T")
        .rule(Rule::derive("a", |s| s.get("b")).deps(["b"]))
        .rule(Rule::derive("b", |s| s.get("a")).deps(["a"]))
        .build();
    let err = Context::instantiate(&ty, Config::new()).err().unwrap();
    assert!(
        matches!(&err, Error::CyclicDependency { rule, entity } if rule == "a" && entity == "T(entity:1)"),
        "{err}"
    );

    let ty = EntityType::builder("T")
        .rule(Rule::accumulate("a", |s| s.get("b")).deps(["b"]))
        .rule(Rule::accumulate("b", |s| s.get("a")).deps(["a"]))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "a"), 0.0);
    ctx.advance().unwrap();
    assert_eq!(num(&mut ctx, "b"), 0.0);
}

#[test]
fn test_deferred_spawn_ordering() {
    let leaf = EntityType::builder("Leaf")
        .rule(Rule::preserve("birth", |s| s.get("context.tick")).deps(["context.tick"]))
        .rule(Rule::accumulate("age", |_| Ok(1.0.into())))
        .build();
    let plant = {
        let leaf = Arc::clone(&leaf);
        EntityType::builder("Plant")
            .rule(Rule::produce("sprout", "children", move |_| {
                Ok(vec![Spawn::new(&leaf)])
            }))
            .rule(Rule::derive("seen", |s| Ok(Value::from(s.children("children").len() as f64))))
            .build()
    };

    let mut ctx = Context::instantiate(&plant, Config::new()).unwrap();
    let root = ctx.root();
    assert!(ctx.children(root, "children").is_empty());
    assert_eq!(num(&mut ctx, "seen"), 0.0);

    for n in 1..=4u64 {
        ctx.advance().unwrap();
        let children = ctx.children(root, "children").to_vec();
        assert_eq!(children.len() as u64, n);
        // reads during tick n saw exactly the children spawned before it
        assert_eq!(ctx.snapshot(root).unwrap()["seen"], Value::from(n as f64));

        let newest = children[children.len() - 1];
        assert_eq!(ctx.number(newest, "birth").unwrap(), n as f64);
        assert_eq!(ctx.number(newest, "age").unwrap(), 0.0);
        assert_eq!(ctx.number(children[0], "age").unwrap(), (n - 1) as f64);
        assert_eq!(ctx.parent(newest), Some(root));
    }
}

#[test]
fn test_optimize_round_trip() {
    let calls = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&calls);
    let ty = EntityType::builder("T")
        .rule(Rule::derive("a", |s| Ok((2.0 * s.number("x")?).into())).deps(["x"]))
        .rule(Rule::derive("b", |s| Ok((s.number("x")? + 1.0).into())).deps(["x"]))
        .rule(
            Rule::optimize("x", move |s| {
                counter.set(counter.get() + 1);
                Ok((s.number("a")? - s.number("b")?).into())
            })
            .deps(["a", "b"])
            .bounds(0.0, 2.0),
        )
        .build();

    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_abs_diff_eq!(num(&mut ctx, "x"), 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(num(&mut ctx, "a"), 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(num(&mut ctx, "b"), 2.0, epsilon = 1e-6);

    let solved = calls.get();
    assert!(solved > 0);
    let x = num(&mut ctx, "x");
    assert_eq!(num(&mut ctx, "x"), x);
    assert_eq!(calls.get(), solved);

    ctx.advance().unwrap();
    assert!(calls.get() > solved);
    assert_abs_diff_eq!(num(&mut ctx, "x"), 1.0, epsilon = 1e-6);
}

#[test]
fn test_optimize_minimize() {
    let ty = EntityType::builder("T")
        .rule(
            Rule::optimize("x", |s| {
                let x = s.number("x")?;
                Ok(((x - 3.0) * (x - 3.0)).into())
            })
            .deps(["x"]),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_abs_diff_eq!(num(&mut ctx, "x"), 3.0, epsilon = 1e-5);
}

#[test]
fn test_optimize_without_sign_change() {
    let ty = EntityType::builder("T")
        .rule(
            Rule::optimize("x", |s| Ok((s.number("x")? * s.number("x")? + 1.0).into()))
                .deps(["x"])
                .bounds(-1.0, 1.0),
        )
        .build();
    let err = Context::instantiate(&ty, Config::new()).err().unwrap();
    assert!(matches!(err, Error::Convergence { ref rule, .. } if rule == "x"), "{err}");
}

#[test]
fn test_solver_trials_do_not_spawn() {
    let bud = EntityType::builder("Bud").build();
    let plant = {
        let bud = Arc::clone(&bud);
        EntityType::builder("Plant")
            .rule(Rule::produce("sprout", "children", move |_| {
                Ok(vec![Spawn::new(&bud)])
            }))
            .rule(
                Rule::optimize("x", |s| Ok((s.number("x")? - s.number("sprout")?).into()))
                    .deps(["x", "sprout"])
                    .bounds(0.0, 2.0),
            )
            .build()
    };
    let mut ctx = Context::instantiate(&plant, Config::new()).unwrap();
    let root = ctx.root();
    assert_abs_diff_eq!(num(&mut ctx, "x"), 1.0, epsilon = 1e-6);

    for n in 1..=3 {
        ctx.advance().unwrap();
        assert_eq!(ctx.children(root, "children").len(), n);
        assert_abs_diff_eq!(num(&mut ctx, "x"), 1.0, epsilon = 1e-6);
    }
    // a cached read after the solve does not request another child
    assert_eq!(num(&mut ctx, "sprout"), 1.0);
    ctx.advance().unwrap();
    assert_eq!(ctx.children(root, "children").len(), 4);
}

#[test]
fn test_solver_trials_do_not_latch_preserve() {
    let ty = EntityType::builder("T")
        .rule(Rule::preserve("p", |s| s.get("x")).deps(["x"]))
        .rule(
            Rule::optimize("x", |s| Ok((s.number("p")? - 1.0).into()))
                .deps(["p"])
                .bounds(0.0, 2.0),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_abs_diff_eq!(num(&mut ctx, "x"), 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(num(&mut ctx, "p"), 1.0, epsilon = 1e-6);
    ctx.advance_by(2).unwrap();
    assert_abs_diff_eq!(num(&mut ctx, "p"), 1.0, epsilon = 1e-6);
}

#[test]
fn test_solver_trials_keep_flip_baseline() {
    let ty = EntityType::builder("T")
        .rule(Rule::flip("level", |s| s.get("x")).deps(["x"]))
        .rule(
            Rule::optimize("x", |s| {
                let target = s.number("context.tick")? + 1.0;
                Ok((s.number("level")? - target).into())
            })
            .deps(["level", "context.tick"])
            .bounds(0.0, 10.0),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_abs_diff_eq!(num(&mut ctx, "level"), 1.0, epsilon = 1e-6);
    for n in 1..=3 {
        ctx.advance().unwrap();
        // x moved since last tick, so the change shows
        assert_abs_diff_eq!(num(&mut ctx, "level"), n as f64 + 1.0, epsilon = 1e-6);
    }
}

#[test]
fn test_failed_solve_keeps_previous_value() {
    let ty = EntityType::builder("T")
        .rule(
            Rule::optimize("x", |s| {
                let x = s.number("x")?;
                if s.tick() == 0 {
                    Ok((x - 1.0).into())
                } else {
                    Ok((x * x + 1.0).into())
                }
            })
            .deps(["x"])
            .bounds(-2.0, 2.0),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let root = ctx.root();
    assert!(matches!(ctx.advance(), Err(Error::Convergence { .. })));
    let x = ctx.snapshot(root).unwrap()["x"].as_number().unwrap();
    assert_abs_diff_eq!(x, 1.0, epsilon = 1e-6);
}

#[test]
fn test_flag() {
    let ty = EntityType::builder("T")
        .rule(Rule::parameter("p", |_| Ok(0.0.into())))
        .rule(Rule::flag("never", |_| Ok(true.into())).prob("p"))
        .rule(Rule::flag("always", |_| Ok(1.0.into())))
        .rule(Rule::flag("falsy", |_| Ok(0.0.into())))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    for _ in 0..10 {
        assert_eq!(ctx.get("never").unwrap(), Value::Bool(false));
        assert_eq!(ctx.get("always").unwrap(), Value::Bool(true));
        assert_eq!(ctx.get("falsy").unwrap(), Value::Bool(false));
        ctx.advance().unwrap();
    }
}

#[test]
fn test_flag_draws_are_reproducible() {
    let ty = EntityType::builder("T")
        .rule(Rule::flag("coin", |_| Ok(true.into())).prob(0.5))
        .build();
    let draws = |seed: f64| {
        let config = Config::new().with(&["Context", "seed"], seed);
        let mut ctx = Context::instantiate(&ty, config).unwrap();
        (0..32)
            .map(|_| {
                ctx.advance().unwrap();
                ctx.get("coin").unwrap().is_truthy()
            })
            .collect::<Vec<_>>()
    };
    let first = draws(7.0);
    assert_eq!(first, draws(7.0));
    assert!(first.iter().any(|b| *b) && first.iter().any(|b| !*b));
}

#[test]
fn test_drive() {
    let ty = EntityType::builder("T")
        .rule(Rule::drive("temperature", |_| {
            let mut row = ValueMap::new();
            row.insert("temperature".into(), 25.0.into());
            row.insert("Tair".into(), 20.0.into());
            Ok(row.into())
        }))
        .rule(
            Rule::drive("air", |_| {
                let mut row = ValueMap::new();
                row.insert("Tair".into(), 20.0.into());
                Ok(row.into())
            })
            .key("Tair"),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "temperature"), 25.0);
    assert_eq!(num(&mut ctx, "air"), 20.0);

    let missing = EntityType::builder("T")
        .rule(Rule::drive("rain", |_| Ok(ValueMap::new().into())))
        .build();
    let err = Context::instantiate(&missing, Config::new()).err().unwrap();
    assert!(matches!(err, Error::UnresolvedDependency { ref name, .. } if name == "rain"));
}

#[test]
fn test_unit_coercion() {
    let ty = EntityType::builder("T")
        .rule(Rule::derive("length", |_| Ok(Quantity::parse("200 cm")?.into())).unit(unit("m")))
        .rule(Rule::derive("bare", |_| Ok(3.0.into())).unit(unit("m")))
        .rule(
            Rule::derive("area", |s| Ok(s.quantity("length")?.checked_mul(&s.quantity("bare")?)?.into()))
                .deps(["length", "bare"])
                .unit(unit("cm^2")),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let length = ctx.get("length").unwrap().quantity().unwrap();
    assert_eq!(length.unit(), Some(&unit("m")));
    assert_abs_diff_eq!(length.magnitude(), 2.0, epsilon = 1e-12);
    assert_eq!(
        ctx.get("bare").unwrap().quantity().unwrap(),
        Quantity::tagged(3.0, unit("m"))
    );
    assert_abs_diff_eq!(num(&mut ctx, "area"), 60_000.0, epsilon = 1e-6);

    let bad = EntityType::builder("T")
        .rule(Rule::derive("length", |_| Ok(Quantity::parse("1 s")?.into())).unit(unit("m")))
        .build();
    let err = Context::instantiate(&bad, Config::new()).err().unwrap();
    assert!(matches!(&err, Error::Evaluation { rule, .. } if rule == "length"));
    assert!(matches!(err.root_cause(), Error::IncompatibleUnit { .. }));
}

#[test]
fn test_unit_from_another_rule() {
    let ty = EntityType::builder("T")
        .rule(Rule::derive("reference", |_| Ok(Quantity::tagged(1.0, unit("kg")).into())))
        .rule(
            Rule::derive("mass", |_| Ok(Quantity::parse("500 g")?.into()))
                .unit_from("reference"),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let mass = ctx.get("mass").unwrap().quantity().unwrap();
    assert_eq!(mass.unit(), Some(&unit("kg")));
    assert_abs_diff_eq!(mass.magnitude(), 0.5, epsilon = 1e-12);
}

#[test]
fn test_dependency_resolution_order() {
    let ty = EntityType::builder("T")
        .rule(constant("base", 10.0))
        .rule(constant("other", 20.0))
        .rule(Rule::derive("bound", |s| s.get("k")).dep(Dep::new("k").bind("other")))
        .rule(Rule::derive("configured", |s| s.get("k")).dep(Dep::new("k").or(7.0)))
        .rule(Rule::derive("defaulted", |s| s.get("k")).dep(Dep::new("k").or(7.0)))
        .rule(Rule::derive("sibling", |s| s.get("base")).deps(["base"]))
        .build();
    let config = Config::new()
        .with(&["T", "bound", "k"], 5.0)
        .with(&["T", "configured", "k"], 5.0);
    let mut ctx = Context::instantiate(&ty, config).unwrap();
    assert_eq!(num(&mut ctx, "bound"), 20.0);
    assert_eq!(num(&mut ctx, "configured"), 5.0);
    assert_eq!(num(&mut ctx, "defaulted"), 7.0);
    assert_eq!(num(&mut ctx, "sibling"), 10.0);
}

#[test]
fn test_unresolved_dependency() {
    let declared = EntityType::builder("T")
        .rule(Rule::derive("a", |s| s.get("missing")).deps(["missing"]))
        .build();
    let err = Context::instantiate(&declared, Config::new()).err().unwrap();
    assert!(matches!(err, Error::UnresolvedDependency { ref name, .. } if name == "missing"));

    // siblings must be declared to be read
    let undeclared = EntityType::builder("T")
        .rule(constant("base", 1.0))
        .rule(Rule::derive("a", |s| s.get("base")))
        .build();
    let err = Context::instantiate(&undeclared, Config::new()).err().unwrap();
    assert!(matches!(err, Error::UnresolvedDependency { ref rule, .. } if rule == "a"));
}

#[test]
fn test_paths_across_the_tree() {
    let leaf = EntityType::builder("Leaf")
        .rule(constant("area", 2.0))
        .rule(Rule::derive("share", |s| Ok((s.number("area")? / s.number("parent.total")?).into()))
            .deps(["area", "parent.total"]))
        .build();
    let plant = {
        let leaf = Arc::clone(&leaf);
        EntityType::builder("Plant")
            .collection("leaves")
            .rule(Rule::preserve("sprout", move |s| {
                s.branch("leaves", Spawn::new(&leaf).with("area", 3.0));
                s.branch("leaves", Spawn::new(&leaf));
                Ok(true.into())
            }))
            .rule(Rule::derive("total", |s| {
                let mut total = 0.0;
                for leaf in s.children("leaves") {
                    total += s.value_of(leaf, "area")?.quantity()?.magnitude();
                }
                Ok(total.into())
            }))
            .build()
    };

    let mut ctx = Context::instantiate(&plant, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "total"), 0.0);
    ctx.advance().unwrap();
    let root = ctx.root();
    let leaves = ctx.children(root, "leaves").to_vec();
    assert_eq!(leaves.len(), 2);
    assert_eq!(num(&mut ctx, "total"), 5.0);
    assert_abs_diff_eq!(ctx.number(leaves[0], "share").unwrap(), 0.6, epsilon = 1e-12);
    assert_eq!(ctx.number(leaves[1], "context.tick").unwrap(), 1.0);
    assert_eq!(
        ctx.get("leaves").unwrap(),
        Value::List(leaves.iter().map(|id| Value::Entity(*id)).collect())
    );
    assert_eq!(ctx.value(leaves[0], "parent").unwrap(), Value::Entity(root));
    assert!(matches!(
        ctx.value(root, "nothing"),
        Err(Error::UnknownRule { .. })
    ));
    assert_eq!(ctx.walk(), vec![CONTEXT, root, leaves[0], leaves[1]]);
}

#[test]
fn test_flip_and_preserve() {
    let ty = EntityType::builder("T")
        .rule(Rule::flip("started", |s| Ok((s.number("context.tick")? >= 2.0).into()))
            .deps(["context.tick"])
            .init(false))
        .rule(Rule::preserve("first", |s| s.get("context.tick")).deps(["context.tick"]))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let mut seen = Vec::new();
    for _ in 0..4 {
        ctx.advance().unwrap();
        seen.push(ctx.get("started").unwrap().is_truthy());
        assert_eq!(num(&mut ctx, "first"), 0.0);
    }
    assert_eq!(seen, vec![false, true, false, false]);
}

#[test]
fn test_fixed_time_source_computes_once() {
    let calls = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&calls);
    let ty = EntityType::builder("T")
        .rule(
            Rule::derive("once", move |_| {
                counter.set(counter.get() + 1);
                Ok(1.0.into())
            })
            .time(TimeSource::Fixed),
        )
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    ctx.advance_by(5).unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_time_from_another_rule() {
    let ty = EntityType::builder("T")
        .rule(Rule::parameter("warm", |_| Ok(true.into())))
        .rule(Rule::accumulate("thermal_age", |s| Ok((if s.truthy("warm")? { 1.0 } else { 0.0 }).into()))
            .deps(["warm"]))
        .rule(Rule::accumulate("development", |_| Ok(2.0.into())).time_from("thermal_age"))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    ctx.advance_by(3).unwrap();
    assert_eq!(num(&mut ctx, "thermal_age"), 3.0);
    assert_eq!(num(&mut ctx, "development"), 6.0);

    let config = Config::new().with(&["T", "warm"], false);
    let mut ctx = Context::instantiate(&ty, config).unwrap();
    ctx.advance_by(3).unwrap();
    assert_eq!(num(&mut ctx, "development"), 0.0);
}

#[test]
fn test_overrides() {
    let ty = EntityType::builder("T")
        .rule(constant("a", 1.0))
        .rule(Rule::accumulate("b", |_| Ok(1.0.into())).unit(unit("m")))
        .build();
    let mut overrides = ValueMap::new();
    overrides.insert("a".into(), 5.0.into());
    overrides.insert("b".into(), "100 cm".into());
    let mut ctx = Context::instantiate_with(&ty, Config::new(), overrides).unwrap();
    ctx.advance_by(2).unwrap();
    assert_eq!(num(&mut ctx, "a"), 5.0);
    assert_abs_diff_eq!(num(&mut ctx, "b"), 3.0, epsilon = 1e-12);

    let mut unknown = ValueMap::new();
    unknown.insert("zzz".into(), 1.0.into());
    assert!(matches!(
        Context::instantiate_with(&ty, Config::new(), unknown),
        Err(Error::UnknownRule { .. })
    ));
}

#[test]
fn test_accumulate_initial_from_path() {
    let ty = EntityType::builder("T")
        .rule(Rule::parameter("seed_mass", |_| Ok(0.5.into())))
        .rule(Rule::accumulate("mass", |_| Ok(1.0.into())).init("seed_mass"))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    assert_eq!(num(&mut ctx, "mass"), 0.5);
    ctx.advance_by(2).unwrap();
    assert_eq!(num(&mut ctx, "mass"), 2.5);
}

#[test]
fn test_clock_configuration() {
    let ty = EntityType::builder("T")
        .rule(
            Rule::accumulate("height", |_| Ok(Quantity::parse("2 m/d")?.into()))
                .unit(unit("m")),
        )
        .build();
    let config = Config::from_ron(
        r#"{ "Clock": { "interval": 0.5, "unit": "d", "datetime": "2020-01-01" } }"#,
    )
    .unwrap();
    let mut ctx = Context::instantiate(&ty, config).unwrap();
    ctx.advance_by(2).unwrap();
    assert_eq!(ctx.time(), Quantity::tagged(1.0, unit("d")));
    assert_abs_diff_eq!(num(&mut ctx, "height"), 2.0, epsilon = 1e-9);
    assert_eq!(
        ctx.datetime().map(|d| d.to_string()),
        Some("2020-01-02 00:00:00".to_string())
    );
    assert_eq!(
        ctx.value(CONTEXT, "datetime").unwrap(),
        Value::from("2020-01-02 00:00:00")
    );
    assert_eq!(ctx.number(CONTEXT, "tick").unwrap(), 2.0);

    let bad = Config::new().with(&["Clock", "datetime"], "soon");
    assert!(matches!(
        Context::instantiate(&ty, bad),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_queued_effects_run_by_priority() {
    let ty = EntityType::builder("T").build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    for (priority, label) in [(5, "late"), (1, "early"), (-1, "before"), (1, "early2")] {
        let log = Rc::clone(&log);
        ctx.queue(priority, move |ctx| {
            log.borrow_mut().push((label, ctx.tick()));
            Ok(())
        });
    }
    ctx.advance().unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("before", 1), ("early", 1), ("early2", 1), ("late", 1)]
    );
}

#[test]
fn test_failed_effect_aborts_its_phase() {
    let ty = EntityType::builder("T").build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    for (priority, label) in [(1, "first"), (2, "failing"), (3, "third")] {
        let log = Rc::clone(&log);
        ctx.queue(priority, move |_| {
            if label == "failing" {
                return Err(Error::InvalidConfig("rejected".into()));
            }
            log.borrow_mut().push(label);
            Ok(())
        });
    }
    assert_eq!(
        ctx.advance().err(),
        Some(Error::InvalidConfig("rejected".into()))
    );
    assert_eq!(*log.borrow(), vec!["first"]);

    // the rest of the aborted flush is dropped, not retried
    ctx.advance().unwrap();
    assert_eq!(*log.borrow(), vec!["first"]);
}

#[test]
fn test_errors_name_rule_and_entity() {
    let ty = EntityType::builder("Leaf")
        .rule(Rule::derive("kind", |_| Ok("broad".into())))
        .rule(Rule::derive("size", |s| Ok((s.number("kind")? * 2.0).into())).deps(["kind"]))
        .build();
    let err = Context::instantiate(&ty, Config::new()).err().unwrap();
    match &err {
        Error::Evaluation { rule, entity, .. } => {
            assert_eq!(rule, "size");
            assert_eq!(entity, "Leaf(entity:1)");
        }
        other => panic!("unexpected {other}"),
    }
    assert!(matches!(err.root_cause(), Error::TypeError { .. }));
}

#[test]
fn test_failed_advance_reports_error() {
    let ty = EntityType::builder("T")
        .rule(Rule::derive("fragile", |s| {
            if s.tick() >= 2 {
                Err(Error::InvalidConfig("out of range".into()))
            } else {
                Ok(0.0.into())
            }
        }))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    ctx.advance().unwrap();
    assert!(matches!(ctx.advance(), Err(Error::Evaluation { .. })));
}

#[test]
fn test_stage() {
    let flowering = EntityType::builder("Flowering")
        .extends(&stage_type())
        .rule(Rule::derive("ready", |s| Ok((s.tick() >= 2).into())))
        .rule(Rule::derive("over", |s| Ok((s.tick() >= 4).into())))
        .build();
    assert_eq!(flowering.tags(), &["Flowering", "Stage", "System"]);
    let mut ctx = Context::instantiate(&flowering, Config::new()).unwrap();
    let mut ing = Vec::new();
    for _ in 0..5 {
        ctx.advance().unwrap();
        ing.push(ctx.get("ing").unwrap().is_truthy());
    }
    assert_eq!(ing, vec![false, true, true, false, false]);
}

#[test]
fn test_snapshot_and_introspection() {
    let ty = EntityType::builder("T")
        .rule(constant("a", 1.0))
        .rule(Rule::accumulate("b", |_| Ok(1.0.into())))
        .build();
    let mut ctx = Context::instantiate(&ty, Config::new()).unwrap();
    ctx.advance_by(2).unwrap();
    let root = ctx.root();
    let snapshot = ctx.snapshot(root).unwrap();
    assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(snapshot["b"], Value::from(2.0));
    assert_eq!(ctx.type_of(root).map(|t| t.name()), Some("T"));
    assert_eq!(ctx.type_of(CONTEXT).map(|t| t.tags().to_vec()), Some(vec![
        "Context".to_string(),
        "Clock".to_string(),
        "System".to_string()
    ]));
    assert_eq!(ctx.parent(root), Some(CONTEXT));
    assert!(matches!(
        ctx.snapshot(EntityId(99)),
        Err(Error::EntityNotFound(_))
    ));
}
