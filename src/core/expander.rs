//! Iterator expansion: nested sweeps to a flat list of resolved runs.
//!
//! Each iterator level with a varying parameter contributes one dimension.
//! The cartesian product runs outermost-major, and every point yields an
//! independent copy of the embedded run named `<run>_<n>` (1-based).

use super::types::*;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Significant digits kept when normalizing sweep values.
pub const SIGNIFICANT_DIGITS: usize = 6;

/// One sweep dimension: what it varies, where, and the values it takes.
#[derive(Debug, Clone)]
pub struct Sweep {
    pub iterator: String,
    pub varying: Varying,
    pub scope: Scope,
    pub values: Vec<Number>,
}

/// Round to [`SIGNIFICANT_DIGITS`] significant digits; integral results
/// become [`Number::Int`].
pub fn normalize(x: f64) -> Number {
    if !x.is_finite() {
        return Number::Float(x);
    }
    let rounded = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, x)
        .parse::<f64>()
        .unwrap_or(x);
    if rounded.fract() == 0.0 && rounded.abs() < 9.0e15 {
        Number::Int(rounded as i64)
    } else {
        Number::Float(rounded)
    }
}

/// Values one iterator level takes, in order.
///
/// Arithmetic levels step `initial_value + i * delta`. Random levels draw
/// `repeat` samples from their own flag's distribution; integer samples are
/// kept exact, everything else is normalized.
pub fn sweep_values<R: Rng + ?Sized>(level: &RunIterator, rng: &mut R) -> Result<Vec<Number>, String> {
    let n = level.repeat as usize;
    let Some(flag) = level.random else {
        return Ok((0..n)
            .map(|i| normalize(level.initial_value + i as f64 * level.delta))
            .collect());
    };
    match flag.mode {
        RandomMode::Int => {
            let lo = flag.arg1.ceil() as i64;
            let hi = flag.arg2.floor() as i64;
            if lo > hi {
                return Err(format!(
                    "iterator '{}': no integer in [{}, {}]",
                    level.name, flag.arg1, flag.arg2
                ));
            }
            Ok((0..n).map(|_| Number::Int(rng.random_range(lo..=hi))).collect())
        }
        RandomMode::Double => {
            if flag.arg1 > flag.arg2 || !flag.arg1.is_finite() || !flag.arg2.is_finite() {
                return Err(format!(
                    "iterator '{}': invalid range [{}, {}]",
                    level.name, flag.arg1, flag.arg2
                ));
            }
            Ok((0..n)
                .map(|_| normalize(rng.random_range(flag.arg1..=flag.arg2)))
                .collect())
        }
        RandomMode::Gaussian => {
            let normal = Normal::new(flag.arg1, flag.arg2)
                .map_err(|e| format!("iterator '{}': {}", level.name, e))?;
            Ok((0..n).map(|_| normalize(normal.sample(rng))).collect())
        }
    }
}

/// Sweep dimensions of an iterator chain, outermost first. Levels without a
/// varying parameter are skipped.
pub fn sweeps<R: Rng + ?Sized>(iterator: &RunIterator, rng: &mut R) -> Result<Vec<Sweep>, String> {
    let mut out = Vec::new();
    for level in iterator.levels() {
        let Some(varying) = level.varying.as_ref().filter(|v| !v.is_blank()) else {
            continue;
        };
        out.push(Sweep {
            iterator: level.name.clone(),
            varying: varying.clone(),
            scope: level.applied_paths.clone(),
            values: sweep_values(level, rng)?,
        });
    }
    Ok(out)
}

/// Cartesian product, first dimension varying slowest. No dimensions yields
/// a single empty tuple.
pub fn cartesian_product(dimensions: &[Vec<Number>]) -> Vec<Vec<Number>> {
    let mut tuples: Vec<Vec<Number>> = vec![Vec::new()];
    for dim in dimensions {
        tuples = tuples
            .into_iter()
            .flat_map(|prefix| {
                dim.iter().map(move |v| {
                    let mut t = prefix.clone();
                    t.push(*v);
                    t
                })
            })
            .collect();
    }
    tuples
}

/// Expand one top-level child.
///
/// A bare run yields one copy with no overrides. An iterator yields one run
/// per point of its sweep product, or nothing when it wraps no run.
pub fn expand<R: Rng + ?Sized>(child: &ScriptChild, rng: &mut R) -> Result<Vec<ResolvedRun>, String> {
    let iterator = match child {
        ScriptChild::Run(run) => return Ok(vec![ResolvedRun::bare(run)]),
        ScriptChild::Iterator(it) => it,
    };
    let Some(run) = iterator.embedded_run() else {
        log::warn!("iterator '{}' wraps no run, skipping", iterator.name);
        return Ok(Vec::new());
    };

    let dims = sweeps(iterator, rng)?;
    let values: Vec<Vec<Number>> = dims.iter().map(|d| d.values.clone()).collect();
    let runs = cartesian_product(&values)
        .into_iter()
        .enumerate()
        .map(|(n, point)| {
            let mut resolved = ResolvedRun::bare(run);
            resolved.run.name = format!("{}_{}", run.name, n + 1);
            for (dim, v) in dims.iter().zip(point) {
                resolved
                    .overrides
                    .set(dim.varying.key(), dim.varying.value(v), dim.scope.clone());
            }
            resolved
        })
        .collect();
    Ok(runs)
}

/// Expand every top-level child of `script` into one immutable batch.
pub fn prepare<R: Rng + ?Sized>(script: &Script, rng: &mut R) -> Result<RunBatch, String> {
    let mut runs = Vec::new();
    for child in &script.children {
        let expanded = expand(child, rng)?;
        log::debug!("{} expanded to {} run(s)", child.name(), expanded.len());
        runs.extend(expanded);
    }
    Ok(RunBatch {
        script: script.clone(),
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn level(name: &str, varying: Option<Varying>, repeat: u32, initial: f64, delta: f64) -> RunIterator {
        RunIterator {
            name: name.to_string(),
            varying,
            repeat,
            initial_value: initial,
            delta,
            random: None,
            applied_paths: Scope::All,
            child: None,
        }
    }

    fn wrap(mut outer: RunIterator, inner: ScriptChild) -> ScriptChild {
        outer.child = Some(Box::new(inner));
        ScriptChild::Iterator(outer)
    }

    fn param(name: &str) -> Option<Varying> {
        Some(Varying::Parameter(name.to_string()))
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn scalar(r: &ResolvedRun, key: &str) -> Number {
        r.overrides
            .get(&OverrideKey::Parameter(key.to_string()))
            .and_then(|o| o.value.as_number())
            .unwrap()
    }

    #[test]
    fn test_expander_normalize_drift() {
        let values = sweep_values(&level("it", param("x"), 3, 0.1, 0.1), &mut rng()).unwrap();
        assert_eq!(
            values,
            vec![Number::Float(0.1), Number::Float(0.2), Number::Float(0.3)]
        );
    }

    #[test]
    fn test_expander_normalize_integral() {
        assert_eq!(normalize(3.0), Number::Int(3));
        assert_eq!(normalize(2.9999999999), Number::Int(3));
        assert_eq!(normalize(0.15000000000000002), Number::Float(0.15));
        assert_eq!(normalize(1234.5678), Number::Float(1234.57));
    }

    #[test]
    fn test_expander_bare_run() {
        let child = ScriptChild::Run(Run::new("solo"));
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name(), "solo");
        assert!(runs[0].overrides.is_empty());
    }

    #[test]
    fn test_expander_simple_sweep() {
        let mut it = level("eps", param("Epsilon"), 3, 0.1, 0.05);
        it.applied_paths = Scope::Items(vec!["train:learn".into()]);
        let child = wrap(it, ScriptChild::Run(Run::new("base")));
        let runs = expand(&child, &mut rng()).unwrap();
        let names: Vec<_> = runs.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["base_1", "base_2", "base_3"]);
        let values: Vec<_> = runs.iter().map(|r| scalar(r, "Epsilon")).collect();
        assert_eq!(
            values,
            vec![Number::Float(0.1), Number::Float(0.15), Number::Float(0.2)]
        );
        let scope = &runs[0]
            .overrides
            .get(&OverrideKey::Parameter("Epsilon".into()))
            .unwrap()
            .scope;
        assert_eq!(scope, &Scope::Items(vec!["train:learn".into()]));
    }

    #[test]
    fn test_expander_nested_outer_major() {
        let inner = wrap(level("eps", param("Epsilon"), 3, 0.1, 0.1), ScriptChild::Run(Run::new("base")));
        let child = wrap(level("mom", param("Momentum"), 2, 0.5, 0.4), inner);
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(runs.len(), 6);
        let moms: Vec<_> = runs.iter().map(|r| scalar(r, "Momentum")).collect();
        let eps: Vec<_> = runs.iter().map(|r| scalar(r, "Epsilon").as_f64()).collect();
        assert_eq!(moms[..3], [Number::Float(0.5); 3]);
        assert_eq!(moms[3..], [Number::Float(0.9); 3]);
        assert_eq!(eps, vec![0.1, 0.2, 0.3, 0.1, 0.2, 0.3]);
        assert_eq!(runs[5].name(), "base_6");
    }

    #[test]
    fn test_expander_blank_levels_pass_through() {
        let inner = wrap(level("blank", None, 5, 0.0, 1.0), ScriptChild::Run(Run::new("base")));
        let child = wrap(level("seed", Some(Varying::Seed), 2, 10.0, 1.0), inner);
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(runs.len(), 2);
        let seeds: Vec<_> = runs
            .iter()
            .map(|r| r.overrides.get(&OverrideKey::Seed).unwrap().value.clone())
            .collect();
        assert_eq!(
            seeds,
            vec![
                OverrideValue::Scalar(Number::Int(10)),
                OverrideValue::Scalar(Number::Int(11))
            ]
        );
    }

    #[test]
    fn test_expander_all_blank_yields_one_run() {
        let child = wrap(level("blank", param(""), 4, 0.0, 1.0), ScriptChild::Run(Run::new("base")));
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name(), "base_1");
    }

    #[test]
    fn test_expander_no_run() {
        let child = ScriptChild::Iterator(level("lonely", param("Epsilon"), 3, 0.0, 1.0));
        assert!(expand(&child, &mut rng()).unwrap().is_empty());
    }

    #[test]
    fn test_expander_hidden_units_pair() {
        let child = wrap(
            level("units", Some(Varying::HiddenUnits("hidden".into())), 2, 10.0, 5.0),
            ScriptChild::Run(Run::new("base")),
        );
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(
            runs[1].overrides.get(&OverrideKey::HiddenUnits).unwrap().value,
            OverrideValue::HiddenUnits {
                group: "hidden".into(),
                units: 15
            }
        );
    }

    #[test]
    fn test_expander_random_levels_use_own_flag() {
        let mut outer = level("outer", param("A"), 4, 0.0, 0.0);
        outer.random = Some(RandomFlag {
            mode: RandomMode::Int,
            arg1: 100.0,
            arg2: 200.0,
        });
        let mut inner = level("inner", param("B"), 4, 0.0, 0.0);
        inner.random = Some(RandomFlag {
            mode: RandomMode::Double,
            arg1: 0.0,
            arg2: 1.0,
        });
        let child = wrap(outer, wrap(inner, ScriptChild::Run(Run::new("r"))));
        let runs = expand(&child, &mut rng()).unwrap();
        assert_eq!(runs.len(), 16);
        for r in &runs {
            let a = scalar(r, "A");
            assert!(matches!(a, Number::Int(v) if (100..=200).contains(&v)));
            let b = scalar(r, "B").as_f64();
            assert!((0.0..=1.0).contains(&b));
        }
    }

    #[test]
    fn test_expander_gaussian_seeded() {
        let mut it = level("g", param("A"), 5, 0.0, 0.0);
        it.random = Some(RandomFlag {
            mode: RandomMode::Gaussian,
            arg1: 10.0,
            arg2: 0.5,
        });
        let a = sweep_values(&it, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = sweep_values(&it, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_expander_bad_random_range() {
        let mut it = level("bad", param("A"), 2, 0.0, 0.0);
        it.random = Some(RandomFlag {
            mode: RandomMode::Int,
            arg1: 5.0,
            arg2: 1.0,
        });
        assert!(sweep_values(&it, &mut rng()).is_err());
    }

    #[test]
    fn test_expander_prepare_flattens() {
        let script = Script {
            name: "s".into(),
            description: None,
            training_profiles: vec![],
            test_profiles: vec![],
            children: vec![
                ScriptChild::Run(Run::new("a")),
                wrap(level("it", Some(Varying::WeightRange), 3, 0.1, 0.1), ScriptChild::Run(Run::new("b"))),
            ],
        };
        let batch = prepare(&script, &mut rng()).unwrap();
        let names: Vec<_> = batch.runs.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b_1", "b_2", "b_3"]);
    }

    proptest! {
        #[test]
        fn prop_cartesian_completeness(lens in proptest::collection::vec(1usize..5, 0..4)) {
            let dims: Vec<Vec<Number>> = lens
                .iter()
                .map(|&n| (0..n as i64).map(Number::Int).collect())
                .collect();
            let expected: usize = lens.iter().product();
            let product = cartesian_product(&dims);
            prop_assert_eq!(product.len(), expected);
            let mut seen = std::collections::HashSet::new();
            for t in &product {
                let key: Vec<i64> = t.iter().map(|n| n.as_i64()).collect();
                prop_assert!(seen.insert(key));
            }
        }

        #[test]
        fn prop_expanded_names_unique(outer in 1u32..5, inner in 1u32..5) {
            let child = wrap(
                level("o", param("A"), outer, 0.0, 1.0),
                wrap(level("i", param("B"), inner, 0.0, 1.0), ScriptChild::Run(Run::new("r"))),
            );
            let runs = expand(&child, &mut rng()).unwrap();
            prop_assert_eq!(runs.len(), (outer * inner) as usize);
            for (n, r) in runs.iter().enumerate() {
                prop_assert_eq!(r.name(), format!("r_{}", n + 1));
            }
        }

        #[test]
        fn prop_normalize_idempotent(x in -1.0e6f64..1.0e6) {
            let once = normalize(x);
            prop_assert_eq!(normalize(once.as_f64()), once);
        }

        #[test]
        fn prop_normalize_keeps_integers(i in -1_000_000i64..1_000_000) {
            prop_assert_eq!(normalize(i as f64), Number::Int(i));
        }
    }
}
