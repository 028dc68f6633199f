//! Override resolution for a phase item inside a resolved run.
//!
//! Precedence, highest first: an iterator override whose scope covers the
//! item, a manual override on the item, the training profile's value.
//! Resolution never fails: unknown names fall through to whatever value is
//! available.

use super::types::*;

/// Everything needed to resolve values for one phase item.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub script: &'a Script,
    pub run: &'a ResolvedRun,
    pub phase: &'a Phase,
    pub item: &'a PhaseItem,
}

impl<'a> ItemContext<'a> {
    pub fn new(script: &'a Script, run: &'a ResolvedRun, phase: &'a Phase, item: &'a PhaseItem) -> Self {
        Self {
            script,
            run,
            phase,
            item,
        }
    }

    /// `"phase:item"` path used by override scopes.
    pub fn path(&self) -> String {
        format!("{}:{}", self.phase.name, self.item.name)
    }

    /// Iterator override for `key`, if its scope covers this item.
    pub fn scoped_override(&self, key: &OverrideKey) -> Option<&'a OverrideValue> {
        self.run
            .overrides
            .get(key)
            .filter(|o| o.scope.covers(&self.phase.name, &self.item.name))
            .map(|o| &o.value)
    }

    /// Training profile referenced by the item.
    pub fn profile(&self) -> Option<&'a TrainingProfile> {
        self.item
            .profile
            .as_deref()
            .and_then(|name| self.script.training_profile(name))
    }
}

/// A profile parameter after override resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParam {
    pub variable_name: String,
    pub value: ParamValue,
}

/// Effective value of `param` for the item in `ctx`.
pub fn effective_value(ctx: &ItemContext<'_>, param: &Parameter) -> ParamValue {
    let key = OverrideKey::Parameter(param.form_name().to_string());
    if let Some(n) = ctx.scoped_override(&key).and_then(OverrideValue::as_number) {
        return ParamValue::from(n);
    }
    if let Some(local) = ctx
        .item
        .overrides
        .iter()
        .find(|o| o.variable_name == param.variable_name)
    {
        return local.value.clone();
    }
    param.value.clone()
}

/// Every profile parameter of the item, resolved, in profile order.
///
/// `profile_name` is never emitted. `example_path` is only emitted for TRAIN
/// items; TEST items take their examples from linked test profiles.
pub fn resolved_parameters(ctx: &ItemContext<'_>) -> Vec<ResolvedParam> {
    let Some(profile) = ctx.profile() else {
        return Vec::new();
    };
    profile
        .parameters
        .iter()
        .filter(|p| p.variable_name != "profile_name")
        .filter(|p| p.variable_name != "example_path" || ctx.item.mode == Mode::Train)
        .map(|p| ResolvedParam {
            variable_name: p.variable_name.clone(),
            value: effective_value(ctx, p),
        })
        .collect()
}

/// Activation noise per included group, manual values first, iterator
/// overrides replacing or appending.
pub fn activation_noise(ctx: &ItemContext<'_>) -> Vec<(String, f64)> {
    group_noise(ctx, &ctx.item.noise.activation, |k| match k {
        OverrideKey::ActivationNoise(g) => Some(g.as_str()),
        _ => None,
    })
}

/// Input noise per included group, merged like [`activation_noise`].
pub fn input_noise(ctx: &ItemContext<'_>) -> Vec<(String, f64)> {
    group_noise(ctx, &ctx.item.noise.input, |k| match k {
        OverrideKey::InputNoise(g) => Some(g.as_str()),
        _ => None,
    })
}

fn group_noise(
    ctx: &ItemContext<'_>,
    manual: &indexmap::IndexMap<String, f64>,
    target: fn(&OverrideKey) -> Option<&str>,
) -> Vec<(String, f64)> {
    let mut out: Vec<(String, f64)> = manual
        .iter()
        .filter(|(g, _)| ctx.item.includes_group(g))
        .map(|(g, v)| (g.clone(), *v))
        .collect();
    for (key, o) in ctx.run.overrides.iter() {
        let Some(group) = target(key) else { continue };
        if !ctx.item.includes_group(group) || !o.scope.covers(&ctx.phase.name, &ctx.item.name) {
            continue;
        }
        let Some(n) = o.value.as_number() else { continue };
        upsert(&mut out, group, n.as_f64());
    }
    out
}

/// Weight noise per included connection. Additive overrides are merged
/// before multiplicative ones; an override replaces the kind as well as the
/// value of a manual entry.
pub fn weight_noise(ctx: &ItemContext<'_>) -> Vec<(String, WeightNoise)> {
    let mut out: Vec<(String, WeightNoise)> = ctx
        .item
        .noise
        .weight
        .iter()
        .filter(|(c, _)| ctx.item.includes_connection(c))
        .map(|(c, w)| (c.clone(), *w))
        .collect();
    for pass in [WeightNoiseKind::Additive, WeightNoiseKind::Multiplicative] {
        for (key, o) in ctx.run.overrides.iter() {
            let OverrideKey::WeightNoise { kind, connection } = key else { continue };
            if *kind != pass
                || !ctx.item.includes_connection(connection)
                || !o.scope.covers(&ctx.phase.name, &ctx.item.name)
            {
                continue;
            }
            let Some(n) = o.value.as_number() else { continue };
            upsert(
                &mut out,
                connection,
                WeightNoise {
                    kind: pass,
                    value: n.as_f64(),
                },
            );
        }
    }
    out
}

fn upsert<T>(entries: &mut Vec<(String, T)>, name: &str, value: T) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = value,
        None => entries.push((name.to_string(), value)),
    }
}

// Run-level values ignore scope: they apply to the whole run.

pub fn effective_seed(run: &ResolvedRun) -> Number {
    run_level(run, &OverrideKey::Seed).unwrap_or(Number::Int(run.run.seed))
}

pub fn effective_bias(run: &ResolvedRun) -> Number {
    run_level(run, &OverrideKey::BiasValue).unwrap_or(Number::Float(run.run.bias_value))
}

pub fn effective_weight_range(run: &ResolvedRun) -> Number {
    run_level(run, &OverrideKey::WeightRange).unwrap_or(Number::Float(run.run.weight_range))
}

fn run_level(run: &ResolvedRun, key: &OverrideKey) -> Option<Number> {
    run.overrides.get(key).and_then(|o| o.value.as_number())
}

/// Unit count for `group`, honoring a hidden-units override.
pub fn effective_units(run: &ResolvedRun, group: &Group) -> i64 {
    match run.overrides.get(&OverrideKey::HiddenUnits).map(|o| &o.value) {
        Some(OverrideValue::HiddenUnits { group: g, units }) if *g == group.name => *units,
        _ => i64::from(group.units),
    }
}
