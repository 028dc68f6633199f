//! YAML parsing and script validation.
//!
//! Parses a script document and checks the constraints the run compiler
//! relies on but does not enforce itself:
//! - iterators must wrap a run and vary something
//! - group names unique, no '%', adjacency sized groups+1
//! - probabilistic phases sum to 1 (within 0.001), no empty phases or items
//! - profile references and example-path overrides resolve

use super::types::*;
use std::collections::HashSet;
use std::path::Path;

/// Allowed deviation of a probabilistic phase's probability sum from 1.
pub const PROBABILITY_TOLERANCE: f64 = 0.001;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a script file from disk.
pub fn parse_script_file(path: &Path) -> Result<Script, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_script(&content)
}

/// Parse a script from a string. Runs without an adjacency matrix get the
/// default one.
pub fn parse_script(yaml: &str) -> Result<Script, String> {
    let mut script: Script =
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))?;
    for child in &mut script.children {
        normalize_child(child);
    }
    Ok(script)
}

fn normalize_child(child: &mut ScriptChild) {
    match child {
        ScriptChild::Run(run) => run.normalize_adjacency(),
        ScriptChild::Iterator(it) => {
            if let Some(inner) = it.child.as_deref_mut() {
                normalize_child(inner);
            }
        }
    }
}

/// Load preferences; a missing file yields the defaults.
pub fn parse_preferences_file(path: &Path) -> Result<Preferences, String> {
    if !path.exists() {
        return Ok(Preferences::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    if content.trim().is_empty() {
        return Ok(Preferences::default());
    }
    serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid preferences {}: {}", path.display(), e))
}

/// Validate a parsed script. Returns a list of errors (empty = valid).
pub fn validate_script(script: &Script) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if script.name.trim().is_empty() {
        push(&mut errors, "script name must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for child in &script.children {
        if !seen.insert(child.name()) {
            push(&mut errors, format!("duplicate top-level name '{}'", child.name()));
        }
        match child {
            ScriptChild::Run(run) => validate_run(script, run, &mut errors),
            ScriptChild::Iterator(it) => validate_iterator(script, it, &mut errors),
        }
    }

    errors
}

fn push(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

fn validate_iterator(script: &Script, it: &RunIterator, errors: &mut Vec<ValidationError>) {
    let run = it.embedded_run();
    if run.is_none() {
        push(errors, format!("iterator '{}' has no run", it.name));
    }

    for level in it.levels() {
        match &level.varying {
            None => push(errors, format!("iterator '{}' has no varying parameter", level.name)),
            Some(v) if v.is_blank() => {
                push(errors, format!("iterator '{}' has no varying parameter", level.name))
            }
            Some(Varying::HiddenUnits(group)) => {
                if let Some(run) = run {
                    if run.group_index(group).is_none() {
                        push(
                            errors,
                            format!("iterator '{}' varies units of unknown group '{}'", level.name, group),
                        );
                    }
                }
            }
            Some(_) => {}
        }
        if level.repeat == 0 {
            push(errors, format!("iterator '{}' repeat must be at least 1", level.name));
        }
        if let Some(flag) = &level.random {
            if flag.mode != RandomMode::Gaussian && flag.arg1 > flag.arg2 {
                push(
                    errors,
                    format!("iterator '{}' random range [{}, {}] is empty", level.name, flag.arg1, flag.arg2),
                );
            }
            if flag.mode == RandomMode::Gaussian && flag.arg2 < 0.0 {
                push(errors, format!("iterator '{}' gaussian stddev must be >= 0", level.name));
            }
        }
    }

    if let Some(run) = run {
        validate_run(script, run, errors);
    }
}

fn validate_run(script: &Script, run: &Run, errors: &mut Vec<ValidationError>) {
    if run.ticks == 0 {
        push(errors, format!("run '{}' must have at least one tick", run.name));
    }

    let mut names = HashSet::new();
    for g in &run.groups {
        if g.name.contains(CONNECTION_SEP) {
            push(
                errors,
                format!("run '{}': group name '{}' must not contain '%'", run.name, g.name),
            );
        }
        if !names.insert(g.name.as_str()) {
            push(errors, format!("run '{}': duplicate group name '{}'", run.name, g.name));
        }
        if g.units == 0 {
            push(errors, format!("run '{}': group '{}' has zero units", run.name, g.name));
        }
    }

    if !run.adjacency.fits(run.groups.len()) {
        push(
            errors,
            format!(
                "run '{}': adjacency must be {}x{} (groups + bias)",
                run.name,
                run.groups.len() + 1,
                run.groups.len() + 1
            ),
        );
    }

    for phase in &run.phases {
        if phase.items.is_empty() {
            push(errors, format!("run '{}': phase '{}' is empty", run.name, phase.name));
        }
        if phase.order == PhaseOrder::Probabilistic {
            let sum: f64 = phase.items.iter().map(|i| i.probability).sum();
            if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
                push(
                    errors,
                    format!(
                        "run '{}': probabilities in phase '{}' sum to {}, not 1",
                        run.name, phase.name, sum
                    ),
                );
            }
        }
        for item in &phase.items {
            validate_item(script, run, phase, item, errors);
        }
    }
}

fn validate_item(
    script: &Script,
    run: &Run,
    phase: &Phase,
    item: &PhaseItem,
    errors: &mut Vec<ValidationError>,
) {
    let path = format!("{}/{}:{}", run.name, phase.name, item.name);

    if item.components.is_empty() {
        push(errors, format!("{}: phase item has no network components", path));
    }
    if !(0.0..=1.0).contains(&item.probability) {
        push(errors, format!("{}: probability {} outside [0, 1]", path, item.probability));
    }

    if item.mode == Mode::Train {
        match item.profile.as_deref() {
            None => push(errors, format!("{}: TRAIN item has no training profile", path)),
            Some(name) if script.training_profile(name).is_none() => {
                push(errors, format!("{}: unknown training profile '{}'", path, name))
            }
            Some(_) => {}
        }
    }
    for t in &item.test_profiles {
        if !script.test_profiles.iter().any(|p| &p.name == t) {
            push(errors, format!("{}: unknown test profile '{}'", path, t));
        }
    }

    for o in &item.overrides {
        if o.variable_name == "example_path" {
            if let ParamValue::Text(p) = &o.value {
                if !Path::new(p).is_file() {
                    push(errors, format!("{}: example set '{}' does not exist", path, p));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
name: demo
training_profiles:
  - name: train
    parameters:
      - variable_name: epsilon
        form_name: Epsilon
        value: 0.1
children:
  - run:
      name: base
      groups:
        - name: input
        - name: output
      phases:
        - name: p1
          order: probabilistic
          items:
            - name: a
              profile: train
              probability: 0.5
              components:
                groups: [input, output]
            - name: b
              profile: train
              probability: 0.5
              components:
                groups: [input]
"#;

    fn messages(script: &Script) -> Vec<String> {
        validate_script(script).into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn test_parser_valid_script() {
        let script = parse_script(BASE).unwrap();
        assert!(messages(&script).is_empty(), "{:?}", messages(&script));
    }

    #[test]
    fn test_parser_default_adjacency() {
        let script = parse_script(BASE).unwrap();
        let ScriptChild::Run(run) = &script.children[0] else {
            panic!("expected run");
        };
        assert!(run.adjacency.fits(2));
        assert!(run.adjacency.is_connected(2, 0));
    }

    #[test]
    fn test_parser_probability_sum_flagged() {
        let yaml = BASE.replace("probability: 0.5\n              components:\n                groups: [input]\n",
            "probability: 0.47\n              components:\n                groups: [input]\n");
        let script = parse_script(&yaml).unwrap();
        let msgs = messages(&script);
        assert_eq!(msgs.len(), 1, "{:?}", msgs);
        assert!(msgs[0].contains("sum to"));
    }

    #[test]
    fn test_parser_probability_within_tolerance() {
        let yaml = BASE.replace("probability: 0.5\n              components:\n                groups: [input]\n",
            "probability: 0.5004\n              components:\n                groups: [input]\n");
        let script = parse_script(&yaml).unwrap();
        assert!(messages(&script).is_empty());
    }

    #[test]
    fn test_parser_iterator_without_run() {
        let yaml = r#"
name: s
children:
  - iterator:
      name: empty
      varying: seed
"#;
        let script = parse_script(yaml).unwrap();
        let msgs = messages(&script);
        assert!(msgs.iter().any(|m| m.contains("has no run")));
    }

    #[test]
    fn test_parser_blank_varying() {
        let yaml = r#"
name: s
children:
  - iterator:
      name: it
      varying:
        parameter: ""
      child:
        run:
          name: r
"#;
        let script = parse_script(yaml).unwrap();
        assert!(messages(&script).iter().any(|m| m.contains("no varying parameter")));
    }

    #[test]
    fn test_parser_group_rules() {
        let yaml = r#"
name: s
children:
  - run:
      name: r
      groups:
        - name: "a%b"
        - name: dup
        - name: dup
"#;
        let script = parse_script(yaml).unwrap();
        let msgs = messages(&script);
        assert!(msgs.iter().any(|m| m.contains("must not contain '%'")));
        assert!(msgs.iter().any(|m| m.contains("duplicate group name 'dup'")));
    }

    #[test]
    fn test_parser_empty_phase_and_item() {
        let yaml = r#"
name: s
children:
  - run:
      name: r
      groups:
        - name: a
      phases:
        - name: empty
        - name: p
          items:
            - name: bare
              mode: TEST
"#;
        let script = parse_script(yaml).unwrap();
        let msgs = messages(&script);
        assert!(msgs.iter().any(|m| m.contains("phase 'empty' is empty")));
        assert!(msgs.iter().any(|m| m.contains("no network components")));
    }

    #[test]
    fn test_parser_missing_example_override() {
        let yaml = BASE.replace(
            "              probability: 0.5\n              components:\n                groups: [input, output]\n",
            "              probability: 0.5\n              components:\n                groups: [input, output]\n              overrides:\n                - variable_name: example_path\n                  value: /definitely/not/here.ex\n",
        );
        let script = parse_script(&yaml).unwrap();
        assert!(messages(&script).iter().any(|m| m.contains("does not exist")));
    }

    #[test]
    fn test_parser_hidden_units_unknown_group() {
        let yaml = r#"
name: s
children:
  - iterator:
      name: it
      varying:
        hidden_units: ghost
      child:
        run:
          name: r
"#;
        let script = parse_script(yaml).unwrap();
        assert!(messages(&script).iter().any(|m| m.contains("unknown group 'ghost'")));
    }

    #[test]
    fn test_parser_preferences_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = parse_preferences_file(&dir.path().join("nope.yaml")).unwrap();
        assert!(prefs.multiprocessing);
    }

    #[test]
    fn test_parser_preferences_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.yaml");
        std::fs::write(&path, "build_method: scons\nmultiprocessing: false\n").unwrap();
        let prefs = parse_preferences_file(&path).unwrap();
        assert_eq!(prefs.build_method, BuildMethod::Scons);
        assert!(!prefs.multiprocessing);
    }

    #[test]
    fn test_parser_bad_yaml() {
        assert!(parse_script("name: [unclosed").is_err());
    }
}
