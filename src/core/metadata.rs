//! Tab-delimited run metadata, the hand-off to the archiver.
//!
//! One line per phase item (`key=value` pairs, tab-terminated), each followed
//! by one `GROUP` line per run group the item includes.

use super::resolver::{self, ItemContext};
use super::types::*;
use std::path::Path;

pub const GROUP_PREFIX: &str = "GROUP";

/// Render the metadata file for `resolved`. `start_date` is a UTC date
/// (`M-D-YYYY`), see [`crate::journal::eventlog::start_date`].
pub fn metadata_content(script: &Script, resolved: &ResolvedRun, start_date: &str) -> String {
    let run = &resolved.run;
    let seed = resolver::effective_seed(resolved);
    let bias = resolver::effective_bias(resolved);
    let range = resolver::effective_weight_range(resolved);
    let mut out = String::new();

    for (phase, item) in run.phase_items() {
        let ctx = ItemContext::new(script, resolved, phase, item);
        out.push_str(&format!(
            "run_name={}\tstart_date={}\tseed={}\tbias_value={}\tweight_range={}\tphase_item={}\t",
            run.name, start_date, seed, bias, range, item.name
        ));
        for p in resolver::resolved_parameters(&ctx) {
            if p.variable_name == "example_path" {
                let path = p.value.to_string();
                let base = Path::new(&path)
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or(path);
                out.push_str(&format!("train_examples={}\t", base));
            } else {
                out.push_str(&format!("{}={}\t", p.variable_name, p.value));
            }
        }
        out.push('\n');

        for g in run.groups.iter().filter(|g| item.includes_group(&g.name)) {
            out.push_str(&format!(
                "{}\tphase_item={}\tgroup={}\tunits={}\tactivation_type={}\terror_computation_type={}\t\n",
                GROUP_PREFIX,
                item.name,
                g.name,
                resolver::effective_units(resolved, g),
                g.activation_type,
                g.error_computation_type
            ));
        }
    }
    out
}

/// One parsed metadata line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// `GROUP` row rather than a phase-item row
    pub group: bool,
    /// `key=value` pairs in file order
    pub fields: Vec<(String, String)>,
}

impl MetadataRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse metadata text. Blank lines and fields without `=` are skipped.
pub fn parse_metadata(content: &str) -> Vec<MetadataRecord> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut parts = line.split('\t').peekable();
            let group = parts.peek() == Some(&GROUP_PREFIX);
            if group {
                parts.next();
            }
            let fields = parts
                .filter_map(|f| f.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            MetadataRecord { group, fields }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codegen::tests::fixture;

    #[test]
    fn test_metadata_item_rows() {
        let (script, run) = fixture();
        let text = metadata_content(&script, &run, "3-7-2026");
        let first = text.lines().next().unwrap();
        assert!(first.starts_with(
            "run_name=base\tstart_date=3-7-2026\tseed=1\tbias_value=1.0\tweight_range=0.1\tphase_item=learn\t"
        ));
        assert!(first.contains("\ttrain_examples=train.ex\t"));
        assert!(first.contains("\tepsilon=1.0\t"));
        assert!(first.ends_with('\t'));
    }

    #[test]
    fn test_metadata_group_rows() {
        let (script, mut run) = fixture();
        run.overrides.set(
            OverrideKey::HiddenUnits,
            OverrideValue::HiddenUnits {
                group: "hidden".into(),
                units: 64,
            },
            Scope::All,
        );
        let text = metadata_content(&script, &run, "1-1-2026");
        let groups: Vec<&str> = text.lines().filter(|l| l.starts_with("GROUP\t")).collect();
        // learn uses three groups, check uses one
        assert_eq!(groups.len(), 4);
        assert_eq!(
            groups[1],
            "GROUP\tphase_item=learn\tgroup=hidden\tunits=64\tactivation_type=LOGISTIC_ACTIVATION\terror_computation_type=SUM_SQUARED_ERROR\t"
        );
        assert!(groups[3].contains("phase_item=check\tgroup=input"));
    }

    #[test]
    fn test_metadata_test_item_has_no_examples() {
        let (script, run) = fixture();
        let text = metadata_content(&script, &run, "1-1-2026");
        let check = text.lines().find(|l| l.contains("phase_item=check")).unwrap();
        assert!(!check.contains("train_examples"));
    }

    #[test]
    fn test_metadata_parse_roundtrip_fields() {
        let (script, run) = fixture();
        let records = parse_metadata(&metadata_content(&script, &run, "1-1-2026"));
        assert_eq!(records.len(), 6);
        assert!(!records[0].group);
        assert_eq!(records[0].get("phase_item"), Some("learn"));
        assert!(records[1].group);
        assert_eq!(records[1].get("group"), Some("input"));
        assert_eq!(records[1].get("units"), Some("4"));
    }

    #[test]
    fn test_metadata_parse_skips_junk() {
        let records = parse_metadata("\n\na=1\tjunk\tb=x=y\t\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields, vec![("a".into(), "1".into()), ("b".into(), "x=y".into())]);
    }
}
