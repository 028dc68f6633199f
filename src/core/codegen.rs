//! C code generation for `build_model.c`.
//!
//! One block per template marker:
//! - includes: the single test-function source shared by all test profiles
//! - constants: sizes, ticks, seed, weight range, run name
//! - tests: one TestSet per test profile
//! - main net: every group, the bias, every adjacency connection
//! - phases / phase items: schedule plus one sub-network per item
//!
//! Connections have no by-name lookup in the simulator, so the main-net
//! block returns a [`ConnectionMap`] from matrix position to C identifier
//! that the phase-item blocks reuse.

use super::resolver::{self, ItemContext};
use super::template::{indent, Marker, Template};
use super::types::*;
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::path::Path;

/// C identifiers of connection objects, keyed by adjacency position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMap {
    groups: IndexMap<(usize, usize), String>,
    bias: IndexMap<usize, String>,
}

impl ConnectionMap {
    /// Number connections `c1..` row-major over groups, then the bias row.
    pub fn build(run: &Run) -> Self {
        let n = run.groups.len();
        let mut map = Self::default();
        let mut count = 0;
        for i in 0..n {
            for j in 0..n {
                if run.adjacency.is_connected(i, j) {
                    count += 1;
                    map.groups.insert((i, j), format!("c{}", count));
                }
            }
        }
        for j in 0..n {
            if run.adjacency.is_connected(n, j) {
                count += 1;
                map.bias.insert(j, format!("c{}", count));
            }
        }
        map
    }

    pub fn get(&self, from: usize, to: usize) -> Option<&str> {
        self.groups.get(&(from, to)).map(String::as_str)
    }

    pub fn bias(&self, to: usize) -> Option<&str> {
        self.bias.get(&to).map(String::as_str)
    }

    /// Identifier for a `"from%to"` connection, if both groups and the
    /// connection still exist.
    pub fn lookup(&self, run: &Run, conn: &str) -> Option<&str> {
        let (from, to) = split_connection(conn)?;
        self.get(run.group_index(from)?, run.group_index(to)?)
    }

    pub fn len(&self) -> usize {
        self.groups.len() + self.bias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Group connections first, then bias connections.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.groups.values().chain(self.bias.values()).map(String::as_str)
    }
}

/// Fill every marker of `template` for `resolved`.
///
/// `base_dir` anchors relative test-function paths.
pub fn generate(
    script: &Script,
    resolved: &ResolvedRun,
    template: &Template,
    base_dir: &Path,
) -> Result<String, String> {
    let includes = includes_block(script, base_dir)?;
    let constants = constants_block(script, resolved)?;
    let tests = tests_block(script);
    let (main_net, connections) = main_net_block(resolved);
    let phases = phases_block(&resolved.run);
    let items = phase_items_block(script, resolved, &connections);

    Ok(template.render(|marker| match marker {
        Marker::Includes => includes.clone(),
        Marker::Constants => constants.clone(),
        Marker::BuildTests => tests.clone(),
        Marker::BuildMainNet => main_net.clone(),
        Marker::BuildPhases => phases.clone(),
        Marker::BuildPhaseItems => items.clone(),
    }))
}

fn finish(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `#include` for the test function. All test profiles must agree on one
/// function path, and it must be a file.
pub fn includes_block(script: &Script, base_dir: &Path) -> Result<String, String> {
    let paths: IndexSet<&str> = script
        .test_profiles
        .iter()
        .filter_map(|p| p.function_path.as_deref())
        .filter(|p| !p.trim().is_empty())
        .collect();
    match paths.len() {
        0 => Ok(String::new()),
        1 => {
            let path = base_dir.join(paths[0]);
            if !path.is_file() {
                return Err(format!("cannot resolve test function path {}", path.display()));
            }
            Ok(format!("#define USE_TESTING\n#include \"{}\"\n", path.display()))
        }
        _ => Err(format!(
            "test function path unresolvable: use one path per script (found {})",
            paths.into_iter().collect::<Vec<_>>().join(", ")
        )),
    }
}

/// `#define` constants and the run name. Fails when the run has no phase items.
pub fn constants_block(script: &Script, resolved: &ResolvedRun) -> Result<String, String> {
    let run = &resolved.run;
    let items = run.phase_item_count();
    if items == 0 {
        return Err(format!("run '{}' has no train or test events, nothing to run", run.name));
    }
    Ok(finish(vec![
        format!("#define NUM_TEST_SETS {}", script.test_profiles.len()),
        format!("#define NUM_PHASES {}", run.phases.len()),
        format!("#define NUM_PHASE_ITEMS {}", items),
        format!("#define TIME {}", run.ticks),
        format!("#define SEED {}", resolver::effective_seed(resolved)),
        format!("#define WEIGHT_RANGE {}", resolver::effective_weight_range(resolved)),
        format!("char run_name[]=\"{}\";", run.name),
    ]))
}

fn string_field(lines: &mut Vec<String>, target: &str, value: &str) {
    lines.push(format!("{}=(char *)mh_malloc({});", target, value.len() + 1));
    lines.push(format!("{}=\"{}\";", target, value));
}

/// TestSet allocation for every test profile, args split on whitespace.
pub fn tests_block(script: &Script) -> String {
    let mut lines = Vec::new();
    for (i, profile) in script.test_profiles.iter().enumerate() {
        let t = format!("test_sets[{}]", i);
        lines.push(format!("{}=(TestSet *)mh_calloc(sizeof(TestSet),1);", t));
        string_field(&mut lines, &format!("{}->test_name", t), &profile.name);
        lines.push(format!(
            "{}->test_examples=load_examples(\"{}\",TIME);",
            t, profile.example_path
        ));
        let args: Vec<&str> = profile.args.split_whitespace().collect();
        lines.push(format!("{}->args=(char **)mh_calloc({},sizeof(char*));", t, args.len()));
        for (j, a) in args.iter().enumerate() {
            lines.push(format!(
                "{}->args[{}]=(char *)mh_calloc({},sizeof(char));",
                t,
                j,
                a.len() + 1
            ));
        }
        for (j, a) in args.iter().enumerate() {
            lines.push(format!("{}->args[{}]=\"{}\";", t, j, a));
        }
        lines.push(String::new());
    }
    if lines.is_empty() {
        return String::new();
    }
    finish(lines)
}

/// Groups, bias, connections, bindings, and weight randomization for the
/// top-level network, plus the connection map for phase items.
pub fn main_net_block(resolved: &ResolvedRun) -> (String, ConnectionMap) {
    let run = &resolved.run;
    let map = ConnectionMap::build(run);
    let mut lines = Vec::new();

    let mut groups: Vec<String> = (1..=run.groups.len()).map(|i| format!("*g{}", i)).collect();
    groups.push(format!("*{}", BIAS_NAME));
    lines.push(format!("Group {};", groups.join(", ")));
    if !map.is_empty() {
        let conns: Vec<String> = map.identifiers().map(|c| format!("*{}", c)).collect();
        lines.push(format!("Connections {};", conns.join(", ")));
    }
    lines.push(String::new());

    lines.push("/* groups: name, units, ticks */".to_string());
    for (i, g) in run.groups.iter().enumerate() {
        let id = format!("g{}", i + 1);
        lines.push(format!(
            "{}=init_group(\"{}\",{},TIME);",
            id,
            g.name,
            resolver::effective_units(resolved, g)
        ));
        lines.push(format!("{}->activationType={};", id, g.activation_type));
        lines.push(format!("{}->errorComputation={};", id, g.error_computation_type));
    }
    lines.push(format!("bias=init_bias({},TIME);", resolver::effective_bias(resolved)));
    lines.push(String::new());

    lines.push("/* bind groups to the run network */".to_string());
    for i in 0..run.groups.len() {
        lines.push(format!("bind_group_to_net(run_net,g{});", i + 1));
    }
    lines.push("bind_group_to_net(run_net,bias);".to_string());
    lines.push(String::new());

    lines.push("/* connections */".to_string());
    for ((i, j), c) in &map.groups {
        lines.push(format!("{}=connect_groups(g{},g{});", c, i + 1, j + 1));
    }
    for (j, c) in &map.bias {
        lines.push(format!("{}=connect_groups(bias,g{});", c, j + 1));
    }
    lines.push(String::new());

    lines.push("/* bind connections to the run network */".to_string());
    for c in map.identifiers() {
        lines.push(format!("bind_connection_to_net(run_net,{});", c));
    }
    lines.push(String::new());

    lines.push("/* randomize weights within WEIGHT_RANGE */".to_string());
    for c in map.identifiers() {
        lines.push(format!("randomize_connections({},WEIGHT_RANGE);", c));
    }

    (indent(&finish(lines)), map)
}

/// One Phase struct per phase.
pub fn phases_block(run: &Run) -> String {
    let mut lines = Vec::new();
    for (i, phase) in run.phases.iter().enumerate() {
        let p = format!("phases[{}]", i);
        lines.push(format!("/* phase {}: */", i + 1));
        lines.push(format!("{}=(Phase *)mh_calloc(sizeof(Phase),1);", p));
        string_field(&mut lines, &format!("{}->phase_name", p), &phase.name);
        lines.push(format!("{}->phase_order={}; //0=seq, 1=prob", p, phase.order.code()));
        lines.push(format!("{}->num_phase_items={};", p, phase.items.len()));
        lines.push(format!("{}->max_iterations={};", p, phase.max_iterations));
    }
    if lines.is_empty() {
        return String::new();
    }
    indent(&finish(lines))
}

/// Every phase item block in document order, with global 0-based indices.
pub fn phase_items_block(script: &Script, resolved: &ResolvedRun, map: &ConnectionMap) -> String {
    let mut out = String::new();
    let mut index = 0;
    for (phase_index, phase) in resolved.run.phases.iter().enumerate() {
        for item in &phase.items {
            let ctx = ItemContext::new(script, resolved, phase, item);
            out.push_str(&phase_item_block(&ctx, phase_index, index, map));
            out.push('\n');
            index += 1;
        }
    }
    indent(&out)
}

/// Sub-network, schedule, readouts, noise, counters, and resolved training
/// parameters for one phase item.
pub fn phase_item_block(ctx: &ItemContext<'_>, phase_index: usize, index: usize, map: &ConnectionMap) -> String {
    let run = &ctx.run.run;
    let item = ctx.item;
    let net = format!("net{}", index + 1);
    let pi = format!("phase_items[{}]", index);
    let mut lines = vec![format!("/* phase item {}: */", index + 1)];

    // sub-network: included groups, the bias, included connections
    lines.push(format!("Net *{};", net));
    lines.push(format!("{}=create_net(TIME);", net));
    for g in &item.components.groups {
        if run.group_index(g).is_some() {
            lines.push(format!("bind_group_to_net({},find_group_by_name(\"{}\"));", net, g));
        }
    }
    lines.push(format!("bind_group_to_net({},bias);", net));
    for conn in &item.components.connections {
        if let Some(c) = map.lookup(run, conn) {
            lines.push(format!("bind_connection_to_net({},{});", net, c));
        }
    }
    for (j, c) in &map.bias {
        if item.includes_group(&run.groups[*j].name) {
            lines.push(format!("bind_connection_to_net({},{});", net, c));
        }
    }

    lines.push(format!("{}=(PhaseItem *)mh_calloc(sizeof(PhaseItem),1);", pi));
    lines.push(format!("{}->net={};", pi, net));
    string_field(&mut lines, &format!("{}->item_name", pi), &item.name);
    lines.push(format!("{}->which_phase={};", pi, phase_index));
    lines.push(format!("{}->test_only={};", pi, u8::from(item.mode == Mode::Test)));

    let tests = ctx.script.test_indices(&item.test_profiles);
    lines.push(format!("{}->num_tests={};", pi, tests.len()));
    if !tests.is_empty() {
        lines.push(format!("{}->test_indices=(int *)mh_calloc({},sizeof(int));", pi, tests.len()));
        for (i, t) in tests.iter().enumerate() {
            lines.push(format!("{}->test_indices[{}]={};", pi, i, t));
        }
    }
    lines.push(format!("{}->probability={};", pi, format_float(item.probability)));

    readout_lines(&mut lines, ctx, &pi, index);
    noise_lines(&mut lines, ctx, &pi, map);

    for counter in ["iter", "wcount", "ecount", "tcount", "ocount"] {
        lines.push(format!("{}->{}=0;", pi, counter));
    }
    lines.push(format!("{}->error=0.0;", pi));
    lines.push(String::new());

    for p in resolver::resolved_parameters(ctx) {
        if p.variable_name == "example_path" {
            lines.push(format!(
                "{}->train_examples=load_examples(\"{}\",TIME);",
                pi, p.value
            ));
        } else {
            lines.push(format!("{}->{}={};", pi, p.variable_name, p.value));
        }
    }

    finish(lines)
}

/// Groups whose activations are recorded by this item, sorted by name.
/// Ticks at or past the run's tick count are dropped.
pub fn readout_groups<'a>(run: &Run, item: &'a PhaseItem) -> Vec<(&'a str, BTreeSet<u32>)> {
    let mut groups: Vec<(&str, BTreeSet<u32>)> = item
        .recording
        .iter()
        .filter(|(g, _)| item.includes_group(g) && run.group_index(g).is_some())
        .map(|(g, ticks)| (g.as_str(), ticks.range(..run.ticks).copied().collect::<BTreeSet<u32>>()))
        .filter(|(_, ticks)| !ticks.is_empty())
        .collect();
    groups.sort_by(|a, b| a.0.cmp(b.0));
    groups
}

fn readout_lines(lines: &mut Vec<String>, ctx: &ItemContext<'_>, pi: &str, index: usize) {
    let run = &ctx.run.run;
    let groups = readout_groups(run, ctx.item);
    lines.push(format!("{}->total_group_readouts={};", pi, groups.len()));
    if groups.is_empty() {
        return;
    }

    lines.push(format!(
        "{}->group_readout_names=(char **)mh_calloc({},sizeof(char*));",
        pi,
        groups.len()
    ));
    for (i, (g, _)) in groups.iter().enumerate() {
        lines.push(format!(
            "{}->group_readout_names[{}]=(char *)mh_calloc({},sizeof(char));",
            pi,
            i,
            g.len() + 1
        ));
    }
    for (i, (g, _)) in groups.iter().enumerate() {
        lines.push(format!("{}->group_readout_names[{}]=\"{}\";", pi, i, g));
    }

    let times: BTreeSet<u32> = groups.iter().flat_map(|(_, t)| t.iter().copied()).collect();
    lines.push(format!(
        "{}->group_readout_times=(int *)mh_calloc({},sizeof(int));",
        pi,
        times.len()
    ));
    for (i, t) in times.iter().enumerate() {
        lines.push(format!("{}->group_readout_times[{}]={};", pi, i, t));
    }

    lines.push(format!("int roTable{}[{}][TIME]={{", index, groups.len()));
    for (_, ticks) in &groups {
        let row: Vec<&str> = (0..run.ticks)
            .map(|t| if ticks.contains(&t) { "1" } else { "0" })
            .collect();
        lines.push(format!("{{{}}},", row.join(",")));
    }
    lines.push("};".to_string());
    lines.push(format!(
        "{}->readout_table=(int **)mh_calloc({},sizeof(int*));",
        pi,
        groups.len()
    ));
    for i in 0..groups.len() {
        lines.push(format!("{}->readout_table[{}]=(int *)mh_calloc(TIME,sizeof(int));", pi, i));
    }
    lines.push(format!("for(p=0;p<{};p++) {{", groups.len()));
    lines.push("\tfor(q=0;q<TIME;q++) {".to_string());
    lines.push(format!("\t\t{}->readout_table[p][q]=roTable{}[p][q];", pi, index));
    lines.push("\t}".to_string());
    lines.push("}".to_string());
}

fn noise_lines(lines: &mut Vec<String>, ctx: &ItemContext<'_>, pi: &str, map: &ConnectionMap) {
    let run = &ctx.run.run;
    let known = |g: &(String, f64)| run.group_index(&g.0).is_some();

    for (label, entries) in [
        ("activation", resolver::activation_noise(ctx)),
        ("input", resolver::input_noise(ctx)),
    ] {
        let entries: Vec<(String, f64)> = entries.into_iter().filter(known).collect();
        lines.push(format!("{}->total_{}_noise={};", pi, label, entries.len()));
        if entries.is_empty() {
            continue;
        }
        lines.push(format!(
            "{}->{}_noise_values=(Real *)mh_calloc({},sizeof(Real));",
            pi,
            label,
            entries.len()
        ));
        lines.push(format!(
            "{}->{}_noise_groups=(Group **)mh_calloc({},sizeof(Group*));",
            pi,
            label,
            entries.len()
        ));
        for (i, (g, v)) in entries.iter().enumerate() {
            lines.push(format!(
                "{}->{}_noise_groups[{}]=find_group_by_name(\"{}\");",
                pi, label, i, g
            ));
            lines.push(format!("{}->{}_noise_values[{}]={};", pi, label, i, format_float(*v)));
        }
    }

    let weights: Vec<(&str, WeightNoise)> = resolver::weight_noise(ctx)
        .into_iter()
        .filter_map(|(conn, w)| map.lookup(run, &conn).map(|c| (c, w)))
        .collect();
    lines.push(format!("{}->total_weight_noise={};", pi, weights.len()));
    if weights.is_empty() {
        return;
    }
    let n = weights.len();
    lines.push(format!("{}->weight_noise_values=(Real *)mh_calloc({},sizeof(Real));", pi, n));
    lines.push(format!(
        "{}->weight_noise_connections=(Connections **)mh_calloc({},sizeof(Connections*));",
        pi, n
    ));
    lines.push(format!("{}->weight_noise_types=(int *)mh_calloc({},sizeof(int));", pi, n));
    for (i, (c, w)) in weights.iter().enumerate() {
        lines.push(format!("{}->weight_noise_connections[{}]={};", pi, i, c));
        lines.push(format!("{}->weight_noise_types[{}]={};", pi, i, w.kind.code()));
        lines.push(format!("{}->weight_noise_values[{}]={};", pi, i, format_float(w.value)));
    }
}
