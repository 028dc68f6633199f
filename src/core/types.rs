//! Script document model, resolved runs, preferences, and runner events.
//!
//! Every type here is a plain owned value. Nothing holds a reference back to
//! its parent: code that needs context (script, run, phase, item) receives it
//! explicitly. All document types derive Serialize/Deserialize for YAML.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the bias node in generated code and connection specs.
pub const BIAS_NAME: &str = "bias";

/// Separator between source and target group in a connection name.
pub const CONNECTION_SEP: char = '%';

// ============================================================================
// Script
// ============================================================================

/// Root document: profiles plus an ordered list of runs and iterators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    /// Script name (names the `data/<script>/` output directory)
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Training-set defaults, referenced by phase items in TRAIN mode
    #[serde(default)]
    pub training_profiles: Vec<TrainingProfile>,

    /// Test sets, referenced by phase items; position is the test index
    #[serde(default)]
    pub test_profiles: Vec<TestProfile>,

    /// Top-level runs and iterators, in execution order
    #[serde(default)]
    pub children: Vec<ScriptChild>,
}

impl Script {
    /// Look up any profile by name. Training profiles shadow test profiles.
    pub fn profile(&self, name: &str) -> Option<ProfileRef<'_>> {
        if let Some(p) = self.training_profile(name) {
            return Some(ProfileRef::Training(p));
        }
        self.test_profiles
            .iter()
            .find(|p| p.name == name)
            .map(ProfileRef::Test)
    }

    pub fn training_profile(&self, name: &str) -> Option<&TrainingProfile> {
        self.training_profiles.iter().find(|p| p.name == name)
    }

    /// Global indices of the named test profiles, in script order.
    pub fn test_indices(&self, names: &[String]) -> Vec<usize> {
        self.test_profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| names.iter().any(|n| n == &p.name))
            .map(|(i, _)| i)
            .collect()
    }
}

/// A top-level (or iterator-wrapped) node: either a run or an iterator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptChild {
    Run(Run),
    Iterator(RunIterator),
}

impl ScriptChild {
    pub fn name(&self) -> &str {
        match self {
            Self::Run(r) => &r.name,
            Self::Iterator(it) => &it.name,
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Editor widget kind for a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetType {
    #[default]
    Text,
    Int,
    Double,
    Bool,
    Choice,
    Path,
}

/// Typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", u8::from(*b)),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", format_float(*x)),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<Number> for ParamValue {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Self::Int(i),
            Number::Float(x) => Self::Float(x),
        }
    }
}

/// A named, typed setting declared by a run, phase, item, or profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Identifier emitted into generated code
    pub variable_name: String,

    /// Display label; iterator overrides are keyed by it
    #[serde(default)]
    pub form_name: Option<String>,

    #[serde(default)]
    pub widget_type: WidgetType,

    pub value: ParamValue,

    /// Options for `choice` widgets
    #[serde(default)]
    pub dropdown_options: Vec<String>,

    /// Whether an iterator may sweep this parameter
    #[serde(default)]
    pub override_flag: bool,

    #[serde(default)]
    pub minimum: Option<f64>,

    #[serde(default)]
    pub maximum: Option<f64>,

    #[serde(default)]
    pub step: Option<f64>,

    #[serde(default)]
    pub decimals: Option<u32>,
}

impl Parameter {
    pub fn new(variable_name: &str, form_name: &str, widget_type: WidgetType, value: ParamValue) -> Self {
        Self {
            variable_name: variable_name.to_string(),
            form_name: Some(form_name.to_string()),
            widget_type,
            value,
            dropdown_options: Vec::new(),
            override_flag: true,
            minimum: None,
            maximum: None,
            step: None,
            decimals: None,
        }
    }

    /// Display label, falling back to the variable name.
    pub fn form_name(&self) -> &str {
        match &self.form_name {
            Some(f) if !f.is_empty() => f,
            _ => &self.variable_name,
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// Named bundle of training defaults. `example_path` is one of its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingProfile {
    pub name: String,

    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl TrainingProfile {
    /// Profile carrying the stock training parameter set.
    pub fn with_defaults(name: &str, example_path: &str) -> Self {
        let mut parameters = vec![Parameter::new(
            "example_path",
            "Example Set",
            WidgetType::Path,
            ParamValue::Text(example_path.to_string()),
        )];
        parameters.extend(default_training_parameters());
        Self {
            name: name.to_string(),
            parameters,
        }
    }

    pub fn parameter(&self, variable_name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.variable_name == variable_name)
    }
}

/// A test set and the (optional) external test function that consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestProfile {
    pub name: String,

    pub example_path: String,

    /// C source file providing the test function
    #[serde(default)]
    pub function_path: Option<String>,

    /// Whitespace-separated argument string passed to the test function
    #[serde(default)]
    pub args: String,
}

/// Result of a by-name profile lookup.
#[derive(Debug, Clone, Copy)]
pub enum ProfileRef<'a> {
    Training(&'a TrainingProfile),
    Test(&'a TestProfile),
}

/// Stock training parameters used by new training profiles.
pub fn default_training_parameters() -> Vec<Parameter> {
    use ParamValue::{Float, Int};
    use WidgetType::{Bool, Choice, Double};
    let flag = |b: bool| Int(i64::from(b));
    [
        ("epsilon", "Epsilon", Double, Float(1.0)),
        ("momentum", "Momentum", Double, Float(0.0)),
        ("tolerance", "Tolerance", Double, Float(0.1)),
        ("error_radius", "Error radius", Double, Float(0.0)),
        ("max_iterations", "Max iterations", WidgetType::Int, Int(1000)),
        ("training_mode", "Training mode", Choice, Int(0)),
        ("dbd", "Use dbd?", Bool, flag(false)),
        ("training_algorithm", "Algorithm", Choice, Int(0)),
        ("reset_activation", "Reset activation each trial?", Bool, flag(true)),
        ("stop_criterion", "Stop criterion", Choice, Int(0)),
        ("seconds", "Seconds", Double, Float(1.0)),
        ("tai", "Time average input?", Bool, flag(false)),
        ("error_ramp", "Ramp error?", Bool, flag(false)),
        ("tao", "Time average output", Double, Float(1.0)),
        ("tao_max_mult", "Tao max multiplier", Double, Float(-1.0)),
        ("tao_min_mult", "Tao min multiplier", Double, Float(0.001)),
        ("tao_epsilon", "Tao epsilon", Double, Float(0.0)),
        ("tao_decay", "Tao decay", Double, Float(0.0)),
        ("will_save_weights", "Save weights?", Bool, flag(false)),
        ("save_weights_interval", "Save weights interval", WidgetType::Int, Int(500)),
        ("will_save_error", "Save error log?", Bool, flag(true)),
        ("save_error_interval", "Save error interval", WidgetType::Int, Int(500)),
        ("will_save_activations", "Save unit activations?", Bool, flag(false)),
        ("save_activations_interval", "Save activations interval", WidgetType::Int, Int(500)),
        ("test_interval", "Test interval", WidgetType::Int, Int(500)),
    ]
    .into_iter()
    .map(|(var, form, widget, value)| Parameter::new(var, form, widget, value))
    .collect()
}

// ============================================================================
// Runs and topology
// ============================================================================

/// One fully specified network configuration: topology plus phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub name: String,

    #[serde(default = "default_seed")]
    pub seed: i64,

    #[serde(default = "default_weight_range")]
    pub weight_range: f64,

    #[serde(default = "default_bias_value")]
    pub bias_value: f64,

    /// Simulation ticks per example
    #[serde(default = "default_ticks")]
    pub ticks: u32,

    #[serde(default)]
    pub groups: Vec<Group>,

    /// (groups+1)² connection matrix; last row and column are the bias
    #[serde(default)]
    pub adjacency: Adjacency,

    #[serde(default)]
    pub phases: Vec<Phase>,
}

fn default_seed() -> i64 {
    1
}

fn default_weight_range() -> f64 {
    0.1
}

fn default_bias_value() -> f64 {
    1.0
}

fn default_ticks() -> u32 {
    3
}

impl Run {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seed: default_seed(),
            weight_range: default_weight_range(),
            bias_value: default_bias_value(),
            ticks: default_ticks(),
            groups: Vec::new(),
            adjacency: Adjacency::new(0),
            phases: Vec::new(),
        }
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    /// Every phase item with its phase, in document order.
    pub fn phase_items(&self) -> impl Iterator<Item = (&Phase, &PhaseItem)> {
        self.phases
            .iter()
            .flat_map(|ph| ph.items.iter().map(move |it| (ph, it)))
    }

    pub fn phase_item_count(&self) -> usize {
        self.phases.iter().map(|p| p.items.len()).sum()
    }
}

/// A layer of units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,

    #[serde(default = "default_units")]
    pub units: u32,

    #[serde(default)]
    pub activation_type: ActivationType,

    #[serde(default)]
    pub error_computation_type: ErrorComputation,
}

fn default_units() -> u32 {
    10
}

impl Group {
    pub fn new(name: &str, units: u32) -> Self {
        Self {
            name: name.to_string(),
            units,
            activation_type: ActivationType::default(),
            error_computation_type: ErrorComputation::default(),
        }
    }
}

/// Unit activation function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationType {
    #[default]
    #[serde(rename = "LOGISTIC_ACTIVATION", alias = "logistic")]
    Logistic,
    #[serde(rename = "TANH_ACTIVATION", alias = "tanh")]
    Tanh,
}

impl fmt::Display for ActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logistic => write!(f, "LOGISTIC_ACTIVATION"),
            Self::Tanh => write!(f, "TANH_ACTIVATION"),
        }
    }
}

/// Error function applied at a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorComputation {
    #[default]
    #[serde(rename = "SUM_SQUARED_ERROR", alias = "sum_squared")]
    SumSquared,
    #[serde(rename = "CROSS_ENTROPY_ERROR", alias = "cross_entropy")]
    CrossEntropy,
}

impl fmt::Display for ErrorComputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SumSquared => write!(f, "SUM_SQUARED_ERROR"),
            Self::CrossEntropy => write!(f, "CROSS_ENTROPY_ERROR"),
        }
    }
}

/// Square 0/1 connection matrix. Row/column `i < n` is group `i`; index `n`
/// is the bias. An empty matrix means "not specified" until normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Adjacency(Vec<Vec<u8>>);

impl Adjacency {
    /// Matrix for `groups` groups with no connections.
    pub fn new(groups: usize) -> Self {
        Self(vec![vec![0; groups + 1]; groups + 1])
    }

    /// Matrix for `groups` groups with bias feeding every group.
    pub fn with_bias(groups: usize) -> Self {
        let mut m = Self::new(groups);
        for j in 0..groups {
            m.0[groups][j] = 1;
        }
        m
    }

    pub fn from_rows(rows: Vec<Vec<u8>>) -> Self {
        Self(rows)
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Side length (groups + 1 when consistent).
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// True when the matrix is square with side `groups + 1`.
    pub fn fits(&self, groups: usize) -> bool {
        self.0.len() == groups + 1 && self.0.iter().all(|r| r.len() == groups + 1)
    }

    pub fn is_connected(&self, from: usize, to: usize) -> bool {
        self.0
            .get(from)
            .and_then(|r| r.get(to))
            .is_some_and(|&v| v == 1)
    }

    pub(crate) fn set(&mut self, from: usize, to: usize, on: bool) {
        if let Some(cell) = self.0.get_mut(from).and_then(|r| r.get_mut(to)) {
            *cell = u8::from(on);
        }
    }

    /// Insert an empty row and column at `index`.
    pub(crate) fn insert(&mut self, index: usize) {
        let side = self.0.len() + 1;
        for row in &mut self.0 {
            row.insert(index, 0);
        }
        self.0.insert(index, vec![0; side]);
    }

    /// Remove row and column `index`.
    pub(crate) fn remove(&mut self, index: usize) {
        if index < self.0.len() {
            self.0.remove(index);
            for row in &mut self.0 {
                row.remove(index);
            }
        }
    }
}

// ============================================================================
// Phases
// ============================================================================

/// Ordering of a phase's items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOrder {
    #[default]
    Sequential,
    Probabilistic,
}

impl PhaseOrder {
    /// Simulator encoding: 0 = sequential, 1 = probabilistic.
    pub fn code(self) -> u8 {
        match self {
            Self::Sequential => 0,
            Self::Probabilistic => 1,
        }
    }
}

/// Named sub-timeline of training/test events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,

    #[serde(default)]
    pub order: PhaseOrder,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default)]
    pub items: Vec<PhaseItem>,
}

fn default_max_iterations() -> u32 {
    1
}

/// TRAIN items learn from their training profile; TEST items only test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    Train,
    Test,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "TRAIN"),
            Self::Test => write!(f, "TEST"),
        }
    }
}

/// One event within a phase, bound to a subset of the run's network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseItem {
    pub name: String,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default = "default_probability")]
    pub probability: f64,

    /// Training profile name (used in TRAIN mode)
    #[serde(default)]
    pub profile: Option<String>,

    /// Linked test profile names
    #[serde(default)]
    pub test_profiles: Vec<String>,

    #[serde(default)]
    pub components: NetComponents,

    /// Group name to recorded tick indices
    #[serde(default)]
    pub recording: IndexMap<String, BTreeSet<u32>>,

    #[serde(default)]
    pub noise: NoiseData,

    /// Manual per-item parameter overrides
    #[serde(default)]
    pub overrides: Vec<Parameter>,
}

fn default_probability() -> f64 {
    1.0
}

impl PhaseItem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: Mode::Train,
            probability: default_probability(),
            profile: None,
            test_profiles: Vec::new(),
            components: NetComponents::default(),
            recording: IndexMap::new(),
            noise: NoiseData::default(),
            overrides: Vec::new(),
        }
    }

    pub fn includes_group(&self, name: &str) -> bool {
        self.components.groups.contains(name)
    }

    pub fn includes_connection(&self, name: &str) -> bool {
        self.components.connections.contains(name)
    }
}

/// Groups and connections ("from%to") a phase item trains or tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetComponents {
    #[serde(default)]
    pub groups: IndexSet<String>,

    #[serde(default)]
    pub connections: IndexSet<String>,
}

impl NetComponents {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.connections.is_empty()
    }
}

/// Manually configured noise on a phase item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseData {
    /// Connection ("from%to") to noise setting
    #[serde(default)]
    pub weight: IndexMap<String, WeightNoise>,

    #[serde(default)]
    pub activation: IndexMap<String, f64>,

    #[serde(default)]
    pub input: IndexMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightNoise {
    pub kind: WeightNoiseKind,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightNoiseKind {
    Additive,
    Multiplicative,
}

impl WeightNoiseKind {
    /// Simulator encoding: additive = 1, multiplicative = 2.
    pub fn code(self) -> u8 {
        match self {
            Self::Additive => 1,
            Self::Multiplicative => 2,
        }
    }
}

impl fmt::Display for WeightNoiseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Additive => write!(f, "additive"),
            Self::Multiplicative => write!(f, "multiplicative"),
        }
    }
}

/// Join two group names into a connection name.
pub fn connection_name(from: &str, to: &str) -> String {
    format!("{}{}{}", from, CONNECTION_SEP, to)
}

/// Split a connection name into (from, to).
pub fn split_connection(conn: &str) -> Option<(&str, &str)> {
    conn.split_once(CONNECTION_SEP)
}

// ============================================================================
// Iterators
// ============================================================================

/// A sweep wrapping exactly one run (directly or via nested iterators).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIterator {
    pub name: String,

    /// What this level sweeps; null means pass-through
    #[serde(default)]
    pub varying: Option<Varying>,

    #[serde(default = "default_repeat")]
    pub repeat: u32,

    #[serde(default)]
    pub initial_value: f64,

    #[serde(default)]
    pub delta: f64,

    /// Sample values instead of stepping arithmetically
    #[serde(default)]
    pub random: Option<RandomFlag>,

    #[serde(default)]
    pub applied_paths: Scope,

    #[serde(default)]
    pub child: Option<Box<ScriptChild>>,
}

fn default_repeat() -> u32 {
    1
}

impl RunIterator {
    /// The run at the bottom of the iterator chain, if any.
    pub fn embedded_run(&self) -> Option<&Run> {
        let mut level = self;
        loop {
            match level.child.as_deref() {
                Some(ScriptChild::Run(run)) => return Some(run),
                Some(ScriptChild::Iterator(inner)) => level = inner,
                None => return None,
            }
        }
    }

    /// Iterator levels from outermost (self) to innermost.
    pub fn levels(&self) -> Vec<&RunIterator> {
        let mut out = vec![self];
        let mut level = self;
        while let Some(ScriptChild::Iterator(inner)) = level.child.as_deref() {
            out.push(inner);
            level = inner;
        }
        out
    }
}

/// The quantity an iterator level sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Varying {
    /// A profile parameter, by form name
    Parameter(String),
    Seed,
    BiasValue,
    WeightRange,
    /// Unit count of the named group
    HiddenUnits(String),
    ActivationNoise(String),
    InputNoise(String),
    WeightNoise {
        kind: WeightNoiseKind,
        connection: String,
    },
}

impl Varying {
    /// A blank parameter name behaves like no varying parameter at all.
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Parameter(p) if p.trim().is_empty())
    }

    /// Override key this level writes into each resolved run.
    pub fn key(&self) -> OverrideKey {
        match self {
            Self::Parameter(p) => OverrideKey::Parameter(p.clone()),
            Self::Seed => OverrideKey::Seed,
            Self::BiasValue => OverrideKey::BiasValue,
            Self::WeightRange => OverrideKey::WeightRange,
            Self::HiddenUnits(_) => OverrideKey::HiddenUnits,
            Self::ActivationNoise(g) => OverrideKey::ActivationNoise(g.clone()),
            Self::InputNoise(g) => OverrideKey::InputNoise(g.clone()),
            Self::WeightNoise { kind, connection } => OverrideKey::WeightNoise {
                kind: *kind,
                connection: connection.clone(),
            },
        }
    }

    /// Wrap one sweep value for this level.
    pub fn value(&self, n: Number) -> OverrideValue {
        match self {
            Self::HiddenUnits(group) => OverrideValue::HiddenUnits {
                group: group.clone(),
                units: n.as_i64(),
            },
            _ => OverrideValue::Scalar(n),
        }
    }
}

/// Random sampling configuration for an iterator level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomFlag {
    pub mode: RandomMode,
    pub arg1: f64,
    pub arg2: f64,
}

/// `int`/`double`: uniform in [arg1, arg2]; `gaussian`: mean arg1, stddev arg2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomMode {
    Int,
    Double,
    Gaussian,
}

/// Phase items an override applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum Scope {
    #[default]
    All,
    /// Explicit `"phase:item"` paths
    Items(Vec<String>),
}

impl Scope {
    /// Whether the scope covers `item` inside `phase`.
    pub fn covers(&self, phase: &str, item: &str) -> bool {
        match self {
            Self::All => true,
            Self::Items(paths) => paths
                .iter()
                .filter_map(|p| p.split_once(':'))
                .any(|(ph, it)| ph == phase && it == item),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeRepr {
    Keyword(String),
    Items(Vec<String>),
}

impl TryFrom<ScopeRepr> for Scope {
    type Error = String;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        match repr {
            ScopeRepr::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(Self::All),
            ScopeRepr::Keyword(k) => Err(format!("unknown scope '{}' (expected ALL or a list of phase:item)", k)),
            ScopeRepr::Items(items) => Ok(Self::Items(items)),
        }
    }
}

impl From<Scope> for ScopeRepr {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::All => Self::Keyword("ALL".to_string()),
            Scope::Items(items) => Self::Items(items),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Items(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

// ============================================================================
// Overrides and resolved runs
// ============================================================================

/// A sweep value: integral when it carries no fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(x) => x,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(i) => i,
            Self::Float(x) => x as i64,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", format_float(*x)),
        }
    }
}

/// Identity of an iterator-injected override. Displays as the editor's
/// form name, which is also the key parameters are matched by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OverrideKey {
    Parameter(String),
    Seed,
    BiasValue,
    WeightRange,
    HiddenUnits,
    ActivationNoise(String),
    InputNoise(String),
    WeightNoise {
        kind: WeightNoiseKind,
        connection: String,
    },
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter(p) => write!(f, "{}", p),
            Self::Seed => write!(f, "Random seed"),
            Self::BiasValue => write!(f, "Bias value"),
            Self::WeightRange => write!(f, "Weight range"),
            Self::HiddenUnits => write!(f, "Number of hidden units"),
            Self::ActivationNoise(g) => write!(f, "Activation noise on {}", g),
            Self::InputNoise(g) => write!(f, "Input noise on {}", g),
            Self::WeightNoise { kind, connection } => write!(
                f,
                "Weight noise ({}) on {}",
                kind,
                connection.replace(CONNECTION_SEP, "->")
            ),
        }
    }
}

/// Value carried by an override.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideValue {
    Scalar(Number),
    HiddenUnits { group: String, units: i64 },
}

impl OverrideValue {
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Scalar(n) => Some(*n),
            Self::HiddenUnits { .. } => None,
        }
    }
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(n) => write!(f, "{}", n),
            Self::HiddenUnits { group, units } => write!(f, "({}, {})", group, units),
        }
    }
}

/// An override value together with the phase items it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedOverride {
    pub value: OverrideValue,
    pub scope: Scope,
}

/// Iterator overrides for one resolved run, in level order (outermost first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides(IndexMap<OverrideKey, ScopedOverride>);

impl RunOverrides {
    /// Set (or replace) an override.
    pub fn set(&mut self, key: OverrideKey, value: OverrideValue, scope: Scope) {
        self.0.insert(key, ScopedOverride { value, scope });
    }

    pub fn get(&self, key: &OverrideKey) -> Option<&ScopedOverride> {
        self.0.get(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OverrideKey, &ScopedOverride)> {
        self.0.iter()
    }
}

/// An independent copy of a run plus the overrides for one sweep point.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub run: Run,
    pub overrides: RunOverrides,
}

impl ResolvedRun {
    /// A bare run with no overrides.
    pub fn bare(run: &Run) -> Self {
        Self {
            run: run.clone(),
            overrides: RunOverrides::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.run.name
    }
}

/// Immutable set of resolved runs shared by every worker.
#[derive(Debug, Clone)]
pub struct RunBatch {
    /// Script the runs came from (profiles are read from here)
    pub script: Script,
    pub runs: Vec<ResolvedRun>,
}

impl RunBatch {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

// ============================================================================
// Compile results
// ============================================================================

/// Pipeline step a run failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Generate,
    Metadata,
    Build,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Generate => write!(f, "generate"),
            Self::Metadata => write!(f, "metadata"),
            Self::Build => write!(f, "build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    /// The simulator was built (execution and archival are not reflected)
    Success,
    Failure { stage: Stage, message: String },
}

/// What happened to one resolved run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_name: String,
    pub outcome: CompileOutcome,
    /// Simulator exit code, when it was launched and exited normally
    pub exit_code: Option<i32>,
    pub archive_failed: bool,
    /// `data/<script>/<run>.tar.gz` when packaging succeeded
    pub package: Option<PathBuf>,
    /// BLAKE3 of the generated model source
    pub source_hash: Option<String>,
    pub duration: Duration,
}

impl RunReport {
    pub fn failure(run_name: &str, stage: Stage, message: String, duration: Duration) -> Self {
        Self {
            run_name: run_name.to_string(),
            outcome: CompileOutcome::Failure { stage, message },
            exit_code: None,
            archive_failed: false,
            package: None,
            source_hash: None,
            duration,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == CompileOutcome::Success
    }

    /// 1 when the build succeeded, 0 otherwise.
    pub fn code(&self) -> u8 {
        u8::from(self.succeeded())
    }
}

// ============================================================================
// Preferences
// ============================================================================

/// External build tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMethod {
    Scons,
    #[default]
    Make,
}

/// User preferences (`preferences.yaml`). Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub build_method: BuildMethod,

    /// Shell command replacing the stock build invocation
    #[serde(default)]
    pub build_command: Option<String>,

    #[serde(default = "default_true")]
    pub multiprocessing: bool,

    /// Worker cap; blank or unparseable means every CPU
    #[serde(default)]
    pub max_cpus: Option<serde_yaml_ng::Value>,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Append run events to `data/<script>/events.jsonl`
    #[serde(default = "default_true")]
    pub journal: bool,

    /// Seed for random sweeps (entropy when absent)
    #[serde(default)]
    pub sweep_seed: Option<u64>,

    /// Template directory; `resources/template_code` under the work dir
    #[serde(default)]
    pub template_dir: Option<PathBuf>,

    #[serde(default = "default_simulator_name")]
    pub simulator_name: String,
}

fn default_true() -> bool {
    true
}

fn default_simulator_name() -> String {
    "mikenet_master".to_string()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            build_method: BuildMethod::default(),
            build_command: None,
            multiprocessing: true,
            max_cpus: None,
            database: None,
            journal: true,
            sweep_seed: None,
            template_dir: None,
            simulator_name: default_simulator_name(),
        }
    }
}

impl Preferences {
    /// Parsed worker cap, `None` when blank or not a positive integer.
    pub fn cpu_cap(&self) -> Option<usize> {
        let raw = yaml_value_to_string(self.max_cpus.as_ref()?);
        raw.trim().parse::<usize>().ok().filter(|&n| n > 0)
    }
}

/// SQLite archive target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

// ============================================================================
// Events
// ============================================================================

/// Progress events pushed from the orchestrator to its observer.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// Worker count; `None` when multiprocessing is disabled
    CpuCount(Option<usize>),
    Progress {
        completed: usize,
        total: usize,
        elapsed_seconds: f64,
    },
    SuccessRatio {
        success: usize,
        total: usize,
    },
    Aborted,
    Finished {
        elapsed_seconds: f64,
    },
}

/// Journal event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    ScriptStarted {
        script: String,
        run_id: String,
        total_runs: usize,
        workers: Option<usize>,
    },
    RunStarted {
        run: String,
    },
    RunGenerated {
        run: String,
        hash: String,
    },
    RunFailed {
        run: String,
        stage: Stage,
        error: String,
    },
    RunCompleted {
        run: String,
        exit_code: Option<i32>,
        archived: bool,
        seconds: f64,
    },
    ScriptAborted {
        script: String,
        run_id: String,
        completed: usize,
    },
    ScriptCompleted {
        script: String,
        run_id: String,
        succeeded: usize,
        failed: usize,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: JournalEvent,
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Shortest round-trip decimal, keeping a `.0` on integral values.
pub fn format_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

// ============================================================================
// Tests
// ============================================================================
