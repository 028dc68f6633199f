//! Benchmarks for mnrun core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mnrun::core::types::*;
use mnrun::core::{codegen, compiler, expander, parser, template::Template};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

const SCRIPT: &str = r#"
name: bench
training_profiles:
  - name: train
    parameters:
      - variable_name: example_path
        form_name: Example Set
        widget_type: path
        value: train.ex
      - variable_name: epsilon
        form_name: Epsilon
        widget_type: double
        value: 0.1
children:
  - iterator:
      name: outer
      varying: seed
      repeat: 10
      initial_value: 1
      delta: 1
      child:
        iterator:
          name: inner
          varying:
            parameter: Epsilon
          repeat: 10
          initial_value: 0.01
          delta: 0.01
          random:
            mode: gaussian
            arg1: 0.1
            arg2: 0.02
          child:
            run:
              name: net
              groups:
                - name: input
                - name: output
              phases:
                - name: p
                  items:
                    - name: learn
                      profile: train
                      components:
                        groups: [input, output]
"#;

fn bench_yaml_parse(c: &mut Criterion) {
    c.bench_function("yaml_parse_script", |b| {
        b.iter(|| {
            let script = parser::parse_script(black_box(SCRIPT)).unwrap();
            black_box(script);
        });
    });
}

fn bench_expand(c: &mut Criterion) {
    let script = parser::parse_script(SCRIPT).unwrap();
    c.bench_function("expand_100_runs", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(7);
            let batch = expander::prepare(black_box(&script), &mut rng).unwrap();
            black_box(batch);
        });
    });
}

fn bench_cartesian(c: &mut Criterion) {
    let mut group = c.benchmark_group("cartesian_product");
    for dims in [2, 4, 6] {
        let values: Vec<Vec<Number>> = (0..dims)
            .map(|d| (0..4).map(|i| Number::Int(d * 10 + i)).collect())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(dims), &values, |b, values| {
            b.iter(|| black_box(expander::cartesian_product(black_box(values))));
        });
    }
    group.finish();
}

/// Chain of `n` groups with one item binding all of them.
fn layered(n: usize) -> (Script, ResolvedRun) {
    let mut script = parser::parse_script("name: bench").unwrap();
    script
        .training_profiles
        .push(TrainingProfile::with_defaults("train", "train.ex"));
    let mut run = Run::new("net");
    let mut item = PhaseItem::new("learn");
    item.profile = Some("train".into());
    for i in 0..n {
        let name = format!("g{}", i);
        run.add_group(Group::new(&name, 16)).unwrap();
        item.components.groups.insert(name.clone());
        item.recording.insert(name, [0, 1].into_iter().collect());
        if i > 0 {
            let from = format!("g{}", i - 1);
            run.connect(&from, &format!("g{}", i)).unwrap();
            item.components.connections.insert(connection_name(&from, &format!("g{}", i)));
        }
    }
    run.phases.push(Phase {
        name: "p".into(),
        order: PhaseOrder::Sequential,
        max_iterations: 1,
        items: vec![item],
    });
    (script, ResolvedRun::bare(&run))
}

fn bench_generate(c: &mut Criterion) {
    let (_, stock) = compiler::TEMPLATES[0];
    let template = Template::parse(stock).unwrap();
    let mut group = c.benchmark_group("generate");
    for n in [4, 16, 64] {
        let (script, run) = layered(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &(script, run), |b, (script, run)| {
            b.iter(|| {
                let source = codegen::generate(script, black_box(run), &template, Path::new(".")).unwrap();
                black_box(source);
            });
        });
    }
    group.finish();
}

fn bench_blake3_source(c: &mut Criterion) {
    let (script, run) = layered(64);
    let (_, stock) = compiler::TEMPLATES[0];
    let template = Template::parse(stock).unwrap();
    let source = codegen::generate(&script, &run, &template, Path::new(".")).unwrap();
    c.bench_function("blake3_generated_source", |b| {
        b.iter(|| black_box(blake3::hash(black_box(source.as_bytes()))));
    });
}

criterion_group!(
    benches,
    bench_yaml_parse,
    bench_expand,
    bench_cartesian,
    bench_generate,
    bench_blake3_source
);
criterion_main!(benches);
