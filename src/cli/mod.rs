//! CLI subcommands: init, validate, expand, generate, run.

use crate::core::orchestrator::{self, ProgressObserver, ScriptRunner};
use crate::core::template::Template;
use crate::core::{compiler, parser, types};
use crate::journal::eventlog;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a project: templates, preferences, and a sample script
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a script without compiling anything
    Validate {
        /// Path to the script
        #[arg(short, long, default_value = "script.yaml")]
        file: PathBuf,
    },

    /// List the resolved runs a script expands to
    Expand {
        /// Path to the script
        #[arg(short, long, default_value = "script.yaml")]
        file: PathBuf,

        /// Preferences file (seeds random sweeps)
        #[arg(long, default_value = "preferences.yaml")]
        prefs: PathBuf,
    },

    /// Write each resolved run's model source and metadata without building
    Generate {
        /// Path to the script
        #[arg(short, long, default_value = "script.yaml")]
        file: PathBuf,

        /// Output directory (one subdirectory per run)
        #[arg(short, long, default_value = "generated")]
        out: PathBuf,

        /// Preferences file
        #[arg(long, default_value = "preferences.yaml")]
        prefs: PathBuf,

        /// Directory holding the templates; relative includes resolve here
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
    },

    /// Compile, build, execute, and archive every run of a script
    Run {
        /// Path to the script
        #[arg(short, long, default_value = "script.yaml")]
        file: PathBuf,

        /// Preferences file
        #[arg(long, default_value = "preferences.yaml")]
        prefs: PathBuf,

        /// Directory holding `data/` and the templates
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Run serially regardless of preferences
        #[arg(long)]
        serial: bool,

        /// Worker count override
        #[arg(short, long)]
        jobs: Option<usize>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Expand { file, prefs } => cmd_expand(&file, &prefs),
        Commands::Generate {
            file,
            out,
            prefs,
            work_dir,
        } => cmd_generate(&file, &out, &prefs, &work_dir),
        Commands::Run {
            file,
            prefs,
            work_dir,
            serial,
            jobs,
        } => cmd_run(&file, &prefs, &work_dir, serial, jobs),
    }
}

const SAMPLE_PREFERENCES: &str = r#"# Build with `make mikenet_master` or `scons`
build_method: make
multiprocessing: true
# Worker cap; blank means every available CPU
max_cpus:
journal: true
# database:
#   path: data/runs.sqlite
"#;

const SAMPLE_SCRIPT: &str = r#"name: sample
description: "XOR network, learning rate sweep"
training_profiles:
  - name: xor
    parameters:
      - variable_name: example_path
        form_name: Example Set
        widget_type: path
        value: xor.ex
      - variable_name: epsilon
        form_name: Epsilon
        widget_type: double
        value: 0.1
        override_flag: true
      - variable_name: max_iterations
        form_name: Max iterations
        widget_type: int
        value: 1000
children:
  - iterator:
      name: learning_rate
      varying:
        parameter: Epsilon
      repeat: 3
      initial_value: 0.05
      delta: 0.05
      child:
        run:
          name: xor
          ticks: 3
          groups:
            - name: input
              units: 2
            - name: hidden
              units: 3
            - name: output
              units: 1
          adjacency:
            - [0, 1, 0, 0]
            - [0, 0, 1, 0]
            - [0, 0, 0, 0]
            - [0, 1, 1, 0]
          phases:
            - name: training
              items:
                - name: learn
                  profile: xor
                  components:
                    groups: [input, hidden, output]
                    connections: ["input%hidden", "hidden%output"]
                  recording:
                    output: [2]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let script_path = path.join("script.yaml");
    let prefs_path = path.join("preferences.yaml");
    for existing in [&script_path, &prefs_path] {
        if existing.exists() {
            return Err(format!("{} already exists", existing.display()));
        }
    }

    let template_dir = path.join("resources").join("template_code");
    compiler::install_templates(&template_dir)?;
    let data_dir = path.join("data");
    std::fs::create_dir_all(&data_dir).map_err(|e| format!("cannot create data dir: {}", e))?;
    std::fs::write(&prefs_path, SAMPLE_PREFERENCES)
        .map_err(|e| format!("cannot write {}: {}", prefs_path.display(), e))?;
    std::fs::write(&script_path, SAMPLE_SCRIPT)
        .map_err(|e| format!("cannot write {}: {}", script_path.display(), e))?;

    println!("Initialized mnrun project at {}", path.display());
    println!("  Created: {}", script_path.display());
    println!("  Created: {}", prefs_path.display());
    println!("  Created: {}/", template_dir.display());
    println!("  Created: {}/", data_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let script = parse_and_validate(file)?;
    let runs: usize = script.children.len();
    println!(
        "OK: {} ({} top-level entries, {} training profiles, {} test profiles)",
        script.name,
        runs,
        script.training_profiles.len(),
        script.test_profiles.len()
    );
    Ok(())
}

/// Parse and validate a script file, printing every error if invalid.
fn parse_and_validate(file: &Path) -> Result<types::Script, String> {
    let script = parser::parse_script_file(file)?;
    let errors = parser::validate_script(&script);
    if errors.is_empty() {
        return Ok(script);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_expand(file: &Path, prefs_path: &Path) -> Result<(), String> {
    let script = parse_and_validate(file)?;
    let prefs = parser::parse_preferences_file(prefs_path)?;
    let batch = orchestrator::prepare_batch(&script, &prefs)?;
    print_batch(&batch);
    Ok(())
}

/// Display resolved runs and their overrides to stdout.
fn print_batch(batch: &types::RunBatch) {
    println!("Expanding: {} ({} runs)", batch.script.name, batch.len());
    println!();
    for run in &batch.runs {
        println!("  {}", run.name());
        for (key, o) in run.overrides.iter() {
            println!("      {} = {} [{}]", key, o.value, o.scope);
        }
    }
}

/// Model template from `work_dir`, falling back to the stock one.
fn model_template(prefs: &types::Preferences, work_dir: &Path) -> Result<Template, String> {
    let dir = compiler::CompileContext::new(work_dir, prefs).template_dir();
    if dir.join(compiler::MODEL_SOURCE).is_file() {
        return compiler::load_template(&dir);
    }
    log::debug!("no template in {}, using the stock one", dir.display());
    let (_, stock) = compiler::TEMPLATES[0];
    Template::parse(stock)
}

fn cmd_generate(file: &Path, out: &Path, prefs_path: &Path, work_dir: &Path) -> Result<(), String> {
    let script = parse_and_validate(file)?;
    let prefs = parser::parse_preferences_file(prefs_path)?;
    let template = model_template(&prefs, work_dir)?;
    let batch = orchestrator::prepare_batch(&script, &prefs)?;
    let date = eventlog::start_date();

    let mut failed = 0;
    for run in &batch.runs {
        let dir = out.join(run.name());
        std::fs::create_dir_all(&dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
        match compiler::emit(&batch.script, run, &template, &dir, work_dir, &date) {
            Ok(hash) => println!("  {} {}", run.name(), hash),
            Err((stage, e)) => {
                eprintln!("  {} FAILED ({}): {}", run.name(), stage, e);
                failed += 1;
            }
        }
    }

    println!();
    if failed > 0 {
        return Err(format!("{} of {} run(s) failed to generate", failed, batch.len()));
    }
    println!("Generated {} run(s) into {}", batch.len(), out.display());
    Ok(())
}

/// Prints orchestrator events to stdout.
#[derive(Debug, Default)]
struct ConsoleObserver;

impl ProgressObserver for ConsoleObserver {
    fn on_cpu_count(&mut self, workers: Option<usize>) {
        match workers {
            Some(n) => println!("Using {} worker(s)", n),
            None => println!("Multiprocessing disabled, running serially"),
        }
    }

    fn on_progress(&mut self, completed: usize, total: usize, elapsed_seconds: f64) {
        println!("[{}/{}] {:.1}s elapsed", completed, total, elapsed_seconds);
    }

    fn on_success_ratio(&mut self, success: usize, total: usize) {
        println!("{}/{} runs successful", success, total);
    }

    fn on_abort(&mut self) {
        println!("Aborted.");
    }

    fn on_finished(&mut self, elapsed_seconds: f64) {
        println!("Finished in {:.1}s", elapsed_seconds);
    }
}

fn cmd_run(file: &Path, prefs_path: &Path, work_dir: &Path, serial: bool, jobs: Option<usize>) -> Result<(), String> {
    let script = parse_and_validate(file)?;
    let mut prefs = parser::parse_preferences_file(prefs_path)?;
    if serial {
        prefs.multiprocessing = false;
    }

    let runner = ScriptRunner::prepare(&script, prefs, work_dir)?.with_jobs(jobs);
    println!("Running: {} ({} runs)", script.name, runner.batch().len());
    let summary = runner.run(&mut ConsoleObserver);

    for report in summary.reports.iter().filter(|r| !r.succeeded()) {
        if let types::CompileOutcome::Failure { stage, message } = &report.outcome {
            eprintln!("  {} FAILED ({}): {}", report.run_name, stage, message);
        }
    }
    if summary.aborted {
        return Err("aborted".to_string());
    }
    if summary.failed() > 0 {
        return Err(format!("{} run(s) failed", summary.failed()));
    }
    Ok(())
}
