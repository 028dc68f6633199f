//! Run compiler: one resolved run in, one packaged run directory out.
//!
//! setup → generate → metadata → build → execute → archive → package
//!
//! Only the first four stages can fail a run. Execution, archival, and
//! packaging problems are logged and recorded in the report.

use super::codegen;
use super::metadata;
use super::template::Template;
use super::types::*;
use crate::archive::{database, package};
use crate::journal::eventlog::{self, Journal};
use crate::journal::hasher;
use crate::toolchain;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Generated model source inside a run directory.
pub const MODEL_SOURCE: &str = "build_model.c";

/// Stock template files, written by `init` and copied into every run directory.
pub const TEMPLATES: [(&str, &str); 5] = [
    (MODEL_SOURCE, include_str!("../../resources/template_code/build_model.c")),
    ("build_model.h", include_str!("../../resources/template_code/build_model.h")),
    ("mikenet_master.c", include_str!("../../resources/template_code/mikenet_master.c")),
    ("Makefile", include_str!("../../resources/template_code/Makefile")),
    ("SConstruct", include_str!("../../resources/template_code/SConstruct")),
];

/// Write the stock templates into `dir`.
pub fn install_templates(dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    for (name, content) in TEMPLATES {
        let path = dir.join(name);
        std::fs::write(&path, content).map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Where and how runs are compiled.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    /// Root holding `data/` and the default template directory
    pub work_dir: &'a Path,
    pub prefs: &'a Preferences,
    pub journal: Option<&'a Journal>,
}

impl<'a> CompileContext<'a> {
    pub fn new(work_dir: &'a Path, prefs: &'a Preferences) -> Self {
        Self {
            work_dir,
            prefs,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }

    pub fn template_dir(&self) -> PathBuf {
        match &self.prefs.template_dir {
            Some(dir) => self.work_dir.join(dir),
            None => self.work_dir.join("resources").join("template_code"),
        }
    }

    /// `data/<script>/<run>`
    pub fn run_dir(&self, script: &str, run: &str) -> PathBuf {
        self.data_dir().join(script).join(run)
    }

    fn record(&self, event: JournalEvent) {
        if let Some(j) = self.journal {
            j.record(event);
        }
    }
}

/// Build file the configured method does not use.
fn unused_build_file(method: BuildMethod) -> &'static str {
    match method {
        BuildMethod::Make => "SConstruct",
        BuildMethod::Scons => "Makefile",
    }
}

/// Recreate the run directory and copy the template files into it.
pub fn prepare_run_dir(ctx: &CompileContext<'_>, script: &str, run: &str) -> Result<PathBuf, String> {
    let dir = ctx.run_dir(script, run);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).map_err(|e| format!("cannot clear {}: {}", dir.display(), e))?;
    }
    std::fs::create_dir_all(&dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;

    let templates = ctx.template_dir();
    let entries = std::fs::read_dir(&templates)
        .map_err(|e| format!("cannot read template dir {}: {}", templates.display(), e))?;
    let skip = unused_build_file(ctx.prefs.build_method);
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() || entry.file_name() == skip {
            continue;
        }
        let target = dir.join(entry.file_name());
        std::fs::copy(&path, &target)
            .map_err(|e| format!("cannot copy {} to {}: {}", path.display(), target.display(), e))?;
    }
    Ok(dir)
}

/// Generate the model source and metadata for `resolved` into `out_dir`.
/// Returns the source hash.
pub fn emit(
    script: &Script,
    resolved: &ResolvedRun,
    template: &Template,
    out_dir: &Path,
    base_dir: &Path,
    start_date: &str,
) -> Result<String, (Stage, String)> {
    let source = codegen::generate(script, resolved, template, base_dir).map_err(|e| (Stage::Generate, e))?;
    let path = out_dir.join(MODEL_SOURCE);
    std::fs::write(&path, &source)
        .map_err(|e| (Stage::Generate, format!("cannot write {}: {}", path.display(), e)))?;

    let meta = out_dir.join(format!("{}.metadata", resolved.name()));
    std::fs::write(&meta, metadata::metadata_content(script, resolved, start_date))
        .map_err(|e| (Stage::Metadata, format!("cannot write {}: {}", meta.display(), e)))?;
    Ok(hasher::hash_string(&source))
}

/// Read and parse the model template from `dir`.
pub fn load_template(dir: &Path) -> Result<Template, String> {
    let path = dir.join(MODEL_SOURCE);
    let text = std::fs::read_to_string(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    Template::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Compile, build, run, archive, and package one resolved run.
pub fn compile(script: &Script, resolved: &ResolvedRun, ctx: &CompileContext<'_>) -> RunReport {
    let start = Instant::now();
    let name = resolved.name();
    ctx.record(JournalEvent::RunStarted { run: name.to_string() });

    let fail = |stage: Stage, message: String| {
        log::warn!("{}: {} failed: {}", name, stage, message);
        ctx.record(JournalEvent::RunFailed {
            run: name.to_string(),
            stage,
            error: message.clone(),
        });
        RunReport::failure(name, stage, message, start.elapsed())
    };

    // setup
    let run_dir = match prepare_run_dir(ctx, &script.name, name) {
        Ok(d) => d,
        Err(e) => return fail(Stage::Setup, e),
    };
    let template = match load_template(&run_dir) {
        Ok(t) => t,
        Err(e) => return fail(Stage::Generate, e),
    };

    // generate + metadata
    let hash = match emit(script, resolved, &template, &run_dir, ctx.work_dir, &eventlog::start_date()) {
        Ok(h) => h,
        Err((stage, e)) => return fail(stage, e),
    };
    log::debug!("{}: generated {}", name, hash);
    ctx.record(JournalEvent::RunGenerated {
        run: name.to_string(),
        hash: hash.clone(),
    });

    // build
    let built = toolchain::build(ctx.prefs, &run_dir);
    if toolchain::artifact_path(&run_dir, &ctx.prefs.simulator_name).is_none() {
        let detail = match built {
            Ok(out) => format!("exit code {}: {}", out.exit_code, tail(&out.log_text(), 20)),
            Err(e) => e,
        };
        return fail(
            Stage::Build,
            format!("no {} produced in {} ({})", ctx.prefs.simulator_name, run_dir.display(), detail),
        );
    }

    // execute
    let log_path = run_dir.join(format!("{}.log", name));
    let exit_code = match toolchain::run_simulator(&run_dir, &ctx.prefs.simulator_name) {
        Ok(out) => {
            if let Err(e) = std::fs::write(&log_path, out.log_text()) {
                log::warn!("{}: cannot write {}: {}", name, log_path.display(), e);
            }
            if !out.success() {
                log::warn!("{}: simulator exited with {}", name, out.exit_code);
            }
            Some(out.exit_code)
        }
        Err(e) => {
            log::warn!("{}: cannot run simulator: {}", name, e);
            None
        }
    };

    // archive
    let archive_failed = match &ctx.prefs.database {
        Some(db) => database::push_run_data(&run_dir, db).is_some(),
        None => false,
    };

    // package
    let package = match package::package_run(&run_dir) {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("{}: cannot package run: {}", name, e);
            None
        }
    };

    let duration = start.elapsed();
    ctx.record(JournalEvent::RunCompleted {
        run: name.to_string(),
        exit_code,
        archived: ctx.prefs.database.is_some() && !archive_failed,
        seconds: duration.as_secs_f64(),
    });
    log::info!("{}: done in {:.1}s", name, duration.as_secs_f64());

    RunReport {
        run_name: name.to_string(),
        outcome: CompileOutcome::Success,
        exit_code,
        archive_failed,
        package,
        source_hash: Some(hash),
        duration,
    }
}

/// Last `n` lines of `text`.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::codegen::tests::fixture;

    /// Build command producing a shell-script simulator that prints trace lines.
    pub(crate) const FAKE_BUILD: &str = "printf '#!/bin/sh\\nprintf \"avgError:\\\\tlearn\\\\t1\\\\t10\\\\t0.5\\\\n\"\\necho done >&2\\n' > mikenet_master && chmod +x mikenet_master";

    pub(crate) fn work_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        install_templates(&dir.path().join("resources").join("template_code")).unwrap();
        dir
    }

    pub(crate) fn fake_prefs() -> Preferences {
        Preferences {
            build_command: Some(FAKE_BUILD.into()),
            ..Preferences::default()
        }
    }

    #[test]
    fn test_compiler_templates_have_markers() {
        let dir = tempfile::tempdir().unwrap();
        install_templates(dir.path()).unwrap();
        assert!(load_template(dir.path()).is_ok());
        assert!(dir.path().join("Makefile").is_file());
    }

    #[test]
    fn test_compiler_prepare_run_dir() {
        let work = work_dir();
        let prefs = Preferences::default();
        let ctx = CompileContext::new(work.path(), &prefs);
        let stale = ctx.run_dir("demo", "base");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("old.log"), "x").unwrap();

        let dir = prepare_run_dir(&ctx, "demo", "base").unwrap();
        assert_eq!(dir, work.path().join("data/demo/base"));
        assert!(!dir.join("old.log").exists());
        assert!(dir.join("build_model.h").is_file());
        assert!(dir.join("Makefile").is_file());
        assert!(!dir.join("SConstruct").exists());
    }

    #[test]
    fn test_compiler_missing_templates_fail_setup() {
        let work = tempfile::tempdir().unwrap();
        let prefs = Preferences::default();
        let ctx = CompileContext::new(work.path(), &prefs);
        let (script, run) = fixture();
        let report = compile(&script, &run, &ctx);
        assert!(!report.succeeded());
        assert!(matches!(
            report.outcome,
            CompileOutcome::Failure {
                stage: Stage::Setup,
                ..
            }
        ));
        assert_eq!(report.code(), 0);
    }

    #[test]
    fn test_compiler_emit_writes_source_and_metadata() {
        let work = work_dir();
        let (script, run) = fixture();
        let template = load_template(&work.path().join("resources/template_code")).unwrap();
        let out = work.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let hash = emit(&script, &run, &template, &out, work.path(), "5-6-2026").unwrap();
        let source = std::fs::read_to_string(out.join(MODEL_SOURCE)).unwrap();
        assert_eq!(hash, hasher::hash_string(&source));
        assert!(source.contains("#define NUM_PHASE_ITEMS 2"));
        let meta = std::fs::read_to_string(out.join("base.metadata")).unwrap();
        assert!(meta.contains("start_date=5-6-2026"));
    }

    #[test]
    fn test_compiler_generate_failure() {
        let work = work_dir();
        let prefs = fake_prefs();
        let ctx = CompileContext::new(work.path(), &prefs);
        let (script, mut run) = fixture();
        run.run.phases.clear();
        let report = compile(&script, &run, &ctx);
        assert!(matches!(
            report.outcome,
            CompileOutcome::Failure {
                stage: Stage::Generate,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_compiler_build_failure() {
        let work = work_dir();
        let prefs = Preferences {
            build_command: Some("echo compile error >&2; exit 2".into()),
            ..Preferences::default()
        };
        let ctx = CompileContext::new(work.path(), &prefs);
        let (script, run) = fixture();
        let report = compile(&script, &run, &ctx);
        match report.outcome {
            CompileOutcome::Failure { stage, message } => {
                assert_eq!(stage, Stage::Build);
                assert!(message.contains("compile error"), "{}", message);
            }
            CompileOutcome::Success => panic!("build should fail"),
        }
        // failed runs keep their directory for inspection
        assert!(ctx.run_dir("demo", "base").join(MODEL_SOURCE).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_compiler_full_pipeline() {
        use flate2::read::GzDecoder;
        let work = work_dir();
        let mut prefs = fake_prefs();
        prefs.database = Some(DatabaseConfig {
            path: work.path().join("runs.db"),
        });
        let journal = Journal::new(&work.path().join("data"), "demo");
        let ctx = CompileContext::new(work.path(), &prefs).with_journal(&journal);
        let (script, run) = fixture();

        let report = compile(&script, &run, &ctx);
        assert!(report.succeeded(), "{:?}", report.outcome);
        assert_eq!(report.code(), 1);
        assert_eq!(report.exit_code, Some(0));
        assert!(!report.archive_failed);
        let tarball = report.package.clone().unwrap();
        assert_eq!(tarball, work.path().join("data/demo/base.tar.gz"));
        assert!(!ctx.run_dir("demo", "base").exists());

        let mut archive = tar::Archive::new(GzDecoder::new(std::fs::File::open(&tarball).unwrap()));
        let mut log = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("base.log") {
                std::io::Read::read_to_string(&mut entry, &mut log).unwrap();
            }
        }
        assert!(log.starts_with("avgError:\tlearn\t1\t10\t0.5\n"), "{}", log);
        assert!(log.contains("*************** stderr ***************\ndone"));

        let conn = rusqlite::Connection::open(work.path().join("runs.db")).unwrap();
        let errors: i64 = conn
            .query_row("SELECT COUNT(*) FROM errordata", [], |r| r.get(0))
            .unwrap();
        assert_eq!(errors, 1);

        let events = eventlog::read_events(journal.path()).unwrap();
        assert!(matches!(events[0].event, JournalEvent::RunStarted { .. }));
        assert!(matches!(events[1].event, JournalEvent::RunGenerated { .. }));
        assert!(matches!(
            events[2].event,
            JournalEvent::RunCompleted {
                archived: true,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_compiler_archive_failure_still_succeeds() {
        let work = work_dir();
        let mut prefs = fake_prefs();
        prefs.database = Some(DatabaseConfig {
            path: work.path().join("no/such/dir/runs.db"),
        });
        let ctx = CompileContext::new(work.path(), &prefs);
        let (script, run) = fixture();
        let report = compile(&script, &run, &ctx);
        assert!(report.succeeded());
        assert!(report.archive_failed);
    }

    #[test]
    fn test_compiler_template_missing_marker() {
        let work = work_dir();
        let source = work.path().join("resources/template_code").join(MODEL_SOURCE);
        let text = std::fs::read_to_string(&source).unwrap();
        let stripped: String = text
            .lines()
            .filter(|l| !l.contains("INSERT_FLAG_BUILD_PHASES"))
            .map(|l| format!("{}\n", l))
            .collect();
        assert_ne!(stripped.len(), text.len());
        std::fs::write(&source, stripped).unwrap();

        let prefs = fake_prefs();
        let ctx = CompileContext::new(work.path(), &prefs);
        let (script, run) = fixture();
        let report = compile(&script, &run, &ctx);
        assert_eq!(report.code(), 0);
        match &report.outcome {
            CompileOutcome::Failure { stage, message } => {
                assert_eq!(*stage, Stage::Generate);
                assert!(message.contains("INSERT_FLAG_BUILD_PHASES"), "{}", message);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let dir = ctx.run_dir("demo", "base");
        assert!(dir.is_dir());
        assert!(!dir.join("mikenet_master").exists());
        assert!(report.package.is_none());
    }

    #[test]
    fn test_compiler_tail() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
