//! Compress bulky simulator outputs and pack a run directory into a tarball.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Output extensions that are gzip'd individually before packing.
pub const COMPRESSED_EXTENSIONS: [&str; 3] = ["activations", "test", "weights"];

/// Gzip every bulky output in `run_dir` in place (`x.weights` becomes
/// `x.weights.gz`). Returns the compressed paths.
pub fn gzip_outputs(run_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut written = Vec::new();
    for ext in COMPRESSED_EXTENSIONS {
        let pattern = Path::new(&glob::Pattern::escape(&run_dir.to_string_lossy())).join(format!("*.{}", ext));
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|e| format!("bad pattern {}: {}", pattern, e))?;
        for path in paths.filter_map(Result::ok) {
            written.push(gzip_file(&path)?);
        }
    }
    Ok(written)
}

fn gzip_file(path: &Path) -> Result<PathBuf, String> {
    let target = PathBuf::from(format!("{}.gz", path.display()));
    let mut src = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let out = File::create(&target).map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
    let mut enc = GzEncoder::new(BufWriter::new(out), Compression::default());
    std::io::copy(&mut src, &mut enc).map_err(|e| format!("gzip {}: {}", path.display(), e))?;
    enc.finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| format!("gzip {}: {}", path.display(), e))?;
    std::fs::remove_file(path).map_err(|e| format!("cannot remove {}: {}", path.display(), e))?;
    Ok(target)
}

/// Write `run_dir` as `<parent>/<name>.tar.gz`, rooted at the directory name.
pub fn tar_run_dir(run_dir: &Path) -> Result<PathBuf, String> {
    let name = run_dir
        .file_name()
        .ok_or_else(|| format!("run directory {} has no name", run_dir.display()))?;
    let parent = run_dir.parent().unwrap_or_else(|| Path::new("."));
    let target = parent.join(format!("{}.tar.gz", name.to_string_lossy()));

    let out = File::create(&target).map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
    let enc = GzEncoder::new(BufWriter::new(out), Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder
        .append_dir_all(name, run_dir)
        .map_err(|e| format!("cannot pack {}: {}", run_dir.display(), e))?;
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .and_then(|mut w| w.flush())
        .map_err(|e| format!("cannot finish {}: {}", target.display(), e))?;
    Ok(target)
}

/// Compress outputs, tar the run directory, then remove it.
pub fn package_run(run_dir: &Path) -> Result<PathBuf, String> {
    let compressed = gzip_outputs(run_dir)?;
    log::debug!("{}: compressed {} output files", run_dir.display(), compressed.len());
    let tarball = tar_run_dir(run_dir)?;
    std::fs::remove_dir_all(run_dir).map_err(|e| format!("cannot remove {}: {}", run_dir.display(), e))?;
    Ok(tarball)
}
