use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use log::{debug, info};
use path_clean::PathClean;
use rand::Rng;
use serde::Deserialize;

use super::presets::get_preset_script;
use super::{DoubletCalls, DoubletDetector};
use crate::fileformat::{write_h5ad, CountMatrix};

pub const PREFLIGHT_OK: &str = "DOUBLET-CHECK";


/**
 * Doublet detection delegated to an external executable, typically a python wrapper
 * around Scrublet. For each unit the counts are written to a temporary h5ad along with
 * a list of the cell names, and the script is called as
 *
 *   script --input unit.h5ad --cells unit.cells.txt --output unit.doublets.tsv
 *
 * It must write a TSV with header "cell score is_doublet", one line per input cell,
 * in input order
 */
#[derive(Debug)]
pub struct ScriptDoubletDetector {
    script_file: PathBuf,
    path_tmp: PathBuf,
    delete_script: bool,
    num_units: Cell<usize>,
}
impl ScriptDoubletDetector {

    /**
     * Copy the script content to a new file in the temp directory, and make it executable.
     * The copy is deleted when the detector is dropped
     */
    pub fn new_from_reader(script_code: &mut impl Read, path_tmp: &Path) -> anyhow::Result<ScriptDoubletDetector> {
        let mut rng = rand::thread_rng();
        let n2: u16 = rng.gen();

        let path_script = path_tmp.join(format!("_doublet_script.{}", n2));
        {
            let mut script_file = File::create_new(&path_script)
                .with_context(|| format!("Failed to create temp script file {}", path_script.display()))?;
            io::copy(script_code, &mut script_file)?;
            script_file.flush()?;
        }
        make_executable(&path_script)?;
        debug!("Extracted doublet script to {}", path_script.display());

        let script = ScriptDoubletDetector {
            script_file: to_absolute_path(&path_script)?,
            path_tmp: to_absolute_path(path_tmp)?,
            delete_script: true,
            num_units: Cell::new(0),
        };
        script.preflight_check()?;
        Ok(script)
    }

    /// Use a script provided by the user, in place
    pub fn new_from_file(f: &Path, path_tmp: &Path) -> anyhow::Result<ScriptDoubletDetector> {
        if !f.exists() {
            bail!("Doublet script {} does not exist", f.display());
        }
        let script = ScriptDoubletDetector {
            script_file: to_absolute_path(f)?,
            path_tmp: to_absolute_path(path_tmp)?,
            delete_script: false,
            num_units: Cell::new(0),
        };
        script.preflight_check()?;
        Ok(script)
    }

    /// One of the scripts shipped inside the binary
    pub fn new_from_preset(preset_name: &str, path_tmp: &Path) -> anyhow::Result<ScriptDoubletDetector> {
        let Some(code) = get_preset_script(preset_name) else {
            bail!("Unknown doublet detection preset '{}'", preset_name);
        };
        let mut reader = io::Cursor::new(code);
        Self::new_from_reader(&mut reader, path_tmp)
    }

    /// The script must answer --preflight-check with DOUBLET-CHECK
    pub fn preflight_check(&self) -> anyhow::Result<()> {
        let run_output = process::Command::new(&self.script_file)
            .arg("--preflight-check")
            .output()
            .with_context(|| format!("Failed to run script {}. Is it executable?", self.script_file.display()))?;

        let run_output_string = String::from_utf8_lossy(&run_output.stdout);
        let run_output_string = run_output_string.trim();
        if run_output_string.lines().last() == Some(PREFLIGHT_OK) {
            Ok(())
        } else {
            bail!(
                "Doublet script {} does not pass pre-flight check: {}",
                self.script_file.display(),
                run_output_string
            )
        }
    }
}

impl Drop for ScriptDoubletDetector {
    fn drop(&mut self) {
        if self.delete_script {
            _ = std::fs::remove_file(&self.script_file);
        }
    }
}

impl fmt::Display for ScriptDoubletDetector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "doublet script {}", self.script_file.display())
    }
}

impl DoubletDetector for ScriptDoubletDetector {

    fn detect(&self, unit: &CountMatrix) -> anyhow::Result<DoubletCalls> {
        let unit_id = self.num_units.get();
        self.num_units.set(unit_id + 1);

        let path_input = self.path_tmp.join(format!("unit_{}.h5ad", unit_id));
        let path_cells = self.path_tmp.join(format!("unit_{}.cells.txt", unit_id));
        let path_output = self.path_tmp.join(format!("unit_{}.doublets.tsv", unit_id));

        //Only counts and names are needed by the script
        let counts_only = CountMatrix::new(unit.x.clone(), unit.obs_names.clone(), unit.var_names.clone())?;
        write_h5ad(&counts_only, &path_input)?;
        write_cell_list_file(&path_cells, &unit.obs_names)?;

        info!("Running {} on {} cells", self, unit.n_obs());
        let run_output = process::Command::new(&self.script_file)
            .current_dir(&self.path_tmp)
            .arg("--input").arg(&path_input)
            .arg("--cells").arg(&path_cells)
            .arg("--output").arg(&path_output)
            .output()
            .with_context(|| format!("Could not spawn process for {}", self))?;

        for line in String::from_utf8_lossy(&run_output.stdout).lines() {
            debug!("{}", line);
        }
        if !run_output.status.success() {
            bail!(
                "{} failed with {}\n{}",
                self,
                run_output.status,
                String::from_utf8_lossy(&run_output.stderr)
            );
        }

        let calls = read_doublet_calls(&path_output, &unit.obs_names)?;

        _ = std::fs::remove_file(&path_input);
        _ = std::fs::remove_file(&path_cells);
        _ = std::fs::remove_file(&path_output);
        Ok(calls)
    }
}



#[derive(Debug, Deserialize)]
struct DoubletCallRecord {
    cell: String,
    score: f64,
    is_doublet: String,
}


/**
 * Read the TSV written by a doublet script. Cells must come in the same order as given
 */
pub fn read_doublet_calls(p: &Path, expected_cells: &[String]) -> anyhow::Result<DoubletCalls> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(p)
        .with_context(|| format!("Doublet script did not produce {}", p.display()))?;

    let mut calls = DoubletCalls {
        scores: Vec::with_capacity(expected_cells.len()),
        is_doublet: Vec::with_capacity(expected_cells.len()),
    };
    for (i, record) in reader.deserialize::<DoubletCallRecord>().enumerate() {
        let record = record.with_context(|| format!("Malformed line {} in {}", i + 2, p.display()))?;
        match expected_cells.get(i) {
            Some(expected) if *expected == record.cell => {}
            Some(expected) => bail!("Doublet calls out of order: expected cell {}, got {}", expected, record.cell),
            None => bail!("Doublet calls include unexpected cell {}", record.cell),
        }
        calls.scores.push(record.score);
        calls.is_doublet.push(parse_flag(&record.is_doublet)?);
    }

    if calls.len() != expected_cells.len() {
        bail!("Doublet script returned {} calls for {} cells", calls.len(), expected_cells.len());
    }
    Ok(calls)
}


fn parse_flag(s: &str) -> anyhow::Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("Cannot parse doublet call '{}'", other),
    }
}


pub fn write_cell_list_file(p: &Path, cells: &[String]) -> anyhow::Result<()> {
    let mut f = io::BufWriter::new(File::create(p)?);
    for cell in cells {
        writeln!(f, "{}", cell)?;
    }
    f.flush()?;
    Ok(())
}


#[cfg(unix)]
fn make_executable(p: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(p)?.permissions();
    perms.set_mode(perms.mode() | 0o700);
    std::fs::set_permissions(p, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_p: &Path) -> anyhow::Result<()> {
    Ok(())
}


pub fn to_absolute_path(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    }.clean();

    Ok(absolute_path)
}
