use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::AnalysisError;
use crate::config::AnalysisConfig;

/// Captured result of one statistical program run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProgramOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// External statistical program. Reads the feature images in `input_dir`
/// together with `variables_csv` and writes its results to `output_dir`.
///
/// Blocking; called from a blocking task.
pub trait StatisticalProgram: Send + Sync {
    fn run(
        &self,
        input_dir: &Path,
        variables_csv: &Path,
        output_dir: &Path,
    ) -> Result<ProgramOutput, AnalysisError>;
}

/// Runs the analysis script through `Rscript` (or whichever interpreter the
/// config names): `program [args..] script <input_dir> <variables_csv> <output_dir>`.
#[derive(Clone, Debug)]
pub struct RscriptProgram {
    program: String,
    script: PathBuf,
    args: Vec<String>,
}

impl RscriptProgram {
    pub fn new(program: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.program.clone(), config.script.clone()).with_args(config.args.clone())
    }

    fn command(&self, input_dir: &Path, variables_csv: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&self.script)
            .arg(input_dir)
            .arg(variables_csv)
            .arg(output_dir);
        cmd
    }
}

impl StatisticalProgram for RscriptProgram {
    fn run(
        &self,
        input_dir: &Path,
        variables_csv: &Path,
        output_dir: &Path,
    ) -> Result<ProgramOutput, AnalysisError> {
        let mut cmd = self.command(input_dir, variables_csv, output_dir);
        info!(program = %self.program, script = %self.script.display(), "Running analysis");
        debug!("Command: {:?}", cmd);

        let output = cmd.output().map_err(|source| AnalysisError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        Ok(ProgramOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_follow_the_script() {
        let program = RscriptProgram::new("Rscript", "utm/run.R").with_args(["--vanilla"]);
        let cmd = program.command(Path::new("in"), Path::new("vars.csv"), Path::new("out"));

        assert_eq!(cmd.get_program(), "Rscript");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["--vanilla", "utm/run.R", "in", "vars.csv", "out"]);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let program = RscriptProgram::new("definitely-not-an-installed-program-7f3a", "x.R");
        let dir = tempfile::tempdir().unwrap();
        let err = program
            .run(dir.path(), &dir.path().join("v.csv"), dir.path())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_captured() {
        // runs `sh -c "exit 3" <csv> <out>`
        let program = RscriptProgram::new("sh", "-c");
        let dir = tempfile::tempdir().unwrap();
        let output = program
            .run(Path::new("exit 3"), &dir.path().join("v.csv"), dir.path())
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
    }
}
