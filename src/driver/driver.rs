//! Build orchestration: import the project, compile every function
//! concurrently, link the used functions behind the synthesized entry
//! sequence, and write the executable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};

use crate::asm::{elf, encoder, Assembler};
use crate::backend::environment::Environment;
use crate::backend::registers::SYSCALL;
use crate::common::error::{BuildError, CompileError, ErrorKind};

/// Number of the Linux `exit` syscall, used by the synthesized epilogue.
const SYS_EXIT: i64 = 60;

/// Mangled name of the program entry function.
const MAIN: &str = "main|0";

/// A compiler build of one project directory.
#[derive(Debug)]
pub struct Build {
    pub path: PathBuf,
    pub executable_path: PathBuf,
    pub executable_name: String,
    pub write_executable: bool,
    pub optimize: bool,
    pub verbose: bool,
}

impl Build {
    pub fn new(directory: &Path) -> Result<Self> {
        let path = directory
            .canonicalize()
            .map_err(|e| anyhow!("Cannot open '{}': {}", directory.display(), e))?;

        let executable_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Cannot name an executable after '{}'", path.display()))?;

        Ok(Self {
            executable_path: path.join(&executable_name),
            path,
            executable_name,
            write_executable: true,
            optimize: false,
            verbose: false,
        })
    }

    /// Parse the input files and generate an executable binary.
    pub fn run(&self) -> Result<()> {
        let mut environment = Environment::new(self.optimize);
        environment
            .import_directory(&self.path)
            .map_err(|error| self.report(&environment, error))?;

        if !environment.functions.contains_key(MAIN) {
            bail!("{}", ErrorKind::MainMissing);
        }

        let environment = Arc::new(environment);
        let results = environment
            .compile()
            .map_err(|error| self.report(&environment, BuildError::Compile(error)))?;

        // Synthesized entry: call main, then exit cleanly.
        let mut final_code = Assembler::new();
        final_code.call(MAIN);
        final_code.move_register_number(SYSCALL[0], SYS_EXIT);
        final_code.move_register_number(SYSCALL[1], 0);
        final_code.syscall();
        environment.functions[MAIN].increment_call_count();

        // Concatenate used functions in name order; the results are
        // already sorted, which keeps the output deterministic.
        for function in &results {
            if function.call_count() == 0 {
                debug!("dropping {} (never called)", function.name);
                continue;
            }

            let compiled = function
                .compiled()
                .ok_or_else(|| anyhow!("Function '{}' has no compiled body", function.name))?;

            if self.verbose {
                debug!("{}\n{}", function.name, compiled.assembler.listing());
            }

            final_code.add_label(function.name.clone());
            final_code.merge(&compiled.assembler, &function.name);
        }

        final_code.verify().map_err(|message| anyhow!("{}", message))?;

        if !self.write_executable {
            return Ok(());
        }

        let program =
            encoder::encode(&final_code, elf::TEXT_VADDR).map_err(|message| anyhow!("{}", message))?;
        elf::write_file(&program, &self.executable_path).map_err(|message| anyhow!("{}", message))?;

        info!(
            "wrote {} ({} bytes of code, {} bytes of data)",
            self.executable_path.display(),
            program.text.len(),
            program.data.len()
        );

        Ok(())
    }

    /// Render a build error, attaching the offending source line when the
    /// file is known.
    fn report(&self, environment: &Environment, error: BuildError) -> anyhow::Error {
        match error {
            BuildError::Compile(compile_error) => {
                anyhow!("{}", self.render(environment, &compile_error))
            }
            BuildError::Io(message) => anyhow!("{}", message),
        }
    }

    fn render(&self, environment: &Environment, error: &CompileError) -> String {
        match environment.source_file(&error.file) {
            Some(source) => error.render(source).trim_end().to_string(),
            None => error.to_string(),
        }
    }
}
