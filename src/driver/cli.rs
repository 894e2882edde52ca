//! Command-line argument parsing.
//!
//! A flat `match` over the argument list; no parser library. The compiler
//! takes one project directory and a handful of flags.

use std::path::Path;

use super::driver::Build;

const USAGE: &str = "\
Usage: qcc [options] <project directory>

Options:
  -O, --optimize   enable small-function inlining and peepholes
  -v, --verbose    log per-function assembly and link decisions
      --dry-run    compile without writing the executable
  -h, --help       show this help
";

/// Parse the command line into a configured build. Returns `Ok(None)`
/// when a query flag (help) was handled and the process should exit.
pub fn parse_args(args: &[String]) -> Result<Option<Build>, String> {
    let mut directory: Option<&str> = None;
    let mut optimize = false;
    let mut verbose = false;
    let mut write_executable = true;

    for arg in &args[1..] {
        match arg.as_str() {
            "-O" | "--optimize" => optimize = true,
            "-v" | "--verbose" => verbose = true,
            "--dry-run" => write_executable = false,
            "-h" | "--help" => {
                print!("{}", USAGE);
                return Ok(None);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("Unknown flag '{}'", flag));
            }
            path => {
                if directory.replace(path).is_some() {
                    return Err("Expected exactly one project directory".to_string());
                }
            }
        }
    }

    let mut build =
        Build::new(Path::new(directory.unwrap_or("."))).map_err(|e| e.to_string())?;
    build.optimize = optimize;
    build.verbose = verbose;
    build.write_executable = write_executable;

    Ok(Some(build))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("qcc").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn flags() {
        let build = parse_args(&args(&["-O", "-v", "--dry-run", "."])).unwrap().unwrap();
        assert!(build.optimize);
        assert!(build.verbose);
        assert!(!build.write_executable);
    }

    #[test]
    fn defaults() {
        let build = parse_args(&args(&["."])).unwrap().unwrap();
        assert!(!build.optimize);
        assert!(!build.verbose);
        assert!(build.write_executable);
    }

    #[test]
    fn unknown_flag() {
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
    }
}
