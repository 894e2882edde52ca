//! A compiler for the Q language.
//!
//! Source files in a project directory are compiled straight to a
//! standalone x86-64 Linux ELF executable: no external assembler, no
//! linker, no C runtime. Functions are compiled concurrently, one task
//! per function, with call sites waiting on their callees' register usage
//! before emitting calls.

pub mod asm;
pub mod backend;
pub mod common;
pub mod driver;
pub mod frontend;

/// Shared entry point for the compiler binary. Spawns the real work on a
/// thread with a large stack so deeply nested expressions can't overflow
/// the recursive tree walkers.
pub fn compiler_main() {
    const STACK_SIZE: usize = 16 * 1024 * 1024; // 16 MB

    let builder = std::thread::Builder::new().stack_size(STACK_SIZE);
    let handler = builder
        .spawn(|| {
            let args: Vec<String> = std::env::args().collect();

            let build = match driver::cli::parse_args(&args) {
                Ok(Some(build)) => build,
                Ok(None) => return Ok(()),
                Err(message) => return Err(message),
            };

            env_logger::Builder::from_default_env()
                .filter_level(if build.verbose {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Warn
                })
                .format_timestamp(None)
                .init();

            build.run().map_err(|e| e.to_string())
        })
        .expect("failed to spawn main thread");

    match handler.join() {
        Ok(Ok(())) => {}
        Ok(Err(message)) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
        Err(panic) => {
            if let Some(s) = panic.downcast_ref::<&str>() {
                eprintln!("qcc: internal error: {}", s);
            } else if let Some(s) = panic.downcast_ref::<String>() {
                eprintln!("qcc: internal error: {}", s);
            } else {
                eprintln!("qcc: internal error (thread panicked)");
            }
            std::process::exit(1);
        }
    }
}
