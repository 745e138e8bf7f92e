use std::env;
use std::fs;
use std::io::{self, Write};

use joker::prelude::*;

/// The conventional exit code in BSD Unixes.
/// See: man 3 sysexits
mod ex {
    /// The conventional exit code for usage error.
    pub const USAGE: i32 = 64;
    /// When the input data is incorrect -- for example, a compile-time error.
    pub const DATAERR: i32 = 65;
    /// An internal software error occured.
    pub const SOFTWARE: i32 = 70;
    /// An error occured while doing I/O on a file.
    pub const IOERR: i32 = 74;
}

fn main() {
    let mut config = Config::default();
    let mut paths = Vec::new();

    for arg in env::args().skip(1) {
        if arg.starts_with("--") {
            if !config.apply_flag(&arg) {
                usage();
            }
        } else {
            paths.push(arg);
        }
    }

    match paths.as_slice() {
        [] => repl(config),
        [filename] => run_file(config, filename),
        _ => usage(),
    }
}

fn usage() -> ! {
    eprintln!("Usage: joker [--trace] [--print-code] [--stress-gc] [--log-gc] [path]");
    std::process::exit(ex::USAGE);
}

/// Use Joker interactively using the read-execute-print loop.
///
/// Errors are reported and the loop carries on; globals survive from one line to the next.
fn repl(config: Config) {
    let mut vm = VM::new(config);
    let mut line = String::with_capacity(1024);

    let stdin = io::stdin();

    loop {
        line.clear();

        print!("> ");
        let _ = io::stdout().flush();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                break;
            }
            Ok(_) => {
                // Already reported by the VM.
                let _ = vm.interpret(&line);
            }
        }
    }
}

fn run_file(config: Config, filename: &str) {
    let source = match fs::read_to_string(filename) {
        Ok(s) => s,
        Err(_) => {
            eprintln!("Could not read file: {filename}");
            std::process::exit(ex::IOERR);
        }
    };
    let mut vm = VM::new(config);

    use InterpretationError::*;
    let status = match vm.interpret(&source) {
        Ok(_) => 0,
        Err(CompileError) => ex::DATAERR,
        Err(RuntimeError) => ex::SOFTWARE,
    };

    std::process::exit(status)
}
