//! Runtime configuration for the [VM](crate::vm::VM).
//!
//! Every diagnostic switch defaults to the matching Cargo feature, so a build with
//! `--features trace_execution` traces without any code changes. The command line can switch
//! them on for a single run.

use crate::gc::GcConfig;

/// How deep calls may nest before `Stack overflow.`
pub const DEFAULT_MAX_FRAMES: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum depth of the call-frame stack.
    pub max_frames: usize,
    /// Print the value stack and each instruction before it runs.
    pub trace_execution: bool,
    /// Disassemble every function as soon as it has been compiled.
    pub print_code: bool,
    pub gc: GcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frames: DEFAULT_MAX_FRAMES,
            trace_execution: cfg!(feature = "trace_execution"),
            print_code: cfg!(feature = "print_code"),
            gc: GcConfig::default(),
        }
    }
}

impl Config {
    /// Applies one command-line switch. Returns `false` if the switch is not recognized.
    ///
    /// ```
    /// # use joker::config::Config;
    /// let mut config = Config::default();
    /// assert!(config.apply_flag("--stress-gc"));
    /// assert!(config.gc.stress);
    /// assert!(!config.apply_flag("--frobnicate"));
    /// ```
    pub fn apply_flag(&mut self, flag: &str) -> bool {
        match flag {
            "--trace" => self.trace_execution = true,
            "--print-code" => self.print_code = true,
            "--stress-gc" => self.gc.stress = true,
            "--log-gc" => self.gc.log = true,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(64, config.max_frames);
        assert_eq!(1024 * 1024, config.gc.initial_threshold);
        assert_eq!(2.0, config.gc.growth_factor);
    }

    #[test]
    fn flags_switch_options_on() {
        let mut config = Config::default();
        assert!(config.apply_flag("--trace"));
        assert!(config.apply_flag("--print-code"));
        assert!(config.apply_flag("--log-gc"));
        assert!(config.trace_execution);
        assert!(config.print_code);
        assert!(config.gc.log);
    }
}
