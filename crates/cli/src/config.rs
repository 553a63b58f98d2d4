//! Startup configuration read once from the environment, the way the
//! compiler's `config.rs` centralizes externally supplied settings into one
//! struct instead of scattering `env::var` calls through the binary.
//!
//! There is no config file (the interpreter persists nothing to disk); the
//! only externally configurable knobs are these environment variables and
//! the `clap`-parsed CLI flags handled separately in `main`.

/// Profiling is a boundary concern, not part of the core interpreter: these
/// fields are parsed and logged at startup but nothing downstream samples or
/// writes a pprof file. An embedder that wants real profiling wraps the CLI.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pprof_enabled: bool,
    pub pprof_cpu: bool,
    pub pprof_mem: bool,
    pub pprof_cpu_name: Option<String>,
    pub pprof_mem_name: Option<String>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            pprof_enabled: env_flag("GLOX_PPROF"),
            pprof_cpu: env_flag("GLOX_PPROF_CPU"),
            pprof_mem: env_flag("GLOX_PPROF_MEM"),
            pprof_cpu_name: std::env::var("GLOX_PPROF_CPU_NAME").ok(),
            pprof_mem_name: std::env::var("GLOX_PPROF_MEM_NAME").ok(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => v != "0" && !v.is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_off() {
        let config = Config::default();
        assert!(!config.pprof_enabled);
        assert!(config.pprof_cpu_name.is_none());
    }

    #[test]
    fn env_flag_treats_zero_and_empty_as_unset() {
        // SAFETY: test runs single-threaded within this process's test harness;
        // no other test reads GLOX_PPROF_TEST_FLAG.
        unsafe {
            std::env::set_var("GLOX_PPROF_TEST_FLAG", "0");
        }
        assert!(!env_flag("GLOX_PPROF_TEST_FLAG"));
        unsafe {
            std::env::set_var("GLOX_PPROF_TEST_FLAG", "1");
        }
        assert!(env_flag("GLOX_PPROF_TEST_FLAG"));
        unsafe {
            std::env::remove_var("GLOX_PPROF_TEST_FLAG");
        }
    }
}
