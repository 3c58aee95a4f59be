//! Command-line interface for dev_launch

use crate::config::LaunchConfig;
use crate::runtime::reaper::PortRange;
use argh::FromArgs;
use std::path::PathBuf;

/// Start a local dev server, wait for it to come up and open it in a browser
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// project directory to run in (default: current directory)
    #[argh(option, short = 'C')]
    pub project_root: Option<PathBuf>,

    /// config file (default: dev_launch.yaml in the project root, if present)
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// start the local emulator first and point the dev server at it
    #[argh(switch, short = 'e')]
    pub emulator: bool,

    /// dev server port used for reaping and fallback URLs
    #[argh(option, short = 'p')]
    pub port: Option<u16>,

    /// host used for fallback URLs
    #[argh(option)]
    pub host: Option<String>,

    /// ports to free before starting (format: N or A-B)
    #[argh(option, from_str_fn(parse_port_range))]
    pub reap: Option<PortRange>,

    /// extra environment for the dev server (format: KEY=VALUE)
    #[argh(option, from_str_fn(parse_env_var))]
    pub env: Vec<(String, String)>,

    /// do not open a browser
    #[argh(switch)]
    pub no_browser: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse "N" or "A-B"
fn parse_port_range(s: &str) -> Result<PortRange, String> {
    s.parse()
}

/// Parse "KEY=VALUE"
fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!(
            "Invalid environment variable '{}'. Expected 'KEY=VALUE'",
            s
        )),
    }
}

impl LaunchArgs {
    /// Apply command-line overrides on top of the loaded config
    pub fn apply_to(&self, config: &mut LaunchConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(range) = self.reap {
            config.reap_ports = Some(range);
        }
        config.env.extend(self.env.iter().cloned());
        if self.no_browser {
            config.open_browser = false;
        }
    }

    /// Normalized level filter for env_logger
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> LaunchArgs {
        LaunchArgs::from_args(&["dev_launch"], argv).unwrap()
    }

    #[test]
    fn test_parse_env_var() {
        assert_eq!(
            parse_env_var("VITE_API=http://localhost:8080"),
            Ok(("VITE_API".to_string(), "http://localhost:8080".to_string()))
        );
        assert_eq!(parse_env_var("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
        assert!(parse_env_var("novalue").is_err());
        assert!(parse_env_var("=value").is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("5173"), Ok(PortRange::single(5173)));
        assert_eq!(parse_port_range("5173-5175"), Ok(PortRange::new(5173, 5175)));
        assert!(parse_port_range("http").is_err());
    }

    #[test]
    fn test_defaults_leave_config_untouched() {
        let mut config = LaunchConfig::default();
        let parsed = args(&[]);
        parsed.apply_to(&mut config);

        assert!(!parsed.emulator);
        assert_eq!(parsed.log_filter(), "info");
        assert_eq!(config.port, 5173);
        assert!(config.open_browser);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = LaunchConfig::default();
        let parsed = args(&[
            "--port",
            "3000",
            "--reap",
            "3000-3001",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--no-browser",
            "--emulator",
            "-l",
            "DEBUG",
        ]);
        parsed.apply_to(&mut config);

        assert!(parsed.emulator);
        assert_eq!(parsed.log_filter(), "debug");
        assert_eq!(config.port, 3000);
        assert_eq!(config.reap_range(), PortRange::new(3000, 3001));
        assert_eq!(config.env.get("B").map(String::as_str), Some("2"));
        assert!(!config.open_browser);
    }

    #[test]
    fn test_bad_reap_is_rejected() {
        assert!(LaunchArgs::from_args(&["dev_launch"], &["--reap", "9-1"]).is_err());
    }
}
