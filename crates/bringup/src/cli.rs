//! Command-line interface for bringup

use argh::FromArgs;
use std::collections::{HashMap, HashSet};

use crate::config::SettingsOverrides;
use crate::runtime::NodeSelection;

/// Bring up interdependent services in dependency order
#[derive(FromArgs, Debug)]
pub struct BringupArgs {
    /// path to the launch file (default: bringup.yaml)
    #[argh(positional, default = "String::from(\"bringup.yaml\")")]
    pub launch_file: String,

    /// override launch arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// explicitly enable these nodes (comma-separated)
    #[argh(option, from_str_fn(parse_nodes))]
    pub enable: Option<Vec<String>>,

    /// explicitly disable these nodes (comma-separated)
    #[argh(option, from_str_fn(parse_nodes))]
    pub disable: Option<Vec<String>>,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate launch file and exit
    #[argh(switch)]
    pub validate: bool,

    /// write the run report as JSON to this path
    #[argh(option)]
    pub report: Option<String>,

    /// whole-run deadline in seconds
    #[argh(option)]
    pub global_timeout: Option<u64>,

    /// seconds between SIGTERM and SIGKILL during teardown
    #[argh(option)]
    pub grace_period: Option<u64>,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, ":=").collect();
    if parts.len() != 2 {
        return Err(format!(
            "Invalid argument format '{}'. Expected 'key:=value'",
            s
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Parse comma-separated node list
fn parse_nodes(s: &str) -> Result<Vec<String>, String> {
    Ok(s.split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

impl BringupArgs {
    /// Convert argument overrides to a HashMap
    pub fn arg_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }

    pub fn node_selection(&self) -> NodeSelection {
        let to_set = |nodes: &Option<Vec<String>>| -> HashSet<String> {
            nodes.iter().flatten().cloned().collect()
        };
        NodeSelection {
            enable: to_set(&self.enable),
            disable: to_set(&self.disable),
        }
    }

    pub fn settings_overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            global_timeout_secs: self.global_timeout,
            grace_period_secs: self.grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_override() {
        let result = parse_arg_override("chain:=mainnet");
        assert_eq!(result, Ok(("chain".to_string(), "mainnet".to_string())));
    }

    #[test]
    fn test_parse_arg_override_with_equals() {
        let result = parse_arg_override("rpc:=http://localhost:2345");
        assert_eq!(result, Ok(("rpc".to_string(), "http://localhost:2345".to_string())));
    }

    #[test]
    fn test_parse_arg_override_invalid() {
        let result = parse_arg_override("invalid");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_nodes() {
        let result = parse_nodes("forest, f3,");
        assert_eq!(result, Ok(vec!["forest".to_string(), "f3".to_string()]));
    }

    #[test]
    fn test_from_args() {
        let args = BringupArgs::from_args(
            &["bringup"],
            &[
                "up.yaml",
                "-a",
                "chain:=mainnet",
                "--disable",
                "f3",
                "--global-timeout",
                "120",
            ],
        )
        .unwrap();

        assert_eq!(args.launch_file, "up.yaml");
        assert_eq!(args.arg_overrides()["chain"], "mainnet");
        assert!(args.node_selection().disable.contains("f3"));
        assert!(args.node_selection().enable.is_empty());
        assert_eq!(args.settings_overrides().global_timeout_secs, Some(120));
        assert_eq!(args.settings_overrides().grace_period_secs, None);
    }
}
