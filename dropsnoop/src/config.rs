use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::netns;

const DEFAULT_KALLSYMS: &str = "/proc/kallsyms";
const DEFAULT_BTF: &str = "/sys/kernel/btf/vmlinux";
const DEFAULT_OBJECT: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../dropsnoop-ebpf/target/bpfel-unknown-none/debug/dropsnoop"
);
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

/// How each drop is printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One line per frame, `=======` between drops.
    #[default]
    Text,
    /// One JSON object per drop.
    Json,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Only report drops in this network namespace id (0 = all).
    #[serde(default)]
    pub netns: Option<u32>,

    /// Only report drops in the namespace behind this path
    /// (e.g. /var/run/netns/blue or /proc/<pid>/ns/net). Wins over `netns`.
    #[serde(default)]
    pub netns_path: Option<PathBuf>,

    /// Symbol table used to name stack frames.
    #[serde(default = "default_kallsyms")]
    pub kallsyms: PathBuf,

    /// Kernel BTF used to decide whether namespaces can be read from the skb.
    #[serde(default = "default_btf")]
    pub btf: PathBuf,

    /// Compiled eBPF object.
    #[serde(default = "default_object")]
    pub object: PathBuf,

    #[serde(default)]
    pub format: OutputFormat,

    /// Sleep between ring buffer polls when it is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_kallsyms() -> PathBuf {
    PathBuf::from(DEFAULT_KALLSYMS)
}

fn default_btf() -> PathBuf {
    PathBuf::from(DEFAULT_BTF)
}

fn default_object() -> PathBuf {
    PathBuf::from(DEFAULT_OBJECT)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            netns: None,
            netns_path: None,
            kallsyms: default_kallsyms(),
            btf: default_btf(),
            object: default_object(),
            format: OutputFormat::default(),
            poll_interval_ms: default_poll_interval_ms(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.netns.is_some() {
            self.netns = cli.netns;
        }
        if cli.netns_path.is_some() {
            self.netns_path = cli.netns_path.clone();
        }
        if cli.kallsyms.as_os_str() != DEFAULT_KALLSYMS {
            self.kallsyms = cli.kallsyms.clone();
        }
        if cli.btf.as_os_str() != DEFAULT_BTF {
            self.btf = cli.btf.clone();
        }
        if let Some(ref object) = cli.object {
            self.object = object.clone();
        }
        if cli.format != OutputFormat::Text {
            self.format = cli.format;
        }
        if cli.poll_interval_ms != DEFAULT_POLL_INTERVAL_MS {
            self.poll_interval_ms = cli.poll_interval_ms;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }

    /// Namespace id written to the filter slot; 0 disables filtering.
    pub fn filter_namespace(&self) -> anyhow::Result<u32> {
        if let Some(ref path) = self.netns_path {
            return netns::namespace_inode(path);
        }
        Ok(self.netns.unwrap_or(0))
    }
}

use clap::Parser;

/// dropsnoop: report where the kernel drops packets
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network namespace id whose drops to report (0 = all).
    #[arg(short, long)]
    pub netns: Option<u32>,

    /// Path to a network namespace (/var/run/netns/<name>, /proc/<pid>/ns/net).
    #[arg(long)]
    pub netns_path: Option<PathBuf>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Kernel symbol table.
    #[arg(long, default_value = DEFAULT_KALLSYMS)]
    pub kallsyms: PathBuf,

    /// Kernel BTF blob.
    #[arg(long, default_value = DEFAULT_BTF)]
    pub btf: PathBuf,

    /// Compiled eBPF object (defaults to the xtask debug build).
    #[arg(long)]
    pub object: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Milliseconds to sleep when the ring buffer is empty.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_defaults() {
        let config: Config = serde_yaml::from_str("netns: 4026532281\n").unwrap();
        assert_eq!(config.netns, Some(4026532281));
        assert_eq!(config.kallsyms, PathBuf::from(DEFAULT_KALLSYMS));
        assert_eq!(config.format, OutputFormat::Text);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "format: json\nquiet: true\nkallsyms: /tmp/ksyms").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.quiet);
        assert_eq!(config.kallsyms, PathBuf::from("/tmp/ksyms"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config: Config = serde_yaml::from_str("netns: 5\nformat: json\n").unwrap();
        let cli = CliArgs::parse_from(["dropsnoop", "--netns", "7", "--poll-interval-ms", "20"]);
        config.merge_cli(&cli);
        assert_eq!(config.netns, Some(7));
        assert_eq!(config.poll_interval_ms, 20);
        // Not given on the command line, so the file value survives.
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_filter_namespace() {
        assert_eq!(Config::default().filter_namespace().unwrap(), 0);

        let config = Config {
            netns: Some(5),
            ..Config::default()
        };
        assert_eq!(config.filter_namespace().unwrap(), 5);

        let config = Config {
            netns: Some(5),
            netns_path: Some(PathBuf::from("/nonexistent/netns")),
            ..Config::default()
        };
        assert!(config.filter_namespace().is_err());
    }
}
