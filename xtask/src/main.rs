use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the kfree_skb probe for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything: the probe first, then the userspace loader.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run dropsnoop with sudo against the fresh probe.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to dropsnoop (e.g. --netns-path /var/run/netns/blue).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run(release, &args)
        }
    }
}

fn status(mut cmd: Command, what: &str) -> anyhow::Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {what}"))?;
    anyhow::ensure!(status.success(), "{what} failed");
    Ok(())
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../dropsnoop-ebpf"));
    cmd.args(["+nightly", "build", "--target", EBPF_TARGET, "-Z", "build-std=core"]);
    if release {
        cmd.arg("--release");
    }
    status(cmd, "eBPF build")
}

fn build_userspace(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--workspace"]);
    if release {
        cmd.arg("--release");
    }
    status(cmd, "workspace build")
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = profile(release);
    let object = format!("dropsnoop-ebpf/target/{EBPF_TARGET}/{profile}/dropsnoop");

    let mut cmd = Command::new("sudo");
    cmd.arg(format!("target/{profile}/dropsnoop"));
    cmd.args(["--object", &object]);
    cmd.args(extra_args);
    status(cmd, "dropsnoop")
}
