//! `sandbox-helper`: flag-driven jail launcher.
//!
//! The guest daemon prepends this binary to sandboxed spawns. It translates
//! its flags into a bubblewrap invocation, exports the compiled seccomp
//! program on a memfd for `bwrap --seccomp`, and execs `bwrap`. bwrap sets
//! `NO_NEW_PRIVS` and installs the filter after building the jail, so the
//! filter's mount/pivot denials cannot break jail construction itself.
//!
//! Exit codes: never returns on success, 1 on argument or setup errors,
//! 127 when the exec itself fails.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, exit};

use clap::Parser;

use vmbox_sandbox::seccomp::{build_program, program_bytes};
use vmbox_sandbox::{BindMount, Profile, SandboxSpec};

#[derive(Debug, Parser)]
#[command(
    name = "sandbox-helper",
    about = "Run a command inside a namespace jail with a seccomp filter",
    disable_version_flag = true
)]
struct Args {
    /// Uid the command runs as inside the jail.
    #[arg(long)]
    uid: Option<u32>,

    /// Gid the command runs as inside the jail.
    #[arg(long)]
    gid: Option<u32>,

    /// Unshare the network namespace.
    #[arg(long)]
    no_network: bool,

    /// Keep the host network (overridden by --no-network).
    #[arg(long)]
    network: bool,

    /// Seccomp profile: default, nodejs, python, or minimal.
    #[arg(long, default_value = "default")]
    seccomp: String,

    /// Extra read-only bind, SRC[:DEST]. Repeatable.
    #[arg(long = "ro-bind", value_name = "SRC[:DEST]")]
    ro_bind: Vec<String>,

    /// Extra read-write bind, SRC[:DEST]. Repeatable.
    #[arg(long = "bind", value_name = "SRC[:DEST]")]
    bind: Vec<String>,

    /// Extra tmpfs overlay path. Repeatable.
    #[arg(long, value_name = "PATH")]
    tmpfs: Vec<String>,

    /// Working directory inside the jail.
    #[arg(long, value_name = "PATH")]
    cwd: Option<String>,

    /// Command and arguments, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap renders --help itself; anything else is an argument error.
            if err.use_stderr() {
                eprintln!("{err}");
                exit(1);
            }
            err.exit();
        }
    };

    let err = run(args);
    // run() only comes back when exec failed or setup broke.
    eprintln!("sandbox-helper: {err}");
    exit(err.exit_code);
}

struct HelperError {
    exit_code: i32,
    message: String,
}

impl std::fmt::Display for HelperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn arg_error(message: String) -> HelperError {
    HelperError {
        exit_code: 1,
        message,
    }
}

fn run(args: Args) -> HelperError {
    let profile: Profile = match args.seccomp.parse() {
        Ok(profile) => profile,
        Err(err) => return arg_error(err.to_string()),
    };

    let mut spec = SandboxSpec {
        uid: args.uid,
        gid: args.gid,
        network: args.network && !args.no_network,
        cwd: args.cwd,
        profile,
        ..SandboxSpec::default()
    };
    for raw in &args.ro_bind {
        match BindMount::parse(raw) {
            Ok(bind) => spec.ro_binds.push(bind),
            Err(err) => return arg_error(err.to_string()),
        }
    }
    for raw in &args.bind {
        match BindMount::parse(raw) {
            Ok(bind) => spec.rw_binds.push(bind),
            Err(err) => return arg_error(err.to_string()),
        }
    }
    spec.tmpfs = args.tmpfs;

    let filter = match export_filter(spec.profile) {
        Ok(file) => file,
        Err(err) => {
            return arg_error(format!("seccomp setup failed: {err}"));
        }
    };

    let mut bwrap = Command::new("bwrap");
    bwrap
        .args(spec.bwrap_args(Some(filter.as_raw_fd())))
        .arg("--")
        .args(&args.command);

    // Only reached if the execve itself fails.
    let err = bwrap.exec();
    HelperError {
        exit_code: 127,
        message: format!("exec bwrap: {err}"),
    }
}

/// Writes the compiled BPF program to an anonymous memfd and rewinds it so
/// bwrap can read the image. The fd is created without CLOEXEC on purpose:
/// it must survive into the bwrap process.
fn export_filter(profile: Profile) -> std::io::Result<File> {
    let bytes = program_bytes(&build_program(profile));

    // SAFETY: memfd_create with a valid NUL-terminated name returns either
    // a fresh fd we then own, or -1 checked below.
    let fd = unsafe { libc::memfd_create(c"seccomp-bpf".as_ptr(), 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by memfd_create and is owned by nobody else.
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(&bytes)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
