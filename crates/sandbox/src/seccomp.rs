//! Runtime seccomp-BPF program construction.
//!
//! Each profile compiles to a classic BPF program of the shape
//!
//! ```text
//! [0]        LD_ABS  seccomp_data.nr
//! [1..=n]    JEQ     syscall_k      ; branch toward a terminal on match
//! [n+1]      RET     ERRNO|EPERM
//! [n+2]      RET     ALLOW
//! ```
//!
//! Denylist profiles branch to the `EPERM` terminal on match and let
//! fall-through past the last check skip it to `ALLOW`; the allowlist
//! profile branches to `ALLOW` on match and falls through to `EPERM`.
//! Jump offsets are computed per instruction against the final program
//! length, so the last instruction executed is always one of the two
//! terminal returns.

use std::str::FromStr;

use crate::SandboxError;

// Classic BPF opcodes, as the kernel's filter.h spells them.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const EPERM: u32 = 1;

/// Offset of `nr` in `struct seccomp_data`.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

/// One BPF instruction, layout-compatible with the kernel's `sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const fn ld_nr() -> SockFilter {
    SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: SECCOMP_DATA_NR_OFFSET,
    }
}

const fn jeq(k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter {
        code: BPF_JMP | BPF_JEQ | BPF_K,
        jt,
        jf,
        k,
    }
}

const fn ret(k: u32) -> SockFilter {
    SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k,
    }
}

// ── Profiles ─────────────────────────────────────────────────────────────────

/// Filter profile selected per spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Denylist of kernel-control syscalls; everything else is allowed.
    #[default]
    Default,
    /// Same denylist as `Default`; the tag exists so callers can pin the
    /// runtime they target without caring that the filters coincide today.
    Nodejs,
    /// Same denylist as `Default`.
    Python,
    /// Tight allowlist for static, compute-only children.
    Minimal,
}

impl FromStr for Profile {
    type Err = SandboxError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "default" => Ok(Self::Default),
            "nodejs" => Ok(Self::Nodejs),
            "python" => Ok(Self::Python),
            "minimal" => Ok(Self::Minimal),
            other => Err(SandboxError::UnknownProfile(other.to_string())),
        }
    }
}

/// Syscalls the denylist profiles refuse with `EPERM`: tracing, mount
/// manipulation, module loading, kexec, accounting, and clock setting.
fn denied_syscalls() -> Vec<u32> {
    [
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_reboot,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_init_module,
        libc::SYS_delete_module,
        libc::SYS_finit_module,
        libc::SYS_kexec_load,
        libc::SYS_kexec_file_load,
        libc::SYS_acct,
        libc::SYS_settimeofday,
        libc::SYS_clock_settime,
        libc::SYS_clock_adjtime,
        libc::SYS_adjtimex,
    ]
    .iter()
    .map(|&nr| nr as u32)
    .collect()
}

/// The only syscalls the `minimal` profile permits.
fn minimal_allowed_syscalls() -> Vec<u32> {
    [
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_openat,
        libc::SYS_close,
        libc::SYS_fstat,
        libc::SYS_mmap,
        libc::SYS_mprotect,
        libc::SYS_munmap,
        libc::SYS_brk,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_rt_sigreturn,
        libc::SYS_futex,
    ]
    .iter()
    .map(|&nr| nr as u32)
    .collect()
}

/// Builds the BPF program for `profile`.
pub fn build_program(profile: Profile) -> Vec<SockFilter> {
    match profile {
        Profile::Default | Profile::Nodejs | Profile::Python => {
            denylist_program(&denied_syscalls())
        }
        Profile::Minimal => allowlist_program(&minimal_allowed_syscalls()),
    }
}

/// Denylist: match jumps to the `EPERM` terminal; fall-through past the last
/// check skips it and lands on `ALLOW`.
fn denylist_program(denied: &[u32]) -> Vec<SockFilter> {
    let n = denied.len();
    let mut prog = Vec::with_capacity(n + 3);
    prog.push(ld_nr());
    for (i, &nr) in denied.iter().enumerate() {
        // JEQ sits at index i + 1; the EPERM terminal at index n + 1.
        let to_eperm = (n - 1 - i) as u8;
        let jf = if i + 1 == n { 1 } else { 0 };
        prog.push(jeq(nr, to_eperm, jf));
    }
    prog.push(ret(SECCOMP_RET_ERRNO | (EPERM & 0xFFFF)));
    prog.push(ret(SECCOMP_RET_ALLOW));
    prog
}

/// Allowlist: match jumps over the `EPERM` terminal to `ALLOW`; fall-through
/// past the last check denies.
fn allowlist_program(allowed: &[u32]) -> Vec<SockFilter> {
    let n = allowed.len();
    let mut prog = Vec::with_capacity(n + 3);
    prog.push(ld_nr());
    for (i, &nr) in allowed.iter().enumerate() {
        // The ALLOW terminal is one instruction past EPERM, at index n + 2.
        let to_allow = (n - i) as u8;
        prog.push(jeq(nr, to_allow, 0));
    }
    prog.push(ret(SECCOMP_RET_ERRNO | (EPERM & 0xFFFF)));
    prog.push(ret(SECCOMP_RET_ALLOW));
    prog
}

/// Serializes the program into the raw `struct sock_filter[]` byte image
/// that `bwrap --seccomp FD` loads.
pub fn program_bytes(prog: &[SockFilter]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(prog.len() * 8);
    for ins in prog {
        bytes.extend_from_slice(&ins.code.to_ne_bytes());
        bytes.push(ins.jt);
        bytes.push(ins.jf);
        bytes.extend_from_slice(&ins.k.to_ne_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Evaluates a classic BPF program against a syscall number and returns
    /// the RET constant it terminates with.
    fn run(prog: &[SockFilter], nr: u32) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            assert!(pc < prog.len(), "pc ran off the program");
            let ins = &prog[pc];
            match ins.code {
                c if c == (BPF_LD | BPF_W | BPF_ABS) => {
                    assert_eq!(ins.k, 0, "only seccomp_data.nr loads expected");
                    acc = nr;
                    pc += 1;
                }
                c if c == (BPF_JMP | BPF_JEQ | BPF_K) => {
                    let off = if acc == ins.k { ins.jt } else { ins.jf };
                    pc += 1 + off as usize;
                }
                c if c == (BPF_RET | BPF_K) => return ins.k,
                other => panic!("unexpected opcode {other:#06x}"),
            }
        }
    }

    fn assert_terminals(prog: &[SockFilter]) {
        let n = prog.len();
        assert_eq!(prog[n - 2], ret(SECCOMP_RET_ERRNO | EPERM));
        assert_eq!(prog[n - 1], ret(SECCOMP_RET_ALLOW));
    }

    fn assert_jumps_in_bounds(prog: &[SockFilter]) {
        for (pc, ins) in prog.iter().enumerate() {
            if ins.code == (BPF_JMP | BPF_JEQ | BPF_K) {
                assert!(pc + 1 + (ins.jt as usize) < prog.len());
                assert!(pc + 1 + (ins.jf as usize) < prog.len());
            }
        }
    }

    #[test]
    fn default_profile_shape() {
        let prog = build_program(Profile::Default);
        assert_eq!(prog.len(), denied_syscalls().len() + 3);
        assert_terminals(&prog);
        assert_jumps_in_bounds(&prog);
    }

    #[test]
    fn minimal_profile_shape() {
        let prog = build_program(Profile::Minimal);
        assert_eq!(prog.len(), minimal_allowed_syscalls().len() + 3);
        assert_terminals(&prog);
        assert_jumps_in_bounds(&prog);
    }

    #[test]
    fn denylist_denies_listed_and_allows_rest() {
        let prog = build_program(Profile::Default);
        for nr in denied_syscalls() {
            assert_eq!(run(&prog, nr), SECCOMP_RET_ERRNO | EPERM, "nr {nr}");
        }
        for nr in [libc::SYS_read as u32, libc::SYS_write as u32, 9999] {
            assert_eq!(run(&prog, nr), SECCOMP_RET_ALLOW, "nr {nr}");
        }
    }

    #[test]
    fn allowlist_allows_listed_and_denies_rest() {
        let prog = build_program(Profile::Minimal);
        for nr in minimal_allowed_syscalls() {
            assert_eq!(run(&prog, nr), SECCOMP_RET_ALLOW, "nr {nr}");
        }
        for nr in [libc::SYS_ptrace as u32, libc::SYS_socket as u32, 9999] {
            assert_eq!(run(&prog, nr), SECCOMP_RET_ERRNO | EPERM, "nr {nr}");
        }
    }

    #[test]
    fn nodejs_and_python_match_default() {
        let default = build_program(Profile::Default);
        assert_eq!(build_program(Profile::Nodejs), default);
        assert_eq!(build_program(Profile::Python), default);
    }

    #[test]
    fn profile_tags_parse() {
        assert_eq!("default".parse::<Profile>().unwrap(), Profile::Default);
        assert_eq!("minimal".parse::<Profile>().unwrap(), Profile::Minimal);
        assert!("chrome".parse::<Profile>().is_err());
    }

    #[test]
    fn byte_image_is_eight_bytes_per_instruction() {
        let prog = build_program(Profile::Minimal);
        let bytes = program_bytes(&prog);
        assert_eq!(bytes.len(), prog.len() * 8);
        // First instruction is the nr load: code 0x20, jt 0, jf 0, k 0.
        assert_eq!(&bytes[..8], &[0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }
}
