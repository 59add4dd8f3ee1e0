// A script is a JSON array of steps such as {"op": "mmap", "length": 4096, "prot": 3,
// "flags": 34}. An address or descriptor argument may be {"result": N} to reuse what step N
// returned.

use std::path::Path;

use anyhow::Context as AnyhowContext;
use mem::Addr;
use serde::{Deserialize, Serialize};
use utils::SysError;

use crate::{context, posix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Value(i64),
    Result { result: usize },
}

impl Default for Operand {
    fn default() -> Self {
        Operand::Value(0)
    }
}

fn no_fd() -> Operand {
    Operand::Value(-1)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Open {
        #[serde(default)]
        name: String,
        contents: String,
    },
    Mmap {
        #[serde(default)]
        start: Operand,
        length: u64,
        prot: i32,
        flags: i32,
        #[serde(default = "no_fd")]
        fd: Operand,
        #[serde(default)]
        page_offset: u64,
    },
    Munmap {
        start: Operand,
        length: u64,
    },
    Mremap {
        old_addr: Operand,
        old_size: u64,
        new_size: u64,
        #[serde(default)]
        flags: i32,
    },
    Mprotect {
        addr: Operand,
        size: u64,
        prot: i32,
    },
    Msync {
        addr: Operand,
        size: u64,
        #[serde(default)]
        flags: i32,
    },
    Madvise {
        addr: Operand,
        size: u64,
        #[serde(default)]
        advice: i32,
    },
    // store `data` through the mapping at `addr`
    Write {
        addr: Operand,
        data: String,
    },
    // load `length` bytes through the mapping at `addr`
    Read {
        addr: Operand,
        length: usize,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Open { .. } => "open",
            Op::Mmap { .. } => "mmap",
            Op::Munmap { .. } => "munmap",
            Op::Mremap { .. } => "mremap",
            Op::Mprotect { .. } => "mprotect",
            Op::Msync { .. } => "msync",
            Op::Madvise { .. } => "madvise",
            Op::Write { .. } => "write",
            Op::Read { .. } => "read",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub step: usize,
    pub op: &'static str,
    pub status: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

pub fn load_script<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Op>> {
    let path = path.as_ref();
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open script {:?}", path))?;
    let ops = serde_json::from_reader(&file)
        .with_context(|| format!("failed to parse script {:?}", path))?;
    Ok(ops)
}

// resolve looks up the value an operand stands for. Referring to a later or failed step is
// an invalid argument.
fn resolve(operand: Operand, done: &[Outcome]) -> posix::Result {
    let value = match operand {
        Operand::Value(v) => v,
        Operand::Result { result } => match done.get(result) {
            Some(outcome) if outcome.status >= 0 => outcome.status,
            _ => return Err(SysError::new(libc::EINVAL)),
        },
    };
    Ok(value as usize)
}

fn perform(op: &Op, done: &[Outcome]) -> (posix::Result, Option<String>) {
    let ctx = context::context();
    let res = match op {
        Op::Open { name, contents } => ctx
            .open_bytes(name, contents.as_bytes())
            .map(|fd| fd as usize),
        Op::Mmap {
            start,
            length,
            prot,
            flags,
            fd,
            page_offset,
        } => resolve(*start, done).and_then(|start| {
            let fd = resolve(*fd, done)? as i32;
            posix::mmap2(start, *length as usize, *prot, *flags, fd, *page_offset)
        }),
        Op::Munmap { start, length } => {
            resolve(*start, done).and_then(|start| posix::munmap(start, *length as usize))
        }
        Op::Mremap {
            old_addr,
            old_size,
            new_size,
            flags,
        } => resolve(*old_addr, done).and_then(|addr| {
            posix::mremap(addr, *old_size as usize, *new_size as usize, *flags)
        }),
        Op::Mprotect { addr, size, prot } => {
            resolve(*addr, done).and_then(|addr| posix::mprotect(addr, *size as usize, *prot))
        }
        Op::Msync { addr, size, flags } => {
            resolve(*addr, done).and_then(|addr| posix::msync(addr, *size as usize, *flags))
        }
        Op::Madvise { addr, size, advice } => {
            resolve(*addr, done).and_then(|addr| posix::madvise(addr, *size as usize, *advice))
        }
        Op::Write { addr, data } => resolve(*addr, done).and_then(|addr| {
            ctx.region_manager()
                .write(Addr(addr as u64), data.as_bytes())
        }),
        Op::Read { addr, length } => {
            let mut buf = vec![0; *length];
            let res = resolve(*addr, done)
                .and_then(|addr| ctx.region_manager().read(Addr(addr as u64), &mut buf));
            let data = res
                .as_ref()
                .ok()
                .map(|_| String::from_utf8_lossy(&buf).into_owned());
            return (res, data);
        }
    };
    (res, None)
}

// run_script performs every step in order against the process-wide context. A failing step
// does not stop the script.
pub fn run_script(ops: &[Op]) -> Vec<Outcome> {
    let mut done: Vec<Outcome> = Vec::with_capacity(ops.len());
    for (step, op) in ops.iter().enumerate() {
        let (res, data) = perform(op, &done);
        if let Err(e) = &res {
            logger::info!("step {} ({}) failed: {}", step, op.name(), e);
        }
        done.push(Outcome {
            step,
            op: op.name(),
            status: posix::status(&res),
            data,
        });
    }
    done
}
