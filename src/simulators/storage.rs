/// Storage views: `df`, `mount` and the Lustre client `lfs`.
///
/// Every node sees the same layout: a local OS disk, the NVMe RAID scratch
/// array, the shared Lustre filesystem over the storage fabric and NFS home
/// directories. Usage figures are fixed per node so repeated runs agree.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::parser::ParsedCommand;

use super::{current_node, node_index, render_table, CommandOutput, Simulator};

const LUSTRE_MGS: &str = "10.150.0.10@o2ib";
const LUSTRE_OSTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVerb {
    Df,
    Mount,
    Lfs,
}

struct Filesystem {
    source: String,
    fstype: &'static str,
    size_kib: u64,
    used_kib: u64,
    mount: &'static str,
    options: &'static str,
}

const TIB: u64 = 1 << 30;
const GIB: u64 = 1 << 20;

fn filesystems(node: &DgxNode) -> Result<Vec<Filesystem>> {
    let n = node_index(node)? as u64;
    Ok(vec![
        Filesystem {
            source: "/dev/nvme0n1p2".to_string(),
            fstype: "ext4",
            size_kib: 1_843 * GIB,
            used_kib: 212 * GIB + n * 3 * GIB,
            mount: "/",
            options: "rw,relatime,errors=remount-ro",
        },
        Filesystem {
            source: "/dev/nvme0n1p1".to_string(),
            fstype: "vfat",
            size_kib: 511 * 1024,
            used_kib: 6 * 1024,
            mount: "/boot/efi",
            options: "rw,relatime,fmask=0077,dmask=0077",
        },
        Filesystem {
            source: "/dev/md0".to_string(),
            fstype: "ext4",
            size_kib: 28 * TIB,
            used_kib: 4 * TIB + n * 97 * GIB,
            mount: "/raid",
            options: "rw,relatime,stripe=256",
        },
        Filesystem {
            source: format!("{}:/lustre", LUSTRE_MGS),
            fstype: "lustre",
            size_kib: LUSTRE_OSTS as u64 * 512 * TIB,
            used_kib: lustre_used_kib(),
            mount: "/lustre",
            options: "rw,flock,lazystatfs,encrypt",
        },
        Filesystem {
            source: "10.150.0.20:/export/home".to_string(),
            fstype: "nfs4",
            size_kib: 64 * TIB,
            used_kib: 19 * TIB,
            mount: "/home",
            options: "rw,relatime,vers=4.2,rsize=1048576,wsize=1048576,hard,proto=tcp",
        },
    ])
}

fn ost_used_kib(ost: u32) -> u64 {
    301 * TIB + ost as u64 * 11 * TIB
}

fn lustre_used_kib() -> u64 {
    (0..LUSTRE_OSTS).map(ost_used_kib).sum()
}

/// `df -h` rendering: 1024-based, one decimal below 10, rounded up.
fn human(kib: u64) -> String {
    const UNITS: [&str; 5] = ["K", "M", "G", "T", "P"];
    let mut value = kib as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{:.1}{}", (value * 10.0).ceil() / 10.0, UNITS[unit])
    } else {
        format!("{}{}", value.ceil() as u64, UNITS[unit])
    }
}

fn use_pct(used: u64, size: u64) -> u64 {
    if size == 0 { 0 } else { (used * 100).div_ceil(size) }
}

#[derive(Debug, Default)]
pub struct Storage;

impl Simulator for Storage {
    type Verb = StorageVerb;

    fn name(&self) -> &'static str {
        "storage"
    }

    fn execute(&mut self, verb: StorageVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match verb {
            StorageVerb::Df => Ok(CommandOutput::ok(df(cmd, node)?)),
            StorageVerb::Mount => {
                let out: String = filesystems(node)?
                    .iter()
                    .map(|fs| format!("{} on {} type {} ({})\n", fs.source, fs.mount, fs.fstype, fs.options))
                    .collect();
                Ok(CommandOutput::ok(out))
            }
            StorageVerb::Lfs => lfs(cmd, node),
        }
    }
}

fn df(cmd: &ParsedCommand, node: &DgxNode) -> Result<String> {
    let human_sizes = cmd.has_any(&["h", "human-readable"]);
    let show_type = cmd.has_flag("T");
    let wanted: Vec<&str> = cmd.operands();
    let mut rows = Vec::new();
    for fs in filesystems(node)? {
        if !wanted.is_empty() && !wanted.iter().any(|w| w.starts_with(fs.mount) && (fs.mount != "/" || *w == "/")) {
            continue;
        }
        let avail = fs.size_kib - fs.used_kib;
        let (size, used, avail) = if human_sizes {
            (human(fs.size_kib), human(fs.used_kib), human(avail))
        } else {
            (fs.size_kib.to_string(), fs.used_kib.to_string(), avail.to_string())
        };
        let mut row = vec![fs.source.clone()];
        if show_type {
            row.push(fs.fstype.to_string());
        }
        row.extend([size, used, avail, format!("{}%", use_pct(fs.used_kib, fs.size_kib)), fs.mount.to_string()]);
        rows.push(row);
    }
    let mut headers = vec!["Filesystem"];
    if show_type {
        headers.push("Type");
    }
    headers.extend([if human_sizes { "Size" } else { "1K-blocks" }, "Used", "Avail", "Use%", "Mounted on"]);
    Ok(render_table(&headers, &rows, 1))
}

fn lfs(cmd: &ParsedCommand, node: &DgxNode) -> Result<CommandOutput> {
    match cmd.operands().as_slice() {
        ["df", rest @ ..] if rest.iter().all(|p| p.starts_with("/lustre")) => {
            Ok(CommandOutput::ok(lfs_df(cmd.has_flag("h"))))
        }
        ["df", other, ..] => Err(SimError::NotFound(format!(
            "lfs df: {} is not a Lustre filesystem",
            other
        ))),
        ["check", "servers"] | ["check", "all"] => {
            let tag = node_index(node)? * 0x11;
            let mut out = format!("lustre-MDT0000-mdc-ffff9a{:04x}e8000: active\n", tag);
            for ost in 0..LUSTRE_OSTS {
                out.push_str(&format!(
                    "lustre-OST{:04x}-osc-ffff9a{:04x}e8000: active\n",
                    ost,
                    tag
                ));
            }
            out.push_str("MGC10.150.0.10@o2ib: active\n");
            Ok(CommandOutput::ok(out))
        }
        ["check", other] => Err(SimError::Usage(format!(
            "lfs check: invalid check type '{}', use 'mds', 'osts', 'mgts', 'servers' or 'all'",
            other
        ))),
        ["getstripe", path] if path.starts_with("/lustre") => Ok(CommandOutput::ok(format!(
            "{}\nlmm_stripe_count:  1\nlmm_stripe_size:   1048576\nlmm_pattern:       raid0\nlmm_layout_gen:    0\nlmm_stripe_offset: 0\n",
            path
        ))),
        ["version"] => Ok(CommandOutput::ok("lfs 2.15.4\n")),
        _ => Err(SimError::Usage(
            "usage: lfs df [-h] [path] | lfs check servers | lfs getstripe <path>".to_string(),
        )),
    }
}

fn lfs_df(human_sizes: bool) -> String {
    let mdt_size = 8 * TIB;
    let mdt_used = 412 * GIB;
    let fmt = |kib: u64| if human_sizes { human(kib) } else { kib.to_string() };
    let mut rows = vec![vec![
        "lustre-MDT0000_UUID".to_string(),
        fmt(mdt_size),
        fmt(mdt_used),
        fmt(mdt_size - mdt_used),
        format!("{}%", use_pct(mdt_used, mdt_size)),
        "/lustre[MDT:0]".to_string(),
    ]];
    for ost in 0..LUSTRE_OSTS {
        let used = ost_used_kib(ost);
        let size = 512 * TIB;
        rows.push(vec![
            format!("lustre-OST{:04x}_UUID", ost),
            fmt(size),
            fmt(used),
            fmt(size - used),
            format!("{}%", use_pct(used, size)),
            format!("/lustre[OST:{}]", ost),
        ]);
    }
    let size = LUSTRE_OSTS as u64 * 512 * TIB;
    let used = lustre_used_kib();
    let headers = ["UUID", if human_sizes { "bytes" } else { "1K-blocks" }, "Used", "Available", "Use%", "Mounted on"];
    let mut out = render_table(&headers, &rows, 2);
    out.push('\n');
    out.push_str(&format!(
        "filesystem_summary:  {}  {}  {}  {}% /lustre\n",
        fmt(size),
        fmt(used),
        fmt(size - used),
        use_pct(used, size)
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::store::ClusterStore;

    fn run(verb: StorageVerb, line: &str) -> Result<CommandOutput> {
        let store = ClusterStore::superpod("t");
        let ctx = CommandContext::new("dgx-02");
        Storage.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn human_sizes_follow_df_rounding() {
        assert_eq!(human(1_536), "1.5M");
        assert_eq!(human(28 * TIB), "28T");
        assert_eq!(human(2048 * TIB), "2.0P");
    }

    #[test]
    fn df_lists_raid_and_lustre() {
        let out = run(StorageVerb::Df, "df -h").unwrap().output;
        assert!(out.starts_with("Filesystem"));
        assert!(out.lines().any(|l| l.starts_with("/dev/md0") && l.ends_with("/raid")));
        assert!(out.contains("10.150.0.10@o2ib:/lustre"));
        let one = run(StorageVerb::Df, "df -h /raid").unwrap().output;
        assert_eq!(one.lines().count(), 2);
    }

    #[test]
    fn mount_shows_types() {
        let out = run(StorageVerb::Mount, "mount").unwrap().output;
        assert!(out.contains("on /lustre type lustre"));
        assert!(out.contains("on /home type nfs4"));
    }

    #[test]
    fn lfs_reports_targets() {
        let df = run(StorageVerb::Lfs, "lfs df -h").unwrap().output;
        assert_eq!(df.lines().filter(|l| l.contains("OST")).count(), 4);
        assert!(df.contains("filesystem_summary:"));
        let check = run(StorageVerb::Lfs, "lfs check servers").unwrap().output;
        assert_eq!(check.lines().filter(|l| l.ends_with(": active")).count(), 6);
        assert!(matches!(run(StorageVerb::Lfs, "lfs df /raid"), Err(SimError::NotFound(_))));
    }
}
