/// Container runtimes: `docker`, `enroot` and `nvidia-container-cli`.
///
/// GPU access inside a container goes through the NVIDIA container toolkit,
/// which refuses to start when a visible GPU has fallen off the bus. Inside a
/// container `nvidia-smi` is the host simulator restricted to the visible
/// GPUs. Detached containers and enroot images are private bookkeeping,
/// keyed by node.
use crate::cluster::{Cluster, DgxNode};
use crate::context::CommandContext;
use crate::error::{Result, SimError};
use crate::gpu::Gpu;
use crate::parser::{parse, Flag, FlagStyle, ParsedCommand};

use super::nvidia_smi::NvidiaSmi;
use super::{current_node, node_index, parse_gpu_list, render_table, CommandOutput, Simulator};

const DOCKER_VERSION: &str = "24.0.7";
const TOOLKIT_VERSION: &str = "1.14.3";
const IMAGES: [(&str, &str, &str, &str); 3] = [
    ("nvcr.io/nvidia/pytorch", "24.01-py3", "8a2e1c4b7d90", "21.8GB"),
    ("nvcr.io/nvidia/cuda", "12.2.0-base-ubuntu22.04", "3c1f07d2e6a5", "243MB"),
    ("nvcr.io/nvidia/nemo", "24.01", "f4d9b2a61c3e", "34.2GB"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerVerb {
    Docker,
    Enroot,
    NvidiaContainerCli,
}

#[derive(Debug, Clone, PartialEq)]
struct DetachedContainer {
    node: String,
    id: String,
    image: String,
    command: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
struct EnrootContainer {
    node: String,
    name: String,
    image: String,
}

#[derive(Debug, Default)]
pub struct Containers {
    detached: Vec<DetachedContainer>,
    enroot_images: Vec<(String, String)>,
    enroot_containers: Vec<EnrootContainer>,
}

impl Simulator for Containers {
    type Verb = ContainerVerb;

    fn name(&self) -> &'static str {
        "containers"
    }

    fn execute(&mut self, verb: ContainerVerb, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster) -> Result<CommandOutput> {
        let node = current_node(ctx, cluster)?;
        match verb {
            ContainerVerb::Docker => self.docker(cmd, ctx, cluster, node),
            ContainerVerb::Enroot => self.enroot(cmd, ctx, cluster, node),
            ContainerVerb::NvidiaContainerCli => match cmd.subcommand.as_deref() {
                Some("info") => Ok(container_cli_info(cluster, node)),
                _ => Err(SimError::Usage("usage: nvidia-container-cli info".to_string())),
            },
        }
    }
}

/// The toolkit's device check: fails when any requested GPU is unreachable.
fn toolkit_check(gpus: &[&Gpu]) -> std::result::Result<(), String> {
    if gpus.iter().any(|g| g.xid_errors.iter().any(|x| x.code == 79)) {
        return Err("nvidia-container-cli: initialization error: nvml error: unknown error".to_string());
    }
    Ok(())
}

fn container_cli_info(cluster: &Cluster, node: &DgxNode) -> CommandOutput {
    let gpus: Vec<&Gpu> = node.gpus.iter().collect();
    if let Err(e) = toolkit_check(&gpus) {
        return CommandOutput::fail(format!("{}\n", e), 1);
    }
    let hw = &cluster.hardware;
    let mut out = format!(
        "CLI version:    {}\nNVRM version:   {}\nCUDA version:   {}\n",
        TOOLKIT_VERSION, hw.driver_version, hw.cuda_version
    );
    for g in gpus {
        out.push_str(&format!(
            "\nDevice Index:   {}\nDevice Minor:   {}\nModel:          {}\nBrand:          Nvidia\nGPU UUID:       {}\nBus Location:   {}\nArchitecture:   9.0\n",
            g.id, g.id, g.name, g.uuid, g.bus_id
        ));
    }
    CommandOutput::ok(out)
}

/// Resolve `--gpus all|N|device=a,b` to GPU ids.
fn requested_gpus(spec: &str, node: &DgxNode) -> Result<Vec<u32>> {
    let spec = spec.trim_matches('"');
    if spec == "all" {
        return Ok(node.gpus.iter().map(|g| g.id).collect());
    }
    if let Some(list) = spec.strip_prefix("device=") {
        return parse_gpu_list(list, node).map_err(|bad| {
            SimError::Usage(format!("docker: Error response from daemon: unknown device id: {}", bad))
        });
    }
    let n: usize = spec
        .parse()
        .map_err(|_| SimError::Usage(format!("invalid argument \"{}\" for \"--gpus\" flag", spec)))?;
    if n > node.gpus.len() {
        return Err(SimError::Usage(format!(
            "docker: Error response from daemon: could not select device driver \"\" with capabilities: [[gpu]] (requested {} GPUs)",
            n
        )));
    }
    Ok(node.gpus.iter().take(n).map(|g| g.id).collect())
}

/// Run `argv` inside a container that sees `visible` GPUs (`None`: no GPUs).
fn run_in_container(
    argv: &[String],
    visible: Option<&[u32]>,
    ctx: &CommandContext,
    cluster: &Cluster,
    node: &DgxNode,
) -> Result<CommandOutput> {
    let Some(program) = argv.first() else {
        return Ok(CommandOutput::ok(""));
    };
    match (program.as_str(), visible) {
        ("nvidia-smi", Some(ids)) => {
            let mut inner = parse(&argv.join(" "))?;
            if ids.len() != node.gpus.len() && !inner.has_any(&["i", "id"]) {
                let list: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                inner.flags.push(Flag { name: "i".to_string(), value: Some(list.join(",")), style: FlagStyle::Short });
            }
            NvidiaSmi.execute((), &inner, ctx, cluster)
        }
        ("nvcc", _) => Ok(CommandOutput::ok(format!(
            "nvcc: NVIDIA (R) Cuda compiler driver\nCuda compilation tools, release {}, V{}.140\n",
            cluster.hardware.cuda_version, cluster.hardware.cuda_version
        ))),
        ("echo", _) => Ok(CommandOutput::ok(format!("{}\n", argv[1..].join(" ")))),
        ("hostname", _) => Ok(CommandOutput::ok(format!("{:012x}\n", node_index(node)? as u64 * 0x1f3d + 0x6a0c_11b2_e400))),
        _ => Ok(CommandOutput::fail(
            format!(
                "docker: Error response from daemon: failed to create task for container: exec: \"{}\": executable file not found in $PATH: unknown.\n",
                program
            ),
            127,
        )),
    }
}

impl Containers {
    fn docker(&mut self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster, node: &DgxNode) -> Result<CommandOutput> {
        match cmd.subcommand.as_deref() {
            Some("ps") => Ok(CommandOutput::ok(self.docker_ps(node))),
            Some("images") => {
                let rows: Vec<Vec<String>> = IMAGES
                    .iter()
                    .map(|(repo, tag, id, size)| {
                        vec![repo.to_string(), tag.to_string(), id.to_string(), "3 weeks ago".to_string(), size.to_string()]
                    })
                    .collect();
                Ok(CommandOutput::ok(render_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"], &rows, 3)))
            }
            Some("info") => Ok(CommandOutput::ok(format!(
                "Client: Docker Engine - Community\n Version:    {}\n\nServer:\n Containers: {}\n Images: {}\n Server Version: {}\n Storage Driver: overlay2\n Runtimes: io.containerd.runc.v2 nvidia runc\n Default Runtime: nvidia\n Kernel Version: {}\n Operating System: {}\n CPUs: {}\n Total Memory: {}GiB\n Name: {}\n",
                DOCKER_VERSION,
                self.detached.iter().filter(|c| c.node == node.id).count(),
                IMAGES.len(),
                DOCKER_VERSION,
                cluster.hardware.kernel,
                cluster.hardware.os_name,
                cluster.hardware.logical_cpus(),
                cluster.hardware.memory_gib,
                node.hostname
            ))),
            Some("run") => self.docker_run(cmd, ctx, cluster, node),
            Some("stop") | Some("rm") => {
                let target = cmd
                    .positionals
                    .first()
                    .ok_or_else(|| SimError::Usage("\"docker stop\" requires at least 1 argument.".to_string()))?;
                let before = self.detached.len();
                self.detached.retain(|c| !(c.node == node.id && (c.id.starts_with(target.as_str()) || c.name == *target)));
                if self.detached.len() == before {
                    return Err(SimError::NotFound(format!(
                        "Error response from daemon: No such container: {}",
                        target
                    )));
                }
                Ok(CommandOutput::ok(format!("{}\n", target)))
            }
            Some("version") => Ok(CommandOutput::ok(format!("Docker version {}, build afdd53b\n", DOCKER_VERSION))),
            Some(other) => Err(SimError::Usage(format!(
                "docker: '{}' is not a docker command.\nSee 'docker --help'",
                other
            ))),
            None => Err(SimError::Usage("Usage:  docker [OPTIONS] COMMAND".to_string())),
        }
    }

    fn docker_ps(&self, node: &DgxNode) -> String {
        let rows: Vec<Vec<String>> = self
            .detached
            .iter()
            .filter(|c| c.node == node.id)
            .map(|c| {
                vec![
                    c.id.clone(),
                    c.image.clone(),
                    format!("\"{}\"", c.command),
                    "Up 2 minutes".to_string(),
                    c.name.clone(),
                ]
            })
            .collect();
        render_table(&["CONTAINER ID", "IMAGE", "COMMAND", "STATUS", "NAMES"], &rows, 3)
    }

    fn docker_run(&mut self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster, node: &DgxNode) -> Result<CommandOutput> {
        let image = cmd
            .positionals
            .first()
            .ok_or_else(|| SimError::Usage("\"docker run\" requires at least 1 argument.".to_string()))?;
        let argv = &cmd.positionals[1..];
        let visible = match cmd.flag_value(&["gpus"]) {
            Some(spec) => Some(requested_gpus(spec, node)?),
            None => None,
        };
        if let Some(ids) = &visible {
            let gpus: Vec<&Gpu> = ids.iter().filter_map(|i| node.gpu(*i)).collect();
            if let Err(e) = toolkit_check(&gpus) {
                return Ok(CommandOutput::fail(
                    format!(
                        "docker: Error response from daemon: failed to create task for container: failed to create shim task: OCI runtime create failed: {}: unknown.\n",
                        e
                    ),
                    125,
                ));
            }
        }
        if argv.first().map(String::as_str) == Some("nvidia-smi") && visible.is_none() {
            return Ok(CommandOutput::fail(
                "docker: Error response from daemon: failed to create task for container: exec: \"nvidia-smi\": executable file not found in $PATH: unknown.\n",
                127,
            ));
        }
        if cmd.has_any(&["d", "detach"]) {
            let id = format!("{:012x}", 0x5e1f_3a90_0000u64 + self.detached.len() as u64 * 0x1_0001 + node_index(node)? as u64);
            let name = cmd
                .flag_value(&["name"])
                .map(str::to_string)
                .unwrap_or_else(|| format!("dgx_job_{}", self.detached.len()));
            self.detached.push(DetachedContainer {
                node: node.id.clone(),
                id: id.clone(),
                image: image.clone(),
                command: if argv.is_empty() { "/bin/bash".to_string() } else { argv.join(" ") },
                name,
            });
            return Ok(CommandOutput::ok(format!("{}\n", id)));
        }
        run_in_container(argv, visible.as_deref(), ctx, cluster, node)
    }

    fn enroot(&mut self, cmd: &ParsedCommand, ctx: &CommandContext, cluster: &Cluster, node: &DgxNode) -> Result<CommandOutput> {
        match cmd.subcommand.as_deref() {
            Some("version") => Ok(CommandOutput::ok("3.4.1\n")),
            Some("list") => {
                let names: String = self
                    .enroot_containers
                    .iter()
                    .filter(|c| c.node == node.id)
                    .map(|c| format!("{}\n", c.name))
                    .collect();
                Ok(CommandOutput::ok(names))
            }
            Some("import") => {
                let uri = cmd
                    .positionals
                    .first()
                    .ok_or_else(|| SimError::Usage("Usage: enroot import [options] [--] URI".to_string()))?;
                let reference = uri
                    .strip_prefix("docker://")
                    .ok_or_else(|| SimError::Usage(format!("[ERROR] Invalid image reference: {}", uri)))?;
                let path = reference.rsplit_once('#').map(|(_, p)| p).unwrap_or(reference);
                let file = format!("{}.sqsh", path.replace(['/', ':'], "+"));
                if !self.enroot_images.iter().any(|(n, f)| n == &node.id && f == &file) {
                    self.enroot_images.push((node.id.clone(), file.clone()));
                }
                Ok(CommandOutput::ok(format!(
                    "[INFO] Querying registry for permission grant\n[INFO] Authenticating with user: <anonymous>\n[INFO] Fetching image manifest list\n[INFO] Fetching image manifest\n[INFO] Downloading 34 missing layers...\n[INFO] Extracting image layers...\n[INFO] Converting whiteouts...\n[INFO] Creating squashfs filesystem...\nParallel mksquashfs: Using {} processors\nCreating 4.0 filesystem on /root/{}, block size 131072.\n",
                    cluster.hardware.logical_cpus(),
                    file
                )))
            }
            Some("create") => {
                let file = cmd
                    .positionals
                    .first()
                    .ok_or_else(|| SimError::Usage("Usage: enroot create [options] [--] IMAGE".to_string()))?;
                if !self.enroot_images.iter().any(|(n, f)| n == &node.id && f == file) {
                    return Err(SimError::NotFound(format!("[ERROR] No such file or directory: {}", file)));
                }
                let name = cmd
                    .flag_value(&["n", "name"])
                    .map(str::to_string)
                    .unwrap_or_else(|| file.trim_end_matches(".sqsh").to_string());
                if self.enroot_containers.iter().any(|c| c.node == node.id && c.name == name) {
                    return Err(SimError::Usage(format!("[ERROR] File already exists: /raid/enroot/data/{}", name)));
                }
                self.enroot_containers.push(EnrootContainer { node: node.id.clone(), name, image: file.clone() });
                Ok(CommandOutput::ok(""))
            }
            Some("start") => {
                let name = cmd
                    .positionals
                    .first()
                    .ok_or_else(|| SimError::Usage("Usage: enroot start [options] [--] NAME|IMAGE [COMMAND] [ARG...]".to_string()))?;
                let known = self
                    .enroot_containers
                    .iter()
                    .any(|c| c.node == node.id && (c.name == *name || c.image == *name));
                if !known {
                    return Err(SimError::NotFound(format!("[ERROR] No such file or directory: /raid/enroot/data/{}", name)));
                }
                let all: Vec<u32> = node.gpus.iter().map(|g| g.id).collect();
                let gpus: Vec<&Gpu> = node.gpus.iter().collect();
                if let Err(e) = toolkit_check(&gpus) {
                    return Ok(CommandOutput::fail(format!("{}\n[ERROR] /etc/enroot/hooks.d/98-nvidia.sh exited with return code 1\n", e), 1));
                }
                run_in_container(&cmd.positionals[1..], Some(&all), ctx, cluster, node)
            }
            Some("remove") => {
                let name = cmd
                    .positionals
                    .first()
                    .ok_or_else(|| SimError::Usage("Usage: enroot remove [options] [--] NAME...".to_string()))?;
                let before = self.enroot_containers.len();
                self.enroot_containers.retain(|c| !(c.node == node.id && c.name == *name));
                if before == self.enroot_containers.len() {
                    return Err(SimError::NotFound(format!("[ERROR] No such file or directory: /raid/enroot/data/{}", name)));
                }
                Ok(CommandOutput::ok(""))
            }
            _ => Err(SimError::Usage("Usage: enroot COMMAND [ARG...]\n\n Commands: version, import, create, start, list, remove".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{inject_fault, FaultKind};
    use crate::store::ClusterStore;

    fn run(sim: &mut Containers, store: &ClusterStore, verb: ContainerVerb, line: &str) -> Result<CommandOutput> {
        let ctx = CommandContext::new("dgx-00");
        sim.execute(verb, &parse(line).unwrap(), &ctx, store.cluster())
    }

    #[test]
    fn gpu_visibility_inside_container() {
        let store = ClusterStore::superpod("t");
        let mut sim = Containers::default();
        let all = run(&mut sim, &store, ContainerVerb::Docker, "docker run --rm --gpus all nvcr.io/nvidia/pytorch:24.01-py3 nvidia-smi -L").unwrap();
        assert_eq!(all.output.lines().count(), 8);
        let two = run(&mut sim, &store, ContainerVerb::Docker, "docker run --rm --gpus \"device=2,5\" nvcr.io/nvidia/cuda:12.2.0-base-ubuntu22.04 nvidia-smi -L").unwrap();
        let lines: Vec<&str> = two.output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("GPU 2:") && lines[1].starts_with("GPU 5:"));
        let none = run(&mut sim, &store, ContainerVerb::Docker, "docker run --rm nvcr.io/nvidia/cuda:12.2.0-base-ubuntu22.04 nvidia-smi").unwrap();
        assert_eq!(none.exit_code, 127);
    }

    #[test]
    fn fallen_gpu_blocks_container_start() {
        let mut store = ClusterStore::superpod("t");
        inject_fault(&mut store, "dgx-00", 0, FaultKind::Xid).unwrap();
        let mut sim = Containers::default();
        let out = run(&mut sim, &store, ContainerVerb::Docker, "docker run --rm --gpus all nvcr.io/nvidia/pytorch:24.01-py3 nvidia-smi").unwrap();
        assert_eq!(out.exit_code, 125);
        assert!(out.output.contains("nvml error: unknown error"));
        // GPU 0 hidden: the container still starts
        let ok = run(&mut sim, &store, ContainerVerb::Docker, "docker run --rm --gpus device=1 nvcr.io/nvidia/pytorch:24.01-py3 nvidia-smi -L").unwrap();
        assert!(ok.success());
        assert_eq!(run(&mut sim, &store, ContainerVerb::NvidiaContainerCli, "nvidia-container-cli info").unwrap().exit_code, 1);
    }

    #[test]
    fn detached_containers_are_listed() {
        let store = ClusterStore::superpod("t");
        let mut sim = Containers::default();
        run(&mut sim, &store, ContainerVerb::Docker, "docker run -d --name trainer --gpus all nvcr.io/nvidia/nemo:24.01 python train.py").unwrap();
        let ps = run(&mut sim, &store, ContainerVerb::Docker, "docker ps").unwrap();
        assert!(ps.output.contains("trainer"));
        run(&mut sim, &store, ContainerVerb::Docker, "docker stop trainer").unwrap();
        assert_eq!(run(&mut sim, &store, ContainerVerb::Docker, "docker ps").unwrap().output.lines().count(), 1);
    }

    #[test]
    fn enroot_import_create_start() {
        let store = ClusterStore::superpod("t");
        let mut sim = Containers::default();
        run(&mut sim, &store, ContainerVerb::Enroot, "enroot import docker://nvcr.io#nvidia/pytorch:24.01-py3").unwrap();
        run(&mut sim, &store, ContainerVerb::Enroot, "enroot create --name pyt nvidia+pytorch+24.01-py3.sqsh").unwrap();
        assert_eq!(run(&mut sim, &store, ContainerVerb::Enroot, "enroot list").unwrap().output, "pyt\n");
        let out = run(&mut sim, &store, ContainerVerb::Enroot, "enroot start pyt nvidia-smi -L").unwrap();
        assert_eq!(out.output.lines().count(), 8);
        assert!(matches!(run(&mut sim, &store, ContainerVerb::Enroot, "enroot start nope"), Err(SimError::NotFound(_))));
    }
}
