// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort migration of segment pages toward a thread's NUMA node.
//!
//! The target node comes from a [`PlacementPolicy`] fed with the node of
//! every CPU in the thread's affinity mask. The default, [`MeanNodePolicy`],
//! averages node indices. It ignores distance and bandwidth entirely and is
//! only a stand-in until a policy that measures them exists.
//!
//! A failed migration leaves the pages valid where they are.

use crate::error::ShmError;
use crate::sizing;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::{fs, io};

pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

pub trait PlacementPolicy: Send + Sync {
    /// Picks the node to move pages to, given the node of each CPU the
    /// thread may run on. `None` means there is nothing sensible to do.
    fn target_node(&self, cpu_nodes: &[usize]) -> Option<usize>;
}

/// Integer mean of the nodes of the allowed CPUs.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanNodePolicy;

impl PlacementPolicy for MeanNodePolicy {
    fn target_node(&self, cpu_nodes: &[usize]) -> Option<usize> {
        if cpu_nodes.is_empty() {
            return None;
        }
        Some(cpu_nodes.iter().sum::<usize>() / cpu_nodes.len())
    }
}

/// CPU to node map read from sysfs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NumaTopology {
    cpu_nodes: BTreeMap<usize, usize>,
    nodes: Vec<usize>,
}

impl NumaTopology {
    /// Reads the host topology. `None` when the host exposes no NUMA
    /// information.
    pub fn detect() -> Option<Self> {
        match Self::from_sysfs(Path::new(SYSFS_NODE_ROOT)) {
            Ok(topology) if topology.node_count() > 0 => Some(topology),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!("NUMA topology unavailable: {err}");
                None
            }
        }
    }

    /// Reads `node<N>/cpulist` entries under `root`, laid out like
    /// `/sys/devices/system/node`.
    pub fn from_sysfs(root: &Path) -> io::Result<Self> {
        let mut topology = Self::default();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(node) = name
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|index| index.parse::<usize>().ok())
            else {
                continue;
            };
            // Memory-only nodes have an empty list.
            let cpulist = match fs::read_to_string(entry.path().join("cpulist")) {
                Ok(cpulist) => cpulist,
                Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
                Err(err) => return Err(err),
            };
            for cpu in parse_cpu_list(&cpulist)? {
                topology.cpu_nodes.insert(cpu, node);
            }
            topology.nodes.push(node);
        }
        topology.nodes.sort_unstable();
        Ok(topology)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    pub fn node_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.cpu_nodes.get(&cpu).copied()
    }
}

/// Parses the kernel's CPU list format, e.g. `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> io::Result<Vec<usize>> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed cpu list {list:?}"),
        )
    };
    let mut cpus = Vec::new();
    for range in list.trim().split(',').filter(|range| !range.is_empty()) {
        let (first, last) = match range.split_once('-') {
            Some((first, last)) => (first, last),
            None => (range, range),
        };
        let first: usize = first.trim().parse().map_err(|_| invalid())?;
        let last: usize = last.trim().parse().map_err(|_| invalid())?;
        if first > last {
            return Err(invalid());
        }
        cpus.extend(first..=last);
    }
    Ok(cpus)
}

/// Where pages were asked to go and what the kernel reported per page
/// (a node index, or a negated errno).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NumaPlacement {
    pub target_node: usize,
    pub page_status: Vec<i32>,
}

impl NumaPlacement {
    pub fn pages_on_target(&self) -> usize {
        self.page_status
            .iter()
            .filter(|status| usize::try_from(**status) == Ok(self.target_node))
            .count()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlacementOutcome {
    /// No NUMA, a single node, or nothing to move.
    NotApplicable,
    Migrated(NumaPlacement),
    Failed {
        target_node: Option<usize>,
        errno: Errno,
    },
}

impl PlacementOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PlacementOutcome::Failed { .. })
    }
}

pub struct NumaPlacer<P = MeanNodePolicy> {
    policy: P,
    topology: Option<NumaTopology>,
    page_size: usize,
}

impl NumaPlacer {
    /// Placer using [`MeanNodePolicy`] over the host topology.
    pub fn new() -> Self {
        Self::with_policy(MeanNodePolicy, NumaTopology::detect())
    }
}

impl Default for NumaPlacer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlacementPolicy> NumaPlacer<P> {
    pub fn with_policy(policy: P, topology: Option<NumaTopology>) -> Self {
        Self {
            policy,
            topology,
            page_size: sizing::page_size(),
        }
    }

    pub fn topology(&self) -> Option<&NumaTopology> {
        self.topology.as_ref()
    }

    /// Asks the kernel to move the pages of `[ptr, ptr + nbytes)` to the node
    /// chosen for thread `tid`.
    ///
    /// `ptr` must be page aligned, on every host. Everything past that check
    /// is best effort: failures come back as [`PlacementOutcome::Failed`]
    /// and the memory stays usable.
    pub fn place(
        &self,
        tid: Pid,
        ptr: *const u8,
        nbytes: usize,
    ) -> Result<PlacementOutcome, ShmError> {
        let addr = ptr as usize;
        let offset = sizing::page_offset(addr, self.page_size);
        if offset != 0 {
            return Err(ShmError::Alignment {
                addr,
                offset,
                page_size: self.page_size,
            });
        }

        let Some(topology) = self.topology.as_ref().filter(|t| t.node_count() > 1) else {
            return Ok(PlacementOutcome::NotApplicable);
        };
        if nbytes == 0 {
            return Ok(PlacementOutcome::NotApplicable);
        }
        Ok(self.migrate(topology, tid, ptr, nbytes))
    }

    #[cfg(target_os = "linux")]
    fn migrate(
        &self,
        topology: &NumaTopology,
        tid: Pid,
        ptr: *const u8,
        nbytes: usize,
    ) -> PlacementOutcome {
        use nix::sched::{sched_getaffinity, CpuSet};

        // Node flags for move_pages(2).
        const MPOL_MF_MOVE: libc::c_int = 1 << 1;

        let cpus = match sched_getaffinity(tid) {
            Ok(cpus) => cpus,
            Err(errno) => {
                tracing::warn!(%tid, "failed to get affinity for thread: {errno}");
                return PlacementOutcome::Failed {
                    target_node: None,
                    errno,
                };
            }
        };
        let cpu_nodes: Vec<usize> = (0..CpuSet::count())
            .filter(|cpu| cpus.is_set(*cpu).unwrap_or(false))
            .filter_map(|cpu| topology.node_of_cpu(cpu))
            .collect();
        let Some(target_node) = self.policy.target_node(&cpu_nodes) else {
            tracing::debug!(%tid, "no NUMA node for thread affinity, leaving pages alone");
            return PlacementOutcome::NotApplicable;
        };
        let Ok(node) = libc::c_int::try_from(target_node) else {
            return PlacementOutcome::Failed {
                target_node: Some(target_node),
                errno: Errno::EINVAL,
            };
        };

        let pages = sizing::page_count(nbytes, self.page_size);
        let page_ptrs: Vec<*mut libc::c_void> = (0..pages)
            .map(|page| ptr.wrapping_add(page * self.page_size) as *mut libc::c_void)
            .collect();
        let nodes = vec![node; pages];
        let mut status = vec![-1 as libc::c_int; pages];

        // SAFETY: the three arrays hold exactly `pages` entries each.
        let not_moved = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                tid.as_raw(),
                pages as libc::c_ulong,
                page_ptrs.as_ptr(),
                nodes.as_ptr(),
                status.as_mut_ptr(),
                MPOL_MF_MOVE,
            )
        };
        if not_moved < 0 {
            let errno = Errno::last();
            tracing::warn!(
                %tid,
                target_node,
                pages,
                "failed to move pages, non-fatal error but results may vary: {errno}"
            );
            return PlacementOutcome::Failed {
                target_node: Some(target_node),
                errno,
            };
        }
        if not_moved > 0 {
            tracing::debug!(%tid, target_node, pages, not_moved, "some pages were not migrated");
        }

        PlacementOutcome::Migrated(NumaPlacement {
            target_node,
            page_status: status,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn migrate(
        &self,
        _topology: &NumaTopology,
        _tid: Pid,
        _ptr: *const u8,
        _nbytes: usize,
    ) -> PlacementOutcome {
        PlacementOutcome::NotApplicable
    }
}

/// Moves the pages of `[ptr, ptr + nbytes)` toward the NUMA node of thread
/// `tid` (use `Pid::from_raw(0)` for the calling thread).
///
/// Returns `Ok(true)` when the pages were migrated or there was nothing to
/// do, `Ok(false)` when the migration was attempted and failed, and an
/// [`ShmError::Alignment`] error when `ptr` is not page aligned.
pub fn move_to_tid_numa(tid: Pid, ptr: *const u8, nbytes: usize) -> Result<bool, ShmError> {
    static PLACER: OnceLock<NumaPlacer> = OnceLock::new();
    let placer = PLACER.get_or_init(NumaPlacer::new);
    Ok(placer.place(tid, ptr, nbytes)?.is_success())
}
