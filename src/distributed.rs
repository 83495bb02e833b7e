//! Process groups: who this process is among its peers, and a barrier to
//! line them up.
//!
//! Only a rendezvous is provided. Collective operations (all-reduce etc.)
//! belong to the training framework, not to data loading.

use crate::error::{DataError, Result};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variables read by [`FileGroup::from_env`] and [`run_id`].
pub const ENV_RANK: &str = "RANK";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_RENDEZVOUS_DIR: &str = "VISIONLOADER_RENDEZVOUS_DIR";
pub const ENV_JOB_ID: &str = "VISIONLOADER_JOB_ID";
pub const ENV_ELASTIC_RUN_ID: &str = "TORCHELASTIC_RUN_ID";
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";

/// A set of cooperating processes (or threads) with a shared barrier.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this member, `0..world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocks until every member of the group has called `barrier`.
    fn barrier(&self) -> Result<()>;
}

/// The trivial group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Ranks that live as threads of one process.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
}

impl LocalGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn new(world_size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        debug!(rank = self.rank, "Entering local barrier");
        self.barrier.wait();
        Ok(())
    }
}

/// Rendezvous through a directory every rank can see.
///
/// Barrier number `g` writes `<dir>/<job_id>/gen-<g>/rank-<r>` and polls
/// until `world_size` markers are present. On the way out every rank writes
/// `left-<r>`; the rank that completes the departure set removes `gen-<g>`,
/// so a finished run leaves nothing behind for the next one with the same
/// id. A marker that already exists when a rank arrives belongs to an
/// earlier run that did not finish, and the barrier fails with
/// [`DataError::StaleRendezvous`] instead of releasing early.
///
/// There is no timeout: a rank that never arrives blocks the others forever.
#[derive(Debug)]
pub struct FileGroup {
    dir: PathBuf,
    rank: usize,
    world_size: usize,
    generation: AtomicU64,
    poll_interval: Duration,
}

impl FileGroup {
    pub fn new<P: AsRef<Path>>(
        dir: P,
        job_id: &str,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(DataError::Config("world size must be positive".into()));
        }
        if rank >= world_size {
            return Err(DataError::InvalidRank { rank, world_size });
        }
        let dir = dir.as_ref().join(job_id);
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), rank, world_size, "Joined file rendezvous");

        Ok(Self {
            dir,
            rank,
            world_size,
            generation: AtomicU64::new(0),
            poll_interval: Duration::from_millis(50),
        })
    }

    /// Builds the group from `RANK`, `WORLD_SIZE`,
    /// `VISIONLOADER_RENDEZVOUS_DIR` (default: system temp dir) and a
    /// per-run id (see [`run_id`]).
    pub fn from_env() -> Result<Self> {
        let rank = env_usize(ENV_RANK)?;
        let world_size = env_usize(ENV_WORLD_SIZE)?;
        let dir = std::env::var_os(ENV_RENDEZVOUS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("visionloader-rendezvous"));
        let job_id = run_id(|name| std::env::var(name).ok())?;
        Self::new(dir, &job_id, rank, world_size)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `<dir>/<job_id>`
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn wait_for(&self, gen_dir: &Path, prefix: &str) -> Result<()> {
        while count_markers(gen_dir, prefix)? < self.world_size {
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Marks this rank as gone; the last one out removes the generation.
    fn depart(&self, gen_dir: &Path, generation: u64) -> Result<()> {
        fs::write(gen_dir.join(format!("{LEFT_PREFIX}{}", self.rank)), b"")?;
        let left = match count_markers(gen_dir, LEFT_PREFIX) {
            Ok(left) => left,
            // Уже удалено другим рангом
            Err(DataError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if left == self.world_size {
            match fs::remove_dir_all(gen_dir) {
                Ok(()) => debug!(generation, "Removed finished barrier generation"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = %gen_dir.display(), error = %e, "Could not remove barrier markers")
                }
            }
        }
        Ok(())
    }
}

const ARRIVED_PREFIX: &str = "rank-";
const LEFT_PREFIX: &str = "left-";

fn count_markers(gen_dir: &Path, prefix: &str) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(gen_dir)? {
        if entry?.file_name().to_string_lossy().starts_with(prefix) {
            count += 1;
        }
    }
    Ok(count)
}

/// Id shared by all ranks of one run and different between runs.
///
/// Taken from `VISIONLOADER_JOB_ID`, then `TORCHELASTIC_RUN_ID` (ignoring the
/// launcher's placeholder `"none"`), then `MASTER_ADDR` + `MASTER_PORT`.
/// Without any of them there is no safe default and this is an error.
pub fn run_id<F>(var: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    let id = set(ENV_JOB_ID)
        .or_else(|| set(ENV_ELASTIC_RUN_ID).filter(|v| v != "none"))
        .or_else(|| match (set(ENV_MASTER_ADDR), set(ENV_MASTER_PORT)) {
            (Some(addr), Some(port)) => Some(format!("{addr}-{port}")),
            _ => None,
        })
        .ok_or_else(|| {
            DataError::Config(format!(
                "no run id for the file rendezvous: set {ENV_JOB_ID}, \
                 {ENV_ELASTIC_RUN_ID} or {ENV_MASTER_ADDR}/{ENV_MASTER_PORT}"
            ))
        })?;

    let path_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    Ok(id
        .trim()
        .chars()
        .map(|c| if path_safe(c) { c } else { '-' })
        .collect())
}

fn env_usize(name: &str) -> Result<usize> {
    let value = std::env::var(name)
        .map_err(|_| DataError::Config(format!("environment variable {name} is not set")))?;
    value
        .trim()
        .parse()
        .map_err(|_| DataError::Config(format!("{name}={value} is not a non-negative integer")))
}

impl ProcessGroup for FileGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let gen_dir = self.dir.join(format!("gen-{generation}"));
        fs::create_dir_all(&gen_dir)?;

        let marker = gen_dir.join(format!("{ARRIVED_PREFIX}{}", self.rank));
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DataError::StaleRendezvous(marker));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(rank = self.rank, generation, "Entered file barrier");

        self.wait_for(&gen_dir, ARRIVED_PREFIX)?;
        debug!(rank = self.rank, generation, "Left file barrier");
        self.depart(&gen_dir, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_single_process() {
        let group = SingleProcess;
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        group.barrier().unwrap();
    }

    #[test]
    fn test_local_group_orders_ranks() {
        let ready = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|group| {
                let ready = Arc::clone(&ready);
                thread::spawn(move || {
                    assert_eq!(group.world_size(), 3);
                    if group.rank() == 0 {
                        thread::sleep(Duration::from_millis(20));
                        ready.store(true, Ordering::SeqCst);
                    }
                    group.barrier().unwrap();
                    ready.load(Ordering::SeqCst)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_file_group_rejects_bad_rank() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileGroup::new(tmp.path(), "job", 2, 2),
            Err(DataError::InvalidRank { rank: 2, world_size: 2 })
        ));
        assert!(FileGroup::new(tmp.path(), "job", 0, 0).is_err());
    }

    #[test]
    fn test_file_barrier_waits_for_all_ranks() {
        let tmp = tempfile::tempdir().unwrap();
        let fast = Duration::from_millis(5);
        let leader = FileGroup::new(tmp.path(), "job", 0, 2)
            .unwrap()
            .with_poll_interval(fast);
        let follower = FileGroup::new(tmp.path(), "job", 1, 2)
            .unwrap()
            .with_poll_interval(fast);
        assert_eq!(leader.dir(), tmp.path().join("job"));

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let waiter = thread::spawn(move || {
            follower.barrier().unwrap();
            flag.store(true, Ordering::SeqCst);
            // Второй барьер - новое поколение
            follower.barrier().unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!released.load(Ordering::SeqCst));

        leader.barrier().unwrap();
        leader.barrier().unwrap();
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        // Завершенные поколения удалены
        assert!(!tmp.path().join("job").join("gen-0").exists());
        assert!(!tmp.path().join("job").join("gen-1").exists());
    }

    fn pair(root: &Path, job: &str) -> (FileGroup, FileGroup) {
        let fast = Duration::from_millis(5);
        let make = |rank| {
            FileGroup::new(root, job, rank, 2)
                .unwrap()
                .with_poll_interval(fast)
        };
        (make(0), make(1))
    }

    #[test]
    fn test_rerun_with_same_id_waits_for_leader_again() {
        let tmp = tempfile::tempdir().unwrap();

        // Первый запуск доходит до конца
        let (leader, follower) = pair(tmp.path(), "job");
        let first = thread::spawn(move || follower.barrier().unwrap());
        leader.barrier().unwrap();
        first.join().unwrap();

        // Второй запуск с тем же id: ведомый не должен пройти один
        let (leader, follower) = pair(tmp.path(), "job");
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let waiter = thread::spawn(move || {
            follower.barrier().unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(150));
        assert!(!released.load(Ordering::SeqCst));

        leader.barrier().unwrap();
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_leftover_marker_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let gen_dir = tmp.path().join("job").join("gen-0");
        fs::create_dir_all(&gen_dir).unwrap();
        fs::write(gen_dir.join("rank-1"), b"").unwrap();

        let (_, follower) = pair(tmp.path(), "job");
        match follower.barrier() {
            Err(DataError::StaleRendezvous(path)) => assert!(path.ends_with("gen-0/rank-1")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_run_id_sources() {
        let env = |vars: &'static [(&'static str, &'static str)]| {
            move |name: &str| {
                vars.iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.to_string())
            }
        };

        assert_eq!(run_id(env(&[("VISIONLOADER_JOB_ID", "exp-7")])).unwrap(), "exp-7");
        assert_eq!(
            run_id(env(&[
                ("TORCHELASTIC_RUN_ID", "none"),
                ("MASTER_ADDR", "10.0.0.1"),
                ("MASTER_PORT", "29500"),
            ]))
            .unwrap(),
            "10.0.0.1-29500"
        );
        assert_eq!(
            run_id(env(&[("TORCHELASTIC_RUN_ID", "ab/cd:1")])).unwrap(),
            "ab-cd-1"
        );
        assert!(matches!(
            run_id(env(&[("MASTER_ADDR", "host")])),
            Err(DataError::Config(_))
        ));
        assert!(run_id(env(&[("VISIONLOADER_JOB_ID", "  ")])).is_err());
    }
}
