//! Partition service backed by a directory tree
//!
//! Each namespace is a directory of generations:
//!
//! - `root/<namespace>/gen-<n>/<key>`: one file per blob
//! - `root/<namespace>/current`: number of the live generation
//!
//! Writes through an open read/write handle are staged in memory. `commit`
//! builds generation `n + 1` next to the live one (unchanged blobs are hard
//! linked, staged ones written and synced), then publishes it by replacing
//! `current` with the temp file, sync, rename, directory sync sequence. That
//! rename is the only step readers observe, so a commit failing anywhere
//! leaves the previous generation in place.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::{debug, warn};

use nvstore_core::backend::PartitionService;
use nvstore_core::PartitionStatus;

use crate::platform_durability::{durable_sync, sync_dir};

/// Longest namespace or key name accepted
pub const MAX_NAME_LEN: usize = 15;

const CURRENT: &str = "current";
const TEMP_SUFFIX: &str = ".tmp";

struct OpenNamespace {
    dir: PathBuf,
    read_write: bool,
    /// Live generation, 0 before the first commit
    generation: u64,
    staged: HashMap<String, Vec<u8>>,
    erase_all: bool,
}

impl OpenNamespace {
    fn generation_dir(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("gen-{}", generation))
    }

    /// Fill `next` with the blobs of the live generation and the staged ones.
    fn build(&self, next: &Path) -> io::Result<usize> {
        if next.exists() {
            fs::remove_dir_all(next)?;
        }
        fs::create_dir(next)?;

        let mut linked = 0;
        if self.generation > 0 && !self.erase_all {
            for entry in fs::read_dir(self.generation_dir(self.generation))? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(key) = name.to_str() else {
                    continue;
                };
                if !entry.file_type()?.is_file() || self.staged.contains_key(key) {
                    continue;
                }
                fs::hard_link(entry.path(), next.join(key))?;
                linked += 1;
            }
        }
        for (key, data) in &self.staged {
            let mut file = fs::File::create(next.join(key))?;
            file.write_all(data)?;
            durable_sync(&file)?;
        }
        sync_dir(next)?;
        Ok(linked)
    }

    /// Drop every generation but the live one, left over from earlier
    /// commits or from ones that failed before publishing.
    fn remove_stale(&self) {
        let live = format!("gen-{}", self.generation);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("partition {} not listed: {}", self.dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let stale = name
                .to_str()
                .map_or(false, |n| n.starts_with("gen-") && n != live);
            if stale {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!("partition {} not removed: {}", entry.path().display(), e);
                }
            }
        }
    }

    /// Point `current` at `generation`; atomic through the final rename.
    fn publish(&self, generation: u64) -> io::Result<()> {
        let target = self.dir.join(CURRENT);
        let temp = self.dir.join(format!("{}{}", CURRENT, TEMP_SUFFIX));
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(generation.to_string().as_bytes())?;
            durable_sync(&file)?;
        }
        fs::rename(&temp, &target)?;
        sync_dir(&self.dir)
    }
}

pub struct DirPartition {
    root: PathBuf,
    open: Option<OpenNamespace>,
    commits: usize,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn failed(context: &str, path: &Path, err: io::Error) -> PartitionStatus {
    warn!("partition {} {}: {}", context, path.display(), err);
    PartitionStatus::FAIL
}

/// Live generation recorded in `dir`, 0 when nothing was committed
fn read_generation(dir: &Path) -> io::Result<u64> {
    let path = dir.join(CURRENT);
    match fs::read_to_string(&path) {
        Ok(text) => text.trim().parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad generation {:?}", text))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

impl DirPartition {
    /// Partition rooted at `root`; the directory is created when missing.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, open: None, commits: 0 })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Directory holding the live blobs of `namespace`, if any were committed
    pub fn live_dir(&self, namespace: &str) -> Option<PathBuf> {
        let dir = self.root.join(namespace);
        match read_generation(&dir) {
            Ok(0) | Err(_) => None,
            Ok(generation) => Some(dir.join(format!("gen-{}", generation))),
        }
    }

    fn handle(&mut self, write: bool) -> Result<&mut OpenNamespace, PartitionStatus> {
        match self.open.as_mut() {
            Some(ns) if ns.read_write || !write => Ok(ns),
            _ => Err(PartitionStatus::INVALID_HANDLE),
        }
    }
}

impl PartitionService for DirPartition {
    fn open(&mut self, namespace: &str, read_write: bool) -> Result<(), PartitionStatus> {
        if !valid_name(namespace) {
            return Err(PartitionStatus::FAIL);
        }
        let dir = self.root.join(namespace);
        if !dir.is_dir() {
            if !read_write {
                return Err(PartitionStatus::NAMESPACE_NOT_FOUND);
            }
            fs::create_dir_all(&dir).map_err(|e| failed("create", &dir, e))?;
        }
        let generation = read_generation(&dir).map_err(|e| failed("open", &dir, e))?;
        self.open = Some(OpenNamespace {
            dir,
            read_write,
            generation,
            staged: HashMap::new(),
            erase_all: false,
        });
        Ok(())
    }

    fn get_blob(&mut self, key: &str) -> Result<Option<Vec<u8>>, PartitionStatus> {
        let ns = self.handle(false)?;
        if let Some(staged) = ns.staged.get(key) {
            return Ok(Some(staged.clone()));
        }
        if ns.erase_all || ns.generation == 0 || !valid_name(key) {
            return Ok(None);
        }
        let path = ns.generation_dir(ns.generation).join(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(failed("read", &path, e)),
        }
    }

    fn set_blob(&mut self, key: &str, data: &[u8]) -> Result<(), PartitionStatus> {
        if !valid_name(key) {
            return Err(PartitionStatus::FAIL);
        }
        let ns = self.handle(true)?;
        ns.staged.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PartitionStatus> {
        let ns = self.handle(true)?;
        let next = ns.generation + 1;
        let next_dir = ns.generation_dir(next);

        let published = ns
            .build(&next_dir)
            .map_err(|e| failed("write", &next_dir, e))
            .and_then(|linked| {
                ns.publish(next).map_err(|e| failed("publish", &ns.dir, e))?;
                Ok(linked)
            });
        let linked = match published {
            Ok(linked) => linked,
            Err(status) => {
                if let Err(e) = fs::remove_dir_all(&next_dir) {
                    debug!("partition cleanup {}: {}", next_dir.display(), e);
                }
                return Err(status);
            }
        };

        debug!(
            "partition {} generation {} committed {} blobs, kept {}",
            ns.dir.display(),
            next,
            ns.staged.len(),
            linked
        );
        ns.generation = next;
        ns.remove_stale();
        ns.staged.clear();
        ns.erase_all = false;
        self.commits += 1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(ns) = self.open.take() {
            if !ns.staged.is_empty() || ns.erase_all {
                debug!("partition {} closed with uncommitted changes", ns.dir.display());
            }
        }
    }

    fn erase_all(&mut self) -> Result<(), PartitionStatus> {
        let ns = self.handle(true)?;
        ns.staged.clear();
        ns.erase_all = true;
        Ok(())
    }
}
