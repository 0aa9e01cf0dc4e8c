//! The map file tracks UUID → md device assignments made by incremental
//! assembly, so concurrent invocations agree on which array a device
//! belongs to.
//!
//! Format: one line per array, `md<num>|mdp<num> <metadata> <uuid> <path>`.
//! Writers take an advisory exclusive lock on a `.lock` sibling, rewrite a
//! `.new` sibling and rename it into place, so readers never observe a
//! partial line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

use crate::model::{uuid_from_text, uuid_text};
use crate::{MdError, Result};

/// Candidate locations, in preference order. `/var/run` may be missing or
/// read-only in early boot, `/dev` is writable for udev very early.
const SYSTEM_CANDIDATES: &[&str] = &[
    "/var/run/mdadm/map",
    "/var/run/mdadm.map",
    "/dev/.mdadm.map",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// md device number; negative means partitionable (`mdp<-1-devnum>`)
    pub devnum: i32,
    pub metadata: String,
    pub uuid: [u8; 16],
    pub path: String,
}

impl MapEntry {
    fn format(&self) -> String {
        let dev = if self.devnum < 0 {
            format!("mdp{}", -1 - self.devnum)
        } else {
            format!("md{}", self.devnum)
        };
        format!("{} {} {} {}\n", dev, self.metadata, uuid_text(&self.uuid), self.path)
    }

    fn parse(line: &str) -> Option<MapEntry> {
        let mut f = line.split_whitespace();
        let dev = f.next()?;
        let metadata = f.next()?.to_string();
        let uuid = uuid_from_text(f.next()?)?;
        let path = f.next()?.to_string();
        if f.next().is_some() {
            return None;
        }
        let devnum = if let Some(n) = dev.strip_prefix("mdp") {
            -1 - n.parse::<i32>().ok()?
        } else if let Some(n) = dev.strip_prefix("md") {
            n.parse::<i32>().ok()?
        } else {
            return None;
        };
        Some(MapEntry { devnum, metadata, uuid, path })
    }
}

#[derive(Debug, Clone)]
pub struct MapFile {
    candidates: Vec<PathBuf>,
}

impl MapFile {
    pub fn system() -> Self {
        MapFile {
            candidates: SYSTEM_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    /// A map rooted at an arbitrary directory; used by tests.
    pub fn at(dir: &Path) -> Self {
        MapFile { candidates: vec![dir.join("map")] }
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    }

    pub fn read(&self) -> Vec<MapEntry> {
        for cand in &self.candidates {
            let Ok(f) = File::open(cand) else { continue };
            let mut entries = Vec::new();
            for line in BufReader::new(f).lines() {
                let Ok(line) = line else { break };
                if let Some(ent) = MapEntry::parse(&line) {
                    entries.push(ent);
                }
            }
            return entries;
        }
        Vec::new()
    }

    pub fn write(&self, entries: &[MapEntry]) -> Result<()> {
        let mut last_err = MdError::NoDevice("map file".into());
        for cand in &self.candidates {
            if let Some(parent) = cand.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let new_path = Self::sibling(cand, ".new");
            let mut f = match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&new_path)
            {
                Ok(f) => f,
                Err(e) => {
                    last_err = MdError::Io(e);
                    continue;
                }
            };
            let mut ok = true;
            for ent in entries {
                if f.write_all(ent.format().as_bytes()).is_err() {
                    ok = false;
                    break;
                }
            }
            if !ok || f.sync_data().is_err() {
                let _ = std::fs::remove_file(&new_path);
                continue;
            }
            drop(f);
            match std::fs::rename(&new_path, cand) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = std::fs::remove_file(&new_path);
                    last_err = MdError::Io(e);
                }
            }
        }
        Err(last_err)
    }

    /// Take the exclusive lock and return the current entries. All mutation
    /// happens between `lock` and the `MapLock` going out of scope.
    pub fn lock(&self) -> Result<MapLock> {
        for cand in &self.candidates {
            if let Some(parent) = cand.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let lock_path = Self::sibling(cand, ".lock");
            let Ok(f) = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&lock_path)
            else {
                continue;
            };
            flock(f.as_raw_fd(), FlockArg::LockExclusive)?;
            return Ok(MapLock {
                map: self.clone(),
                entries: self.read(),
                _file: f,
                lock_path,
            });
        }
        Err(MdError::NoDevice("map lock file".into()))
    }
}

/// Held while the map is being mutated; writes back on `commit`.
pub struct MapLock {
    map: MapFile,
    pub entries: Vec<MapEntry>,
    _file: File,
    lock_path: PathBuf,
}

impl MapLock {
    pub fn by_uuid(&self, uuid: &[u8; 16]) -> Option<&MapEntry> {
        self.entries.iter().find(|e| &e.uuid == uuid)
    }

    pub fn by_devnum(&self, devnum: i32) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.devnum == devnum)
    }

    pub fn by_name(&self, name: &str) -> Option<&MapEntry> {
        self.entries
            .iter()
            .find(|e| e.path.strip_prefix("/dev/md/") == Some(name))
    }

    /// Replace or append the entry for `devnum` and persist.
    pub fn update(
        &mut self,
        devnum: i32,
        metadata: &str,
        uuid: &[u8; 16],
        path: &str,
    ) -> Result<()> {
        if let Some(ent) = self.entries.iter_mut().find(|e| e.devnum == devnum) {
            ent.metadata = metadata.to_string();
            ent.uuid = *uuid;
            ent.path = path.to_string();
        } else {
            self.entries.push(MapEntry {
                devnum,
                metadata: metadata.to_string(),
                uuid: *uuid,
                path: path.to_string(),
            });
        }
        self.map.write(&self.entries)
    }

    pub fn delete(&mut self, devnum: i32) -> Result<()> {
        self.entries.retain(|e| e.devnum != devnum);
        self.map.write(&self.entries)
    }
}

impl Drop for MapLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
        // the flock is released when _file closes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let line = "md127 1.2 00000001:00000002:00000003:00000004 /dev/md/home\n";
        let ent = MapEntry::parse(line).unwrap();
        assert_eq!(ent.devnum, 127);
        assert_eq!(ent.metadata, "1.2");
        assert_eq!(ent.path, "/dev/md/home");
        assert_eq!(ent.format(), line);

        let part = MapEntry::parse("mdp3 0.90 00000001:00000002:00000003:00000004 /dev/md_d3")
            .unwrap();
        assert_eq!(part.devnum, -4);
        assert!(part.format().starts_with("mdp3 "));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(MapEntry::parse("notmd 1.2 0:0:0:0 /dev/x").is_none());
        assert!(MapEntry::parse("md1 1.2 badhex /dev/x").is_none());
        assert!(MapEntry::parse("md1 1.2").is_none());
    }

    #[test]
    fn update_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let map = MapFile::at(dir.path());
        let uuid = [7u8; 16];
        {
            let mut lock = map.lock().unwrap();
            lock.update(3, "1.2", &uuid, "/dev/md3").unwrap();
        }
        let mut lock = map.lock().unwrap();
        assert_eq!(lock.by_uuid(&uuid).unwrap().devnum, 3);
        lock.update(3, "1.2", &uuid, "/dev/md/renamed").unwrap();
        assert_eq!(lock.entries.len(), 1);
        assert_eq!(lock.by_devnum(3).unwrap().path, "/dev/md/renamed");
        lock.delete(3).unwrap();
        assert!(lock.entries.is_empty());
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let uuid = [9u8; 16];
        let mut handles = Vec::new();
        for i in 0..2 {
            let p = dir_path.clone();
            handles.push(std::thread::spawn(move || {
                let map = MapFile::at(&p);
                let mut lock = map.lock().unwrap();
                lock.update(5, "1.2", &[9u8; 16], &format!("/dev/md/p{}", i))
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let map = MapFile::at(&dir_path);
        let entries = map.read();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uuid, uuid);
        assert!(entries[0].path == "/dev/md/p0" || entries[0].path == "/dev/md/p1");
    }
}
