//! The narrow `/proc/mdstat` interface the monitor consumes: one record per
//! array plus a poll-based wait for the next change.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;

use mdctl_core::util::devnum_from_name;
use mdctl_core::{MdError, Result};
use nix::poll::{poll, PollFd, PollFlags};

#[derive(Debug, Clone, Default)]
pub struct MdstatEnt {
    pub name: String,
    pub devnum: i32,
    pub active: bool,
    pub level: Option<String>,
    /// "external:/md127/0" style, when present
    pub metadata_version: Option<String>,
    /// up/down pattern like "UU_"
    pub pattern: Option<String>,
    pub raid_disks: i32,
    /// bytes
    pub chunk_size: i32,
    /// -1 when no resync is running
    pub resync_percent: i32,
    pub devcnt: usize,
}

pub fn parse(text: &str) -> Vec<MdstatEnt> {
    let mut out: Vec<MdstatEnt> = Vec::new();
    for line in text.lines() {
        if line.starts_with("Personalities") || line.starts_with("unused") {
            continue;
        }
        if !line.starts_with(' ') && line.contains(" : ") {
            let mut ent = MdstatEnt { resync_percent: -1, ..Default::default() };
            let mut words = line.split_whitespace();
            let Some(name) = words.next() else { continue };
            let Some(devnum) = devnum_from_name(name) else { continue };
            ent.name = name.to_string();
            ent.devnum = devnum;
            let _ = words.next(); // ":"
            for w in words {
                match w {
                    "active" => ent.active = true,
                    "inactive" => ent.active = false,
                    "(read-only)" | "(auto-read-only)" => {}
                    _ if w.starts_with("super") => {
                        // "super 1.2" arrives as two words; the version
                        // follows in the next iteration and is handled there
                    }
                    _ if w.contains('[') && w.ends_with(']') => {
                        // member like "sda1[0]" or "sdb1[1](F)"
                        ent.devcnt += 1;
                    }
                    _ if w.starts_with("external:") => {
                        ent.metadata_version = Some(w.to_string());
                    }
                    _ => {
                        if ent.level.is_none()
                            && mdctl_core::model::level_from_name(w).is_some()
                        {
                            ent.level = Some(w.to_string());
                        } else if ent.metadata_version.is_none()
                            && (w == "1.0" || w == "1.1" || w == "1.2" || w == "0.90")
                        {
                            ent.metadata_version = Some(w.to_string());
                        }
                    }
                }
            }
            out.push(ent);
        } else if let Some(ent) = out.last_mut() {
            // continuation lines: blocks / status / resync progress
            if let Some(pos) = line.find("k chunks") {
                let num: String = line[..pos]
                    .chars()
                    .rev()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                let num: String = num.chars().rev().collect();
                ent.chunk_size = num.parse::<i32>().unwrap_or(0) * 1024;
            }
            for w in line.split_whitespace() {
                if w.starts_with('[') && w.ends_with(']') && w[1..w.len() - 1]
                    .chars()
                    .all(|c| c == 'U' || c == '_')
                {
                    ent.pattern = Some(w[1..w.len() - 1].to_string());
                } else if w.ends_with('%') {
                    if let Ok(pct) = w.trim_end_matches('%').parse::<f64>() {
                        ent.resync_percent = pct as i32;
                    }
                }
            }
            if let Some(pat) = &ent.pattern {
                ent.raid_disks = pat.len() as i32;
            }
            // "[3/2]" style disk counts
            for w in line.split_whitespace() {
                if let Some(body) = w.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
                    if let Some((total, _up)) = body.split_once('/') {
                        if let Ok(t) = total.parse::<i32>() {
                            ent.raid_disks = t;
                        }
                    }
                }
            }
        }
    }
    out
}

pub fn read() -> Result<Vec<MdstatEnt>> {
    let mut text = String::new();
    File::open("/proc/mdstat")
        .and_then(|mut f| f.read_to_string(&mut text))
        .map_err(MdError::Io)?;
    Ok(parse(&text))
}

/// Hold an fd open across reads so changes can be waited for. `/proc/mdstat`
/// signals changes as an exceptional condition, like sysfs attributes.
pub struct MdstatWatch {
    file: File,
}

impl AsFd for MdstatWatch {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl MdstatWatch {
    pub fn open() -> Result<MdstatWatch> {
        Ok(MdstatWatch { file: File::open("/proc/mdstat").map_err(MdError::Io)? })
    }

    /// Wait for a change or `timeout_ms` (< 0 blocks). Returns the fresh
    /// records, or None on timeout.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<Option<Vec<MdstatEnt>>> {
        let mut fds = [PollFd::new(
            &self.file,
            PollFlags::POLLPRI | PollFlags::POLLERR,
        )];
        let n = poll(&mut fds, timeout_ms)?;
        if n == 0 {
            return Ok(None);
        }
        read().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Personalities : [raid1] [raid6] [raid5] [raid4]
md127 : active raid5 sdc1[2] sdb1[1] sda1[0]
      1047552 blocks super 1.2 level 5, 512k chunks, algorithm 2 [3/3] [UUU]
md126 : inactive sdd[0](S)
      1047552 blocks external:imsm
md125 : active raid1 sde1[1] sdf1[0]
      523712 blocks super external:/md126/0 [2/2] [UU]
      [==>..................]  recovery = 12.6% (66176/523712)
unused devices: <none>
";

    #[test]
    fn parses_arrays_and_members() {
        let ents = parse(SAMPLE);
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[0].name, "md127");
        assert_eq!(ents[0].devnum, 127);
        assert!(ents[0].active);
        assert_eq!(ents[0].level.as_deref(), Some("raid5"));
        assert_eq!(ents[0].devcnt, 3);
        assert_eq!(ents[0].chunk_size, 512 * 1024);
        assert_eq!(ents[0].pattern.as_deref(), Some("UUU"));
        assert_eq!(ents[0].raid_disks, 3);

        assert!(!ents[1].active);
        assert_eq!(ents[1].metadata_version.as_deref(), Some("external:imsm"));

        assert_eq!(ents[2].metadata_version.as_deref(), Some("external:/md126/0"));
        assert_eq!(ents[2].resync_percent, 12);
    }
}
