//! Stripe geometry: mapping the array's linear data address space onto
//! member disks, and copying ranges of it to and from a backup.
//!
//! Only data blocks are moved; parity is the kernel's to regenerate.

use mdctl_core::{BlockDevice, MdError, Result};

/// Which member disk holds `block` of `stripe`.
///
/// `block` is the data-block index within the stripe, or -1 for P, -2 for Q.
pub fn geo_map(block: i32, stripe: u64, raid_disks: i32, level: i32, layout: i32) -> i32 {
    let disks = raid_disks;
    match level {
        0 | -1 => block,
        4 => {
            // parity fixed on the last disk
            if block == -1 {
                disks - 1
            } else {
                block
            }
        }
        5 => {
            let pd = match layout {
                0 | 2 => disks - 1 - (stripe % disks as u64) as i32, // left
                1 | 3 => (stripe % disks as u64) as i32,             // right
                4 => 0,
                5 => disks - 1,
                _ => disks - 1 - (stripe % disks as u64) as i32,
            };
            if block == -1 {
                return pd;
            }
            match layout {
                // asymmetric: data fills slots in order, skipping parity
                0 | 1 => {
                    if block < pd {
                        block
                    } else {
                        block + 1
                    }
                }
                // symmetric: data starts just past parity and wraps
                2 | 3 => (pd + 1 + block) % disks,
                4 => block + 1,
                5 => block,
                _ => block,
            }
        }
        6 => {
            let pd = match layout {
                0 | 2 => disks - 1 - (stripe % disks as u64) as i32,
                1 | 3 => (stripe % disks as u64) as i32,
                _ => disks - 1 - (stripe % disks as u64) as i32,
            };
            let qd = (pd + 1) % disks;
            match block {
                -1 => pd,
                -2 => qd,
                _ => match layout {
                    0 | 1 => {
                        // data skips both P and Q slots
                        let mut d = block;
                        if d >= pd.min(qd) {
                            d += 1;
                        }
                        if d >= pd.max(qd) {
                            d += 1;
                        }
                        d
                    }
                    2 | 3 => (qd + 1 + block) % disks,
                    _ => (qd + 1 + block) % disks,
                },
            }
        }
        _ => block,
    }
}

/// Data disks for a level.
pub fn data_disks(level: i32, raid_disks: i32) -> i32 {
    match level {
        4 | 5 => raid_disks - 1,
        6 => raid_disks - 2,
        _ => raid_disks,
    }
}

/// Copy `length` bytes of array-linear data starting at `start` (both in
/// bytes, relative to the data area) from the member devices into `dest`.
///
/// `offsets[i]` is the byte offset of member `i`'s data area.
#[allow(clippy::too_many_arguments)]
pub fn save_stripes(
    sources: &mut [Option<BlockDevice>],
    offsets: &[u64],
    raid_disks: i32,
    chunk_bytes: u64,
    level: i32,
    layout: i32,
    dests: &mut [(&mut BlockDevice, u64)],
    start: u64,
    length: u64,
) -> Result<()> {
    let ndata = data_disks(level, raid_disks) as u64;
    let mut buf = vec![0u8; chunk_bytes as usize];
    let mut pos = start;
    let end = start + length;
    while pos < end {
        let chunk_index = pos / chunk_bytes;
        let within = pos % chunk_bytes;
        let take = (chunk_bytes - within).min(end - pos);
        let stripe = chunk_index / ndata;
        let block = (chunk_index % ndata) as i32;
        let disk = geo_map(block, stripe, raid_disks, level, layout) as usize;
        let dev = sources
            .get_mut(disk)
            .and_then(|d| d.as_mut())
            .ok_or_else(|| MdError::NoDevice(format!("member {}", disk)))?;
        let dev_off = offsets[disk] + stripe * chunk_bytes + within;
        let b = &mut buf[..take as usize];
        dev.read_at(dev_off, b)?;
        for (dest, dest_off) in dests.iter_mut() {
            dest.write_at(*dest_off + (pos - start), b)?;
        }
        pos += take;
    }
    for (dest, _) in dests.iter_mut() {
        dest.sync()?;
    }
    Ok(())
}

/// [`save_stripes`] into memory instead of a destination device.
#[allow(clippy::too_many_arguments)]
pub fn read_stripes(
    sources: &mut [Option<BlockDevice>],
    offsets: &[u64],
    raid_disks: i32,
    chunk_bytes: u64,
    level: i32,
    layout: i32,
    start: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let ndata = data_disks(level, raid_disks) as u64;
    let mut out = vec![0u8; length as usize];
    let mut pos = start;
    let end = start + length;
    while pos < end {
        let chunk_index = pos / chunk_bytes;
        let within = pos % chunk_bytes;
        let take = (chunk_bytes - within).min(end - pos);
        let stripe = chunk_index / ndata;
        let block = (chunk_index % ndata) as i32;
        let disk = geo_map(block, stripe, raid_disks, level, layout) as usize;
        let dev = sources
            .get_mut(disk)
            .and_then(|d| d.as_mut())
            .ok_or_else(|| MdError::NoDevice(format!("member {}", disk)))?;
        let at = (pos - start) as usize;
        dev.read_at(
            offsets[disk] + stripe * chunk_bytes + within,
            &mut out[at..at + take as usize],
        )?;
        pos += take;
    }
    Ok(out)
}

/// Inverse of [`save_stripes`]: write `length` bytes read from
/// `source`@`source_off` back into the array's data space at `start`,
/// using the NEW geometry.
#[allow(clippy::too_many_arguments)]
pub fn restore_stripes(
    targets: &mut [Option<BlockDevice>],
    offsets: &[u64],
    raid_disks: i32,
    chunk_bytes: u64,
    level: i32,
    layout: i32,
    source: &mut BlockDevice,
    source_off: u64,
    start: u64,
    length: u64,
) -> Result<()> {
    let ndata = data_disks(level, raid_disks) as u64;
    let mut buf = vec![0u8; chunk_bytes as usize];
    let mut pos = start;
    let end = start + length;
    while pos < end {
        let chunk_index = pos / chunk_bytes;
        let within = pos % chunk_bytes;
        let take = (chunk_bytes - within).min(end - pos);
        let stripe = chunk_index / ndata;
        let block = (chunk_index % ndata) as i32;
        let disk = geo_map(block, stripe, raid_disks, level, layout) as usize;
        let b = &mut buf[..take as usize];
        source.read_at(source_off + (pos - start), b)?;
        let dev = targets
            .get_mut(disk)
            .and_then(|d| d.as_mut())
            .ok_or_else(|| MdError::NoDevice(format!("member {}", disk)))?;
        dev.write_at(offsets[disk] + stripe * chunk_bytes + within, b)?;
        pos += take;
    }
    for t in targets.iter_mut().flatten() {
        t.sync()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raid5_left_symmetric_rotation() {
        // 3 disks: parity walks 2,1,0,2,... and data starts past it
        assert_eq!(geo_map(-1, 0, 3, 5, 2), 2);
        assert_eq!(geo_map(-1, 1, 3, 5, 2), 1);
        assert_eq!(geo_map(-1, 2, 3, 5, 2), 0);
        // stripe 0: data blocks 0,1 on disks 0,1
        assert_eq!(geo_map(0, 0, 3, 5, 2), 0);
        assert_eq!(geo_map(1, 0, 3, 5, 2), 1);
        // stripe 1: parity on 1, data on 2,0
        assert_eq!(geo_map(0, 1, 3, 5, 2), 2);
        assert_eq!(geo_map(1, 1, 3, 5, 2), 0);
    }

    #[test]
    fn raid5_left_asymmetric_skips_parity() {
        // stripe 0, parity on 2: data 0,1 → 0,1
        assert_eq!(geo_map(0, 0, 3, 5, 0), 0);
        assert_eq!(geo_map(1, 0, 3, 5, 0), 1);
        // stripe 1, parity on 1: data 0,1 → 0,2
        assert_eq!(geo_map(0, 1, 3, 5, 0), 0);
        assert_eq!(geo_map(1, 1, 3, 5, 0), 2);
    }

    #[test]
    fn every_slot_claimed_exactly_once() {
        for layout in [0, 1, 2, 3] {
            for stripe in 0..12u64 {
                let mut seen = [false; 5];
                let p = geo_map(-1, stripe, 5, 5, layout) as usize;
                seen[p] = true;
                for b in 0..4 {
                    let d = geo_map(b, stripe, 5, 5, layout) as usize;
                    assert!(!seen[d], "layout {} stripe {} dup disk {}", layout, stripe, d);
                    seen[d] = true;
                }
                assert!(seen.iter().all(|s| *s));
            }
        }
    }

    #[test]
    fn raid6_claims_p_q_and_data_distinctly() {
        for stripe in 0..8u64 {
            let mut seen = [false; 5];
            for b in [-1, -2, 0, 1, 2] {
                let d = geo_map(b, stripe, 5, 6, 2) as usize;
                assert!(!seen[d], "stripe {} block {} dup", stripe, b);
                seen[d] = true;
            }
        }
    }

    fn scratch(len: u64) -> (tempfile::NamedTempFile, BlockDevice) {
        let tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file().set_len(len).unwrap();
        let dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        (tf, dev)
    }

    #[test]
    fn save_then_restore_round_trips() {
        // raid5, 3 disks, 4K chunks: lay down known data per geometry, save
        // a region, scribble, restore, compare
        let chunk = 4096u64;
        let mut files = Vec::new();
        let mut devs: Vec<Option<BlockDevice>> = Vec::new();
        for _ in 0..3 {
            let (tf, dev) = scratch(1 << 20);
            files.push(tf);
            devs.push(Some(dev));
        }
        let offsets = [0u64, 0, 0];
        // array-linear data: 16 chunks of a counting pattern
        let total = 16 * chunk;
        for ci in 0..16u64 {
            let stripe = ci / 2;
            let block = (ci % 2) as i32;
            let disk = geo_map(block, stripe, 3, 5, 2) as usize;
            let data = vec![(ci as u8) ^ 0x5a; chunk as usize];
            devs[disk]
                .as_mut()
                .unwrap()
                .write_at(stripe * chunk, &data)
                .unwrap();
        }
        let (_btf, mut backup) = scratch(1 << 20);
        {
            let mut dests = [(&mut backup, 8192u64)];
            save_stripes(&mut devs, &offsets, 3, chunk, 5, 2, &mut dests, 0, total).unwrap();
        }
        // wipe the data area
        for d in devs.iter_mut().flatten() {
            d.write_at(0, &vec![0u8; (8 * chunk) as usize]).unwrap();
        }
        restore_stripes(&mut devs, &offsets, 3, chunk, 5, 2, &mut backup, 8192, 0, total)
            .unwrap();
        for ci in 0..16u64 {
            let stripe = ci / 2;
            let block = (ci % 2) as i32;
            let disk = geo_map(block, stripe, 3, 5, 2) as usize;
            let mut back = vec![0u8; chunk as usize];
            devs[disk]
                .as_mut()
                .unwrap()
                .read_at(stripe * chunk, &mut back)
                .unwrap();
            assert_eq!(back, vec![(ci as u8) ^ 0x5a; chunk as usize], "chunk {}", ci);
        }
    }
}
