//! Small shared helpers.

pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

/// "md3" / "md_d2" style kernel names from a device number (negative =
/// partitionable).
pub fn devnum_to_name(devnum: i32) -> String {
    if devnum < 0 {
        format!("md_d{}", -1 - devnum)
    } else {
        format!("md{}", devnum)
    }
}

pub fn devnum_from_name(name: &str) -> Option<i32> {
    if let Some(n) = name.strip_prefix("md_d") {
        return n.parse::<i32>().ok().map(|n| -1 - n);
    }
    name.strip_prefix("md")?.parse::<i32>().ok()
}

pub fn check_env(name: &str) -> bool {
    std::env::var_os(name).map_or(false, |v| !v.is_empty() && v != "0")
}

pub fn human_size(bytes: u64) -> String {
    if bytes >= 100 * 1024 * 1024 * 1024 {
        format!("{:.2} TiB", bytes as f64 / (1u64 << 40) as f64)
    } else if bytes >= 100 * 1024 * 1024 {
        format!("{:.2} GiB", bytes as f64 / (1u64 << 30) as f64)
    } else {
        format!("{:.2} MiB", bytes as f64 / (1u64 << 20) as f64)
    }
}

/// Greatest common divisor, used for critical-section sizing.
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

pub fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        0
    } else {
        a / gcd(a, b) * b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnum_names() {
        assert_eq!(devnum_to_name(127), "md127");
        assert_eq!(devnum_to_name(-3), "md_d2");
        assert_eq!(devnum_from_name("md127"), Some(127));
        assert_eq!(devnum_from_name("md_d2"), Some(-3));
        assert_eq!(devnum_from_name("sda"), None);
    }

    #[test]
    fn lcm_of_stripe_widths() {
        // 64K chunks: 2 data disks vs 3 data disks, in sectors
        assert_eq!(lcm(128 * 2, 128 * 3), 768);
        assert_eq!(gcd(128 * 2, 128 * 3), 128);
    }
}
