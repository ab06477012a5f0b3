/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::Path;

/**
 * The partitions we create on each disk of the root pool, in on-disk order.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Efi,
    Swap,
    Pool,
}

/**
 * The partition layout of a root pool disk.  Partitions are numbered from 1
 * in the order they are created.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    parts: Vec<Partition>,
}

impl Layout {
    pub fn new(swap: bool) -> Layout {
        let mut parts = vec![Partition::Efi];
        if swap {
            parts.push(Partition::Swap);
        }
        parts.push(Partition::Pool);
        Layout { parts }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.parts
    }

    /**
     * The partition number of the first partition of this type, if the
     * layout has one.
     */
    pub fn number(&self, part: Partition) -> Option<usize> {
        self.parts.iter().position(|p| *p == part).map(|i| i + 1)
    }

    /**
     * The pool member partition is always the last one, as it consumes the
     * rest of the disk.
     */
    pub fn pool_number(&self) -> usize {
        self.parts.len()
    }
}

/**
 * The device path of a partition.  Disks are expected to be given as
 * udev-managed links (e.g., /dev/disk/by-id/...), for which partition links
 * are the disk link with "-partN" appended.
 */
pub fn partition<P: AsRef<Path>>(disk: P, number: usize) -> String {
    format!("{}-part{}", disk.as_ref().display(), number)
}

pub fn sgdisk_zap<P: AsRef<Path>>(disk: P) -> Vec<String> {
    vec![
        "sgdisk".to_string(),
        "--zap-all".to_string(),
        disk.as_ref().display().to_string(),
    ]
}

/**
 * Arguments to sgdisk(8) to append a partition of the given type.  The
 * partition number 0 asks sgdisk for the next free number, so these must be
 * run in layout order.
 */
pub fn sgdisk_new<P: AsRef<Path>>(
    disk: P,
    part: Partition,
    swap_size: &str,
    pool: &str,
) -> Vec<String> {
    let (new, typecode, name) = match part {
        Partition::Efi => (
            "--new=0:1M:+512M".to_string(),
            "EF00",
            "EFI System Partition".to_string(),
        ),
        Partition::Swap => {
            (format!("--new=0:0:+{}", swap_size), "8200", "Swap".to_string())
        }
        Partition::Pool => {
            ("--new=0:0:0".to_string(), "BF00", format!("ZFS Pool {}", pool))
        }
    };

    vec![
        "sgdisk".to_string(),
        new,
        format!("--typecode=0:{}", typecode),
        format!("--change-name=0:{}", name),
        disk.as_ref().display().to_string(),
    ]
}

pub fn blkdiscard<P: AsRef<Path>>(disk: P) -> Vec<String> {
    vec![
        "blkdiscard".to_string(),
        "--force".to_string(),
        disk.as_ref().display().to_string(),
    ]
}

pub fn zero<P: AsRef<Path>>(disk: P) -> Vec<String> {
    vec![
        "dd".to_string(),
        "if=/dev/zero".to_string(),
        format!("of={}", disk.as_ref().display()),
        "bs=4096".to_string(),
        "status=progress".to_string(),
    ]
}
