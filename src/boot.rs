/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use slog::info;

use crate::config::Config;
use crate::disk::{self, Partition};
use crate::ensure::{Ensure, Exit};
use crate::storage;

/**
 * Where the EFI System Partition of each root pool disk is mounted in the
 * installed system; each gets a directory named for its file system UUID.
 */
pub const EFIS_DIR: &str = "/boot/efis";

pub fn efi_dir(uuid: &str) -> String {
    format!("{}/{}", EFIS_DIR, uuid)
}

/**
 * Placeholder UUID for the EFI System Partition of the n-th disk, used when
 * we do not really format anything.  Each disk gets a distinct value so that
 * a dry run shows one boot entry per disk.
 */
fn placeholder_uuid(n: usize) -> String {
    format!("A48C-{:04X}", 0x0D61 + n)
}

pub fn mkfs_efi(part: &str) -> Vec<String> {
    ["mkfs.fat", "-F", "32", "-s", "1", "-n", "EFI", part]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn blkid_uuid(part: &str) -> Vec<String> {
    ["blkid", "--match-tag", "UUID", "--output", "value", part]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/**
 * Arguments to efibootmgr(8) to add a firmware boot entry that loads the
 * image from the EFI System Partition of this disk.
 */
pub fn efibootmgr<P: AsRef<Path>>(
    disk: P,
    part: usize,
    uuid: &str,
    image: &str,
) -> Vec<String> {
    vec![
        "efibootmgr".to_string(),
        "--create".to_string(),
        "--disk".to_string(),
        disk.as_ref().display().to_string(),
        "--part".to_string(),
        part.to_string(),
        "--label".to_string(),
        format!("ZFSBootMenu ({})", uuid),
        "--loader".to_string(),
        format!("\\{}", image),
    ]
}

/**
 * Download the boot manager image into the current directory and return its
 * path.  The server names the file (e.g., "zfsbootmenu-release-x86_64-...")
 * so we must go looking for it afterwards.
 */
pub fn fetch_image(e: &Ensure, cfg: &Config) -> Result<PathBuf> {
    e.run(&[
        "curl",
        "--remote-name",
        "--remote-header-name",
        "--location",
        cfg.boot_image_url.as_str(),
    ], Exit::Check).context("downloading boot image")?;

    e.find("zfsbootmenu-*", "zfsbootmenu.efi")
}

/**
 * Format the EFI System Partition of every root pool disk, install the boot
 * manager image on each, and register each with the firmware.  Every disk is
 * independently bootable, so the system survives the loss of any one of them.
 * Returns the file system UUID of each EFI System Partition, in disk order.
 */
pub fn install(e: &Ensure, cfg: &Config, image: &Path) -> Result<Vec<String>> {
    let layout = storage::layout(cfg);
    let efinum = layout.number(Partition::Efi)
        .ok_or_else(|| anyhow!("no EFI System Partition in layout"))?;
    let name = image.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad image path {}", image.display()))?;

    let mut uuids = Vec::new();
    for (n, disk) in cfg.root_pool.disks.iter().enumerate() {
        let part = disk::partition(disk, efinum);

        e.run(&mkfs_efi(&part), Exit::Check)?;

        let uuid = e.output(&blkid_uuid(&part), &placeholder_uuid(n))?;
        if uuid.is_empty() || uuid.contains(|c: char| c.is_whitespace()) {
            bail!("unexpected UUID {:?} for {}", uuid, part);
        }
        info!(e.log(), "EFI System Partition {} has UUID {}", part, uuid);

        let dir = cfg.altroot.join(efi_dir(&uuid).trim_start_matches('/'));
        let mp = dir.display().to_string();
        e.directory(&dir)?;
        e.run(&["mount", part.as_str(), mp.as_str()], Exit::Check)?;
        e.copy(image, &dir)?;

        e.run(&efibootmgr(disk, efinum, &uuid, name), Exit::Check)
            .with_context(|| format!("registering boot entry for {}",
                disk.display()))?;

        uuids.push(uuid);
    }

    Ok(uuids)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test::{config, pool};
    use crate::ensure::test::discard;
    use crate::ensure::{Action, Simulate};

    #[test]
    fn one_entry_per_disk() {
        let mut c = config();
        c.root_pool = pool("rpool", "raidz1", &["/dev/a", "/dev/b", "/dev/c"]);

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        let image = fetch_image(&e, &c).unwrap();
        let uuids = install(&e, &c, &image).unwrap();

        assert_eq!(uuids, vec!["A48C-0D61", "A48C-0D62", "A48C-0D63"]);

        let acts = sim.actions();
        let boot: Vec<_> = acts.iter().filter_map(|a| match a {
            Action::Run { args, .. } if args[0] == "efibootmgr" => Some(args),
            _ => None,
        }).collect();
        assert_eq!(boot.len(), 3);
        assert_eq!(boot[1][3], "/dev/b");
        assert_eq!(boot[1][7], "ZFSBootMenu (A48C-0D62)");
        assert_eq!(boot[1][9], "\\zfsbootmenu.efi");

        assert!(acts.contains(&Action::Directory(
            PathBuf::from("/rpool/boot/efis/A48C-0D63"))));
        assert!(acts.contains(&Action::Copy {
            src: PathBuf::from("zfsbootmenu.efi"),
            dst: PathBuf::from("/rpool/boot/efis/A48C-0D61"),
            recursive: false,
        }));
    }

    #[test]
    fn format_mount_then_register() {
        let c = config();
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        install(&e, &c, Path::new("zfsbootmenu.efi")).unwrap();

        let first: Vec<_> = sim.actions().iter().map(|a| match a {
            Action::Run { args, .. } | Action::Output { args, .. } => {
                args[0].clone()
            }
            Action::Directory(_) => "mkdir".to_string(),
            Action::Copy { .. } => "cp".to_string(),
            other => panic!("unexpected {:?}", other),
        }).collect();
        assert_eq!(first, vec![
            "mkfs.fat", "blkid", "mkdir", "mount", "cp", "efibootmgr",
        ]);
    }

    #[test]
    fn efi_partition_is_first() {
        let c = config();
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        install(&e, &c, Path::new("zfsbootmenu.efi")).unwrap();
        assert_eq!(sim.actions()[0], Action::Run {
            args: mkfs_efi("/dev/disk/by-path/pci-0000:05:00.0-part1"),
            exit: Exit::Check,
        });
    }
}
