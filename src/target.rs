/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::boot;
use crate::config::Config;
use crate::disk::{self, Partition};
use crate::ensure::Ensure;
use crate::storage;
use crate::zfs;

/**
 * The ZFS event daemon script that maintains the zfs-list.cache files.  We
 * take the list of cached properties from it.
 */
pub const LIST_CACHER: &str = "/etc/zfs/zed.d/history_event-zfs-list-cacher.sh";

/*
 * What the script looks like, for when we are not really reading it.
 */
const LIST_CACHER_PLACEHOLDER: &str = "\
PROPS=\"name,mountpoint,canmount,atime,relatime,devices,exec\\
,readonly,setuid,nbmand,encroot,keylocation\\
,org.openzfs.systemd:requires,org.openzfs.systemd:requires-mounts-for\\
,org.openzfs.systemd:before,org.openzfs.systemd:after\\
,org.openzfs.systemd:wanted-by,org.openzfs.systemd:required-by\\
,org.openzfs.systemd:nofail,org.openzfs.systemd:ignore\"
";

/**
 * A path within the staged root of the new system.
 */
pub fn staged<P: AsRef<Path>>(cfg: &Config, path: P) -> PathBuf {
    let p = path.as_ref();
    cfg.altroot.join(p.strip_prefix("/").unwrap_or(p))
}

fn cryptswap(n: usize) -> String {
    format!("cryptswap{}", n + 1)
}

/**
 * The swap partition on each root pool disk is encrypted with a fresh random
 * key on every boot, so nothing written to swap survives a reboot.  Returns
 * None if no swap is configured.
 */
pub fn crypttab(cfg: &Config) -> Option<String> {
    let swapnum = storage::layout(cfg).number(Partition::Swap)?;

    let mut out = String::new();
    for (n, disk) in cfg.root_pool.disks.iter().enumerate() {
        out += &format!("{} {} /dev/urandom \
            swap,cipher=aes-xts-plain64:sha256,size=256,discard\n",
            cryptswap(n), disk::partition(disk, swapnum));
    }
    Some(out)
}

pub fn fstab(cfg: &Config, efi_uuids: &[String]) -> String {
    let mut out = String::new();

    for uuid in efi_uuids.iter() {
        out += &format!("/dev/disk/by-uuid/{} {} \
            vfat umask=0077,shortname=winnt,nofail 0 2\n",
            uuid, boot::efi_dir(uuid));
    }

    if cfg.swap().is_some() {
        for n in 0..cfg.root_pool.disks.len() {
            out += &format!("/dev/mapper/{} none swap \
                x-systemd.requires=cryptsetup.target,defaults 0 0\n",
                cryptswap(n));
        }
    }

    out
}

/**
 * Configuration for dracut(8) to include the ZFS module, and the pool key
 * files so that the pools can be unlocked from the initramfs without asking
 * for the passphrase a second time.
 */
pub fn dracut_conf(key_files: &[PathBuf]) -> String {
    let mut out = "add_dracutmodules+=\" zfs \"\n".to_string();
    if !key_files.is_empty() {
        let files = key_files.iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        out += &format!("install_items+=\" {} \"\n", files);
    }
    out
}

pub fn write_crypttab(e: &Ensure, cfg: &Config) -> Result<()> {
    if let Some(contents) = crypttab(cfg) {
        e.filestr(staged(cfg, "/etc/crypttab"), &contents)?;
    }
    Ok(())
}

pub fn write_fstab(e: &Ensure, cfg: &Config, efi_uuids: &[String])
    -> Result<()>
{
    e.filestr(staged(cfg, "/etc/fstab"), &fstab(cfg, efi_uuids))
}

pub fn write_dracut_conf(e: &Ensure, cfg: &Config, key_files: &[PathBuf])
    -> Result<()>
{
    e.filestr(staged(cfg, "/etc/dracut.conf.d/zfs.conf"),
        &dracut_conf(key_files))
}

/**
 * Populate /etc/zfs/zfs-list.cache in the new system, from which
 * zfs-mount-generator(8) creates mount units at boot.  The ZFS event daemon
 * keeps these files up to date once the system is running, but it is not
 * running inside our staged root.
 */
pub fn write_list_cache(e: &Ensure, cfg: &Config) -> Result<()> {
    let script = e.read(LIST_CACHER, LIST_CACHER_PLACEHOLDER)?;
    let props = zfs::list_cache_props(&script)
        .with_context(|| format!("parsing {}", LIST_CACHER))?;

    let dir = staged(cfg, "/etc/zfs/zfs-list.cache");
    e.directory(&dir)?;

    for pool in cfg.pools() {
        let placeholder = format!("{}\t/\toff\ton\ton\ton\ton\toff\ton\toff\t\
            {}\tprompt\t-\t-\t-\t-\t-\t-\t-\t-", pool.name, pool.name);
        let mut list = e.output(&zfs::zfs_list(&pool.name, &props),
            &placeholder)?;

        if pool.name == cfg.root_pool.name {
            list = zfs::strip_altroot(&list, &cfg.altroot);
        }

        e.filestr(dir.join(&pool.name), &list)?;
    }

    Ok(())
}
