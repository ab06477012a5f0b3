/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use uuid::Uuid;

use crate::config::{Kind, Pool};

pub const ENCRYPTION: &str = "aes-256-gcm";

/**
 * Where the key file for an encrypted pool lives, both on the live system
 * and in the installed one.
 */
pub fn key_file(pool: &Pool) -> Option<PathBuf> {
    if pool.encrypted() {
        Some(PathBuf::from(format!("/etc/zfs/{}.key", pool.name)))
    } else {
        None
    }
}

/**
 * Construct the arguments for zpool-create(8).  The "devices" are the vdev
 * members, already resolved to whole disks or partitions by the caller.
 */
pub fn zpool_create(
    pool: &Pool,
    key_file: Option<&Path>,
    altroot: Option<&Path>,
    devices: &[String],
) -> Vec<String> {
    let mut args = vec!["zpool".to_string(), "create".to_string(),
        "-f".to_string()];

    for (k, v) in pool.pool_properties.iter() {
        args.push("-o".to_string());
        args.push(format!("{}={}", k, v));
    }
    for (k, v) in pool.filesystem_properties.iter() {
        args.push("-O".to_string());
        args.push(format!("{}={}", k, v));
    }
    if let Some(kf) = key_file {
        args.push("-O".to_string());
        args.push(format!("encryption={}", ENCRYPTION));
        args.push("-O".to_string());
        args.push("keyformat=passphrase".to_string());
        args.push("-O".to_string());
        args.push(format!("keylocation=file://{}", kf.display()));
    }
    if let Some(mp) = &pool.mountpoint {
        args.push("-m".to_string());
        args.push(mp.to_string());
    }
    if let Some(altroot) = altroot {
        /*
         * Mount everything in the pool underneath the altroot, and keep the
         * pool out of the system cache file while we work on it.
         */
        args.push("-R".to_string());
        args.push(altroot.display().to_string());
    }

    args.push(pool.name.to_string());
    if let Kind::Vdev(v) = &pool.kind {
        args.push(v.to_string());
    }
    args.extend(devices.iter().cloned());

    args
}

pub fn zfs_create(dataset: &str, props: &[(&str, &str)]) -> Vec<String> {
    let mut args = vec!["zfs".to_string(), "create".to_string()];
    for (k, v) in props {
        args.push("-o".to_string());
        args.push(format!("{}={}", k, v));
    }
    args.push(dataset.to_string());
    args
}

/**
 * Six lowercase alphanumeric characters to make the name of the root file
 * system unique, so that more than one installation can share a pool.
 */
pub fn root_suffix() -> String {
    suffix_from(Uuid::new_v4().as_bytes())
}

const SUFFIX_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn suffix_from(bytes: &[u8]) -> String {
    bytes.iter()
        .take(6)
        .map(|b| SUFFIX_CHARS[*b as usize % SUFFIX_CHARS.len()] as char)
        .collect()
}

pub fn root_fs(suffix: &str) -> String {
    format!("ROOT/fedora_{}", suffix)
}

/**
 * Extract the property list used by the ZFS event daemon to maintain
 * /etc/zfs/zfs-list.cache from the text of its history_event-zfs-list-cacher
 * script.  The zfs-mount-generator(8) expects exactly these columns, so we
 * must not maintain our own copy of the list.
 */
pub fn list_cache_props(script: &str) -> Result<String> {
    let joined = script.replace("\\\n", "");

    let mut props = None;
    for l in joined.lines() {
        if let Some(rest) = l.strip_prefix("PROPS=\"") {
            props = rest.strip_suffix('"').map(str::to_string);
        }
    }

    match props {
        Some(p) if !p.is_empty() => Ok(p),
        _ => bail!("could not determine properties for zfs-list.cache"),
    }
}

pub fn zfs_list(pool: &str, props: &str) -> Vec<String> {
    ["zfs", "list", "-H", "-r", "-t", "filesystem", "-o", props, pool]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/**
 * The mountpoint column of "zfs list" includes the altroot of the pool.  The
 * installed system will import the pool without one, so strip it.
 */
pub fn strip_altroot(list: &str, altroot: &Path) -> String {
    let altroot = altroot.components().collect::<PathBuf>();
    let altroot = altroot.display().to_string();
    list.replace(&format!("{}/", altroot), "/")
        .replace(&format!("{}\t", altroot), "/\t")
}
