/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use slog::info;

use crate::config::{Config, Pool};
use crate::disk::{self, Layout};
use crate::ensure::{Ensure, Exit};
use crate::zfs;

/*
 * There is no reliable way to wait for the kernel to notice new partition
 * tables: partprobe(8), partx(8), "blockdev --rereadpt" and restarting udevd
 * all return before the partition links appear.
 */
const PARTITION_SETTLE_SECS: u64 = 2;

/**
 * What pool creation leaves behind for later steps.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pools {
    /*
     * Key files for every encrypted pool, root pool first.
     */
    pub key_files: Vec<PathBuf>,
    /*
     * The full name of the root file system; e.g., "rpool/ROOT/fedora_x1y2z3".
     */
    pub root_fs: String,
}

pub fn layout(cfg: &Config) -> Layout {
    Layout::new(cfg.swap().is_some())
}

/**
 * Discard the contents of every configured disk and, if requested, overwrite
 * them with zeroes.
 */
pub fn discard_disks(e: &Ensure, cfg: &Config) -> Result<()> {
    for pool in cfg.pools() {
        for disk in pool.disks.iter() {
            /*
             * Not every device supports discard.
             */
            e.run(&disk::blkdiscard(disk), Exit::Ignore)?;
            if cfg.zero_disks {
                /*
                 * dd(1) exits non-zero when it runs off the end of the device,
                 * which is how it always finishes here.
                 */
                e.run(&disk::zero(disk), Exit::Ignore)
                    .with_context(|| format!("zeroing {}", disk.display()))?;
            }
        }
    }

    Ok(())
}

pub fn partition_root_disks(e: &Ensure, cfg: &Config) -> Result<()> {
    let layout = layout(cfg);
    let pool = &cfg.root_pool;

    for disk in pool.disks.iter() {
        info!(e.log(), "partitioning {}", disk.display());

        /*
         * Exits non-zero on a damaged or missing GPT, after wiping it anyway.
         */
        e.run(&disk::sgdisk_zap(disk), Exit::Ignore)?;
        for part in layout.partitions() {
            e.run(&disk::sgdisk_new(disk, *part, &cfg.swap_size, &pool.name),
                Exit::Check)?;
        }
    }

    e.sleep(PARTITION_SETTLE_SECS)
}

/**
 * Create a pool.  If the pool is to be encrypted, the key file is written
 * first as zpool-create(8) reads the passphrase from it.
 */
fn create_pool(
    e: &Ensure,
    pool: &Pool,
    altroot: Option<&Path>,
    devices: &[String],
) -> Result<Option<PathBuf>> {
    info!(e.log(), "creating {} pool {} on {} disk(s)", pool.kind, pool.name,
        devices.len());

    let key_file = zfs::key_file(pool);
    if let Some(kf) = &key_file {
        e.filestr(kf, &format!("{}\n", pool.password))?;
        /*
         * The key file is only ever read by root, and lives in the encrypted
         * pool it unlocks.
         */
        e.mode(kf, 0)?;
    }

    e.run(&zfs::zpool_create(pool, key_file.as_deref(), altroot, devices),
        Exit::Check)
        .with_context(|| format!("creating pool {}", pool.name))?;

    Ok(key_file)
}

fn create_fs(e: &Ensure, pool: &str, fs: &str, props: &[(&str, &str)])
    -> Result<()>
{
    let ds = format!("{}/{}", pool, fs);
    e.run(&zfs::zfs_create(&ds, props), Exit::Check)
        .with_context(|| format!("creating file system {}", ds))
}

/**
 * Create the root pool and every data pool, and then lay out the file systems
 * for the new installation in the root pool.
 */
pub fn create_pools(e: &Ensure, cfg: &Config) -> Result<Pools> {
    /*
     * Refuses to overwrite an existing /etc/hostid, which we then keep.
     */
    e.run(&["zgenhostid"], Exit::Ignore)?;

    let layout = layout(cfg);
    let root = &cfg.root_pool;

    let mut key_files = Vec::new();

    let devices: Vec<_> = root.disks.iter()
        .map(|d| disk::partition(d, layout.pool_number()))
        .collect();
    let altroot = Some(cfg.altroot.as_path());
    key_files.extend(create_pool(e, root, altroot, &devices)?);

    for pool in cfg.data_pools.iter() {
        let devices: Vec<_> = pool.disks.iter()
            .map(|d| d.display().to_string())
            .collect();
        key_files.extend(create_pool(e, pool, None, &devices)?);
    }

    /*
     * The order here matters, as each file system inherits from those
     * created before it.
     */
    create_fs(e, &root.name, "ROOT", &[("mountpoint", "none")])?;

    let root_fs = zfs::root_fs(&zfs::root_suffix());
    create_fs(e, &root.name, &root_fs, &[
        ("mountpoint", "/"),
        ("canmount", "noauto"),
        ("org.zfsbootmenu:rootprefix", "root=zfs:"),
        ("org.zfsbootmenu:commandline", "ro quiet"),
    ])?;
    let root_fs = format!("{}/{}", root.name, root_fs);
    info!(e.log(), "root file system: {}", root_fs);

    let bootfs = format!("bootfs={}", root_fs);
    e.run(&["zfs", "mount", root_fs.as_str()], Exit::Check)?;
    e.run(&["zpool", "set", bootfs.as_str(), root.name.as_str()],
        Exit::Check)?;

    create_fs(e, &root.name, "home", &[("mountpoint", "/home")])?;
    create_fs(e, &root.name, "home/root", &[("mountpoint", "/root")])?;
    for user in cfg.users.iter() {
        create_fs(e, &root.name, &format!("home/{}", user.name), &[])?;
    }

    Ok(Pools { key_files, root_fs })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::test::{config, pool, user};
    use crate::ensure::test::discard;
    use crate::ensure::{Action, Simulate};

    fn runs(sim: &Simulate) -> Vec<Vec<String>> {
        sim.actions().into_iter().filter_map(|a| match a {
            Action::Run { args, .. } => Some(args),
            _ => None,
        }).collect()
    }

    fn is(args: &[String], prefix: &[&str]) -> bool {
        args.len() >= prefix.len()
            && args.iter().zip(prefix).all(|(a, p)| a == p)
    }

    fn sgdisk_new(runs: &[Vec<String>], disk: &str) -> Vec<Vec<String>> {
        runs.iter()
            .filter(|a| is(a, &["sgdisk"]) && a[1].starts_with("--new"))
            .filter(|a| a.last().map(String::as_str) == Some(disk))
            .cloned()
            .collect()
    }

    #[test]
    fn three_partitions_with_swap() {
        let mut c = config();
        c.root_pool = pool("rpool", "mirror", &["/dev/a", "/dev/b"]);

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        partition_root_disks(&e, &c).unwrap();

        let r = runs(&sim);
        for disk in ["/dev/a", "/dev/b"] {
            let parts = sgdisk_new(&r, disk);
            assert_eq!(parts.len(), 3);

            /*
             * The pool member partition is last on each disk.
             */
            assert_eq!(parts[0][2], "--typecode=0:EF00");
            assert_eq!(parts[1][2], "--typecode=0:8200");
            assert_eq!(parts[2][2], "--typecode=0:BF00");
        }

        assert_eq!(sim.actions().last(),
            Some(&Action::Sleep(std::time::Duration::from_secs(2))));
    }

    #[test]
    fn two_partitions_without_swap() {
        let mut c = config();
        c.swap_size = String::new();

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        partition_root_disks(&e, &c).unwrap();

        let disk = c.root_pool.disks[0].display().to_string();
        let r = runs(&sim);
        let parts = sgdisk_new(&r, &disk);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1][2], "--typecode=0:BF00");
        assert!(r.iter().all(|a| !a.iter().any(|x| x.contains("8200"))));
    }

    #[test]
    fn zap_precedes_new() {
        let c = config();
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        partition_root_disks(&e, &c).unwrap();
        assert_eq!(runs(&sim)[0][1], "--zap-all");
    }

    #[test]
    fn data_disks_not_partitioned() {
        let mut c = config();
        c.data_pools.push(pool("tank", "mirror", &["/dev/x", "/dev/y"]));
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        partition_root_disks(&e, &c).unwrap();
        assert!(runs(&sim).iter().all(|a| !a.contains(&"/dev/x".to_string())));
    }

    #[test]
    fn zeroing_is_optional() {
        let mut c = config();
        c.data_pools.push(pool("tank", "mirror", &["/dev/x", "/dev/y"]));

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        discard_disks(&e, &c).unwrap();
        assert_eq!(sim.actions().len(), 3);
        assert!(sim.actions().iter().all(|a| matches!(a,
            Action::Run { exit: Exit::Ignore, .. })));

        c.zero_disks = true;
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        discard_disks(&e, &c).unwrap();
        let zero: Vec<_> = sim.actions().into_iter().filter(|a| matches!(a,
            Action::Run { args, .. } if args[0] == "dd")).collect();
        assert_eq!(zero.len(), 3);
        assert_eq!(sim.actions().len(), 6);
    }

    #[test]
    fn key_file_before_create() {
        let mut c = config();
        c.root_pool.password = "secret".to_string();

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        let pools = create_pools(&e, &c).unwrap();
        assert_eq!(pools.key_files, vec![PathBuf::from("/etc/zfs/rpool.key")]);

        let acts = sim.actions();
        let write = acts.iter().position(|a| *a == Action::Write {
            path: "/etc/zfs/rpool.key".into(),
            contents: "secret\n".into(),
        }).unwrap();
        let chmod = acts.iter().position(|a| *a == Action::Mode {
            path: "/etc/zfs/rpool.key".into(),
            mode: 0,
        }).unwrap();
        let create = acts.iter().position(|a| matches!(a,
            Action::Run { args, .. } if is(args, &["zpool", "create"])))
            .unwrap();
        assert!(write < chmod);
        assert!(chmod < create);

        if let Action::Run { args, .. } = &acts[create] {
            assert!(args.contains(&"encryption=aes-256-gcm".to_string()));
            assert!(args.contains(&"keyformat=passphrase".to_string()));
            assert!(args.contains(
                &"keylocation=file:///etc/zfs/rpool.key".to_string()));
            assert!(args.contains(&"-R".to_string()));
            assert_eq!(args.last().unwrap(),
                "/dev/disk/by-path/pci-0000:05:00.0-part3");
        }
    }

    #[test]
    fn unencrypted_has_no_key() {
        let c = config();
        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        let pools = create_pools(&e, &c).unwrap();
        assert!(pools.key_files.is_empty());

        for a in sim.actions() {
            match &a {
                Action::Write { .. } | Action::Mode { .. } => {
                    panic!("unexpected {:?}", a);
                }
                Action::Run { args, .. } => {
                    assert!(args.iter().all(|x| !x.starts_with("encryption=")
                        && !x.starts_with("keyformat=")
                        && !x.starts_with("keylocation=")));
                }
                _ => (),
            }
        }
    }

    #[test]
    fn data_pool_whole_disks_after_root() {
        let mut c = config();
        c.swap_size = String::new();
        let mut tank = pool("tank", "mirror", &["/dev/x", "/dev/y"]);
        tank.password = "p".to_string();
        c.data_pools.push(tank);

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        let pools = create_pools(&e, &c).unwrap();
        assert_eq!(pools.key_files, vec![PathBuf::from("/etc/zfs/tank.key")]);

        let creates: Vec<_> = runs(&sim).into_iter()
            .filter(|a| is(a, &["zpool", "create"]))
            .collect();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0].last().unwrap(),
            "/dev/disk/by-path/pci-0000:05:00.0-part2");
        assert!(!creates[1].contains(&"-R".to_string()));
        let n = creates[1].len();
        assert_eq!(creates[1][n - 4..], ["tank", "mirror", "/dev/x", "/dev/y"]);
    }

    #[test]
    fn file_system_order() {
        let mut c = config();
        c.users.push(user("alice"));
        c.users.push(user("bob"));

        let sim = Simulate::default();
        let e = Ensure::new(&discard(), &sim);
        let pools = create_pools(&e, &c).unwrap();
        assert!(pools.root_fs.starts_with("rpool/ROOT/fedora_"));

        let r = runs(&sim);
        let created: Vec<_> = r.iter()
            .filter(|a| is(a, &["zfs", "create"]))
            .map(|a| a.last().unwrap().as_str())
            .collect();
        assert_eq!(created, vec![
            "rpool/ROOT",
            pools.root_fs.as_str(),
            "rpool/home",
            "rpool/home/root",
            "rpool/home/alice",
            "rpool/home/bob",
        ]);

        let mount = r.iter().position(|a| is(a, &["zfs", "mount"])).unwrap();
        let bootfs = r.iter().position(|a| is(a, &["zpool", "set"])).unwrap();
        let home = r.iter()
            .position(|a| a.last().unwrap() == "rpool/home").unwrap();
        assert_eq!(r[mount][2], pools.root_fs);
        assert_eq!(r[bootfs][2], format!("bootfs={}", pools.root_fs));
        assert!(mount < bootfs && bootfs < home);

        let rootfs = r.iter()
            .find(|a| a.last().unwrap() == &pools.root_fs).unwrap();
        assert!(rootfs.contains(&"canmount=noauto".to_string()));
        assert!(rootfs.contains(&"mountpoint=/".to_string()));
    }
}
