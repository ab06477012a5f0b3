/*
 * Copyright 2021 Oxide Computer Company
 */

use anyhow::{anyhow, bail, Context, Result};
use slog::info;

use crate::boot;
use crate::config::Config;
use crate::ensure::{Ensure, Exit};
use crate::storage::{self, Pools};
use crate::system;
use crate::target::{self, staged};

/**
 * The steps of an installation, in the order they are performed.  Each step
 * depends on all of those before it.
 */
pub const STEPS: &[&str] = &[
    "live_zfs",
    "disks",
    "pools",
    "boot",
    "packages",
    "configure",
    "firstboot",
    "chroot",
    "snapshot",
    "export",
];

/*
 * How long to wait after a lazy unmount before exporting the pools.
 */
const UNMOUNT_SETTLE_SECS: u64 = 10;

struct Installer<'a> {
    e: &'a Ensure<'a>,
    cfg: &'a Config,
    version: Option<u32>,
    pools: Option<Pools>,
    efi_uuids: Vec<String>,
}

impl Installer<'_> {
    fn version(&self) -> Result<u32> {
        self.version.ok_or_else(|| anyhow!("OS version not yet determined"))
    }

    fn pools(&self) -> Result<&Pools> {
        self.pools.as_ref().ok_or_else(|| anyhow!("pools not yet created"))
    }
}

/**
 * Perform a complete installation as described by the configuration.  The
 * configuration is checked first, before anything is done.  Whether anything
 * really happens depends entirely on the Host behind "e".
 */
pub fn install(e: &Ensure, cfg: &Config) -> Result<()> {
    cfg.check().context("configuration")?;

    let mut ins = Installer {
        e,
        cfg,
        version: None,
        pools: None,
        efi_uuids: Vec::new(),
    };

    for (count, step) in STEPS.iter().enumerate() {
        info!(e.log(), "STEP {}: {}", count, step);

        run_step(&mut ins, step)
            .with_context(|| anyhow!("step {} ({})", count, step))?;

        info!(e.log(), "STEP {} ({}) COMPLETE", count, step);
    }

    Ok(())
}

fn run_step(ins: &mut Installer, step: &str) -> Result<()> {
    let e = ins.e;
    let cfg = ins.cfg;

    match step {
        "live_zfs" => {
            /*
             * SELinux would prevent us from relabelling the new system from
             * within the chroot.  setenforce(8) fails if SELinux is already
             * disabled on the live system.
             */
            e.run(&["setenforce", "0"], Exit::Ignore)?;

            let version = system::os_version(e)?;
            info!(e.log(), "installing release {}", version);
            system::install_live_zfs(e, version)?;
            ins.version = Some(version);
        }
        "disks" => {
            storage::discard_disks(e, cfg)?;
            storage::partition_root_disks(e, cfg)?;
        }
        "pools" => {
            ins.pools = Some(storage::create_pools(e, cfg)?);
        }
        "boot" => {
            let image = boot::fetch_image(e, cfg)?;
            ins.efi_uuids = boot::install(e, cfg, &image)?;
        }
        "packages" => {
            system::rbind_mounts(e, cfg)?;
            system::install_packages(e, cfg, ins.version()?)?;
        }
        "configure" => {
            let key_files = &ins.pools()?.key_files;

            target::write_crypttab(e, cfg)?;
            target::write_fstab(e, cfg, &ins.efi_uuids)?;
            target::write_dracut_conf(e, cfg, key_files)?;
            target::write_list_cache(e, cfg)?;

            e.copy("/etc/hostid", staged(cfg, "/etc"))?;
            for kf in key_files.iter() {
                e.copy(kf, staged(cfg, "/etc/zfs"))?;
            }
        }
        "firstboot" => {
            system::firstboot_and_services(e, cfg)?;
        }
        "chroot" => {
            let root = e.chroot(&cfg.altroot)?;
            info!(e.log(), "now within {}", root.root().display());

            /*
             * Only schedules a relabel for the first boot; fails if the new
             * system has no SELinux policy installed.
             */
            e.run(&["fixfiles", "-F", "onboot"], Exit::Ignore)?;

            for pool in cfg.pools() {
                e.run(&["zpool", "set", "cachefile=/etc/zfs/zpool.cache",
                    pool.name.as_str()], Exit::Check)?;
            }

            system::kernels(e)?;
            system::setup_users(e, cfg)?;
        }
        "snapshot" => {
            let snap = format!("{}@{}-before-first-boot", cfg.root_pool.name,
                chrono::Local::now().format("%Y%m%d"));
            e.run(&["zfs", "snapshot", "-r", snap.as_str()], Exit::Check)?;
        }
        "export" => {
            let altroot = cfg.altroot.display().to_string();
            e.run(&["umount", "--recursive", "--lazy", altroot.as_str()],
                Exit::Check)?;
            e.sleep(UNMOUNT_SETTLE_SECS)?;
            e.run(&["zpool", "export", "-a"], Exit::Check)?;
        }
        x => bail!("INVALID STEP: {}", x),
    }

    Ok(())
}
