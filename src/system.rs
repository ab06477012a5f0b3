/*
 * Copyright 2021 Oxide Computer Company
 */

use std::path::Path;

use anyhow::{Context, Result};
use slog::info;

use crate::config::{Config, User};
use crate::ensure::{Ensure, Exit};
use crate::target::staged;

/*
 * The newest Fedora release for which the ZFS project publishes packages.
 * Later releases use the repository for this one.
 */
const NEWEST_ZFS_RELEASE: u32 = 37;

const ZFS_REPO: &str = "/etc/yum.repos.d/zfs.repo";

/**
 * Services to enable in the new system.
 */
const SERVICES: &[&str] = &[
    "systemd-timesyncd",
    "zfs-import-cache",
    "zfs-zed",
    "zfs-import.target",
    "zfs.target",
];

/**
 * Determine the release of the running (live) system; e.g., 36 for Fedora 36.
 * The new system is installed with the same release.
 */
pub fn os_version(e: &Ensure) -> Result<u32> {
    let v = e.shell_output(&[". /etc/os-release; echo \"$VERSION_ID\""],
        "36")?;
    v.parse::<u32>()
        .with_context(|| format!("unexpected VERSION_ID {:?}", v))
}

pub fn zfs_release_rpm(version: u32) -> String {
    format!("https://zfsonlinux.org/fedora/zfs-release-2-2.fc{}.noarch.rpm",
        version.min(NEWEST_ZFS_RELEASE))
}

pub fn dnf_install<S: AsRef<str>>(
    packages: &[S],
    installroot: Option<&Path>,
    releasever: Option<u32>,
) -> Vec<String> {
    let mut args = vec!["dnf".to_string(), "install".to_string(),
        "--assumeyes".to_string()];
    if let Some(root) = installroot {
        args.push(format!("--installroot={}", root.display()));
    }
    if let Some(rv) = releasever {
        args.push(format!("--releasever={}", rv));
    }
    args.extend(packages.iter().map(|p| p.as_ref().to_string()));
    args
}

/*
 * The ZFS repository configuration refers to $releasever, for which there may
 * not yet be a ZFS repository.
 */
fn pin_zfs_repo(e: &Ensure, version: u32, repo: &Path) -> Result<()> {
    if version > NEWEST_ZFS_RELEASE {
        let expr = format!("s/$releasever/{}/g", NEWEST_ZFS_RELEASE);
        let repo = repo.display().to_string();
        e.run(&["sed", "--in-place", expr.as_str(), repo.as_str()],
            Exit::Check)?;
    }
    Ok(())
}

/**
 * Make ZFS available in the live environment we are running in, so that we
 * can create pools.
 */
pub fn install_live_zfs(e: &Ensure, version: u32) -> Result<()> {
    /*
     * Conflicts with the zfs package, and is not always installed.
     */
    e.run(&["rpm", "--erase", "--nodeps", "zfs-fuse"], Exit::Ignore)?;

    e.run(&dnf_install(&[zfs_release_rpm(version)], None, None), Exit::Check)
        .context("installing ZFS repository")?;
    pin_zfs_repo(e, version, Path::new(ZFS_REPO))?;

    let release = e.output(&["uname", "--kernel-release"],
        "5.17.5-300.fc36.x86_64")?;
    let devel = format!("kernel-devel-{}", release);
    e.run(&dnf_install(&[devel.as_str(), "zfs"], None, None), Exit::Check)
        .context("installing ZFS")?;

    e.run(&["modprobe", "zfs"], Exit::Check)
}

/**
 * The packages installed into the new system, before any configured extras.
 */
pub fn base_packages(cfg: &Config, version: u32) -> Result<Vec<String>> {
    let mut pkgs = vec![zfs_release_rpm(version)];
    pkgs.extend([
        "@core",
        "kernel",
        "kernel-devel",
        "kexec-tools",
        "efibootmgr",
        "glibc-minimal-langpack",
    ].iter().map(|s| s.to_string()));
    pkgs.push(format!("glibc-langpack-{}", cfg.locale_lang()?));
    pkgs.push("zfs".to_string());
    pkgs.push("zfs-dracut".to_string());
    Ok(pkgs)
}

pub fn install_packages(e: &Ensure, cfg: &Config, version: u32) -> Result<()> {
    let mut pkgs = base_packages(cfg, version)?;
    pkgs.extend(cfg.packages.iter().cloned());

    e.run(&dnf_install(&pkgs, Some(cfg.altroot.as_path()), Some(version)),
        Exit::Check)
        .context("installing packages into new system")?;

    pin_zfs_repo(e, version, &staged(cfg, ZFS_REPO))
}

/**
 * Make the devices, processes and kernel interfaces of the live system
 * visible inside the new one, for the package scriptlets and for the steps
 * we run within the chroot.
 */
pub fn rbind_mounts(e: &Ensure, cfg: &Config) -> Result<()> {
    for dir in ["dev", "proc", "sys"] {
        let src = format!("/{}", dir);
        let dst = cfg.altroot.join(dir);
        let dstr = dst.display().to_string();
        e.directory(&dst)?;
        e.run(&["mount", "--rbind", src.as_str(), dstr.as_str()],
            Exit::Check)?;
    }
    Ok(())
}

pub fn firstboot_and_services(e: &Ensure, cfg: &Config) -> Result<()> {
    let root = format!("--root={}", cfg.altroot.display());

    /*
     * systemd-firstboot(1) will not replace an existing time zone link, even
     * with --force.
     */
    e.removed(staged(cfg, "/etc/localtime"))?;

    e.run(&[
        "systemd-firstboot".to_string(),
        root.clone(),
        format!("--locale={}", cfg.locale),
        format!("--locale-messages={}", cfg.locale),
        format!("--keymap={}", cfg.keymap),
        format!("--timezone={}", cfg.timezone),
        format!("--hostname={}", cfg.hostname),
        "--force".to_string(),
    ], Exit::Check)?;

    let mut args = vec!["systemctl".to_string(), root, "enable".to_string()];
    args.extend(SERVICES.iter().map(|s| s.to_string()));
    e.run(&args, Exit::Check)
}

/**
 * Build the ZFS kernel modules and an initramfs for every kernel installed in
 * the new system.  Must be run within the chroot.
 */
pub fn kernels(e: &Ensure) -> Result<()> {
    let list = e.output(&["rpm", "--query", "kernel"],
        "kernel-5.17.5-200.fc35.x86_64")?;

    for pkg in list.lines() {
        let v = pkg.trim().trim_start_matches("kernel-");
        if v.is_empty() {
            continue;
        }
        let image = format!("/usr/lib/modules/{}/vmlinuz", v);
        e.run(&["kernel-install", "add", v, image.as_str()], Exit::Check)
            .with_context(|| format!("installing kernel {}", v))?;
    }

    Ok(())
}

pub fn useradd(user: &User) -> Vec<String> {
    let mut args = vec!["useradd".to_string(), "--user-group".to_string()];
    if user.wheel {
        args.push("--groups".to_string());
        args.push("wheel".to_string());
    }
    if !user.comment.is_empty() {
        args.push("--comment".to_string());
        args.push(user.comment.to_string());
    }
    args.push("--no-create-home".to_string());
    args.push("--home-dir".to_string());
    args.push(format!("/home/{}", user.name));
    args.push(user.name.to_string());
    args
}

/**
 * Set the root password (or lock the account) and create each user with a
 * home directory on its own file system.  Must be run within the chroot, as
 * the users exist only in the new system.
 */
pub fn setup_users(e: &Ensure, cfg: &Config) -> Result<()> {
    if cfg.root_password.is_empty() {
        e.run(&["passwd", "--lock", "root"], Exit::Check)?;
    } else {
        e.passwd("root", &cfg.root_password)?;
    }

    for user in cfg.users.iter() {
        info!(e.log(), "creating user {}", user.name);

        let home = format!("/home/{}", user.name);
        let fs = format!("{}/home/{}", cfg.root_pool.name, user.name);

        e.run(&useradd(user), Exit::Check)
            .with_context(|| format!("creating user {}", user.name))?;
        e.run(&["zfs", "allow", "-u", user.name.as_str(),
            "mount,snapshot,destroy", fs.as_str()], Exit::Check)?;

        e.copy_tree("/etc/skel", &home)?;
        e.owner(&home, &user.name, &user.name, true)?;
        e.mode(&home, 0o700)?;
        e.run(&["restorecon", home.as_str()], Exit::Check)?;

        if user.password.is_empty() {
            e.run(&["passwd", user.name.as_str(), "--delete"], Exit::Check)?;
        } else {
            e.passwd(&user.name, &user.password)?;
        }
    }

    Ok(())
}
