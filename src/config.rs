/*
 * Copyright 2021 Oxide Computer Company
 */

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/**
 * The vdev layout of a pool: either a single disk, or one of the redundant
 * layouts understood by zpool(8) (e.g., "mirror", "raidz1") which require at
 * least two disks.
 */
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Kind {
    Single,
    Vdev(String),
}

impl From<String> for Kind {
    fn from(s: String) -> Kind {
        if s == "single" {
            Kind::Single
        } else {
            Kind::Vdev(s)
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Single => write!(f, "single"),
            Kind::Vdev(v) => write!(f, "{}", v),
        }
    }
}

impl Default for Kind {
    fn default() -> Kind {
        Kind::Single
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Pool {
    pub name: String,
    pub disks: Vec<PathBuf>,
    /*
     * A path, or one of the special values "none" or "legacy".
     */
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub pool_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub filesystem_properties: BTreeMap<String, String>,
}

impl Pool {
    pub fn encrypted(&self) -> bool {
        !self.password.is_empty()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub wheel: bool,
}

fn default_true() -> bool {
    true
}

fn default_swap_size() -> String {
    "1G".to_string()
}

fn default_locale() -> String {
    "en_US.UTF-8".to_string()
}

fn default_keymap() -> String {
    "us".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_altroot() -> PathBuf {
    PathBuf::from("/rpool")
}

fn default_boot_image_url() -> String {
    "https://get.zfsbootmenu.org/efi".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub root_pool: Pool,
    #[serde(default)]
    pub data_pools: Vec<Pool>,
    /*
     * Size of the swap partition on each root pool disk, in a form sgdisk(8)
     * understands.  The empty string means no swap.
     */
    #[serde(default = "default_swap_size")]
    pub swap_size: String,
    /*
     * The empty string locks the root account.
     */
    #[serde(default)]
    pub root_password: String,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_keymap")]
    pub keymap: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub zero_disks: bool,
    #[serde(default = "default_true")]
    pub dry_mode: bool,
    /*
     * Where the new system is assembled; the root pool is created with this
     * as its altroot.
     */
    #[serde(default = "default_altroot")]
    pub altroot: PathBuf,
    #[serde(default = "default_boot_image_url")]
    pub boot_image_url: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let f = std::fs::File::open(path)
            .with_context(|| anyhow!("config load path: {:?}", path))?;
        let c: Config = serde_json::from_reader(f)
            .with_context(|| anyhow!("parsing config {:?}", path))?;
        Ok(c)
    }

    /**
     * The root pool, followed by each data pool in the order configured.
     */
    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        std::iter::once(&self.root_pool).chain(self.data_pools.iter())
    }

    pub fn swap(&self) -> Option<&str> {
        if self.swap_size.is_empty() {
            None
        } else {
            Some(self.swap_size.as_str())
        }
    }

    /**
     * The language part of the locale; e.g., "en" for "en_US.UTF-8".
     */
    pub fn locale_lang(&self) -> Result<&str> {
        match self.locale.split_once('_') {
            Some((lang, _)) if !lang.is_empty() => Ok(lang),
            _ => bail!("locale \"{}\" is not of the form lang_TERRITORY",
                self.locale),
        }
    }

    /**
     * Check the configuration for errors.  This must be done before we touch
     * anything, as most of what follows destroys data on the configured
     * disks.
     */
    pub fn check(&self) -> Result<()> {
        let mut pool_names = HashSet::new();
        let mut disks = HashSet::new();

        for pool in self.pools() {
            if pool.name.is_empty() {
                bail!("pool configured without a name");
            }
            if pool.name.contains(|c: char| {
                c == '/' || c == '@' || c.is_whitespace()
            }) {
                bail!("pool name \"{}\" may not contain '/', '@' or spaces",
                    pool.name);
            }
            if !pool_names.insert(pool.name.as_str()) {
                bail!("name \"{}\" configured for multiple pools", pool.name);
            }

            match (&pool.kind, pool.disks.len()) {
                (_, 0) => {
                    bail!("pool {} configured without disks", pool.name);
                }
                (Kind::Single, 1) => (),
                (Kind::Single, _) => {
                    bail!("pool {} kind \"single\" configured with more \
                        than one disk", pool.name);
                }
                (Kind::Vdev(v), _) if v.is_empty() => {
                    bail!("pool {} configured with an empty kind", pool.name);
                }
                (Kind::Vdev(v), 1) => {
                    bail!("pool {} kind \"{}\" configured with only one disk",
                        pool.name, v);
                }
                (Kind::Vdev(_), _) => (),
            }

            for disk in pool.disks.iter() {
                if !disk.is_absolute() {
                    bail!("disk \"{}\" in pool {} is not an absolute path",
                        disk.display(), pool.name);
                }
                if !disks.insert(disk) {
                    bail!("disk \"{}\" configured multiple times",
                        disk.display());
                }
            }
        }

        let mut user_names = HashSet::new();
        for user in self.users.iter() {
            if user.name.is_empty() {
                bail!("user configured without a name");
            }
            /*
             * The home directory for root is its own file system, so a user
             * with this name would collide with it.
             */
            if user.name == "root" {
                bail!("user \"root\" cannot be configured as a user");
            }
            if !user_names.insert(user.name.as_str()) {
                bail!("name \"{}\" configured for multiple users", user.name);
            }
        }

        self.locale_lang()?;

        /*
         * The altroot is stripped from the mountpoints recorded for the
         * installed system, so it must name a real directory below "/".
         */
        if !self.altroot.is_absolute() {
            bail!("altroot \"{}\" is not an absolute path",
                self.altroot.display());
        }
        if !self.altroot.components().skip(1)
            .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("altroot \"{}\" may not contain \".\" or \"..\"",
                self.altroot.display());
        }
        if self.altroot.parent().is_none() {
            bail!("altroot may not be \"/\"");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn pool(name: &str, kind: &str, disks: &[&str]) -> Pool {
        Pool {
            name: name.to_string(),
            disks: disks.iter().map(PathBuf::from).collect(),
            mountpoint: None,
            kind: Kind::from(kind.to_string()),
            password: String::new(),
            pool_properties: BTreeMap::new(),
            filesystem_properties: BTreeMap::new(),
        }
    }

    pub(crate) fn user(name: &str) -> User {
        User {
            name: name.to_string(),
            comment: String::new(),
            password: String::new(),
            wheel: true,
        }
    }

    /**
     * A minimal valid configuration with one single-disk root pool.
     */
    pub(crate) fn config() -> Config {
        serde_json::from_str(r#"{
            "root_pool": {
                "name": "rpool",
                "disks": [ "/dev/disk/by-path/pci-0000:05:00.0" ]
            }
        }"#).unwrap()
    }

    #[test]
    fn defaults() {
        let c = config();
        assert_eq!(c.swap(), Some("1G"));
        assert_eq!(c.locale, "en_US.UTF-8");
        assert_eq!(c.keymap, "us");
        assert_eq!(c.timezone, "UTC");
        assert_eq!(c.hostname, "localhost");
        assert!(c.dry_mode);
        assert!(!c.zero_disks);
        assert_eq!(c.altroot, PathBuf::from("/rpool"));
        assert_eq!(c.root_pool.kind, Kind::Single);
        assert!(!c.root_pool.encrypted());
        assert!(c.check().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let c: Config = serde_json::from_str(r#"{
            "root_pool": {
                "name": "rpool",
                "mountpoint": "none",
                "disks": [ "/dev/disk/by-id/a", "/dev/disk/by-id/b" ],
                "kind": "mirror",
                "password": "change this pass",
                "pool_properties": { "ashift": "13", "autotrim": "on" },
                "filesystem_properties": { "compression": "zstd" }
            },
            "data_pools": [ {
                "name": "rdata",
                "disks": [ "/dev/disk/by-id/c" ]
            } ],
            "swap_size": "",
            "users": [ { "name": "alice", "comment": "Alice" } ],
            "packages": [ "@workstation-product-environment" ],
            "keymap": "us-altgr-intl",
            "timezone": "Europe/Berlin",
            "hostname": "myhostname",
            "dry_mode": false
        }"#).unwrap();

        assert!(c.check().is_ok());
        assert_eq!(c.swap(), None);
        assert_eq!(c.root_pool.kind, Kind::Vdev("mirror".to_string()));
        assert!(c.root_pool.encrypted());
        assert!(c.users[0].wheel);
        assert!(!c.dry_mode);
        let names: Vec<_> = c.pools().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["rpool", "rdata"]);
    }

    #[test]
    fn unknown_fields_rejected() {
        let r: std::result::Result<Config, _> = serde_json::from_str(r#"{
            "root_pool": { "name": "rpool", "disks": [ "/dev/sda" ] },
            "swapsize": "2G"
        }"#);
        assert!(r.is_err());
    }

    #[test]
    fn duplicate_pool_names() {
        let mut c = config();
        c.data_pools.push(pool("rpool", "single", &["/dev/sdb"]));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("multiple pools"), "{}", e);
    }

    #[test]
    fn pool_without_disks() {
        let mut c = config();
        c.data_pools.push(pool("rdata", "mirror", &[]));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("without disks"), "{}", e);
    }

    #[test]
    fn single_with_two_disks() {
        let mut c = config();
        c.data_pools.push(pool("rdata", "single", &["/dev/sdb", "/dev/sdc"]));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("more than one disk"), "{}", e);
    }

    #[test]
    fn mirror_with_one_disk() {
        let mut c = config();
        c.data_pools.push(pool("rdata", "mirror", &["/dev/sdb"]));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("only one disk"), "{}", e);
    }

    #[test]
    fn disk_in_two_pools() {
        let mut c = config();
        let disk = c.root_pool.disks[0].to_str().unwrap().to_string();
        c.data_pools.push(pool("rdata", "mirror", &["/dev/sdb", &disk]));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("configured multiple times"), "{}", e);
        assert!(e.contains(&disk), "{}", e);
    }

    #[test]
    fn disk_twice_in_one_pool() {
        let mut c = config();
        c.data_pools.push(pool("rdata", "mirror", &["/dev/sdb", "/dev/sdb"]));
        assert!(c.check().is_err());
    }

    #[test]
    fn duplicate_users() {
        let mut c = config();
        c.users.push(user("alice"));
        c.users.push(user("bob"));
        assert!(c.check().is_ok());
        c.users.push(user("alice"));
        let e = c.check().unwrap_err().to_string();
        assert!(e.contains("multiple users"), "{}", e);
    }

    #[test]
    fn user_named_root() {
        let mut c = config();
        c.users.push(user("root"));
        assert!(c.check().is_err());
    }

    #[test]
    fn bad_pool_name() {
        let mut c = config();
        c.root_pool.name = "rpool/ROOT".to_string();
        assert!(c.check().is_err());
    }

    #[test]
    fn bad_locale() {
        let mut c = config();
        c.locale = "C.UTF-8".to_string();
        assert!(c.check().is_err());
        c.locale = "de_DE.UTF-8".to_string();
        assert_eq!(c.locale_lang().unwrap(), "de");
    }

    #[test]
    fn altroot_must_be_below_root() {
        let mut c = config();
        for bad in ["rpool", "/", "/mnt/../rpool", "//"] {
            c.altroot = PathBuf::from(bad);
            assert!(c.check().is_err(), "{}", bad);
        }
        for good in ["/rpool", "/rpool/", "/mnt/target"] {
            c.altroot = PathBuf::from(good);
            assert!(c.check().is_ok(), "{}", good);
        }
    }

    #[test]
    fn raidz_with_three_disks() {
        let mut c = config();
        c.data_pools.push(pool("tank", "raidz1",
            &["/dev/sdb", "/dev/sdc", "/dev/sdd"]));
        assert!(c.check().is_ok());
    }
}
