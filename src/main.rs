/*
 * Copyright 2021 Oxide Computer Company
 */

use std::process::exit;

use anyhow::{anyhow, bail, Result};
use slog::{crit, info, o, warn, Drain, Logger};
use slog_async::Async;
use slog_term::{CompactFormat, TermDecorator};

mod boot;
mod config;
mod disk;
mod ensure;
mod install;
mod storage;
mod system;
mod target;
mod zfs;

use config::Config;
use ensure::{Ensure, Host, Live, Simulate};

fn usage(opts: &getopts::Options) {
    let s = opts.usage("zfs-installer COMMAND [OPTIONS]\n\n\
        Commands:\n    install    install a new system\n    \
        check      check the configuration and exit");
    println!("{}", s);
}

fn main() -> Result<()> {
    let cmd = std::env::args().nth(1)
        .ok_or_else(|| anyhow!("missing command name"))?;

    let mut opts = getopts::Options::new();
    opts.parsing_style(getopts::ParsingStyle::StopAtFirstFree);
    opts.reqopt("c", "config", "installation configuration file", "CONFIG");

    let f: fn(&Logger, &getopts::Matches) -> Result<()> = match cmd.as_str() {
        "install" => {
            opts.optflag("n", "dry-run",
                "log what would be done without doing it");
            opts.optflag("L", "live",
                "really install, regardless of \"dry_mode\" in the config");

            run_install
        }
        "check" => run_check,
        n => {
            usage(&opts);
            bail!("invalid command: {}", n);
        }
    };

    let mat = match opts.parse(std::env::args().skip(2)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            bail!("invalid options: {:?}", e);
        }
    };

    let decorator = TermDecorator::new().stdout().build();
    let drain = CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = Async::new(drain).build_with_guard();
    let log = Logger::root(drain.fuse(), o!());

    if let Err(e) = f(&log, &mat) {
        crit!(log, "fatal error: {:?}", e);
        /*
         * Flush the log before we go.
         */
        drop(guard);
        exit(1);
    }

    Ok(())
}

fn load_config(log: &Logger, mat: &getopts::Matches) -> Result<Config> {
    let path = mat.opt_str("c")
        .ok_or_else(|| anyhow!("configuration file (-c) is required"))?;

    let cfg = Config::load(&path)?;
    cfg.check()?;
    info!(log, "configuration {} is valid", path);

    Ok(cfg)
}

fn run_check(log: &Logger, mat: &getopts::Matches) -> Result<()> {
    load_config(log, mat)?;
    Ok(())
}

fn run_install(log: &Logger, mat: &getopts::Matches) -> Result<()> {
    let cfg = load_config(log, mat)?;

    if mat.opt_present("n") && mat.opt_present("L") {
        bail!("-n and -L are mutually exclusive");
    }

    let dry = if mat.opt_present("n") {
        true
    } else if mat.opt_present("L") {
        false
    } else {
        cfg.dry_mode
    };

    let live = Live::default();
    let sim = Simulate::default();
    let host: &dyn Host = if dry {
        info!(log, "dry run: nothing will be changed on this system");
        &sim
    } else {
        warn!(log, "all data on these disks will be destroyed: {}",
            cfg.pools()
                .flat_map(|p| p.disks.iter())
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "));
        &live
    };

    let e = Ensure::new(log, host);
    install::install(&e, &cfg)?;

    if dry {
        info!(log, "dry run complete: {} actions", sim.actions().len());
    } else {
        info!(log, "installation complete; the pools have been exported");
    }

    Ok(())
}
