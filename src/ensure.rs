/*
 * Copyright 2021 Oxide Computer Company
 */

use std::cell::RefCell;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use slog::{crit, info, warn, Logger};

/**
 * What to do when a program exits with a non-zero status.  Many of the tools
 * we drive (e.g., blkdiscard(8) on a device without discard support) report
 * harmless conditions this way, so each call site must decide.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Check,
    Ignore,
}

/**
 * A single privileged side effect.  Every operation the installer performs on
 * the host is described by one of these before it is handed to a Host, which
 * either performs it or merely records it.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run {
        args: Vec<String>,
        exit: Exit,
    },
    Output {
        args: Vec<String>,
        shell: bool,
        placeholder: String,
    },
    Read {
        path: PathBuf,
        placeholder: String,
    },
    Find {
        pattern: String,
        placeholder: String,
    },
    Write {
        path: PathBuf,
        contents: String,
    },
    Directory(PathBuf),
    Remove(PathBuf),
    Copy {
        src: PathBuf,
        dst: PathBuf,
        recursive: bool,
    },
    Owner {
        path: PathBuf,
        user: String,
        group: String,
        recursive: bool,
    },
    Mode {
        path: PathBuf,
        mode: u32,
    },
    Passwd {
        user: String,
        password: String,
    },
    Sleep(Duration),
    Chroot(PathBuf),
    ChrootExit(PathBuf),
}

/**
 * Render an argument vector the way one would type it into a shell, quoting
 * only those arguments that contain a space.
 */
pub fn cmdline<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| {
            let a = a.as_ref();
            if a.contains(' ') {
                format!("\"{}\"", a)
            } else {
                a.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl Action {
    /**
     * The transcript lines for this action, as they appear in the log.  The
     * transcript is the same whether or not the action is performed.
     */
    pub fn transcript(&self) -> Vec<String> {
        match self {
            Action::Run { args, .. }
            | Action::Output { args, shell: false, .. } => {
                vec![cmdline(args)]
            }
            Action::Output { args, shell: true, .. } => vec![args.join(" ")],
            Action::Read { path, .. } => vec![format!("cat {}", path.display())],
            Action::Find { pattern, .. } => vec![format!("ls -d {}", pattern)],
            Action::Write { path, contents } => {
                let mut out = vec![format!("cat > {} << EOF", path.display())];
                out.extend(contents.lines().map(str::to_string));
                out.push("EOF".to_string());
                out
            }
            Action::Directory(p) => {
                vec![format!("mkdir --parents {}", p.display())]
            }
            Action::Remove(p) => vec![format!("rm --force {}", p.display())],
            Action::Copy { src, dst, recursive } => vec![format!(
                "cp --archive{} {} {}",
                if *recursive { " --recursive" } else { "" },
                src.display(),
                dst.display()
            )],
            Action::Owner { path, user, group, recursive } => vec![format!(
                "chown{} {}:{} {}",
                if *recursive { " --recursive" } else { "" },
                user,
                group,
                path.display()
            )],
            Action::Mode { path, mode } => {
                vec![format!("chmod {:o} {}", mode, path.display())]
            }
            /*
             * Never put the password in the log.
             */
            Action::Passwd { user, .. } => {
                vec![format!("passwd {} --stdin", user)]
            }
            Action::Sleep(d) => vec![format!("sleep {}", d.as_secs())],
            Action::Chroot(p) => vec![format!("chroot {}", p.display())],
            Action::ChrootExit(p) => {
                vec![format!("exit  # chroot {}", p.display())]
            }
        }
    }

    fn placeholder(&self) -> Option<&str> {
        match self {
            Action::Output { placeholder, .. }
            | Action::Read { placeholder, .. }
            | Action::Find { placeholder, .. } => Some(placeholder),
            _ => None,
        }
    }

    /**
     * Does this action produce output that should be echoed into the
     * transcript?  File reads are not echoed, as the contents are generally
     * long and only of interest to the caller.
     */
    fn echo(&self) -> bool {
        matches!(self, Action::Output { .. } | Action::Find { .. })
    }
}

/**
 * Somewhere to carry out actions.  The installer logic is written entirely
 * against this trait so that a dry run takes exactly the same path through
 * the code as a real installation.
 */
pub trait Host {
    /**
     * Perform the action.  Actions that capture output (running a program
     * for its output, reading a file, finding a file) return it; everything
     * else returns an empty string.
     */
    fn perform(&self, log: &Logger, action: &Action) -> Result<String>;
}

/**
 * Performs every action for real on this system.
 */
#[derive(Default)]
pub struct Live {
    /*
     * Handles on the root directory we had before each chroot, innermost
     * last.
     */
    oldroots: RefCell<Vec<File>>,
}

/**
 * Performs nothing.  Each action is recorded so that the sequence can be
 * inspected, and actions that capture output return the placeholder supplied
 * by the caller.
 */
#[derive(Default)]
pub struct Simulate {
    actions: RefCell<Vec<Action>>,
}

impl Simulate {
    pub fn actions(&self) -> Vec<Action> {
        self.actions.borrow().clone()
    }
}

impl Host for Simulate {
    fn perform(&self, _log: &Logger, action: &Action) -> Result<String> {
        self.actions.borrow_mut().push(action.clone());
        Ok(action.placeholder().unwrap_or_default().to_string())
    }
}

fn run(log: &Logger, args: &[String], exit: Exit) -> Result<()> {
    let (prog, rest) = args.split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;

    let status = Command::new(prog)
        .args(rest)
        .status()
        .with_context(|| anyhow!("exec {:?}", prog))?;

    if !status.success() {
        match exit {
            Exit::Check => bail!("{} failed: {}", cmdline(args), status),
            Exit::Ignore => {
                warn!(log, "{} failed: {} (ignored)", prog, status);
            }
        }
    }

    Ok(())
}

fn output(args: &[String], shell: bool) -> Result<String> {
    let mut cmd = if shell {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(args.join(" "));
        cmd
    } else {
        let (prog, rest) = args.split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;
        let mut cmd = Command::new(prog);
        cmd.args(rest);
        cmd
    };

    let out = cmd.stderr(Stdio::inherit()).output()
        .with_context(|| anyhow!("exec {:?}", args))?;

    if !out.status.success() {
        bail!("{} failed: {}", cmdline(args), out.status);
    }

    Ok(String::from_utf8(out.stdout)?.trim().to_string())
}

fn find(pattern: &str) -> Result<String> {
    if let Some(ent) = glob::glob(pattern)?.next() {
        return Ok(ent?.to_string_lossy().to_string());
    }

    bail!("no file matches {:?}", pattern);
}

fn copy(src: &Path, dst: &Path) -> Result<()> {
    let dst = if dst.is_dir() {
        let name = src.file_name()
            .ok_or_else(|| anyhow!("no file name in {}", src.display()))?;
        dst.join(name)
    } else {
        dst.to_path_buf()
    };

    /*
     * std::fs::copy() also copies the permission bits.
     */
    std::fs::copy(src, &dst).with_context(|| {
        anyhow!("copy {} to {}", src.display(), dst.display())
    })?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for ent in walkdir::WalkDir::new(src) {
        let ent = ent?;
        let rel = ent.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let ft = ent.file_type();

        if ft.is_dir() {
            std::fs::create_dir_all(&target)?;
            let perms = ent.metadata()?.permissions();
            std::fs::set_permissions(&target, perms)?;
        } else if ft.is_symlink() {
            let link = std::fs::read_link(ent.path())?;
            match std::fs::remove_file(&target) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e.into()),
            }
            std::os::unix::fs::symlink(&link, &target)?;
        } else {
            std::fs::copy(ent.path(), &target)?;
        }
    }

    Ok(())
}

/*
 * We cannot use a fixed table of IDs here: the users we assign ownership to
 * have just been created inside the target, so we must consult the passwd and
 * group databases of whatever root we are in now.
 */
fn lookup_uid(user: &str) -> Result<u32> {
    let n = CString::new(user)?;
    let pw = unsafe { libc::getpwnam(n.as_ptr()) };
    if pw.is_null() {
        bail!("unknown user \"{}\"", user);
    }
    Ok(unsafe { (*pw).pw_uid })
}

fn lookup_gid(group: &str) -> Result<u32> {
    let n = CString::new(group)?;
    let gr = unsafe { libc::getgrnam(n.as_ptr()) };
    if gr.is_null() {
        bail!("unknown group \"{}\"", group);
    }
    Ok(unsafe { (*gr).gr_gid })
}

fn owner(path: &Path, user: &str, group: &str, recursive: bool) -> Result<()> {
    let uid = lookup_uid(user)?;
    let gid = lookup_gid(group)?;

    let walk = walkdir::WalkDir::new(path)
        .max_depth(if recursive { usize::MAX } else { 0 });
    for ent in walk {
        let ent = ent?;
        std::os::unix::fs::lchown(ent.path(), Some(uid), Some(gid))
            .with_context(|| anyhow!("chown {}", ent.path().display()))?;
    }

    Ok(())
}

fn passwd(user: &str, password: &str) -> Result<()> {
    let mut child = Command::new("passwd")
        .arg(user)
        .arg("--stdin")
        .stdin(Stdio::piped())
        .spawn()
        .context("exec passwd")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(password.as_bytes())?;
    }

    let status = child.wait()?;
    if !status.success() {
        bail!("passwd {} failed: {}", user, status);
    }

    Ok(())
}

fn chroot_here() -> Result<()> {
    std::os::unix::fs::chroot(".").context("chroot")?;
    Ok(())
}

impl Live {
    fn enter(&self, root: &Path) -> Result<()> {
        let oldroot = File::open("/").context("open /")?;

        std::env::set_current_dir(root)
            .with_context(|| anyhow!("chdir {}", root.display()))?;
        chroot_here()?;

        self.oldroots.borrow_mut().push(oldroot);
        Ok(())
    }

    fn leave(&self) -> Result<()> {
        let oldroot = self.oldroots.borrow_mut().pop()
            .ok_or_else(|| anyhow!("not in a chroot"))?;

        if unsafe { libc::fchdir(oldroot.as_raw_fd()) } != 0 {
            let err = std::io::Error::last_os_error();
            bail!("fchdir to old root: {}", err);
        }
        /*
         * The handle on the old root is closed as it goes out of scope.
         */
        chroot_here()
    }
}

impl Host for Live {
    fn perform(&self, log: &Logger, action: &Action) -> Result<String> {
        match action {
            Action::Run { args, exit } => run(log, args, *exit)?,
            Action::Output { args, shell, .. } => {
                return output(args, *shell);
            }
            Action::Read { path, .. } => {
                return std::fs::read_to_string(path)
                    .with_context(|| anyhow!("read {}", path.display()));
            }
            Action::Find { pattern, .. } => return find(pattern),
            Action::Write { path, contents } => {
                std::fs::write(path, contents)
                    .with_context(|| anyhow!("write {}", path.display()))?;
            }
            Action::Directory(p) => {
                std::fs::create_dir_all(p)
                    .with_context(|| anyhow!("mkdir {}", p.display()))?;
            }
            Action::Remove(p) => match std::fs::remove_file(p) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => bail!("rm {}: {}", p.display(), e),
            },
            Action::Copy { src, dst, recursive: false } => copy(src, dst)?,
            Action::Copy { src, dst, recursive: true } => {
                copy_tree(src, dst)?
            }
            Action::Owner { path, user, group, recursive } => {
                owner(path, user, group, *recursive)?
            }
            Action::Mode { path, mode } => {
                let perms = std::fs::Permissions::from_mode(*mode);
                std::fs::set_permissions(path, perms)
                    .with_context(|| anyhow!("chmod {}", path.display()))?;
            }
            Action::Passwd { user, password } => passwd(user, password)?,
            Action::Sleep(d) => std::thread::sleep(*d),
            Action::Chroot(p) => self.enter(p)?,
            Action::ChrootExit(_) => self.leave()?,
        }

        Ok(String::new())
    }
}

/**
 * The gateway through which every privileged operation passes.  Each
 * operation is written to the log as a shell-like transcript line and then
 * handed to the Host.
 */
pub struct Ensure<'a> {
    log: Logger,
    host: &'a dyn Host,
}

impl<'a> Ensure<'a> {
    pub fn new(log: &Logger, host: &'a dyn Host) -> Ensure<'a> {
        Ensure { log: log.clone(), host }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    fn perform(&self, action: Action) -> Result<String> {
        for line in action.transcript() {
            info!(self.log, "{}", line);
        }

        let out = self.host.perform(&self.log, &action)?;

        if action.echo() {
            for line in out.lines() {
                info!(self.log, "#> {}", line);
            }
        }

        Ok(out)
    }

    pub fn run<S: AsRef<str>>(&self, args: &[S], exit: Exit) -> Result<()> {
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.perform(Action::Run { args, exit })?;
        Ok(())
    }

    /**
     * Run a program and return its trimmed standard output.  If the program
     * is not really run, "placeholder" is returned instead.
     */
    pub fn output<S: AsRef<str>>(&self, args: &[S], placeholder: &str)
        -> Result<String>
    {
        self.output_common(args, placeholder, false)
    }

    /**
     * As for output(), but the arguments are joined and passed to sh(1).
     */
    pub fn shell_output<S: AsRef<str>>(&self, args: &[S], placeholder: &str)
        -> Result<String>
    {
        self.output_common(args, placeholder, true)
    }

    fn output_common<S: AsRef<str>>(
        &self,
        args: &[S],
        placeholder: &str,
        shell: bool,
    ) -> Result<String> {
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.perform(Action::Output {
            args,
            shell,
            placeholder: placeholder.to_string(),
        })
    }

    pub fn read<P: AsRef<Path>>(&self, path: P, placeholder: &str)
        -> Result<String>
    {
        self.perform(Action::Read {
            path: path.as_ref().to_path_buf(),
            placeholder: placeholder.to_string(),
        })
    }

    /**
     * Locate the first file that matches a glob(7) pattern.
     */
    pub fn find(&self, pattern: &str, placeholder: &str) -> Result<PathBuf> {
        let out = self.perform(Action::Find {
            pattern: pattern.to_string(),
            placeholder: placeholder.to_string(),
        })?;
        Ok(PathBuf::from(out))
    }

    pub fn filestr<P: AsRef<Path>>(&self, path: P, contents: &str)
        -> Result<()>
    {
        self.perform(Action::Write {
            path: path.as_ref().to_path_buf(),
            contents: contents.to_string(),
        })?;
        Ok(())
    }

    pub fn directory<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.perform(Action::Directory(path.as_ref().to_path_buf()))?;
        Ok(())
    }

    pub fn removed<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.perform(Action::Remove(path.as_ref().to_path_buf()))?;
        Ok(())
    }

    pub fn copy<P: AsRef<Path>, Q: AsRef<Path>>(&self, src: P, dst: Q)
        -> Result<()>
    {
        self.perform(Action::Copy {
            src: src.as_ref().to_path_buf(),
            dst: dst.as_ref().to_path_buf(),
            recursive: false,
        })?;
        Ok(())
    }

    pub fn copy_tree<P: AsRef<Path>, Q: AsRef<Path>>(&self, src: P, dst: Q)
        -> Result<()>
    {
        self.perform(Action::Copy {
            src: src.as_ref().to_path_buf(),
            dst: dst.as_ref().to_path_buf(),
            recursive: true,
        })?;
        Ok(())
    }

    pub fn owner<P: AsRef<Path>>(
        &self,
        path: P,
        user: &str,
        group: &str,
        recursive: bool,
    ) -> Result<()> {
        self.perform(Action::Owner {
            path: path.as_ref().to_path_buf(),
            user: user.to_string(),
            group: group.to_string(),
            recursive,
        })?;
        Ok(())
    }

    pub fn mode<P: AsRef<Path>>(&self, path: P, mode: u32) -> Result<()> {
        self.perform(Action::Mode { path: path.as_ref().to_path_buf(), mode })?;
        Ok(())
    }

    pub fn passwd(&self, user: &str, password: &str) -> Result<()> {
        self.perform(Action::Passwd {
            user: user.to_string(),
            password: password.to_string(),
        })?;
        Ok(())
    }

    pub fn sleep(&self, secs: u64) -> Result<()> {
        self.perform(Action::Sleep(Duration::from_secs(secs)))?;
        Ok(())
    }

    /**
     * Change the root directory of this process to "root" until the returned
     * guard is dropped, at which point the original root is restored.
     */
    pub fn chroot<P: AsRef<Path>>(&self, root: P) -> Result<Chroot<'_, 'a>> {
        let root = root.as_ref().to_path_buf();
        self.perform(Action::Chroot(root.clone()))?;
        Ok(Chroot { ensure: self, root })
    }
}

#[must_use = "the chroot is left as soon as this guard is dropped"]
pub struct Chroot<'e, 'a> {
    ensure: &'e Ensure<'a>,
    root: PathBuf,
}

impl Chroot<'_, '_> {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for Chroot<'_, '_> {
    fn drop(&mut self) {
        let root = self.root.clone();
        if let Err(e) = self.ensure.perform(Action::ChrootExit(root)) {
            /*
             * There is nothing sensible left to do from a destructor; if we
             * cannot get out of the target root, every subsequent step would
             * act on the wrong system.
             */
            crit!(self.ensure.log, "could not leave chroot {}: {:?}",
                self.root.display(), e);
            std::process::exit(1);
        }
    }
}
