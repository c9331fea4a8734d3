use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use wardenutils::{args, CmdRunner, Sleeper};

use crate::{
    config::{BUSY_RETRY_ATTEMPTS, DELETE_RETRY_DELAY, UNMOUNT_RETRY_DELAY},
    ResultExt, WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Bind mount directories on the host, one ephemeral and one persistent directory per VM.
///
/// The persistent directory of a VM holds one loop-mounted subdirectory per attached disk.
pub struct FsHostBindMounts {
    ephemeral_dir: PathBuf,
    persistent_dir: PathBuf,
    cmd_runner: Arc<dyn CmdRunner>,
    sleeper: Arc<dyn Sleeper>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Host side of the storage exposed to a VM.
#[async_trait]
pub trait HostBindMounts: Send + Sync {
    /// Creates the ephemeral directory of `vm_id` and returns its path.
    async fn make_ephemeral(&self, vm_id: &str) -> WardenCpiResult<PathBuf>;

    /// Removes the ephemeral directory of `vm_id`.
    async fn delete_ephemeral(&self, vm_id: &str) -> WardenCpiResult<()>;

    /// Creates the persistent directory of `vm_id` as a shared, unbindable self bind mount.
    async fn make_persistent(&self, vm_id: &str) -> WardenCpiResult<PathBuf>;

    /// Unmounts every disk of `vm_id`, then unmounts and removes its persistent directory.
    async fn delete_persistent(&self, vm_id: &str) -> WardenCpiResult<()>;

    /// Loop-mounts `disk_path` at the disk directory of `disk_id`.
    async fn mount_persistent(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_path: &Path,
    ) -> WardenCpiResult<()>;

    /// Unmounts the disk directory of `disk_id`.
    async fn unmount_persistent(&self, vm_id: &str, disk_id: &str) -> WardenCpiResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsHostBindMounts {
    /// Creates host bind mounts rooted at the two given directories.
    pub fn new(
        ephemeral_dir: impl Into<PathBuf>,
        persistent_dir: impl Into<PathBuf>,
        cmd_runner: Arc<dyn CmdRunner>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            ephemeral_dir: ephemeral_dir.into(),
            persistent_dir: persistent_dir.into(),
            cmd_runner,
            sleeper,
        }
    }

    async fn mount(&self, mount_args: Vec<String>) -> WardenCpiResult<String> {
        Ok(self.cmd_runner.run_command("mount", &mount_args).await?.stdout)
    }

    async fn umount(&self, path: &Path) -> WardenCpiResult<()> {
        self.cmd_runner
            .run_command("umount", &args([path.display().to_string()]))
            .await?;
        Ok(())
    }

    /// Unmounts `path`, retrying while the mount is busy.
    ///
    /// A path missing from the mount table counts as unmounted.
    async fn unmount_path(&self, path: &Path) -> WardenCpiResult<()> {
        let needle = path.display().to_string();
        let mut last_err = None;

        for attempt in 1..=BUSY_RETRY_ATTEMPTS {
            let mounts = self
                .mount(Vec::new())
                .await
                .context("Checking persistent bind mount")?;

            if !is_mounted(&mounts, &needle) {
                return Ok(());
            }

            match self.umount(path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(path = %needle, attempt, error = %e, "umount failed");
                    last_err = Some(e);
                }
            }

            if attempt < BUSY_RETRY_ATTEMPTS {
                self.sleeper.sleep(UNMOUNT_RETRY_DELAY).await;
            }
        }

        Err(busy(format!("umount {needle}"), last_err))
    }

    /// Removes the tree at `path`, retrying while it is busy.
    async fn delete_path(&self, path: &Path) -> WardenCpiResult<()> {
        let rm_args = args(["-rf".to_string(), path.display().to_string()]);
        let mut last_err = None;

        for attempt in 1..=BUSY_RETRY_ATTEMPTS {
            match self.cmd_runner.run_command("rm", &rm_args).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(path = %path.display(), attempt, error = %e, "rm failed");
                    last_err = Some(e.into());
                }
            }

            if attempt < BUSY_RETRY_ATTEMPTS {
                self.sleeper.sleep(DELETE_RETRY_DELAY).await;
            }
        }

        Err(busy(format!("rm -rf {}", path.display()), last_err))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl HostBindMounts for FsHostBindMounts {
    async fn make_ephemeral(&self, vm_id: &str) -> WardenCpiResult<PathBuf> {
        let path = self.ephemeral_dir.join(vm_id);
        make_dir(&path).await.context("Making ephemeral bind mount")?;
        Ok(path)
    }

    async fn delete_ephemeral(&self, vm_id: &str) -> WardenCpiResult<()> {
        let path = self.ephemeral_dir.join(vm_id);
        self.delete_path(&path)
            .await
            .context("Removing ephemeral bind mount")
    }

    async fn make_persistent(&self, vm_id: &str) -> WardenCpiResult<PathBuf> {
        let path = self.persistent_dir.join(vm_id);
        make_dir(&path)
            .await
            .context("Making persistent bind mounts")?;

        let p = path.display().to_string();
        let p = p.as_str();
        let steps = [
            args(["--bind", p, p]),
            // Unbindable so the directory cannot be cloned by further bind mounts.
            args(["--make-unbindable", p]),
            // Shared so disk mounts made later propagate into the container.
            args(["--make-shared", p]),
        ];

        for step in steps {
            self.mount(step).await?;
        }

        Ok(path)
    }

    async fn delete_persistent(&self, vm_id: &str) -> WardenCpiResult<()> {
        let path = self.persistent_dir.join(vm_id);

        if !tokio::fs::try_exists(&path)
            .await
            .context("Checking persistent bind mounts dir")?
        {
            return Ok(());
        }

        let disk_paths = glob_children(&path)
            .await
            .with_context(|| format!("Getting mounted disk paths in '{}'", path.display()))?;

        for disk_path in disk_paths {
            self.unmount_path(&disk_path).await.with_context(|| {
                format!("Unmounting persistent disk '{}'", disk_path.display())
            })?;
        }

        if let Err(e) = self.umount(&path).await {
            if !e.stderr().is_some_and(|s| s.contains("not mounted")) {
                return Err(e);
            }

            tracing::debug!(path = %path.display(), "persistent bind mounts dir was not mounted");
        }

        self.delete_path(&path)
            .await
            .context("Removing persistent bind mounts")
    }

    async fn mount_persistent(
        &self,
        vm_id: &str,
        disk_id: &str,
        disk_path: &Path,
    ) -> WardenCpiResult<()> {
        let path = self.persistent_dir.join(vm_id).join(disk_id);

        make_dir(&path)
            .await
            .context("Making disk specific persistent bind mount")?;

        self.mount(args([
            disk_path.display().to_string(),
            path.display().to_string(),
            "-o".to_string(),
            "loop".to_string(),
        ]))
        .await
        .context("Mounting disk specific persistent bind mount")?;

        Ok(())
    }

    async fn unmount_persistent(&self, vm_id: &str, disk_id: &str) -> WardenCpiResult<()> {
        let path = self.persistent_dir.join(vm_id).join(disk_id);
        self.unmount_path(&path)
            .await
            .context("Unmounting disk specific persistent bind mount")
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn make_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

/// Lists the non-hidden children of `dir`, sorted by name, like the shell glob `dir/*`.
async fn glob_children(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with('.') {
            paths.push(entry.path());
        }
    }

    paths.sort();
    Ok(paths)
}

/// Whether `path` is a mount point in `mount` output (`<source> on <path> type ...`).
fn is_mounted(mount_table: &str, path: &str) -> bool {
    let needle = format!(" on {path} ");
    mount_table.lines().any(|line| line.contains(&needle))
}

fn busy(resource: String, last_err: Option<WardenCpiError>) -> WardenCpiError {
    WardenCpiError::ResourceBusy {
        resource: resource.clone(),
        attempts: BUSY_RETRY_ATTEMPTS,
        source: Box::new(
            last_err.unwrap_or_else(|| WardenCpiError::Runtime(format!("{resource} never ran"))),
        ),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use wardenutils::CmdOutput;

    use crate::{
        fakes::{cmd_failed, FakeCmdRunner, FakeSleeper},
        ErrorKind,
    };

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        ephemeral: PathBuf,
        persistent: PathBuf,
        runner: Arc<FakeCmdRunner>,
        sleeper: Arc<FakeSleeper>,
        mounts: FsHostBindMounts,
    }

    /// Builds bind mounts in a fresh temp dir; `runner` receives the persistent root.
    fn fixture(runner: impl FnOnce(&Path) -> FakeCmdRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ephemeral = dir.path().join("ephemeral");
        let persistent = dir.path().join("persistent");
        let runner = Arc::new(runner(&persistent));
        let sleeper = Arc::new(FakeSleeper::default());

        let mounts =
            FsHostBindMounts::new(&ephemeral, &persistent, runner.clone(), sleeper.clone());

        Fixture {
            _dir: dir,
            ephemeral,
            persistent,
            runner,
            sleeper,
            mounts,
        }
    }

    fn mount_table(path: &Path) -> String {
        format!("/dev/loop0 on {} type ext4 (rw)\n", path.display())
    }

    #[test_log::test(tokio::test)]
    async fn test_make_ephemeral_creates_dir() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());

        let path = f.mounts.make_ephemeral("vm-1").await?;

        assert_eq!(path, f.ephemeral.join("vm-1"));
        let mode = tokio::fs::metadata(&path).await?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(f.runner.calls().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_make_persistent_runs_three_mounts_in_order() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());

        let path = f.mounts.make_persistent("vm-1").await?;
        let p = path.display().to_string();

        assert!(path.is_dir());
        assert_eq!(
            f.runner.calls(),
            vec![
                format!("mount --bind {p} {p}"),
                format!("mount --make-unbindable {p}"),
                format!("mount --make-shared {p}"),
            ]
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_make_persistent_stops_at_first_failing_mount() {
        let f = fixture(|_| {
            FakeCmdRunner::new(|_, args| {
                if args.first().map(String::as_str) == Some("--make-unbindable") {
                    Err(cmd_failed("mount", "boom"))
                } else {
                    Ok(CmdOutput::default())
                }
            })
        });

        assert!(f.mounts.make_persistent("vm-1").await.is_err());
        assert_eq!(f.runner.calls().len(), 2);
        assert!(f.persistent.join("vm-1").is_dir());
    }

    #[test_log::test(tokio::test)]
    async fn test_mount_persistent_loop_mounts_disk() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());

        f.mounts
            .mount_persistent("vm-1", "disk-1", Path::new("/disks/disk-1"))
            .await?;

        let dir = f.persistent.join("vm-1").join("disk-1");
        assert!(dir.is_dir());
        assert_eq!(
            f.runner.calls(),
            vec![format!("mount /disks/disk-1 {} -o loop", dir.display())]
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unmount_persistent_succeeds_on_last_attempt() -> anyhow::Result<()> {
        let umounts = Arc::new(AtomicU32::new(0));
        let counter = umounts.clone();

        let f = fixture(move |persistent| {
            let table = mount_table(&persistent.join("vm-1").join("disk-1"));
            FakeCmdRunner::new(move |program, _| match program {
                "mount" => Ok(CmdOutput {
                    stdout: table.clone(),
                    ..Default::default()
                }),
                _ if counter.fetch_add(1, Ordering::SeqCst) + 1 < BUSY_RETRY_ATTEMPTS => {
                    Err(cmd_failed("umount", "target is busy"))
                }
                _ => Ok(CmdOutput::default()),
            })
        });

        f.mounts.unmount_persistent("vm-1", "disk-1").await?;

        let calls = f.runner.calls();
        assert_eq!(calls.iter().filter(|c| *c == "mount").count(), 60);
        assert_eq!(umounts.load(Ordering::SeqCst), 60);
        assert_eq!(f.sleeper.sleeps(), vec![UNMOUNT_RETRY_DELAY; 59]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unmount_persistent_gives_up_after_sixty_attempts() {
        let f = fixture(|persistent| {
            let table = mount_table(&persistent.join("vm-1").join("disk-1"));
            FakeCmdRunner::new(move |program, _| match program {
                "mount" => Ok(CmdOutput {
                    stdout: table.clone(),
                    ..Default::default()
                }),
                _ => Err(cmd_failed("umount", "target is busy")),
            })
        });

        let err = f
            .mounts
            .unmount_persistent("vm-1", "disk-1")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert_eq!(err.stderr(), None);
        assert!(err.to_string().contains("target is busy"));

        let calls = f.runner.calls();
        assert_eq!(calls.iter().filter(|c| *c == "mount").count(), 60);
        assert_eq!(calls.iter().filter(|c| c.starts_with("umount")).count(), 60);
        assert_eq!(f.sleeper.sleeps().len(), 59);
    }

    #[test_log::test(tokio::test)]
    async fn test_unmount_persistent_skips_umount_when_not_listed() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());

        f.mounts.unmount_persistent("vm-1", "disk-1").await?;

        assert_eq!(f.runner.calls(), vec!["mount"]);
        assert!(f.sleeper.sleeps().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unmount_persistent_ignores_disks_sharing_a_prefix() -> anyhow::Result<()> {
        let f = fixture(|persistent| {
            let table = mount_table(&persistent.join("vm-1").join("disk-10"));
            FakeCmdRunner::new(move |program, _| match program {
                "mount" => Ok(CmdOutput {
                    stdout: table.clone(),
                    ..Default::default()
                }),
                _ => Err(cmd_failed("umount", "not mounted")),
            })
        });

        f.mounts.unmount_persistent("vm-1", "disk-1").await?;

        assert_eq!(f.runner.calls(), vec!["mount"]);
        assert!(f.sleeper.sleeps().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unmount_persistent_fails_when_mount_table_unreadable() {
        let f = fixture(|_| FakeCmdRunner::new(|_, _| Err(cmd_failed("mount", "no proc"))));

        let err = f
            .mounts
            .unmount_persistent("vm-1", "disk-1")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Checking persistent bind mount"));
        assert_eq!(err.stderr(), Some("no proc"));
        assert_eq!(f.runner.calls().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_persistent_unmounts_disks_then_dir() -> anyhow::Result<()> {
        let f = fixture(|persistent| {
            let dir = persistent.join("vm-1");
            let table = Arc::new(Mutex::new(format!(
                "{}{}",
                mount_table(&dir.join("disk-a")),
                mount_table(&dir.join("disk-b"))
            )));
            let dir = dir.display().to_string();

            FakeCmdRunner::new(move |program, args| match program {
                "mount" => Ok(CmdOutput {
                    stdout: table.lock().unwrap().clone(),
                    ..Default::default()
                }),
                "umount" if args[0] == dir => {
                    Err(cmd_failed("umount", &format!("umount: {dir}: not mounted.")))
                }
                "umount" => {
                    let mut table = table.lock().unwrap();
                    *table = table
                        .lines()
                        .filter(|line| !line.contains(&args[0]))
                        .map(|line| format!("{line}\n"))
                        .collect();
                    Ok(CmdOutput::default())
                }
                _ => Ok(CmdOutput::default()),
            })
        });

        let dir = f.persistent.join("vm-1");
        tokio::fs::create_dir_all(dir.join("disk-a")).await?;
        tokio::fs::create_dir_all(dir.join("disk-b")).await?;
        tokio::fs::create_dir_all(dir.join(".hidden")).await?;

        f.mounts.delete_persistent("vm-1").await?;

        let d = dir.display().to_string();
        assert_eq!(
            f.runner.calls(),
            vec![
                "mount".to_string(),
                format!("umount {d}/disk-a"),
                "mount".to_string(),
                format!("umount {d}/disk-b"),
                format!("umount {d}"),
                format!("rm -rf {d}"),
            ]
        );
        assert!(f.sleeper.sleeps().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_persistent_surfaces_other_umount_errors() -> anyhow::Result<()> {
        let f = fixture(|_| {
            FakeCmdRunner::new(|program, _| match program {
                "umount" => Err(cmd_failed("umount", "permission denied")),
                _ => Ok(CmdOutput::default()),
            })
        });

        tokio::fs::create_dir_all(f.persistent.join("vm-1")).await?;

        let err = f.mounts.delete_persistent("vm-1").await.unwrap_err();
        assert_eq!(err.stderr(), Some("permission denied"));
        assert!(!f.runner.calls().iter().any(|c| c.starts_with("rm")));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_persistent_fails_when_dir_cannot_be_checked() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());
        // The persistent root is a file, so looking up a VM dir under it fails.
        tokio::fs::create_dir_all(f.persistent.parent().unwrap()).await?;
        tokio::fs::write(&f.persistent, b"").await?;

        let err = f.mounts.delete_persistent("vm-1").await.unwrap_err();

        assert!(err
            .to_string()
            .starts_with("Checking persistent bind mounts dir"));
        assert!(f.runner.calls().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_persistent_is_noop_without_dir() -> anyhow::Result<()> {
        let f = fixture(|_| FakeCmdRunner::succeeding());

        f.mounts.delete_persistent("vm-1").await?;

        assert!(f.runner.calls().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_ephemeral_retries_busy_dir() -> anyhow::Result<()> {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let f = fixture(move |_| {
            FakeCmdRunner::new(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(cmd_failed("rm", "Device or resource busy"))
                } else {
                    Ok(CmdOutput::default())
                }
            })
        });

        f.mounts.delete_ephemeral("vm-1").await?;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(f.sleeper.sleeps(), vec![DELETE_RETRY_DELAY; 2]);
        assert_eq!(
            f.runner.calls()[0],
            format!("rm -rf {}", f.ephemeral.join("vm-1").display())
        );

        Ok(())
    }
}
