use std::sync::Arc;

use gatefs::access::AccessMediator;
use gatefs::delivery::CommandDelivery;
use gatefs::fs::fuser::FuserAdapter;
use gatefs::fs::gate::Gate;
use gatefs::fs::passthrough::Passthrough;
use gatefs::prompt::CommandPrompt;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config;

mod managed_fuse {
    //! Lifecycle of the FUSE session. fuser only does a regular unmount when the
    //! `BackgroundSession` is dropped; we follow up with a forced detach so a busy mount never
    //! outlives the daemon.
    use std::path::PathBuf;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{FuserAdapter, app_config, debug, error};
    use fuser::BackgroundSession;

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn(
            config: &app_config::Config,
            adapter: FuserAdapter,
        ) -> Result<Self, std::io::Error> {
            let mount_opts = super::mount_options(&config.mount);
            debug!(?mount_opts, "Mounting with options.");
            Ok(Self {
                _session: fuser::spawn_mount2(adapter, &config.mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(config: &app_config::Config) -> Self {
            Self {
                mount_point: config.mount_point.clone(),
            }
        }

        pub fn spawn(
            &self,
            config: &app_config::Config,
            adapter: FuserAdapter,
        ) -> Result<FuseCoreScope, std::io::Error> {
            _ = self; // self used for calling convention.
            FuseCoreScope::spawn(config, adapter)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Translate one `-o` option into its fuser equivalent. Unknown options pass through verbatim.
fn mount_option(raw: &str) -> fuser::MountOption {
    use fuser::MountOption;

    match raw {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        other => MountOption::CUSTOM(other.to_owned()),
    }
}

/// The full option list for a mount: name, then `allow_other`, then every extra option.
///
/// Extra entries may themselves be comma-separated, as they are on a `-o` command line.
fn mount_options(config: &app_config::MountConfig) -> Vec<fuser::MountOption> {
    let mut opts = vec![fuser::MountOption::FSName(config.fs_name.clone())];
    if config.allow_other {
        opts.push(fuser::MountOption::AllowOther);
    }
    opts.extend(
        config
            .options
            .iter()
            .flat_map(|group| group.split(','))
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
            .map(mount_option),
    );
    opts
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Wire the stores, prompt, delivery program and passthrough set into a FUSE adapter.
fn build_adapter(config: &app_config::Config, handle: tokio::runtime::Handle) -> FuserAdapter {
    let prompt = Arc::new(CommandPrompt::new(&config.prompt.program));
    let delivery = Arc::new(
        CommandDelivery::new(&config.delivery.program).with_args(config.delivery.args.clone()),
    );

    let protected_path = config.protected_path();
    info!(
        credentials = %config.stores.credentials.display(),
        permissions = %config.stores.permissions.display(),
        protected_path = %protected_path,
        privileged_user = %config.access.privileged_user,
        "Access control configured."
    );

    let mediator = AccessMediator::builder(prompt, delivery)
        .credentials(&config.stores.credentials)
        .permissions(&config.stores.permissions)
        .protected_path(protected_path)
        .privileged_user(config.access.privileged_user.clone())
        .otp_timeout(config.prompt.otp_timeout())
        .build();

    if config.access.mediate_create {
        info!("create goes through the same checks as open.");
    } else {
        warn!("create is not mediated; new files can be created without authentication.");
    }

    let mut fs = Passthrough::new(&config.source);
    if let Some(hidden) = mount_point_within_source(config) {
        info!(
            mount_point = %hidden.display(),
            "Mount point lies inside the source; it will not be resolved through the mount."
        );
        fs = fs.hide(hidden);
    }

    let gate = Gate::new(Arc::new(fs), Arc::new(mediator))
        .mediate_create(config.access.mediate_create);
    FuserAdapter::new(gate, handle)
}

/// The host path of the mount point when it sits under `source`. Only meaningful before the
/// mount exists, since resolving it afterwards goes through the mount.
fn mount_point_within_source(config: &app_config::Config) -> Option<std::path::PathBuf> {
    let mount_point = std::fs::canonicalize(&config.mount_point).ok()?;
    mount_point
        .starts_with(&config.source)
        .then_some(mount_point)
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    // Host mode bits are applied verbatim.
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    prepare_mount_point(&config.mount_point).await?;

    info!(
        source = %config.source.display(),
        "Mounting filesystem at {}.",
        config.mount_point.display()
    );

    let adapter = build_adapter(&config, handle);
    let fuse = managed_fuse::ManagedFuse::new(&config);
    {
        let _session = fuse.spawn(&config, adapter)?;
        info!("gatefs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .inspect_err(|e| error!("Failed to create Tokio runtime: {e}"))?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
