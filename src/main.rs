use clap::Parser;
use rfuse3::MountOptions;
use rfuse3::raw::Session;
use std::ffi::OsString;
use stubfs::config::{Config, DEFAULT_MAGIC, DEFAULT_POLICY};
use stubfs::fuse::StubFs;
use stubfs::store::localdir::LocalDirStore;
use stubfs::vfs::FilesystemCore;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount an object-store-backed stub filesystem")]
struct Args {
    /// Path to mount point
    #[arg(long)]
    mountpoint: String,
    /// Local directory holding the stub files
    #[arg(long)]
    stub_root: String,
    /// Optional mirror directory for stub records
    #[arg(long)]
    backup_root: Option<String>,
    /// Directory the object store writes objects into
    #[arg(long)]
    store_root: String,
    /// Store address recorded in stub records
    #[arg(long, default_value = "localhost")]
    store_address: String,
    /// Storage policy for new objects
    #[arg(long, default_value = DEFAULT_POLICY)]
    policy: String,
    /// Magic tag written into stub records
    #[arg(long, default_value = DEFAULT_MAGIC)]
    magic: String,
    /// Use privileged mount instead of unprivileged (default false)
    #[arg(long, default_value_t = false)]
    not_unprivileged: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = Config::new(
        args.magic,
        args.stub_root,
        args.backup_root,
        args.store_address,
        args.policy,
    )
    .expect("invalid configuration");
    let store = LocalDirStore::new(&args.store_root);
    let fs = StubFs::new(FilesystemCore::new(config, store));

    let mount_path = OsString::from(&args.mountpoint);
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mount_options = MountOptions::default();
    mount_options.fs_name("stubfs").uid(uid).gid(gid);

    let mut mount_handle = if !args.not_unprivileged {
        println!("Mounting stubfs (unprivileged)");
        Session::new(mount_options)
            .mount_with_unprivileged(fs, mount_path)
            .await
            .expect("Unprivileged mount failed")
    } else {
        println!("Mounting stubfs (privileged)");
        Session::new(mount_options)
            .mount(fs, mount_path)
            .await
            .expect("Privileged mount failed")
    };

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.unwrap(),
        _ = signal::ctrl_c() => {
            mount_handle.unmount().await.unwrap();
        }
    }
}
