use std::{future::IntoFuture, path::PathBuf};

use afs_store::{
    appdata::DriveConfig,
    backend::{list_remote_drives, StoreBackend},
    pseudoclass::default_registry,
    server::{gen_router, AppState},
    AppData, MountConfig, NodeHandle,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use url::Url;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MountArgs {
    /// A TOML file listing the drives to mount.
    #[arg(long, short = 'c', env = "AFS_CONFIG")]
    config: Option<PathBuf>,

    /// Mounts an additional drive, as NAME=ADDR, e.g.
    /// `mem=memory://` or `shared=redb:///var/lib/afs/shared`.
    #[arg(long = "drive", value_name = "NAME=ADDR", value_parser = parse_drive)]
    drives: Vec<DriveConfig>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serves the mounted drives over HTTP.
    Daemon {
        #[clap(flatten)]
        mount_args: MountArgs,

        /// The address to listen on.
        #[clap(flatten)]
        listen_args: tokio_listener::ListenerAddressLFlag,
    },
    /// Lists the mounted drives, or the drives a remote server exposes.
    Drives {
        #[clap(flatten)]
        mount_args: MountArgs,

        /// Asks the server at this address instead, e.g. `http://[::1]:8000`.
        #[arg(long, env = "AFS_REMOTE", conflicts_with_all = ["config", "drives"])]
        remote: Option<Url>,
    },
    /// Lists the children of a node, given as `drive:/a/b`.
    Ls {
        #[clap(flatten)]
        mount_args: MountArgs,

        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Archives a node with its subtree into a directory.
    Archive {
        #[clap(flatten)]
        mount_args: MountArgs,

        #[clap(value_name = "PATH")]
        path: String,

        /// The node lands in DIR/NODE_ID.
        #[clap(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Restores an archived node as a new child of PATH.
    Unarchive {
        #[clap(flatten)]
        mount_args: MountArgs,

        #[clap(value_name = "PATH")]
        path: String,

        /// The archived node's directory, DIR/NODE_ID.
        #[clap(value_name = "NODE_DIR")]
        node_dir: PathBuf,
    },
    /// Lists the nodes left inconsistent on a drive, like after an
    /// interrupted restore.
    Inconsistent {
        #[clap(flatten)]
        mount_args: MountArgs,

        #[clap(value_name = "DRIVE")]
        drive: String,
    },
}

fn parse_drive(s: &str) -> Result<DriveConfig, String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("{} isn't of the form NAME=ADDR", s))?;
    Ok(DriveConfig {
        name: name.to_string(),
        addr: addr.to_string(),
    })
}

async fn ls(app_data: &AppData, path: &str) -> Result<(), afs_store::Error> {
    let node = must_get_node(app_data, path).await?;

    for child in node.children().await? {
        println!("{}\t{}\t{}", child.id(), child.pseudo_class(), child.name());
    }
    Ok(())
}

async fn must_get_node(app_data: &AppData, path: &str) -> Result<NodeHandle, afs_store::Error> {
    app_data
        .get_node(path)
        .await?
        .ok_or_else(|| afs_store::Error::NotFound(path.to_string()))
}

async fn inconsistent(app_data: &AppData, drive: &str) -> Result<(), afs_store::Error> {
    let store = app_data
        .drive(drive)
        .ok_or_else(|| afs_store::Error::NotFound(format!("drive {}", drive)))?;
    for node in store.get_inconsistent_nodes().await? {
        println!("{}\t{}\t{}", node.id, node.pseudo_class, node.name);
    }
    Ok(())
}

async fn mount(mount_args: MountArgs) -> Result<AppData, afs_store::Error> {
    let mut config = match &mount_args.config {
        Some(path) => MountConfig::load(path).await?,
        None => MountConfig::default(),
    };
    config.drives.extend(mount_args.drives);

    AppData::from_config(&config, default_registry()).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    {
        let mut builder = afs_tracing::TracingBuilder::default();
        builder = builder.level(cli.log_level.unwrap_or(Level::INFO));
        if cli.json {
            builder = builder.enable_json();
        }
        builder.build()?;
    }

    match cli.command {
        Commands::Daemon {
            mount_args,
            listen_args,
        } => {
            let app_data = mount(mount_args).await?;
            if app_data.drive_names().next().is_none() {
                warn!("no drives mounted");
            }

            let state = AppState::new(
                app_data
                    .drives()
                    .map(|(name, store)| (name.to_string(), store.clone())),
            );
            let app = gen_router()
                .with_state(state)
                .layer(afs_tracing::propagate::axum::trace_layer());

            let listen_address = &listen_args.listen_address.unwrap_or_else(|| {
                "[::]:8000"
                    .parse()
                    .expect("invalid fallback listen address")
            });

            let listener = tokio_listener::Listener::bind(
                listen_address,
                &Default::default(),
                &listen_args.listener_options,
            )
            .await?;

            info!(listen_address=%listen_address, drives=?app_data.drive_names().collect::<Vec<_>>(), "starting daemon");

            let serve = tokio_listener::axum07::serve(
                listener,
                app.into_make_service_with_connect_info::<tokio_listener::SomeSocketAddrClonable>(),
            );

            let res = tokio::select! {
                res = serve.into_future() => res,
                res = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    res
                }
            };

            app_data.close().await?;
            Ok(res?)
        }
        Commands::Drives {
            remote: Some(remote),
            ..
        } => {
            for name in list_remote_drives(&remote).await? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Drives {
            mount_args,
            remote: None,
        } => {
            let app_data = mount(mount_args).await?;
            for name in app_data.drive_names() {
                println!("{}", name);
            }
            app_data.close().await?;
            Ok(())
        }
        Commands::Ls { mount_args, path } => {
            let app_data = mount(mount_args).await?;

            let res = ls(&app_data, &path).await;
            app_data.close().await?;
            Ok(res?)
        }
        Commands::Archive {
            mount_args,
            path,
            dir,
        } => {
            let app_data = mount(mount_args).await?;

            let res = match must_get_node(&app_data, &path).await {
                Ok(node) => node.archive(&dir).await.map(|node_dir| {
                    println!("{}", node_dir.display());
                }),
                Err(e) => Err(e),
            };
            app_data.close().await?;
            Ok(res?)
        }
        Commands::Unarchive {
            mount_args,
            path,
            node_dir,
        } => {
            let app_data = mount(mount_args).await?;

            let res = match must_get_node(&app_data, &path).await {
                Ok(parent) => parent.unarchive(&node_dir).await.map(|node| {
                    println!("{}\t{}\t{}", node.id(), node.pseudo_class(), node.name());
                }),
                Err(e) => Err(e),
            };
            app_data.close().await?;
            Ok(res?)
        }
        Commands::Inconsistent { mount_args, drive } => {
            let app_data = mount(mount_args).await?;

            let res = inconsistent(&app_data, &drive).await;
            app_data.close().await?;
            Ok(res?)
        }
    }
}
