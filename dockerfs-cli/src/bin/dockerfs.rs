use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dockerfs_cli::lifecycle::Manager;
use dockerfs_cli::ui;

#[derive(Debug, Parser)]
#[command(version, about = "Mount a running container's filesystem over FUSE")]
enum Opt {
    /// List containers known to the runtime and their current mount state
    List {
        #[command(flatten)]
        conn: Connection,
    },

    /// Mount a container's filesystem at the given path
    Mount {
        /// Container id or name to mount
        container_id: String,

        /// Mount point for the container filesystem
        mount_point: PathBuf,

        /// Keep the process attached to the terminal instead of
        /// daemonizing into the background once the mount handshake
        /// succeeds.
        #[arg(long)]
        foreground: bool,

        /// How often the change list is refreshed, in milliseconds.
        #[arg(long = "changes-interval-ms", default_value_t = 1000)]
        changes_interval_ms: u64,

        #[command(flatten)]
        conn: Connection,
    },

    /// Unmount a previously mounted container
    Unmount {
        /// Container id or name to unmount
        container_id: String,

        /// Mount point the container is mounted at
        mount_point: PathBuf,

        #[command(flatten)]
        conn: Connection,
    },

    /// Interactively pick a container to mount or unmount
    Interactive {
        /// How often the change list is refreshed, in milliseconds.
        #[arg(long = "changes-interval-ms", default_value_t = 1000)]
        changes_interval_ms: u64,

        #[command(flatten)]
        conn: Connection,
    },
}

#[derive(Debug, clap::Args)]
struct Connection {
    /// Control-plane socket address, `unix:/path/to.sock`.
    #[arg(long = "docker-socket", default_value = dockerfs::DEFAULT_DOCKER_ADDR)]
    docker_socket: String,

    #[command(flatten)]
    verbosity: Verbosity,
}

#[derive(Debug, clap::Args)]
struct Verbosity {
    /// Increase logging level to 'debug'.
    #[arg(short, long)]
    verbose: bool,

    /// Decrease logging level to 'error'.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_logging(verbosity: &Verbosity) {
    let level = if verbosity.verbose {
        log::LevelFilter::Debug
    } else if verbosity.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> Result<()> {
    match Opt::parse() {
        Opt::List { conn } => {
            init_logging(&conn.verbosity);
            let mgr = Manager::new(conn.docker_socket);
            for c in mgr.list_containers()? {
                let status = match &c.mount_point {
                    Some(p) => format!("mounted at {}", p.display()),
                    None => "not mounted".to_string(),
                };
                println!(
                    "{}\t{}\t{}\t[{status}]",
                    c.short_id, c.name, c.image
                );
            }
        }

        Opt::Mount {
            container_id,
            mount_point,
            foreground,
            changes_interval_ms,
            conn,
        } => {
            init_logging(&conn.verbosity);
            let mgr = Manager::new(conn.docker_socket);
            mgr.mount_container(
                &container_id,
                &mount_point,
                Duration::from_millis(changes_interval_ms),
                !foreground,
            )?;
        }

        Opt::Unmount {
            container_id,
            mount_point,
            conn,
        } => {
            init_logging(&conn.verbosity);
            let mgr = Manager::new(conn.docker_socket);
            mgr.unmount_container(&container_id, &mount_point)?;
        }

        Opt::Interactive {
            changes_interval_ms,
            conn,
        } => {
            init_logging(&conn.verbosity);
            let mgr = Manager::new(conn.docker_socket);
            ui::run(&mgr, Duration::from_millis(changes_interval_ms))?;
        }
    }
    Ok(())
}
