// ABOUTME: Command-line render farm server
// ABOUTME: Validates the working directory and renderer, then runs the accept loop

use argh::FromArgs;
use renderfarm::server::render::{ProcessSpawner, verify_renderer};
use renderfarm::server::{Server, ServerConfig};
use renderfarm::serverlist::{ServerEntry, parse_peer_list};
use std::path::PathBuf;
use std::process;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

/// Render farm server: renders frames through an external renderer and
/// forwards surplus work to registered child servers.
#[derive(FromArgs)]
struct CliArgs {
    /// enable debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    /// directory for scene files and render output, created if absent
    #[argh(positional)]
    work_dir: PathBuf,

    /// renderer executable spawned once per render session
    #[argh(positional)]
    renderer: PathBuf,

    /// port to listen on
    #[argh(option, short = 'p', default = "21816")]
    port: u16,

    /// comma-separated 'address port' parents to register at
    #[argh(option)]
    parents: Option<String>,

    /// comma-separated 'address port' children to dispatch to
    #[argh(option)]
    children: Option<String>,
}

#[tokio::main]
async fn main() {
    let args: CliArgs = argh::from_env();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    if let Err(err) = run(args).await {
        error!("{err}");
        process::exit(1);
    }
}

async fn run(args: CliArgs) -> renderfarm::Result<()> {
    let work_dir = prepare_work_dir(args.work_dir)?;
    verify_renderer(&args.renderer)?;
    let renderer = args.renderer.canonicalize()?;

    let config = ServerConfig {
        port: args.port,
        work_dir: work_dir.clone(),
        parents: parse_peers(args.parents.as_deref())?,
        children: parse_peers(args.children.as_deref())?,
    };

    let spawner = ProcessSpawner { renderer, work_dir, base_port: args.port };
    let server = Server::bind(config, spawner).await?;
    server.run().await
}

fn prepare_work_dir(work_dir: PathBuf) -> renderfarm::Result<PathBuf> {
    if !work_dir.exists() {
        std::fs::create_dir_all(&work_dir)
            .map_err(|err| format!("could not create working directory '{}': {err}", work_dir.display()))?;
    } else if !work_dir.is_dir() {
        return Err(format!("'{}' is not a directory", work_dir.display()).into());
    }
    Ok(work_dir.canonicalize()?)
}

fn parse_peers(list: Option<&str>) -> renderfarm::Result<Vec<ServerEntry>> {
    match list {
        Some(list) => Ok(parse_peer_list(list)?),
        None => Ok(Vec::new()),
    }
}
