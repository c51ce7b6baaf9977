// ABOUTME: Command-line client for the render farm
// ABOUTME: Drives UPLOAD, RENDER, and DELETE against every server in a list file

use argh::FromArgs;
use renderfarm::client;
use renderfarm::protocol::session_name_is_valid;
use renderfarm::serverlist::{ServerEntry, parse_server_list};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Render farm client: distribute scene uploads and frame renders across a
/// list of servers.
#[derive(FromArgs)]
struct CliArgs {
    /// enable debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Upload(UploadArgs),
    Render(RenderArgs),
    Delete(DeleteArgs),
}

/// upload a scene file to every listed server
#[derive(FromArgs)]
#[argh(subcommand, name = "upload")]
struct UploadArgs {
    /// file with one 'address port' server entry per line
    #[argh(positional)]
    server_list: PathBuf,

    /// alphanumeric session name
    #[argh(positional)]
    session: String,

    /// scene file to upload
    #[argh(positional)]
    scene: PathBuf,
}

/// render a frame range across the listed servers
#[derive(FromArgs)]
#[argh(subcommand, name = "render")]
struct RenderArgs {
    /// file with one 'address port' server entry per line
    #[argh(positional)]
    server_list: PathBuf,

    /// alphanumeric session name
    #[argh(positional)]
    session: String,

    /// directory to collect rendered frames into
    #[argh(positional)]
    output_dir: PathBuf,

    /// first frame to render
    #[argh(positional)]
    start_frame: i64,

    /// last frame to render; defaults to the start frame
    #[argh(positional)]
    end_frame: Option<i64>,

    /// encoder hint forwarded to the render backend
    #[argh(option, short = 'F')]
    render_format: Option<String>,
}

/// delete a session from every listed server
#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
struct DeleteArgs {
    /// file with one 'address port' server entry per line
    #[argh(positional)]
    server_list: PathBuf,

    /// alphanumeric session name
    #[argh(positional)]
    session: String,
}

#[tokio::main]
async fn main() {
    let args: CliArgs = argh::from_env();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    if let Err(err) = run(args.command).await {
        error!("{err}");
        process::exit(1);
    }
}

async fn run(command: Command) -> renderfarm::Result<()> {
    match command {
        Command::Upload(args) => {
            let servers = read_server_list(&args.server_list)?;
            let session = validated_session(args.session)?;
            let scene = std::fs::read(&args.scene)
                .map_err(|err| format!("could not read scene file '{}': {err}", args.scene.display()))?;
            client::upload(servers, session, scene.into()).await;
        }
        Command::Render(args) => {
            let servers = read_server_list(&args.server_list)?;
            let session = validated_session(args.session)?;
            let end_frame = args.end_frame.unwrap_or(args.start_frame);

            let report = client::render(
                servers,
                session,
                args.output_dir,
                args.start_frame,
                end_frame,
                args.render_format,
            )
            .await?;

            let elapsed = report.elapsed.as_secs_f64();
            info!(
                "done: {} frame(s) rendered in {elapsed:.3} seconds ({:.3} seconds per frame on average)",
                report.frames,
                elapsed / report.frames as f64,
            );
        }
        Command::Delete(args) => {
            let servers = read_server_list(&args.server_list)?;
            let session = validated_session(args.session)?;
            client::delete(servers, session).await;
        }
    }
    Ok(())
}

fn read_server_list(path: &Path) -> renderfarm::Result<Vec<ServerEntry>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read server list '{}': {err}", path.display()))?;
    Ok(parse_server_list(&contents)?)
}

fn validated_session(session: String) -> renderfarm::Result<String> {
    if !session_name_is_valid(&session) {
        return Err(format!("the session name '{session}' is not alphanumeric").into());
    }
    Ok(session)
}
