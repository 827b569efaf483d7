use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::{env, fs, process};

use clap::Parser;
use configory::{Manager as ConfigManager, Options as ConfigOptions};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use styx::Error;
use styx::broker::{self, Broker, Role, WorkerPool};
use styx::config::{Config, ConfigEventHandler};
use styx::style::{FilterFunctions, StyleDocument};
use styx::text::canvas::{TextCanvas, TextRasterizer};
use styx::text::skia::SkiaRasterizer;
use styx::tile::TileRequest;
use styx::worker::WorkerState;
use tokio::runtime::Builder;
use tokio::task::LocalSet;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Build vector map tiles and place their labels.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Options {
    /// Style document in JSON format.
    style: PathBuf,
    /// Tile feature files in JSON format.
    #[arg(required = true)]
    tiles: Vec<PathBuf>,
}

fn main() {
    // Setup logging.
    let directives = env::var("RUST_LOG").unwrap_or("warn,styx=info,configory=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    let options = Options::parse();

    info!("Started Styx");

    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("[CRITICAL] Failed to start runtime: {err}");
            process::exit(1);
        },
    };

    if let Err(err) = LocalSet::new().block_on(&runtime, run(options)) {
        error!("[CRITICAL] {err}");
        process::exit(1);
    }
}

async fn run(options: Options) -> Result<(), Error> {
    // Initialize configuration state.
    let (config_handler, config_rx) = ConfigEventHandler::new();
    let config_options = ConfigOptions::new("styx").notify(true);
    let config_manager = ConfigManager::with_options(&config_options, config_handler.clone())?;
    let config = config_manager
        .get::<&str, Config>(&[])
        .inspect_err(|err| error!("Config error: {err}"))
        .ok()
        .flatten()
        .unwrap_or_default();
    config_handler.publish(config);
    let config = config_rx.borrow().clone();

    let document: StyleDocument = read_json(&options.style)?;

    // Expose text canvases of all text styles to the workers.
    let broker = Broker::new(Role::Main, Default::default());
    broker.set_timeout(config.broker.timeout());
    let rasterizer: Rc<dyn TextRasterizer> = Rc::new(SkiaRasterizer::new());
    let canvases: Vec<_> = document
        .text_styles()
        .into_iter()
        .map(|style| TextCanvas::new(style, rasterizer.clone(), config.labels.atlas_size()))
        .collect();
    for canvas in &canvases {
        broker.register(&canvas.namespace(), canvas.target());
    }

    let (mailbox, inbox) = broker::channel();
    tokio::task::spawn_local({
        let broker = broker.clone();
        async move { broker.listen(inbox).await }
    });

    let pool = WorkerPool::spawn(&broker, mailbox, config.workers.count, move |context| {
        let state = WorkerState::new(&context, config_rx.clone(), FilterFunctions::new());
        state.register();
    })?;

    let result = build_tiles(&options, &broker, &pool, &document, &canvases).await;

    pool.terminate();

    result
}

/// Build all tiles and print their results.
async fn build_tiles(
    options: &Options,
    broker: &Broker,
    pool: &WorkerPool,
    document: &StyleDocument,
    canvases: &[Rc<TextCanvas>],
) -> Result<(), Error> {
    let document = serde_json::to_value(document)?;
    broker.call_workers(&pool.ids(), "styles.update", json!([document])).await?;

    let mut builds = Vec::with_capacity(options.tiles.len());
    for (id, path) in options.tiles.iter().enumerate() {
        let mut request: TileRequest = read_json(path)?;
        request.id = id as u64 + 1;

        let worker = pool.next_worker().ok_or(Error::NoWorkers)?;
        let build = broker.call(Role::Worker(worker), "tiles.build", json!([request]));
        builds.push((path, build));
    }

    for (path, build) in builds {
        let reply = match build.await {
            Ok(reply) => reply,
            Err(err) => {
                error!("Failed to build tile {path:?}: {err}");
                continue;
            },
        };

        let quads: usize = reply.transferables.iter().map(Vec::len).sum();
        info!("Built tile {path:?} with {quads} bytes of label quads");

        println!("{}", reply.value);

        // Textures are only referenced by the printed result.
        let textures = texture_names(&reply.value);
        for canvas in canvases {
            canvas.release(&textures);
        }
    }

    Ok(())
}

/// Names of all label textures in a tile result.
fn texture_names(result: &Value) -> Vec<String> {
    let Some(labels) = result.get("labels").and_then(Value::as_object) else {
        return Vec::new();
    };

    labels
        .values()
        .filter_map(|output| output.get("textures")?.as_array())
        .flatten()
        .filter_map(|name| Some(name.as_str()?.to_owned()))
        .collect()
}

/// Read a JSON file.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|err| Error::InvalidFile(path.display().to_string(), err))
}
