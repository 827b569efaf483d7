//! Tile building on worker threads.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::broker::{Broker, MethodError, Payload, Reply, Target, WorkerContext};
use crate::config::Config;
use crate::labels::{LabelIds, TileCollisions};
use crate::style::{FilterFunctions, MatchContext, StyleDocument, StyleLayers, TEXT_STYLE};
use crate::text::{TextOutput, TileTextBuilder, release_textures};
use crate::tile::{Tile, TileId, TileIndex, TileRequest};

/// Result of a tile build.
#[derive(Serialize, Default, Debug)]
pub struct TileResult {
    pub id: TileId,
    pub index: TileIndex,
    /// Build was superseded before it finished.
    pub canceled: bool,
    /// Number of features drawn by each draw group.
    pub draw_groups: IndexMap<String, usize>,
    /// Placed text labels by style name.
    pub labels: IndexMap<String, TextOutput>,
}

/// Currently loaded style.
struct Style {
    document: Rc<StyleDocument>,
    layers: Rc<StyleLayers>,
}

/// Tile building state of a single worker.
pub struct WorkerState {
    broker: Broker,
    config: watch::Receiver<Arc<Config>>,
    functions: FilterFunctions,
    style: RefCell<Option<Style>>,
    tiles: RefCell<HashMap<TileId, Rc<Tile>>>,
    label_ids: RefCell<LabelIds>,
}

impl WorkerState {
    pub fn new(
        context: &WorkerContext,
        config: watch::Receiver<Arc<Config>>,
        functions: FilterFunctions,
    ) -> Rc<Self> {
        Rc::new(Self {
            functions,
            config,
            label_ids: RefCell::new(LabelIds::for_worker(context.id, context.count)),
            broker: context.broker.clone(),
            style: Default::default(),
            tiles: Default::default(),
        })
    }

    /// Register the worker's broker targets.
    ///
    /// Exposes `styles.update`, `tiles.build` and `tiles.cancel`.
    pub fn register(self: &Rc<Self>) {
        let update = self.clone();
        let styles = Target::new().method("update", move |payload: Payload| {
            payload.arg(0).map(|document| update.update_style(document))
        });

        let build = self.clone();
        let cancel = self.clone();
        let tiles = Target::new()
            .method("build", move |payload: Payload| match payload.arg::<TileRequest>(0) {
                Ok(request) => {
                    let tile = build.start_tile(&request);
                    Reply::deferred(build.clone().build_tile(tile, request))
                },
                Err(err) => Reply::Ready(Err(err.into())),
            })
            .method("cancel", move |payload: Payload| {
                payload.arg(0).map(|id| Value::from(cancel.cancel_tile(id)))
            });

        self.broker.register("styles", styles);
        self.broker.register("tiles", tiles);
    }

    /// Replace the current style.
    ///
    /// Tiles already being built keep using the previous layers.
    pub fn update_style(&self, document: StyleDocument) -> Value {
        let layers = document.build(self.functions.clone());
        let roots = layers.roots().count();

        let style = Style { document: Rc::new(document), layers: Rc::new(layers) };
        *self.style.borrow_mut() = Some(style);

        info!("Loaded style with {roots} root layers");

        json!({ "layers": roots })
    }

    /// Cancel a tile build.
    ///
    /// Returns `false` if no build with this ID is in progress.
    pub fn cancel_tile(&self, id: TileId) -> bool {
        match self.tiles.borrow().get(&id) {
            Some(tile) => {
                debug!("Canceling build of tile {}", tile.key());
                tile.cancel();
                true
            },
            None => false,
        }
    }

    /// Document and layers of the loaded style.
    fn current_style(&self) -> Option<(Rc<StyleDocument>, Rc<StyleLayers>)> {
        let style = self.style.borrow();
        style.as_ref().map(|style| (style.document.clone(), style.layers.clone()))
    }

    /// Track a new tile build, so it can be canceled.
    pub fn start_tile(&self, request: &TileRequest) -> Rc<Tile> {
        let scale = self.config.borrow().labels.tile_scale;
        let tile = Tile::new(request.id, request.index, request.style_zoom).with_scale(scale);
        let tile = Rc::new(tile);
        self.tiles.borrow_mut().insert(tile.id, tile.clone());
        tile
    }

    /// Stop tracking a tile build.
    ///
    /// Newer builds of the same tile ID stay tracked.
    fn finish_tile(&self, tile: &Rc<Tile>) {
        let mut tiles = self.tiles.borrow_mut();
        if tiles.get(&tile.id).is_some_and(|tracked| Rc::ptr_eq(tracked, tile)) {
            tiles.remove(&tile.id);
        }
    }

    /// Build a tile's draw groups and labels.
    pub async fn build_tile(
        self: Rc<Self>,
        tile: Rc<Tile>,
        request: TileRequest,
    ) -> Result<Payload, MethodError> {
        let Some((document, layers)) = self.current_style() else {
            self.finish_tile(&tile);
            return Err("No style loaded".into());
        };
        let config = self.config.borrow().clone();

        let mut result = TileResult { id: tile.id, index: tile.index, ..Default::default() };
        let mut texts: IndexMap<String, TileTextBuilder> = IndexMap::new();

        // Tile globals override the style's.
        let globals = if request.globals.is_empty() {
            Cow::Borrowed(&document.global)
        } else {
            let mut globals = document.global.clone();
            globals.extend(request.globals.clone());
            Cow::Owned(globals)
        };

        let meters_per_pixel_sq = tile.meters_per_pixel_sq();
        let roots = layers.roots().take_while(|_| !tile.canceled());
        for root in roots {
            for source in root.source_layers() {
                let Some(features) = request.layers.get(&source) else { continue };

                for feature in features {
                    let context = MatchContext {
                        meters_per_pixel_sq,
                        properties: &feature.properties,
                        zoom: tile.style_zoom,
                        geometry: feature.geometry.type_name(),
                        layer: &source,
                        globals: Some(&*globals),
                    };

                    let matched = layers.match_feature(root.id, &context);
                    let Some(groups) = layers.draw_groups(&matched) else { continue };

                    for (name, draw) in groups.iter() {
                        *result.draw_groups.entry(name.clone()).or_default() += 1;

                        if document.base_style(draw) == TEXT_STYLE {
                            let style = document.style_name(draw);
                            let builder = texts
                                .entry(style.to_owned())
                                .or_insert_with(|| TileTextBuilder::new(style));
                            builder.add_feature(feature, draw, &tile, &config.font);
                        }
                    }
                }
            }
        }

        let mut collisions = TileCollisions::new(tile.scale);
        for (style, builder) in texts {
            let ids = &self.label_ids;
            let labels = &config.labels;
            let output = builder.build(&self.broker, &tile, ids, &mut collisions, labels).await;

            if !output.is_empty() {
                result.labels.insert(style, output);
            }

            if tile.canceled() {
                break;
            }
        }

        self.finish_tile(&tile);

        if tile.canceled() {
            trace!("Stopped build of canceled tile {}", tile.key());

            for (style, output) in &result.labels {
                release_textures(&self.broker, style, &output.textures).await;
            }

            let canceled =
                TileResult { id: tile.id, index: tile.index, canceled: true, ..Default::default() };
            return Ok(Payload::new(serde_json::to_value(canceled)?));
        }

        let quads = result.labels.values().flat_map(|output| output.quad_buffer()).collect();
        Ok(Payload::with_transferables(serde_json::to_value(result)?, vec![quads]))
    }
}
