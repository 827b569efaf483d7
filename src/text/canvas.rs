//! Main thread text measurement and atlas rasterization.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{MethodError, Payload, Target};
use crate::geometry::{Point, Size};
use crate::text::settings::TextSettings;
use crate::text::{AtlasRect, RasterizedTexts, TextError, TileTexts};
use crate::tile::TileId;

/// Padding between texts in an atlas, in pixels.
const ATLAS_PADDING: u32 = 1;

/// Font backend used for measuring and drawing text.
pub trait TextRasterizer {
    /// Size of a single line of text in pixels.
    fn measure(&self, text: &str, settings: &TextSettings) -> Result<Size, TextError>;

    /// Draw texts into a new RGBA8 image.
    fn rasterize(&self, size: Size<u32>, texts: &[RasterText<'_>]) -> Result<Vec<u8>, TextError>;
}

/// Text placed within an atlas.
#[derive(Copy, Clone, Debug)]
pub struct RasterText<'a> {
    pub text: &'a str,
    pub settings: &'a TextSettings,
    /// Top-left corner within the atlas.
    pub origin: Point<u32>,
    pub size: Size<u32>,
}

/// Rasterized label atlas.
#[derive(Clone, Debug)]
pub struct Texture {
    pub name: String,
    pub size: Size<u32>,
    /// RGBA8 pixel data.
    pub pixels: Vec<u8>,
}

/// Text canvas of one text style.
///
/// Measures text for workers and keeps the rasterized label textures.
pub struct TextCanvas {
    style: String,
    rasterizer: Rc<dyn TextRasterizer>,
    max_texture_size: u32,
    textures: RefCell<IndexMap<String, Texture>>,
    next_texture_id: Cell<u64>,
}

impl TextCanvas {
    pub fn new(style: &str, rasterizer: Rc<dyn TextRasterizer>, max_texture_size: u32) -> Rc<Self> {
        Rc::new(Self {
            max_texture_size,
            rasterizer,
            style: style.into(),
            next_texture_id: Default::default(),
            textures: Default::default(),
        })
    }

    /// Broker namespace of the canvas.
    pub fn namespace(&self) -> String {
        format!("text_labels_{}", self.style)
    }

    /// Broker target exposing the canvas to workers.
    pub fn target(self: &Rc<Self>) -> Target {
        let sizes = self.clone();
        let raster = self.clone();
        let release = self.clone();
        Target::new()
            .method("calc_text_sizes", move |payload: Payload| -> Result<Value, MethodError> {
                let tile_id: TileId = payload.arg(0)?;
                let texts: TileTexts = payload.arg(1)?;
                let texts = sizes.text_sizes(tile_id, texts)?;
                Ok(serde_json::to_value(texts)?)
            })
            .method("rasterize_texts", move |payload: Payload| -> Result<Value, MethodError> {
                let tile_id: TileId = payload.arg(0)?;
                let tile_key: String = payload.arg(1)?;
                let texts: TileTexts = payload.arg(2)?;
                let rasterized = raster.rasterize_texts(tile_id, &tile_key, texts)?;
                Ok(serde_json::to_value(rasterized)?)
            })
            .method("release_textures", move |payload: Payload| {
                payload.arg::<Vec<String>>(0).map(|names| Value::from(release.release(&names)))
            })
    }

    /// Measure all texts of a tile.
    pub fn text_sizes(
        &self,
        tile_id: TileId,
        mut texts: TileTexts,
    ) -> Result<TileTexts, TextError> {
        let mut count = 0;
        for infos in texts.values_mut() {
            for (text, info) in infos.iter_mut() {
                info.size = Some(self.rasterizer.measure(text, &info.text_settings)?);
                count += 1;
            }
        }

        debug!("Measured {count} texts of tile {tile_id} for style {}", self.style);

        Ok(texts)
    }

    /// Rasterize all texts of a tile into texture atlases.
    ///
    /// Textures stay on the main thread, only their names are returned.
    pub fn rasterize_texts(
        &self,
        tile_id: TileId,
        tile_key: &str,
        mut texts: TileTexts,
    ) -> Result<RasterizedTexts, TextError> {
        let max_size = self.max_texture_size.max(1);
        let mut atlases = AtlasPacker::new(max_size);

        for infos in texts.values_mut() {
            for (text, info) in infos.iter_mut() {
                let size = match info.size {
                    Some(size) => {
                        Size::<u32>::from(Size::new(size.width as f32, size.height as f32))
                    },
                    None => continue,
                };

                info.atlas = atlases.insert(size);
                if info.atlas.is_none() {
                    warn!("Text {text:?} exceeds maximum texture size of {max_size}px");
                }
            }
        }

        let texture_id = self.next_texture_id.get();
        self.next_texture_id.set(texture_id + 1);
        let prefix = format!("labels-{}-{tile_key}-{tile_id}-{texture_id}-", self.style);

        let mut names = Vec::with_capacity(atlases.sizes.len());
        for (index, &size) in atlases.sizes.iter().enumerate() {
            let placed: Vec<_> = texts
                .values()
                .flat_map(|infos| infos.iter())
                .filter_map(|(text, info)| {
                    let rect = info.atlas.filter(|rect| rect.texture == index)?;
                    Some(RasterText {
                        origin: Point::new(rect.x, rect.y),
                        size: Size::new(rect.width, rect.height),
                        settings: &info.text_settings,
                        text,
                    })
                })
                .collect();

            let pixels = self.rasterizer.rasterize(size, &placed)?;

            let name = format!("{prefix}{index}");
            let texture = Texture { name: name.clone(), size, pixels };
            self.textures.borrow_mut().insert(name.clone(), texture);
            names.push(name);
        }

        Ok(RasterizedTexts { texts, textures: names })
    }

    /// Get a rasterized texture.
    pub fn texture(&self, name: &str) -> Option<Ref<'_, Texture>> {
        Ref::filter_map(self.textures.borrow(), |textures| textures.get(name)).ok()
    }

    /// Names of all retained textures.
    pub fn texture_names(&self) -> Vec<String> {
        self.textures.borrow().keys().cloned().collect()
    }

    /// Release all textures of a tile build.
    ///
    /// Returns the number of released textures.
    pub fn release(&self, names: &[String]) -> usize {
        let mut textures = self.textures.borrow_mut();
        let released = names.iter().filter(|name| textures.shift_remove(*name).is_some()).count();
        debug!("Released {released} {} label textures", self.style);
        released
    }
}

/// Shelf packer distributing rectangles over fixed-size atlases.
#[derive(Debug)]
struct AtlasPacker {
    max_size: u32,
    /// Used size of every atlas.
    sizes: Vec<Size<u32>>,
    cursor: Point<u32>,
    row_height: u32,
}

impl AtlasPacker {
    fn new(max_size: u32) -> Self {
        Self { max_size, sizes: Vec::new(), cursor: Point::default(), row_height: 0 }
    }

    /// Reserve space for a rectangle.
    ///
    /// Returns `None` if the rectangle cannot fit into an empty atlas.
    fn insert(&mut self, size: Size<u32>) -> Option<AtlasRect> {
        let width = size.width.checked_add(ATLAS_PADDING)?;
        let height = size.height.checked_add(ATLAS_PADDING)?;
        let padded = Size::new(width, height);
        if padded.width > self.max_size || padded.height > self.max_size {
            return None;
        }

        // Start a new row once the current one is full.
        if self.cursor.x.saturating_add(padded.width) > self.max_size {
            self.cursor = Point::new(0, self.cursor.y.saturating_add(self.row_height));
            self.row_height = 0;
        }

        // Start a new atlas once the current one is full.
        if self.sizes.is_empty() || self.cursor.y.saturating_add(padded.height) > self.max_size {
            self.sizes.push(Size::default());
            self.cursor = Point::default();
            self.row_height = 0;
        }

        let texture = self.sizes.len() - 1;
        let rect = AtlasRect {
            texture,
            x: self.cursor.x,
            y: self.cursor.y,
            width: size.width,
            height: size.height,
        };

        self.cursor.x += padded.width;
        self.row_height = self.row_height.max(padded.height);

        let atlas = &mut self.sizes[texture];
        atlas.width = atlas.width.max(self.cursor.x);
        atlas.height = atlas.height.max(self.cursor.y + self.row_height);

        Some(rect)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::config::Font;
    use crate::text::TextInfo;

    /// Monospace rasterizer drawing every text as a filled box.
    #[derive(Default)]
    pub struct BoxRasterizer {
        pub rasterized: RefCell<Vec<(Size<u32>, Vec<String>)>>,
    }

    impl TextRasterizer for BoxRasterizer {
        fn measure(&self, text: &str, settings: &TextSettings) -> Result<Size, TextError> {
            let width = text.chars().count() as f32 * settings.size / 2.;
            Ok(Size::new(width as f64, settings.size as f64))
        }

        fn rasterize(
            &self,
            size: Size<u32>,
            texts: &[RasterText<'_>],
        ) -> Result<Vec<u8>, TextError> {
            let mut pixels = vec![0; (size.width * size.height * 4) as usize];
            for text in texts {
                for y in text.origin.y..text.origin.y + text.size.height {
                    for x in text.origin.x..text.origin.x + text.size.width {
                        let index = ((y * size.width + x) * 4) as usize;
                        pixels[index..index + 4].copy_from_slice(&[0, 0, 0, 255]);
                    }
                }
            }

            let names = texts.iter().map(|text| text.text.to_owned()).collect();
            self.rasterized.borrow_mut().push((size, names));

            Ok(pixels)
        }
    }

    fn texts(entries: &[(&str, f32)]) -> TileTexts {
        let mut texts = TileTexts::new();
        for &(text, size) in entries {
            let draw = json!({ "font": { "size": size } });
            let settings = TextSettings::compute(draw.as_object().unwrap(), &Font::default());
            let infos = texts.entry(settings.key()).or_default();
            infos.insert(text.into(), TextInfo::new(settings));
        }
        texts
    }

    #[test]
    fn measure_texts() {
        let canvas = TextCanvas::new("text", Rc::new(BoxRasterizer::default()), 2048);
        let measured = canvas.text_sizes(1, texts(&[("Berlin", 12.), ("Hamburg", 20.)])).unwrap();

        let infos = measured.values().flat_map(|infos| infos.values());
        let sizes: Vec<_> = infos.map(|info| info.size).collect();
        assert_eq!(sizes, [Some(Size::new(36., 12.)), Some(Size::new(70., 20.))]);
    }

    #[test]
    fn atlas_packing() {
        let mut packer = AtlasPacker::new(64);

        let a = packer.insert(Size::new(30, 10)).unwrap();
        let b = packer.insert(Size::new(30, 20)).unwrap();
        let c = packer.insert(Size::new(30, 10)).unwrap();
        assert_eq!((a.texture, a.x, a.y), (0, 0, 0));
        assert_eq!((b.texture, b.x, b.y), (0, 31, 0));
        assert_eq!((c.texture, c.x, c.y), (0, 0, 21));

        // Overflow into a second atlas.
        let d = packer.insert(Size::new(60, 40)).unwrap();
        assert_eq!((d.texture, d.x, d.y), (1, 0, 0));
        assert_eq!(packer.sizes, [Size::new(62, 32), Size::new(61, 41)]);

        assert!(packer.insert(Size::new(64, 1)).is_none());
    }

    #[test]
    fn rasterize_into_named_textures() {
        let rasterizer = Rc::new(BoxRasterizer::default());
        let canvas = TextCanvas::new("labels", rasterizer.clone(), 64);

        let measured = canvas.text_sizes(7, texts(&[("Elbe", 12.), ("Spree", 24.)])).unwrap();
        let rasterized = canvas.rasterize_texts(7, "1/2/3", measured).unwrap();
        assert_eq!(rasterized.textures, ["labels-labels-1/2/3-7-0-0"]);

        let infos = rasterized.texts.values().flat_map(|infos| infos.values());
        let rects: Vec<_> = infos.map(|info| info.atlas).collect();
        assert_eq!(rects, [
            Some(AtlasRect { texture: 0, x: 0, y: 0, width: 24, height: 12 }),
            Some(AtlasRect { texture: 0, x: 0, y: 13, width: 60, height: 24 }),
        ]);

        let texts = rasterized.texts.clone();
        let rasterized_again = canvas.rasterize_texts(7, "1/2/3", texts).unwrap();
        assert_eq!(rasterized_again.textures, ["labels-labels-1/2/3-7-1-0"]);

        let texture = canvas.texture("labels-labels-1/2/3-7-0-0").unwrap();
        assert_eq!(texture.size, Size::new(61, 38));
        assert_eq!(texture.pixels.len(), 61 * 38 * 4);
        drop(texture);

        assert_eq!(rasterizer.rasterized.borrow()[0].1, ["Elbe", "Spree"]);

        canvas.release(&rasterized.textures);
        assert_eq!(canvas.texture_names(), ["labels-labels-1/2/3-7-1-0"]);
    }

    #[test]
    fn skip_oversized_texts() {
        let mut packer = AtlasPacker::new(u32::MAX);
        assert!(packer.insert(Size::new(u32::MAX, 12)).is_none());
        assert!(packer.insert(Size::new(12, u32::MAX)).is_none());

        let canvas = TextCanvas::new("text", Rc::new(BoxRasterizer::default()), 2048);
        let mut measured = texts(&[("Atlantis", 12.)]);
        for info in measured.values_mut().flat_map(|infos| infos.values_mut()) {
            info.size = Some(Size::new(1e10, 12.));
        }

        let rasterized = canvas.rasterize_texts(3, "0/0/1", measured).unwrap();
        assert!(rasterized.textures.is_empty());
        assert!(canvas.texture_names().is_empty());

        let mut infos = rasterized.texts.values().flat_map(|infos| infos.values());
        assert!(infos.all(|info| info.atlas.is_none()));
    }
}
