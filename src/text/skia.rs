//! Skia text rasterization.

use std::cell::RefCell;
use std::collections::HashMap;

use skia_safe::font_style::{Slant, Weight, Width};
use skia_safe::surface::surfaces;
use skia_safe::{
    AlphaType, Color4f, ColorType, Font, FontMgr, FontStyle, ISize, ImageInfo, Paint, PaintStyle,
    Typeface,
};
use tracing::debug;

use crate::geometry::{Point, Size};
use crate::text::TextError;
use crate::text::canvas::{RasterText, TextRasterizer};
use crate::text::settings::TextSettings;

/// Typeface lookup key, by family, bold and italic flags.
type TypefaceKey = (String, bool, bool);

/// CPU text rasterizer backed by Skia.
pub struct SkiaRasterizer {
    font_mgr: FontMgr,
    typefaces: RefCell<HashMap<TypefaceKey, Typeface>>,
    paint: RefCell<Paint>,
}

impl SkiaRasterizer {
    pub fn new() -> Self {
        let mut paint = Paint::default();
        paint.set_anti_alias(true);

        Self { paint: RefCell::new(paint), font_mgr: FontMgr::new(), typefaces: Default::default() }
    }

    /// Get the font for a text's settings.
    fn font(&self, settings: &TextSettings) -> Result<Font, TextError> {
        let key = (settings.family.clone(), settings.bold(), settings.italic());

        let mut typefaces = self.typefaces.borrow_mut();
        let typeface = match typefaces.get(&key) {
            Some(typeface) => typeface.clone(),
            None => {
                let weight = if key.1 { Weight::BOLD } else { Weight::NORMAL };
                let slant = if key.2 { Slant::Italic } else { Slant::Upright };
                let style = FontStyle::new(weight, Width::NORMAL, slant);

                // Fall back to the system's default font.
                let typeface = self
                    .font_mgr
                    .match_family_style(&settings.family, style)
                    .or_else(|| {
                        debug!("Font family {:?} not found, using fallback", settings.family);
                        self.font_mgr.legacy_make_typeface(None, style)
                    })
                    .ok_or_else(|| TextError::Font(settings.family.clone()))?;

                typefaces.insert(key, typeface.clone());
                typeface
            },
        };

        Ok(Font::from_typeface(typeface, settings.size))
    }
}

impl Default for SkiaRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRasterizer for SkiaRasterizer {
    fn measure(&self, text: &str, settings: &TextSettings) -> Result<Size, TextError> {
        let font = self.font(settings)?;
        let (advance, _) = font.measure_str(text, None);
        let metrics = font.metrics().1;

        let stroke = settings.stroke.map_or(0., |stroke| stroke.width);
        let width = advance + 2. * stroke;
        let height = metrics.descent - metrics.ascent + 2. * stroke;

        Ok(Size::new(width, height).into())
    }

    fn rasterize(&self, size: Size<u32>, texts: &[RasterText<'_>]) -> Result<Vec<u8>, TextError> {
        let mut surface = surfaces::raster_n32_premul(ISize::from(size))
            .ok_or(TextError::Surface(size.width, size.height))?;

        let canvas = surface.canvas();
        canvas.clear(Color4f::new(0., 0., 0., 0.));

        let mut paint = self.paint.borrow_mut();
        for text in texts {
            let font = self.font(text.settings)?;
            let ascent = font.metrics().1.ascent;

            let stroke = text.settings.stroke;
            let inset = stroke.map_or(0., |stroke| stroke.width);
            let x = text.origin.x as f32 + inset;
            let y = text.origin.y as f32 + inset - ascent;
            let origin = Point::new(x, y);

            if let Some(stroke) = stroke {
                paint.set_style(PaintStyle::Stroke);
                paint.set_stroke_width(stroke.width);
                paint.set_color4f(Color4f::from(stroke.color), None);
                canvas.draw_str(text.text, origin, &font, &paint);
            }

            paint.set_style(PaintStyle::Fill);
            paint.set_color4f(Color4f::from(text.settings.fill), None);
            canvas.draw_str(text.text, origin, &font, &paint);
        }

        let row_bytes = size.width as usize * 4;
        let mut pixels = vec![0; row_bytes * size.height as usize];
        let info =
            ImageInfo::new(ISize::from(size), ColorType::RGBA8888, AlphaType::Unpremul, None);
        if !surface.read_pixels(&info, &mut pixels, row_bytes, (0, 0)) {
            return Err(TextError::ReadPixels);
        }

        Ok(pixels)
    }
}
