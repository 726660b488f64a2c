use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cosmic_text::{fontdb, Attrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache, Wrap};
use image::{ImageFormat, Rgba, RgbaImage};
use tracing::{debug, info, warn};

use crate::capabilities::{BoundingBox, CapabilityError, ComposedImage, Typesetter, TypesetRegion};

const LINE_HEIGHT_RATIO: f32 = 1.2;
const DEFAULT_MIN_FONT_PX: f32 = 8.0;
const DEFAULT_MAX_FONT_PX: f32 = 48.0;

/// Draws translated text over the original art: each region is blanked and
/// the text is set at the largest size that fits its box.
pub struct RasterTypesetter {
    inner: Arc<Inner>,
}

struct Inner {
    font_system: Mutex<FontSystem>,
    swash_cache: Mutex<SwashCache>,
    min_font_px: f32,
    max_font_px: f32,
}

impl RasterTypesetter {
    /// Load fonts from `fonts_dir` when given, otherwise use system fonts.
    pub fn new(fonts_dir: Option<&Path>) -> Self {
        let font_system = match fonts_dir {
            Some(dir) => {
                let mut db = fontdb::Database::new();
                db.load_fonts_dir(dir);
                if db.is_empty() {
                    warn!(
                        "No fonts found in {}, falling back to system fonts",
                        dir.display()
                    );
                    FontSystem::new()
                } else {
                    info!("Loaded {} font faces from {}", db.len(), dir.display());
                    FontSystem::new_with_locale_and_db("en-US".to_string(), db)
                }
            }
            None => FontSystem::new(),
        };

        Self {
            inner: Arc::new(Inner {
                font_system: Mutex::new(font_system),
                swash_cache: Mutex::new(SwashCache::new()),
                min_font_px: DEFAULT_MIN_FONT_PX,
                max_font_px: DEFAULT_MAX_FONT_PX,
            }),
        }
    }
}

/// Largest font size in `[min_size, max_size]` whose measured block fits in
/// `max_width` x `max_height`. Falls back to `min_size` when nothing fits.
pub fn fit_font_size<F>(
    min_size: f32,
    max_size: f32,
    max_width: f32,
    max_height: f32,
    mut measure: F,
) -> f32
where
    F: FnMut(f32) -> (f32, f32),
{
    let fits = |(w, h): (f32, f32)| w <= max_width && h <= max_height;

    if fits(measure(max_size)) {
        return max_size;
    }

    let mut low = min_size;
    let mut high = max_size;
    let mut best = min_size;
    for _ in 0..20 {
        if high - low < 0.25 {
            break;
        }
        let mid = (low + high) / 2.0;
        if fits(measure(mid)) {
            best = mid;
            low = mid;
        } else {
            high = mid;
        }
    }
    best
}

fn layout(font_system: &mut FontSystem, text: &str, font_size: f32, max_width: f32) -> Buffer {
    let metrics = Metrics::new(font_size, font_size * LINE_HEIGHT_RATIO);
    let mut buffer = Buffer::new(font_system, metrics);
    buffer.set_size(font_system, Some(max_width), None);
    buffer.set_wrap(font_system, Wrap::WordOrGlyph);
    let attrs = Attrs::new().family(Family::SansSerif);
    buffer.set_text(font_system, text, &attrs, Shaping::Advanced);
    buffer.shape_until_scroll(font_system, false);
    buffer
}

fn block_size(buffer: &Buffer) -> (f32, f32) {
    let mut width = 0.0f32;
    let mut lines = 0usize;
    for run in buffer.layout_runs() {
        width = width.max(run.line_w);
        lines += 1;
    }
    (width, lines as f32 * buffer.metrics().line_height)
}

fn clear_region(canvas: &mut RgbaImage, bbox: BoundingBox) {
    for y in bbox.y..bbox.y + bbox.height {
        for x in bbox.x..bbox.x + bbox.width {
            canvas.put_pixel(x, y, Rgba([255, 255, 255, 255]));
        }
    }
}

fn blend(existing: Rgba<u8>, color: Color) -> Rgba<u8> {
    let alpha = color.a() as f32 / 255.0;
    let inv = 1.0 - alpha;
    Rgba([
        (color.r() as f32 * alpha + existing[0] as f32 * inv) as u8,
        (color.g() as f32 * alpha + existing[1] as f32 * inv) as u8,
        (color.b() as f32 * alpha + existing[2] as f32 * inv) as u8,
        existing[3].max(color.a()),
    ])
}

impl Inner {
    fn render(&self, image: &[u8], regions: &[TypesetRegion]) -> Result<ComposedImage, CapabilityError> {
        let decoded = image::load_from_memory(image)
            .map_err(|e| CapabilityError::Permanent(format!("cannot decode page image: {}", e)))?;
        let mut canvas = decoded.to_rgba8();
        let (image_width, image_height) = canvas.dimensions();

        let mut font_system = self
            .font_system
            .lock()
            .map_err(|_| CapabilityError::Permanent("font system lock poisoned".to_string()))?;
        let mut swash_cache = self
            .swash_cache
            .lock()
            .map_err(|_| CapabilityError::Permanent("glyph cache lock poisoned".to_string()))?;

        for region in regions {
            let text = region.text.trim();
            if text.is_empty() {
                continue;
            }
            let Some(bbox) = region.bbox.clamp_to(image_width, image_height) else {
                debug!("Skipping region outside the page: {:?}", region.bbox);
                continue;
            };

            clear_region(&mut canvas, bbox);

            let padding = (bbox.width.min(bbox.height) as f32 * 0.08).max(1.0);
            let max_width = (bbox.width as f32 - 2.0 * padding).max(1.0);
            let max_height = (bbox.height as f32 - 2.0 * padding).max(1.0);

            let font_size = fit_font_size(
                self.min_font_px,
                self.max_font_px,
                max_width,
                max_height,
                |size| block_size(&layout(&mut font_system, text, size, max_width)),
            );
            let buffer = layout(&mut font_system, text, font_size, max_width);
            let (block_width, block_height) = block_size(&buffer);

            let origin_x = bbox.x as f32 + padding + ((max_width - block_width) / 2.0).max(0.0);
            let origin_y = bbox.y as f32 + padding + ((max_height - block_height) / 2.0).max(0.0);
            let (min_x, min_y) = (bbox.x as i32, bbox.y as i32);
            let (max_x, max_y) = (min_x + bbox.width as i32, min_y + bbox.height as i32);

            buffer.draw(
                &mut font_system,
                &mut swash_cache,
                Color::rgb(0, 0, 0),
                |px, py, w, h, color| {
                    for dy in 0..h as i32 {
                        for dx in 0..w as i32 {
                            let x = origin_x as i32 + px + dx;
                            let y = origin_y as i32 + py + dy;
                            if x >= min_x && x < max_x && y >= min_y && y < max_y {
                                let existing = *canvas.get_pixel(x as u32, y as u32);
                                canvas.put_pixel(x as u32, y as u32, blend(existing, color));
                            }
                        }
                    }
                },
            );
        }

        let mut out = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| CapabilityError::Permanent(format!("cannot encode page image: {}", e)))?;

        Ok(ComposedImage {
            bytes: out,
            content_type: "image/png".to_string(),
        })
    }
}

#[async_trait]
impl Typesetter for RasterTypesetter {
    async fn compose(
        &self,
        image: &[u8],
        regions: &[TypesetRegion],
    ) -> Result<ComposedImage, CapabilityError> {
        let inner = self.inner.clone();
        let image = image.to_vec();
        let regions = regions.to_vec();
        tokio::task::spawn_blocking(move || inner.render(&image, &regions))
            .await
            .map_err(|e| CapabilityError::Permanent(format!("typesetter task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_fit_font_size_limited_by_width() {
        // Ten glyphs, each half the font size wide, on one line.
        let size = fit_font_size(8.0, 48.0, 100.0, 500.0, |s| (s * 5.0, s * 1.2));
        assert!(size <= 20.0);
        assert!(size > 19.0);
    }

    #[test]
    fn test_fit_font_size_uses_max_when_everything_fits() {
        let size = fit_font_size(8.0, 48.0, 1000.0, 1000.0, |s| (s, s));
        assert_eq!(size, 48.0);
    }

    #[test]
    fn test_fit_font_size_falls_back_to_min() {
        let size = fit_font_size(8.0, 48.0, 1.0, 1.0, |s| (s * 10.0, s));
        assert_eq!(size, 8.0);
    }

    #[tokio::test]
    async fn test_compose_blanks_regions_and_keeps_the_rest() {
        let typesetter = RasterTypesetter::new(None);
        let regions = vec![TypesetRegion {
            bbox: BoundingBox::new(8, 8, 40, 20),
            text: "Hi".to_string(),
        }];
        let composed = typesetter.compose(&red_png(64, 64), &regions).await.unwrap();
        assert_eq!(composed.content_type, "image/png");

        let out = image::load_from_memory(&composed.bytes).unwrap().to_rgba8();
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(*out.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*out.get_pixel(63, 63), Rgba([255, 0, 0, 255]));
        // Top-left corner of the box sits inside the padding.
        assert_eq!(*out.get_pixel(8, 8), Rgba([255, 255, 255, 255]));
    }

    #[tokio::test]
    async fn test_compose_ignores_regions_outside_page() {
        let typesetter = RasterTypesetter::new(None);
        let regions = vec![TypesetRegion {
            bbox: BoundingBox::new(500, 500, 10, 10),
            text: "lost".to_string(),
        }];
        let composed = typesetter.compose(&red_png(16, 16), &regions).await.unwrap();
        let out = image::load_from_memory(&composed.bytes).unwrap().to_rgba8();
        assert!(out.pixels().all(|p| *p == Rgba([255, 0, 0, 255])));
    }

    #[tokio::test]
    async fn test_compose_rejects_malformed_image() {
        let typesetter = RasterTypesetter::new(None);
        let err = typesetter
            .compose(b"definitely not an image", &[])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
