//! Configuration options.

use std::fmt::{self, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use configory::EventHandler;
use configory::docgen::{DocType, Docgen, Leaf};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use tracing::{error, info};

use crate::tile::TILE_SCALE;

/// Hard upper bound for label atlas textures.
pub const MAX_ATLAS_SIZE: u32 = 2048;

/// # Styx
///
/// ## Syntax
///
/// Styx's configuration file uses the TOML format. The format's specification
/// can be found at _https://toml.io/en/v1.0.0_.
///
/// ## Location
///
/// Styx doesn't create the configuration file for you, but it looks for one
/// at <br> `${XDG_CONFIG_HOME:-$HOME/.config}/styx/styx.toml`.
///
/// ## Fields
#[derive(Docgen, Deserialize, Clone, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// This section documents the `[workers]` table.
    pub workers: Workers,
    /// This section documents the `[broker]` table.
    pub broker: Broker,
    /// This section documents the `[labels]` table.
    pub labels: Labels,
    /// This section documents the `[font]` table.
    pub font: Font,
}

/// Worker pool configuration.
#[derive(Docgen, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Workers {
    /// Number of tile building worker threads.
    pub count: usize,
}

impl Default for Workers {
    fn default() -> Self {
        Self { count: 2 }
    }
}

/// Cross-thread call configuration.
#[derive(Docgen, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Broker {
    /// Maximum time to wait for a reply before a call is rejected.
    ///
    /// A value of `0` waits until the peer replies or disconnects.
    #[docgen(doc_type = "integer (milliseconds)", default = "10000")]
    pub call_timeout: MillisDuration,
}

impl Broker {
    /// Call timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.call_timeout.is_zero()).then_some(*self.call_timeout)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self { call_timeout: Duration::from_secs(10).into() }
    }
}

/// Label placement configuration.
#[derive(Docgen, Deserialize, Copy, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Labels {
    /// Maximum width and height of a label texture atlas.
    ///
    /// Values above 2048 are clamped.
    pub max_texture_size: u32,
    /// Width and height of a tile in local tile units.
    pub tile_scale: f64,
    /// Factor applied to label boxes before collision checks.
    ///
    /// Values slightly below `1.0` keep perfectly adjacent labels from
    /// colliding.
    pub collision_epsilon: f64,
}

impl Labels {
    /// Effective atlas size limit.
    pub fn atlas_size(&self) -> u32 {
        self.max_texture_size.min(MAX_ATLAS_SIZE)
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self { max_texture_size: MAX_ATLAS_SIZE, tile_scale: TILE_SCALE, collision_epsilon: 0.9999 }
    }
}

/// Default label font configuration.
#[derive(Docgen, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Font {
    /// Font family.
    pub family: Arc<String>,
    /// Font size in pixels.
    pub size: f32,
    /// Text fill color.
    pub fill: Color,
}

impl Default for Font {
    fn default() -> Self {
        Self { family: Arc::new(String::from("sans")), size: 12., fill: Color::new(0, 0, 0) }
    }
}

/// RGB color.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse a `#rrggbb` hex color.
    pub fn from_hex(value: &str) -> Result<Self, String> {
        let channels = match value.strip_prefix('#') {
            Some(channels) => channels,
            None => return Err(format!("color {value:?} is missing leading '#'")),
        };

        let digits = channels.len();
        if digits != 6 {
            return Err(format!("color {value:?} has {digits} digits; expected 6"));
        }

        match u32::from_str_radix(channels, 16) {
            Ok(mut color) => {
                let b = (color & 0xFF) as u8;
                color >>= 8;
                let g = (color & 0xFF) as u8;
                color >>= 8;
                let r = color as u8;

                Ok(Color::new(r, g, b))
            },
            Err(_) => Err(format!("color {value:?} contains non-hex digits")),
        }
    }
}

#[cfg(feature = "skia")]
impl From<Color> for skia_safe::Color4f {
    fn from(color: Color) -> Self {
        skia_safe::Color4f {
            r: color.r as f32 / 255.,
            g: color.g as f32 / 255.,
            b: color.b as f32 / 255.,
            a: 1.,
        }
    }
}

impl Docgen for Color {
    fn doc_type() -> DocType {
        DocType::Leaf(Leaf::new("color"))
    }

    fn format(&self) -> String {
        format!("\"{self}\"")
    }
}

/// Deserialize rgb color from a hex string.
impl<'de> Deserialize<'de> for Color {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ColorVisitor;

        impl Visitor<'_> for ColorVisitor {
            type Value = Color;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("hex color like #ff00ff")
            }

            fn visit_str<E>(self, value: &str) -> Result<Color, E>
            where
                E: serde::de::Error,
            {
                Color::from_hex(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(ColorVisitor)
    }
}

impl Serialize for Color {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "#{:0>2x}{:0>2x}{:0>2x}", self.r, self.g, self.b)
    }
}

/// Config wrapper for millisecond-precision durations.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct MillisDuration(Duration);

impl Deref for MillisDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for MillisDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms).into())
    }
}

impl From<Duration> for MillisDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl Display for MillisDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.0.as_millis())
    }
}

/// Event handler for configuration manager updates.
#[derive(Clone)]
pub struct ConfigEventHandler {
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigEventHandler {
    pub fn new() -> (Self, watch::Receiver<Arc<Config>>) {
        let (tx, rx) = watch::channel(Arc::new(Config::default()));
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Publish a new configuration.
    pub fn publish(&self, config: Config) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Reload the configuration file.
    fn reload_config(&self, config: &configory::Config) {
        info!("Reloading configuration file");

        // Parse config or fall back to the default.
        let parsed = config
            .get::<&str, Config>(&[])
            .inspect_err(|err| error!("Config error: {err}"))
            .ok()
            .flatten()
            .unwrap_or_default();

        self.publish(parsed);
    }
}

impl EventHandler for ConfigEventHandler {
    type MessageData = ();

    fn file_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn ipc_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn file_error(&self, _config: &configory::Config, err: configory::Error) {
        error!("Configuration file error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors() {
        assert_eq!(Color::from_hex("#ff8000"), Ok(Color::new(255, 128, 0)));
        assert_eq!(Color::new(1, 2, 255).to_string(), "#0102ff");
        assert!(Color::from_hex("ff8000").is_err());
        assert!(Color::from_hex("#ff80").is_err());
        assert!(Color::from_hex("#gg8000").is_err());
    }

    #[test]
    fn atlas_size_is_capped() {
        let mut labels = Labels::default();
        assert_eq!(labels.atlas_size(), 2048);

        labels.max_texture_size = 8192;
        assert_eq!(labels.atlas_size(), 2048);

        labels.max_texture_size = 512;
        assert_eq!(labels.atlas_size(), 512);
    }

    #[test]
    fn disabled_timeout() {
        let mut broker = Broker::default();
        assert_eq!(broker.timeout(), Some(Duration::from_secs(10)));

        broker.call_timeout = Duration::ZERO.into();
        assert_eq!(broker.timeout(), None);
    }

    #[test]
    fn published_config() {
        let (handler, rx) = ConfigEventHandler::new();
        assert_eq!(rx.borrow().workers.count, 2);

        let mut config = Config::default();
        config.workers.count = 7;
        handler.publish(config);
        assert_eq!(rx.borrow().workers.count, 7);
    }
}
