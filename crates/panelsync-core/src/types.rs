/*!
 * Shared data types for PanelSync.
 *
 * Lighting is described here rather than in the device crate because it is
 * also part of the persisted configuration.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// An RGB colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    /// Red channel
    pub r: u8,
    /// Green channel
    pub g: u8,
    /// Blue channel
    pub b: u8,
}

impl Rgb {
    /// All channels off
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    /// All channels at full intensity
    pub const WHITE: Rgb = Rgb { r: 255, g: 255, b: 255 };

    /// Create a colour from its channels
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Whether every channel is zero
    pub fn is_black(&self) -> bool {
        *self == Self::BLACK
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Lighting state for a whole device
///
/// How a configuration becomes output reports is up to the device handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LightingConfig {
    /// Every light shows the same colour
    AllColor {
        /// The colour
        color: Rgb,
    },
    /// Firmware-driven rainbow animation
    Rainbow {
        /// Overall brightness
        brightness: u8,
        /// Animation speed
        speed: u8,
    },
    /// Individually coloured controls
    Custom {
        /// Knob ring colours, in control order
        #[serde(default)]
        knobs: Vec<Rgb>,
        /// Slider colours, in control order
        #[serde(default)]
        sliders: Vec<Rgb>,
        /// Logo colour, if the device has one
        #[serde(default)]
        logo: Option<Rgb>,
    },
}

impl LightingConfig {
    /// Lighting with every light switched off
    pub fn all_off() -> Self {
        LightingConfig::AllColor { color: Rgb::BLACK }
    }

    /// Single-colour lighting
    pub fn all_color(color: Rgb) -> Self {
        LightingConfig::AllColor { color }
    }

    /// Whether this configuration emits no light at all
    pub fn is_off(&self) -> bool {
        match self {
            LightingConfig::AllColor { color } => color.is_black(),
            LightingConfig::Rainbow { brightness, .. } => *brightness == 0,
            LightingConfig::Custom { knobs, sliders, logo } => {
                knobs.iter().chain(sliders.iter()).all(Rgb::is_black)
                    && logo.map_or(true, |c| c.is_black())
            }
        }
    }
}

impl Default for LightingConfig {
    fn default() -> Self {
        LightingConfig::all_color(Rgb::WHITE)
    }
}
