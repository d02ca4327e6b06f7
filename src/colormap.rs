//! Named colormaps: pure functions from a normalized scalar in [0, 1] to an
//! RGB triple in [0, 1].

use std::collections::HashMap;
use tracing::warn;

pub type ColormapFn = fn(f32) -> [f32; 3];

pub const DEFAULT_COLORMAP: &str = "hot";

/// Registry of colormaps addressed by case-insensitive name.
#[derive(Debug, Clone)]
pub struct ColormapRegistry {
    maps: HashMap<String, ColormapFn>,
}

impl Default for ColormapRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("gray", gray);
        registry.register("hot", hot);
        registry.register("jet", jet);
        registry.register("cool", cool);
        registry.register("rainbow", rainbow);
        registry
    }
}

impl ColormapRegistry {
    /// Registry with the built-in colormaps.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            maps: HashMap::new(),
        }
    }

    /// Add or replace a colormap.
    pub fn register(&mut self, name: impl Into<String>, map: ColormapFn) {
        self.maps.insert(name.into().to_lowercase(), map);
    }

    pub fn get(&self, name: &str) -> Option<ColormapFn> {
        self.maps.get(&name.to_lowercase()).copied()
    }

    /// Colormap for `name`, falling back to [`DEFAULT_COLORMAP`] (or gray if
    /// that was never registered) for unknown names.
    pub fn resolve(&self, name: &str) -> ColormapFn {
        self.get(name).unwrap_or_else(|| {
            warn!(colormap = name, fallback = DEFAULT_COLORMAP, "Unknown colormap");
            self.get(DEFAULT_COLORMAP).unwrap_or(gray)
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.maps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[inline]
fn unit(t: f32) -> f32 {
    if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) }
}

pub fn gray(t: f32) -> [f32; 3] {
    let t = unit(t);
    [t, t, t]
}

/// Black through red and yellow to white.
pub fn hot(t: f32) -> [f32; 3] {
    let t = unit(t);
    [
        unit(3.0 * t),
        unit(3.0 * t - 1.0),
        unit(3.0 * t - 2.0),
    ]
}

/// Blue through cyan, yellow and red.
pub fn jet(t: f32) -> [f32; 3] {
    let t = unit(t);
    [
        unit(1.5 - (4.0 * t - 3.0).abs()),
        unit(1.5 - (4.0 * t - 2.0).abs()),
        unit(1.5 - (4.0 * t - 1.0).abs()),
    ]
}

pub fn cool(t: f32) -> [f32; 3] {
    let t = unit(t);
    [t, 1.0 - t, 1.0]
}

/// Full-saturation hue sweep from blue (0) to red (1).
pub fn rainbow(t: f32) -> [f32; 3] {
    // 60 degree hue steps from red (0) round to blue (4)
    let hue = (1.0 - unit(t)) * 4.0;
    let sextant = hue.floor().min(3.0);
    let f = hue - sextant;
    match sextant as u8 {
        0 => [1.0, f, 0.0],
        1 => [1.0 - f, 1.0, 0.0],
        2 => [0.0, 1.0, f],
        _ => [0.0, 1.0 - f, 1.0],
    }
}
