use std::collections::BTreeMap;

use palette::{Hsl, IntoColor, Srgb};

// ---------------------------------------------------------------------------
// Color palette generator
// ---------------------------------------------------------------------------

/// Generates `n` visually distinct colours using evenly spaced hues, as
/// `#rrggbb` strings.
pub fn generate_palette(n: usize) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let hue = (i as f32 / n as f32) * 360.0;
            let hsl = Hsl::new(hue, 0.75, 0.45);
            let rgb: Srgb = hsl.into_color();
            let rgb: Srgb<u8> = rgb.into_format();
            format!("#{:02x}{:02x}{:02x}", rgb.red, rgb.green, rgb.blue)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Color mapping: drug name → colour
// ---------------------------------------------------------------------------

/// Gives every drug of a batch its own colour, stable across plots.
#[derive(Debug, Clone)]
pub struct ColorMap {
    mapping: BTreeMap<String, String>,
    default_color: String,
}

impl ColorMap {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut unique: Vec<&str> = names.into_iter().collect();
        unique.sort_unstable();
        unique.dedup();
        let mapping = unique
            .iter()
            .zip(generate_palette(unique.len()))
            .map(|(n, c)| (n.to_string(), c))
            .collect();

        ColorMap {
            mapping,
            default_color: "#808080".to_string(),
        }
    }

    pub fn color_for(&self, name: &str) -> &str {
        self.mapping
            .get(name)
            .map(String::as_str)
            .unwrap_or(&self.default_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_is_distinct_hex() {
        let colors = generate_palette(4);
        assert_eq!(colors.len(), 4);
        assert!(colors.iter().all(|c| c.len() == 7 && c.starts_with('#')));
        let mut unique = colors.clone();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert!(generate_palette(0).is_empty());
    }

    #[test]
    fn map_is_independent_of_input_order() {
        let a = ColorMap::new(["Sorafenib", "AC220", "Sorafenib"]);
        let b = ColorMap::new(["AC220", "Sorafenib"]);
        assert_eq!(a.color_for("AC220"), b.color_for("AC220"));
        assert_ne!(a.color_for("AC220"), a.color_for("Sorafenib"));
        assert_eq!(a.color_for("unknown"), "#808080");
    }
}
