//! Random fill and cursor colors.

use rand::Rng;

/// A vivid random color as `#rrggbb`.
///
/// Hue is uniform; saturation and lightness are fixed high enough that
/// shapes and cursors stand out on a white board.
pub fn random_color<R: Rng>(rng: &mut R) -> String {
    let hue = rng.random_range(0.0..1.0_f32);
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
    to_hex(r, g, b)
}

fn to_hex(r: f32, g: f32, b: f32) -> String {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_color_format() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let color = random_color(&mut rng);
            assert_eq!(color.len(), 7);
            assert!(color.starts_with('#'));
            assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hsl_red() {
        assert_eq!(to_hex(1.0, 0.0, 0.0), "#ff0000");
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert_eq!(to_hex(r, g, b), "#ff0000");
    }

    #[test]
    fn test_hsl_achromatic() {
        let (r, g, b) = hsl_to_rgb(0.3, 0.0, 0.5);
        assert_eq!((r, g, b), (0.5, 0.5, 0.5));
    }
}
