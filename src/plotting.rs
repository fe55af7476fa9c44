use textplots::{Chart, Plot};

use crate::frame::Frame;

/// Determine the best scale and unit prefix for a count rate
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1e6 {
        (1e-6, "M")
    } else if max_value >= 1e3 {
        (1e-3, "k")
    } else {
        (1.0, "")
    }
}

/// Plot count rates with automatic k/M scaling
///
/// # Arguments
/// * `values` - Count rates in counts per second
/// * `title` - Optional title for the plot
/// * `width` - Optional plot width (default: 140)
/// * `height` - Optional plot height (default: 60)
///
/// # Examples
/// ```
/// use rusty_confocal::plotting::plot_values;
///
/// let rates = vec![12_000.0, 15_500.0, 14_200.0, 13_900.0];
/// plot_values(&rates, Some("Count rate"), None, None).unwrap();
/// ```
pub fn plot_values(
    values: &[f64],
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if values.is_empty() {
        return Err("Cannot plot empty data".into());
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let min_value = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_value = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let max_abs = max_value.abs().max(min_value.abs());

    let (value_scale, value_unit) = determine_scale(max_abs);

    let points: Vec<(f32, f32)> = values
        .iter()
        .enumerate()
        .map(|(i, &value)| (i as f32, (value * value_scale) as f32))
        .collect();

    let max_index = (values.len().max(2) - 1) as f32;
    let scaled_min = min_value * value_scale;
    let scaled_max = max_value * value_scale;

    println!("{}", title.unwrap_or("Count rate"));
    println!("X-axis: Sample Index | Y-axis: {}counts/s", value_unit);
    println!(
        "Range: {} samples | Values: {:.3} to {:.3} {}counts/s",
        values.len(),
        scaled_min,
        scaled_max,
        value_unit
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, 0.0, max_index)
        .lineplot(&textplots::Shape::Lines(&points))
        .nice();

    println!("Sample Index →");

    Ok(())
}

const SHADES: &[u8] = b" .:-=+*#%@";

/// Coarse text rendering of a frame, one character per cell
///
/// Unmeasured cells are left blank; measured ones map linearly onto
/// [`SHADES`] between the frame's minimum and maximum.
pub fn frame_to_ascii(frame: &Frame) -> String {
    let data = frame.data();
    let measured = || data.iter().copied().filter(|v| !v.is_nan());
    let min = measured().fold(f64::INFINITY, f64::min);
    let max = measured().fold(f64::NEG_INFINITY, f64::max);
    let span = if max > min { max - min } else { 1.0 };

    let mut out = String::with_capacity(data.len() + data.nrows());
    for row in data.rows() {
        for &v in row {
            let c = if v.is_nan() {
                ' '
            } else {
                let level = ((v - min) / span * (SHADES.len() - 1) as f64).round() as usize;
                SHADES[level.clamp(1, SHADES.len() - 1)] as char
            };
            out.push(c);
        }
        out.push('\n');
    }
    out
}
