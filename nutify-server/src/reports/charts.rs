//! Inline SVG chart rendering for email reports.
//!
//! Reports must fit in a single HTML document, so charts are embedded as
//! `data:image/svg+xml;base64` URIs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const WIDTH: f64 = 560.0;
const HEIGHT: f64 = 200.0;
const PAD_LEFT: f64 = 48.0;
const PAD_BOTTOM: f64 = 24.0;
const PAD_TOP: f64 = 12.0;
const PAD_RIGHT: f64 = 12.0;

/// One named series of (label, value) points.
#[derive(Debug, Clone)]
pub struct ChartSeries {
    pub name: String,
    pub points: Vec<(String, f64)>,
}

/// Render a line chart as an SVG data URI. Returns the placeholder chart
/// when no series has data.
pub fn line_chart_data_uri(title: &str, unit: &str, series: &[ChartSeries]) -> String {
    let has_data = series.iter().any(|s| !s.points.is_empty());
    if !has_data {
        return placeholder_data_uri(title);
    }
    let svg = line_chart_svg(title, unit, series);
    to_data_uri(&svg)
}

/// An empty-placeholder chart used when a section's reporter failed.
pub fn placeholder_data_uri(title: &str) -> String {
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
<rect width="{w}" height="{h}" fill="#fafafa" stroke="#dddddd"/>
<text x="{cx}" y="{cy}" text-anchor="middle" font-family="Arial" font-size="13" fill="#999999">{title}: no data</text>
</svg>"##,
        w = WIDTH,
        h = HEIGHT,
        cx = WIDTH / 2.0,
        cy = HEIGHT / 2.0,
        title = escape(title),
    );
    to_data_uri(&svg)
}

fn line_chart_svg(title: &str, unit: &str, series: &[ChartSeries]) -> String {
    let values: Vec<f64> = series
        .iter()
        .flat_map(|s| s.points.iter().map(|(_, v)| *v))
        .collect();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (min, max) = if (max - min).abs() < f64::EPSILON {
        (min - 1.0, max + 1.0)
    } else {
        (min, max)
    };

    let plot_w = WIDTH - PAD_LEFT - PAD_RIGHT;
    let plot_h = HEIGHT - PAD_TOP - PAD_BOTTOM;
    let colors = ["#2980b9", "#27ae60", "#e67e22", "#8e44ad"];

    let mut body = String::new();
    // Frame and horizontal gridlines with value labels.
    body.push_str(&format!(
        r##"<rect x="{PAD_LEFT}" y="{PAD_TOP}" width="{plot_w}" height="{plot_h}" fill="#ffffff" stroke="#dddddd"/>"##
    ));
    for step in 0..=4 {
        let frac = step as f64 / 4.0;
        let y = PAD_TOP + plot_h * (1.0 - frac);
        let value = min + (max - min) * frac;
        body.push_str(&format!(
            r##"<line x1="{PAD_LEFT}" y1="{y:.1}" x2="{x2:.1}" y2="{y:.1}" stroke="#eeeeee"/>
<text x="{tx:.1}" y="{ty:.1}" text-anchor="end" font-family="Arial" font-size="10" fill="#999999">{value:.0}</text>"##,
            x2 = PAD_LEFT + plot_w,
            tx = PAD_LEFT - 4.0,
            ty = y + 3.0,
        ));
    }

    for (index, one_series) in series.iter().filter(|s| !s.points.is_empty()).enumerate() {
        let n = one_series.points.len();
        let coords: Vec<String> = one_series
            .points
            .iter()
            .enumerate()
            .map(|(i, (_, value))| {
                let x = PAD_LEFT
                    + if n > 1 {
                        plot_w * i as f64 / (n - 1) as f64
                    } else {
                        plot_w / 2.0
                    };
                let y = PAD_TOP + plot_h * (1.0 - (value - min) / (max - min));
                format!("{x:.1},{y:.1}")
            })
            .collect();
        body.push_str(&format!(
            r#"<polyline fill="none" stroke="{color}" stroke-width="1.5" points="{points}"/>"#,
            color = colors[index % colors.len()],
            points = coords.join(" "),
        ));
    }

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
<text x="{PAD_LEFT}" y="{ty}" font-family="Arial" font-size="12" fill="#555555">{title} ({unit})</text>
{body}
</svg>"##,
        w = WIDTH,
        h = HEIGHT,
        ty = PAD_TOP - 2.0,
        title = escape(title),
        unit = escape(unit),
    )
}

fn to_data_uri(svg: &str) -> String {
    format!("data:image/svg+xml;base64,{}", BASE64.encode(svg.as_bytes()))
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
