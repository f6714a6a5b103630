//! SVG rendering for training curves, the confusion matrix and image
//! galleries. Output is plain markup so it opens in any browser.

use std::{fmt::Write as _, fs, path::Path};

use crate::{
    error::{IoContext, Result},
    evaluation::ConfusionMatrix,
    training::History,
};

const FONT: &str = "Arial, sans-serif";
const COLOR_TRAIN: &str = "#e74c3c";
const COLOR_VALID: &str = "#2ecc71";
const COLOR_BEST: &str = "#3498db";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";

const PANEL_WIDTH: f64 = 600.0;
const PANEL_HEIGHT: f64 = 420.0;
const MARGIN: f64 = 60.0;

/// Gallery grid is capped at 5x5 tiles.
pub const GALLERY_COLUMNS: usize = 5;
pub const GALLERY_MAX_TILES: usize = 25;
const TILE_SIZE: f64 = 180.0;
const TILE_CAPTION: f64 = 40.0;

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn text(svg: &mut String, x: f64, y: f64, size: u32, anchor: &str, content: &str) {
    let _ = write!(
        svg,
        r#"<text x="{x:.1}" y="{y:.1}" font-family="{FONT}" font-size="{size}" text-anchor="{anchor}" fill="{COLOR_AXIS}">{}</text>"#,
        escape_xml(content)
    );
}

struct Series<'a> {
    name: &'a str,
    values: &'a [f64],
    color: &'a str,
}

struct Panel<'a> {
    title: &'a str,
    y_label: &'a str,
    series: [Series<'a>; 2],
    best: Option<(usize, f64)>,
}

fn value_range(series: &[Series]) -> (f64, f64) {
    let (min, max) = series
        .iter()
        .flat_map(|s| s.values.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

    if !min.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((max - min) * 0.1).max(1e-3);
    (min - pad, max + pad)
}

fn draw_panel(svg: &mut String, offset_x: f64, panel: &Panel) {
    let width = PANEL_WIDTH - 2.0 * MARGIN;
    let height = PANEL_HEIGHT - 2.0 * MARGIN;
    let left = offset_x + MARGIN;
    let top = MARGIN;
    let epochs = panel.series[0].values.len().max(1);
    let (y_min, y_max) = value_range(&panel.series);

    let x_at = |epoch: usize| {
        if epochs == 1 {
            left + width / 2.0
        } else {
            left + (epoch - 1) as f64 / (epochs - 1) as f64 * width
        }
    };
    let y_at = |value: f64| top + height - (value - y_min) / (y_max - y_min) * height;

    text(svg, offset_x + PANEL_WIDTH / 2.0, 30.0, 16, "middle", panel.title);

    for i in 0..=5 {
        let value = y_min + (y_max - y_min) * i as f64 / 5.0;
        let y = y_at(value);
        let _ = write!(
            svg,
            r#"<line x1="{left:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="{COLOR_GRID}"/>"#,
            left + width
        );
        text(svg, left - 8.0, y + 4.0, 11, "end", &format!("{value:.3}"));
    }

    let _ = write!(
        svg,
        r#"<polyline points="{left:.1},{top:.1} {left:.1},{bottom:.1} {right:.1},{bottom:.1}" fill="none" stroke="{COLOR_AXIS}" stroke-width="2"/>"#,
        bottom = top + height,
        right = left + width
    );

    for epoch in 1..=epochs {
        text(svg, x_at(epoch), top + height + 18.0, 11, "middle", &epoch.to_string());
    }
    text(svg, left + width / 2.0, PANEL_HEIGHT - 12.0, 13, "middle", "Epochs");
    let _ = write!(
        svg,
        r#"<text x="{x:.1}" y="{y:.1}" font-family="{FONT}" font-size="13" text-anchor="middle" fill="{COLOR_AXIS}" transform="rotate(-90 {x:.1} {y:.1})">{}</text>"#,
        escape_xml(panel.y_label),
        x = offset_x + 16.0,
        y = top + height / 2.0
    );

    for series in &panel.series {
        let points: Vec<String> = series
            .values
            .iter()
            .enumerate()
            .map(|(i, &v)| format!("{:.1},{:.1}", x_at(i + 1), y_at(v)))
            .collect();
        let _ = write!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2.5"/>"#,
            points.join(" "),
            series.color
        );
    }

    let mut legend = vec![(panel.series[0].name.to_string(), panel.series[0].color)];
    legend.push((panel.series[1].name.to_string(), panel.series[1].color));

    if let Some((epoch, value)) = panel.best {
        let _ = write!(
            svg,
            r#"<circle cx="{:.1}" cy="{:.1}" r="8" fill="{COLOR_BEST}"/>"#,
            x_at(epoch),
            y_at(value)
        );
        legend.push((format!("Best Epoch = {epoch}"), COLOR_BEST));
    }

    for (i, (label, color)) in legend.iter().enumerate() {
        let y = top + 10.0 + i as f64 * 20.0;
        let x = left + width - 150.0;
        let _ = write!(
            svg,
            r#"<rect x="{x:.1}" y="{y:.1}" width="12" height="12" fill="{color}"/>"#
        );
        text(svg, x + 18.0, y + 10.0, 12, "start", label);
    }
}

/// Loss and accuracy curves side by side, each marking the best
/// validation epoch.
pub fn training_curves(history: &History, path: &Path) -> Result<()> {
    let loss = Panel {
        title: "Training vs Validation (loss)",
        y_label: "Loss",
        series: [
            Series {
                name: "Training Loss",
                values: &history.train_loss,
                color: COLOR_TRAIN,
            },
            Series {
                name: "Validation Loss",
                values: &history.valid_loss,
                color: COLOR_VALID,
            },
        ],
        best: history
            .best_loss_epoch()
            .map(|epoch| (epoch, history.valid_loss[epoch - 1])),
    };
    let accuracy = Panel {
        title: "Training vs Validation (Accuracy)",
        y_label: "Accuracy",
        series: [
            Series {
                name: "Training Accuracy",
                values: &history.train_accuracy,
                color: COLOR_TRAIN,
            },
            Series {
                name: "Validation Accuracy",
                values: &history.valid_accuracy,
                color: COLOR_VALID,
            },
        ],
        best: history
            .best_accuracy_epoch()
            .map(|epoch| (epoch, history.valid_accuracy[epoch - 1])),
    };

    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{PANEL_HEIGHT}" viewBox="0 0 {w} {PANEL_HEIGHT}"><rect width="100%" height="100%" fill="white"/>"#,
        w = 2.0 * PANEL_WIDTH
    );
    draw_panel(&mut svg, 0.0, &loss);
    draw_panel(&mut svg, PANEL_WIDTH, &accuracy);
    svg.push_str("</svg>");

    fs::write(path, svg).at(path)
}

/// White-to-navy scale like a "Blues" colormap.
fn blues(intensity: f64) -> String {
    let from = [247.0, 251.0, 255.0];
    let to = [8.0, 48.0, 107.0];
    let channel = |i: usize| (from[i] + (to[i] - from[i]) * intensity.clamp(0.0, 1.0)).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(0), channel(1), channel(2))
}

pub fn confusion_matrix(matrix: &ConfusionMatrix, class_names: &[String], path: &Path) -> Result<()> {
    let n = matrix.num_classes();
    let cell = 110.0;
    let left = 120.0;
    let top = 40.0;
    let width = left + cell * n as f64 + 30.0;
    let height = top + cell * n as f64 + 70.0;
    let max = matrix.max().max(1) as f64;

    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}"><rect width="100%" height="100%" fill="white"/>"#
    );

    for truth in 0..n {
        for predicted in 0..n {
            let count = matrix.get(truth, predicted);
            let intensity = count as f64 / max;
            let x = left + predicted as f64 * cell;
            let y = top + truth as f64 * cell;
            let fill = if intensity > 0.5 { "white" } else { COLOR_AXIS };

            let _ = write!(
                svg,
                r#"<rect x="{x:.1}" y="{y:.1}" width="{cell}" height="{cell}" fill="{}" stroke="white"/>"#,
                blues(intensity)
            );
            let _ = write!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" font-family="{FONT}" font-size="18" text-anchor="middle" fill="{fill}">{count}</text>"#,
                x + cell / 2.0,
                y + cell / 2.0 + 6.0
            );
        }
    }

    for (i, name) in class_names.iter().enumerate().take(n) {
        let offset = i as f64 * cell + cell / 2.0;
        text(&mut svg, left + offset, top + n as f64 * cell + 20.0, 12, "middle", name);
        text(&mut svg, left - 10.0, top + offset + 4.0, 12, "end", name);
    }
    text(&mut svg, left + n as f64 * cell / 2.0, height - 15.0, 13, "middle", "Prediction classes");
    let _ = write!(
        svg,
        r#"<text x="20" y="{y:.1}" font-family="{FONT}" font-size="13" text-anchor="middle" fill="{COLOR_AXIS}" transform="rotate(-90 20 {y:.1})">True classes</text>"#,
        y = top + n as f64 * cell / 2.0
    );
    svg.push_str("</svg>");

    fs::write(path, svg).at(path)
}

pub struct Tile {
    pub image: std::path::PathBuf,
    pub caption: String,
}

/// Grid of linked images with captions; captions may span several lines.
pub fn gallery(tiles: &[Tile], path: &Path) -> Result<()> {
    let tiles = &tiles[..tiles.len().min(GALLERY_MAX_TILES)];
    let columns = GALLERY_COLUMNS.min(tiles.len().max(1));
    let rows = tiles.len().div_ceil(columns).max(1);
    let pitch_y = TILE_SIZE + TILE_CAPTION + 10.0;
    let width = columns as f64 * (TILE_SIZE + 10.0) + 10.0;
    let height = rows as f64 * pitch_y + 10.0;

    let mut svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{width}" height="{height}" viewBox="0 0 {width} {height}"><rect width="100%" height="100%" fill="white"/>"#
    );

    for (i, tile) in tiles.iter().enumerate() {
        let x = 10.0 + (i % columns) as f64 * (TILE_SIZE + 10.0);
        let y = 10.0 + (i / columns) as f64 * pitch_y;

        for (line, caption) in tile.caption.lines().enumerate() {
            text(&mut svg, x + TILE_SIZE / 2.0, y + 14.0 + line as f64 * 16.0, 12, "middle", caption);
        }

        let href = escape_xml(&tile.image.to_string_lossy());
        let _ = write!(
            svg,
            r#"<image x="{x:.1}" y="{:.1}" width="{TILE_SIZE}" height="{TILE_SIZE}" href="{href}" xlink:href="{href}" preserveAspectRatio="xMidYMid meet"/>"#,
            y + TILE_CAPTION
        );
    }
    svg.push_str("</svg>");

    fs::write(path, svg).at(path)
}
