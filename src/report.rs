use crate::error::{Error, Result};
use plotters::prelude::*;
use plotters::style::{register_font, FontStyle};
use std::path::Path;

/// Number of consecutive step losses averaged into one plotted point.
pub const LOSS_BUCKET: usize = 100;

/// What to do with losses that do not fill a whole bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemainderPolicy {
    #[default]
    Fail,
    Truncate,
}

pub fn bucket_means(losses: &[f32], bucket: usize, policy: RemainderPolicy) -> Result<Vec<f32>> {
    let err = || Error::LossHistory {
        len: losses.len(),
        bucket,
    };
    if bucket == 0 {
        return Err(err());
    }
    if policy == RemainderPolicy::Fail && losses.len() % bucket != 0 {
        return Err(err());
    }
    let means: Vec<f32> = losses
        .chunks_exact(bucket)
        .map(|chunk| chunk.iter().sum::<f32>() / bucket as f32)
        .collect();
    if means.is_empty() {
        return Err(err());
    }
    Ok(means)
}

const FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const TITLE: &str = "Training of MinGPT on The Pile";

fn plot_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Plot(e.to_string())
}

/// Draws bucket index against mean loss and writes the image to `path`.
/// The format follows the file extension.
pub fn plot_loss_curve(means: &[f32], path: &Path) -> Result<()> {
    if means.is_empty() {
        return Err(Error::Plot("nothing to plot".to_string()));
    }
    register_font("sans-serif", FontStyle::Normal, FONT)
        .map_err(|_| Error::Plot("bundled font is not a valid TrueType file".to_string()))?;

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let x_max = (means.len() - 1).max(1) as f32;
    let (lo, hi) = means
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &m| (lo.min(m), hi.max(m)));
    let pad = ((hi - lo) * 0.05).max(0.5);

    let mut chart = ChartBuilder::on(&root)
        .caption(TITLE, ("sans-serif", 28))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(0f32..x_max, (lo - pad)..(hi + pad))
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("Iterations")
        .y_desc("Loss")
        .label_style(("sans-serif", 16))
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(
            means.iter().enumerate().map(|(i, &m)| (i as f32, m)),
            BLUE.stroke_width(2),
        ))
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    tracing::info!(path = %path.display(), points = means.len(), "saved loss curve");
    Ok(())
}
