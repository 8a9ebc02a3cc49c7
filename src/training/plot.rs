//! Prediction plots: one task's context and target points, the model fit
//! with an uncertainty band, sample paths for latent models, and the
//! ground-truth posterior where the process admits one.

use std::path::Path;

use anyhow::Result;
use ndarray::{Array1, Array3};
use plotters::prelude::*;
use rand::Rng;

use crate::data::{StochasticProcess, Task};
use crate::model::NeuralProcess;

const CURVE_POINTS: usize = 200;
const PLOT_PAD: f64 = 0.25;

fn slice_task(task: &Task, index: usize) -> (Array3<f64>, Array3<f64>, Array3<f64>, Array3<f64>) {
    let take = |a: &Array3<f64>| -> Array3<f64> {
        a.slice(ndarray::s![index..index + 1, .., ..]).to_owned()
    };
    (take(&task.xc), take(&task.yc), take(&task.xt), take(&task.yt))
}

fn flatten(a: &Array3<f64>) -> Array1<f64> {
    Array1::from_iter(a.iter().copied())
}

/// Render one task from a batch to a PNG file.
pub fn render_fit(
    model: &mut NeuralProcess,
    process: &dyn StochasticProcess,
    task: &Task,
    task_index: usize,
    num_samples: usize,
    rng: &mut impl Rng,
    path: &Path,
) -> Result<()> {
    let (xc, yc, xt, yt) = slice_task(task, task_index);

    let lo = xc.iter().chain(xt.iter()).cloned().fold(f64::INFINITY, f64::min) - PLOT_PAD;
    let hi = xc
        .iter()
        .chain(xt.iter())
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max)
        + PLOT_PAD;
    let xs = Array1::linspace(lo, hi, CURVE_POINTS);
    let xs3 = Array3::from_shape_fn((1, CURVE_POINTS, 1), |(_, i, _)| xs[i]);

    let prior = model.encode_context(&xc, &yc, &xs3);

    // Central fit: the prior mean stands in for the latent sample.
    let central = prior.as_ref().map(|p| p.mean.clone());
    let pred = model.decode(&xs3, central.as_ref(), None);
    let mean = flatten(&pred.mean);
    let sigma = flatten(&pred.sigma);

    let mut paths: Vec<Array1<f64>> = Vec::new();
    if let Some(p) = &prior {
        for _ in 0..num_samples {
            let (z, _) = p.sample(rng);
            let sample_pred = model.decode(&xs3, Some(&z), None);
            paths.push(flatten(&sample_pred.mean));
        }
    }

    let xc_flat = flatten(&xc);
    let yc_flat = flatten(&yc);
    let truth = process.posterior(&xc_flat, &yc_flat, &xs);

    // Vertical bounds over everything drawn.
    let mut y_lo = f64::INFINITY;
    let mut y_hi = f64::NEG_INFINITY;
    let mut cover = |v: f64| {
        y_lo = y_lo.min(v);
        y_hi = y_hi.max(v);
    };
    for i in 0..CURVE_POINTS {
        cover(mean[i] - 2.0 * sigma[i]);
        cover(mean[i] + 2.0 * sigma[i]);
    }
    for p in &paths {
        for &v in p.iter() {
            cover(v);
        }
    }
    for &v in yc.iter().chain(yt.iter()) {
        cover(v);
    }
    y_lo -= PLOT_PAD;
    y_hi += PLOT_PAD;

    let root = BitMapBackend::new(path, (900, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .caption(process.name(), ("sans-serif", 22))
        .build_cartesian_2d(lo..hi, y_lo..y_hi)?;
    chart.configure_mesh().draw()?;

    // Two-sigma band as a closed polygon.
    let mut band: Vec<(f64, f64)> = (0..CURVE_POINTS)
        .map(|i| (xs[i], mean[i] + 2.0 * sigma[i]))
        .collect();
    band.extend((0..CURVE_POINTS).rev().map(|i| (xs[i], mean[i] - 2.0 * sigma[i])));
    chart.draw_series(std::iter::once(Polygon::new(band, BLUE.mix(0.15))))?;

    for p in &paths {
        chart.draw_series(LineSeries::new(
            (0..CURVE_POINTS).map(|i| (xs[i], p[i])),
            BLUE.mix(0.35),
        ))?;
    }

    chart
        .draw_series(LineSeries::new(
            (0..CURVE_POINTS).map(|i| (xs[i], mean[i])),
            BLUE.stroke_width(2),
        ))?
        .label("model")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLUE.stroke_width(2)));

    if let Some((truth_mean, truth_var)) = truth {
        chart
            .draw_series(LineSeries::new(
                (0..CURVE_POINTS).map(|i| (xs[i], truth_mean[i])),
                RED.stroke_width(2),
            ))?
            .label("truth")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], RED.stroke_width(2)));
        for sign in [-1.0, 1.0] {
            chart.draw_series(LineSeries::new(
                (0..CURVE_POINTS).map(|i| (xs[i], truth_mean[i] + sign * 2.0 * truth_var[i].sqrt())),
                RED.mix(0.4),
            ))?;
        }
    }

    chart
        .draw_series(
            xc_flat
                .iter()
                .zip(yc_flat.iter())
                .map(|(&x, &y)| Circle::new((x, y), 4, BLACK.filled())),
        )?
        .label("context")
        .legend(|(x, y)| Circle::new((x + 8, y), 4, BLACK.filled()));

    let xt_flat = flatten(&xt);
    let yt_flat = flatten(&yt);
    chart
        .draw_series(
            xt_flat
                .iter()
                .zip(yt_flat.iter())
                .map(|(&x, &y)| Cross::new((x, y), 4, BLACK.mix(0.5))),
        )?
        .label("target")
        .legend(|(x, y)| Cross::new((x + 8, y), 4, BLACK.mix(0.5)));

    chart
        .configure_series_labels()
        .border_style(BLACK.mix(0.3))
        .background_style(WHITE.mix(0.8))
        .draw()?;
    root.present()?;
    Ok(())
}
