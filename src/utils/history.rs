//! Persisting and reporting training curves

use std::path::Path;

use log::info;

use super::save_json;
use crate::core::TrainingHistory;
use crate::Result;

/// Write `history.json` into `dir`, plus `accuracy.png` and `loss.png` when
/// built with the `viz` feature
pub fn save_train_history(history: &TrainingHistory, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    super::make_dir(dir)?;
    save_json(history, dir.join("history.json"))?;

    #[cfg(feature = "viz")]
    {
        plot::curves(&dir.join("accuracy.png"), "model accuracy", "accuracy", &history.acc, &history.val_acc)?;
        plot::curves(&dir.join("loss.png"), "model loss", "loss", &history.loss, &history.val_loss)?;
    }
    Ok(())
}

/// Log the per-epoch curves as a table
pub fn display_train_history(history: &TrainingHistory) {
    info!("{:>6} {:>10} {:>10} {:>10} {:>10}", "epoch", "loss", "acc", "val_loss", "val_acc");
    for epoch in 0..history.epochs() {
        let val = |curve: &[f32]| curve.get(epoch).map_or("-".to_string(), |v| format!("{:.4}", v));
        info!(
            "{:>6} {:>10.4} {:>10.4} {:>10} {:>10}",
            epoch + 1,
            history.loss[epoch],
            history.acc.get(epoch).copied().unwrap_or(0.0),
            val(&history.val_loss),
            val(&history.val_acc)
        );
    }
}

#[cfg(feature = "viz")]
mod plot {
    use std::path::Path;

    use plotters::prelude::*;

    use crate::{NetError, Result};

    fn plot_error<E: std::fmt::Display>(e: E) -> NetError {
        NetError::Plot(e.to_string())
    }

    /// Train and validation curves over epochs
    pub(super) fn curves(path: &Path, caption: &str, y_desc: &str, train: &[f32], val: &[f32]) -> Result<()> {
        let epochs = train.len().max(val.len()).max(1);
        let (lo, hi) = train
            .iter()
            .chain(val)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let (lo, hi) = if lo.is_finite() && hi > lo { (lo, hi) } else { (0.0, 1.0) };

        let root = BitMapBackend::new(path, (640, 480)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_error)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(caption, ("sans-serif", 24))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0..epochs, lo..hi)
            .map_err(plot_error)?;
        chart
            .configure_mesh()
            .x_desc("epoch")
            .y_desc(y_desc)
            .draw()
            .map_err(plot_error)?;

        chart
            .draw_series(LineSeries::new(train.iter().enumerate().map(|(i, &v)| (i, v)), &BLUE))
            .map_err(plot_error)?
            .label("train")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
        if !val.is_empty() {
            chart
                .draw_series(LineSeries::new(val.iter().enumerate().map(|(i, &v)| (i, v)), &RED))
                .map_err(plot_error)?
                .label("test")
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        }
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .border_style(BLACK)
            .draw()
            .map_err(plot_error)?;
        root.present().map_err(plot_error)?;
        Ok(())
    }
}
