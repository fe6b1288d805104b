//! # End-of-Run Export
//!
//! Writes the final training batch's predictions and targets per output
//! feature as time-sorted CSV files under `<log_dir>/data/`. Export runs
//! after training has completed; a failure here never invalidates the
//! finished run (the caller logs and moves on).

use candle_core::Tensor;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::DiscoveryResult;

/// Write `prediction_x{i}.csv` and `data_x{i}.csv` for every feature.
///
/// Rows are sorted by the time coordinate so the files plot cleanly.
pub fn export_final_batch(
    log_dir: &Path,
    coords: &Tensor,
    prediction: &Tensor,
    targets: &Tensor,
) -> DiscoveryResult<()> {
    let data_dir = log_dir.join("data");
    fs::create_dir_all(&data_dir)?;

    let coord_rows = coords.to_vec2::<f64>()?;
    let pred_rows = prediction.to_vec2::<f64>()?;
    let target_rows = targets.to_vec2::<f64>()?;
    let n_features = pred_rows.first().map(|r| r.len()).unwrap_or(0);

    for f in 0..n_features {
        let mut rows: Vec<(f64, f64, f64)> = coord_rows
            .iter()
            .zip(pred_rows.iter().zip(target_rows.iter()))
            .map(|(c, (p, t))| (c[0], p[f], t[f]))
            .collect();
        rows.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let pred_path = data_dir.join(format!("prediction_x{}.csv", f + 1));
        let mut file = fs::File::create(&pred_path)?;
        writeln!(file, "t,prediction")?;
        for &(t, p, _) in &rows {
            writeln!(file, "{},{}", t, p)?;
        }

        let data_path = data_dir.join(format!("data_x{}.csv", f + 1));
        let mut file = fs::File::create(&data_path)?;
        writeln!(file, "t,target")?;
        for &(t, _, y) in &rows {
            writeln!(file, "{},{}", t, y)?;
        }
    }

    log::info!("Exported final-batch CSVs to {:?}", data_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::TempDir;

    #[test]
    fn test_export_writes_sorted_csvs() {
        let device = Device::Cpu;
        // Deliberately unsorted time column.
        let coords = Tensor::from_vec(vec![2.0f64, 0.0, 1.0], (3, 1), &device).unwrap();
        let prediction = Tensor::from_vec(vec![20.0f64, 0.5, 10.0, 21.0, 1.5, 11.0], (3, 2), &device)
            .unwrap();
        let targets = prediction.clone();

        let dir = TempDir::new().unwrap();
        export_final_batch(dir.path(), &coords, &prediction, &targets).unwrap();

        let csv = fs::read_to_string(dir.path().join("data/prediction_x1.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "t,prediction");
        assert!(lines[1].starts_with("0,"));
        assert!(lines[2].starts_with("1,"));
        assert!(lines[3].starts_with("2,"));

        assert!(dir.path().join("data/data_x2.csv").exists());
    }
}
