//! Irregularly-sampled lightcurve container.
//!
//! A [`GappyLightcurve`] stores timestamps, count rates, their uncertainties
//! and optional per-point exposure times and background rates. It is the
//! read-only data side of the inference engine; mutating operations
//! (`truncate`, `split`, `rand_remove`) return new instances.

use crate::simulator::{NoisePdf, SimulatorFactory};
use crate::model::PsdFn;
use crate::{Error, Result};
use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

/// An irregularly time-sampled series of count-rate measurements.
///
/// All arrays have one entry per datapoint. Timestamps are assumed to be in
/// seconds and sorted in ascending order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GappyLightcurve {
    times: Array1<f64>,
    y: Array1<f64>,
    dy: Array1<f64>,
    exposures: Array1<f64>,
    bkg_rate: Array1<f64>,
    bkg_rate_err: Array1<f64>,
}

impl GappyLightcurve {
    /// Create a new lightcurve.
    ///
    /// `dy`, `exposures`, `bkg_rate` and `bkg_rate_err` default to zeros when
    /// not supplied. When exposures are given, every timestamp spacing must
    /// be at least half the exposure sampling time.
    pub fn new(
        times: Array1<f64>,
        y: Array1<f64>,
        dy: Option<Array1<f64>>,
        exposures: Option<Array1<f64>>,
        bkg_rate: Option<Array1<f64>>,
        bkg_rate_err: Option<Array1<f64>>,
    ) -> Result<Self> {
        let n = times.len();
        let zeros = || Array1::zeros(n);

        let dy = dy.unwrap_or_else(zeros);
        let bkg_rate = bkg_rate.unwrap_or_else(zeros);
        let bkg_rate_err = bkg_rate_err.unwrap_or_else(zeros);

        for (name, arr) in [
            ("y", &y),
            ("dy", &dy),
            ("bkg_rate", &bkg_rate),
            ("bkg_rate_err", &bkg_rate_err),
        ] {
            if arr.len() != n {
                return Err(Error::InvalidParameter(format!(
                    "{} has {} entries but there are {} timestamps",
                    name,
                    arr.len(),
                    n
                )));
            }
        }

        let exposures = match exposures {
            Some(exposures) => {
                if exposures.len() != n {
                    return Err(Error::InvalidParameter(format!(
                        "exposures has {} entries but there are {} timestamps",
                        exposures.len(),
                        n
                    )));
                }
                // 1.01 guards against numerically distinct but equal spacings
                let epsilon = 1.01;
                let wrong = (1..n)
                    .filter(|&i| times[i] - times[i - 1] < exposures[i - 1] * epsilon / 2.0)
                    .count();
                if wrong > 0 {
                    return Err(Error::ExposureTime(format!(
                        "some timestamps ({}) have a spacing below the exposure sampling time",
                        wrong
                    )));
                }
                exposures
            }
            None => zeros(),
        };

        Ok(Self {
            times,
            y,
            dy,
            exposures,
            bkg_rate,
            bkg_rate_err,
        })
    }

    /// Create a lightcurve with the same exposure time for every datapoint.
    pub fn with_uniform_exposure(
        times: Array1<f64>,
        y: Array1<f64>,
        dy: Option<Array1<f64>>,
        exposure: f64,
    ) -> Result<Self> {
        let exposures = Array1::from_elem(times.len(), exposure);
        Self::new(times, y, dy, Some(exposures), None, None)
    }

    /// Timestamps of the lightcurve.
    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }

    /// Observed flux or count rate.
    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    /// 1-sigma uncertainty on `y`.
    pub fn dy(&self) -> &Array1<f64> {
        &self.dy
    }

    /// Exposure time of each datapoint.
    pub fn exposures(&self) -> &Array1<f64> {
        &self.exposures
    }

    /// Background rate associated with each datapoint.
    pub fn bkg_rate(&self) -> &Array1<f64> {
        &self.bkg_rate
    }

    /// Uncertainty on the background rate.
    pub fn bkg_rate_err(&self) -> &Array1<f64> {
        &self.bkg_rate_err
    }

    /// Number of datapoints.
    pub fn n(&self) -> usize {
        self.times.len()
    }

    /// Mean count rate.
    pub fn mean(&self) -> f64 {
        self.y.mean().unwrap_or(f64::NAN)
    }

    /// Duration of the lightcurve (`times[n-1] - times[0]`).
    pub fn duration(&self) -> f64 {
        match self.times.len() {
            0 => 0.0,
            n => self.times[n - 1] - self.times[0],
        }
    }

    /// Create a new lightcurve by cutting the data between `tmin` and `tmax`
    /// (inclusive).
    pub fn truncate(&self, tmin: f64, tmax: f64) -> Result<Self> {
        if tmin >= tmax {
            return Err(Error::InvalidParameter(format!(
                "minimum truncation time ({:.2e} s) is greater than or equal to maximum truncation time ({:.2e} s)",
                tmin, tmax
            )));
        }
        if !self.times.is_empty() && tmax < self.times[0] {
            return Err(Error::InvalidParameter(format!(
                "maximum truncation time ({:.2}) is lower than initial lightcurve time ({:.2})",
                tmax, self.times[0]
            )));
        }
        let keep: Vec<usize> = (0..self.n())
            .filter(|&i| self.times[i] >= tmin && self.times[i] <= tmax)
            .collect();
        Ok(self.select(&keep))
    }

    /// Split the lightcurve wherever consecutive timestamps are separated by
    /// more than `interval`.
    pub fn split(&self, interval: f64) -> Result<Vec<Self>> {
        let n = self.n();
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        let mut start = 0;
        for i in 1..n {
            if self.times[i] - self.times[i - 1] > interval {
                segments.push(self.truncate(self.times[start], self.times[i - 1])?);
                start = i;
            }
        }
        segments.push(self.truncate(self.times[start], self.times[n - 1])?);
        Ok(segments)
    }

    /// Randomly remove `points_remove` datapoints from the lightcurve.
    pub fn rand_remove<R: Rng + ?Sized>(&self, points_remove: usize, rng: &mut R) -> Result<Self> {
        if points_remove > self.n() {
            return Err(Error::InvalidParameter(format!(
                "number of points to remove ({}) is greater than number of lightcurve datapoints ({})",
                points_remove,
                self.n()
            )));
        }
        let removed = rand::seq::index::sample(rng, self.n(), points_remove);
        let mut mask = vec![true; self.n()];
        for i in removed {
            mask[i] = false;
        }
        let keep: Vec<usize> = (0..self.n()).filter(|&i| mask[i]).collect();
        Ok(self.select(&keep))
    }

    /// Save the lightcurve to a tab-separated file.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# t\trate\terror\texposure\tbkg_rate\tbkg_rate_err")?;
        for i in 0..self.n() {
            writeln!(
                writer,
                "{:.8e}\t{:.5}\t{:.5}\t{:.3}\t{:.5}\t{:.5}",
                self.times[i],
                self.y[i],
                self.dy[i],
                self.exposures[i],
                self.bkg_rate[i],
                self.bkg_rate_err[i]
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Create a simulator for this lightcurve's sampling pattern.
    ///
    /// The factory receives the PSD function, the lightcurve and the chosen
    /// noise distribution; the simulation mathematics lives entirely behind
    /// the [`SimulatorFactory`] seam.
    pub fn get_simulator<F: SimulatorFactory>(
        &self,
        factory: &F,
        psd: PsdFn,
        pdf: NoisePdf,
    ) -> Result<F::Sim> {
        factory.simulator(psd, self, pdf)
    }

    fn select(&self, keep: &[usize]) -> Self {
        let pick = |arr: &Array1<f64>| keep.iter().map(|&i| arr[i]).collect::<Array1<f64>>();
        Self {
            times: pick(&self.times),
            y: pick(&self.y),
            dy: pick(&self.dy),
            exposures: pick(&self.exposures),
            bkg_rate: pick(&self.bkg_rate),
            bkg_rate_err: pick(&self.bkg_rate_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn simple_lc() -> GappyLightcurve {
        let times = array![0.0, 10.0, 20.0, 35.0, 100.0, 110.0];
        let y = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let dy = array![0.1, 0.1, 0.1, 0.1, 0.1, 0.1];
        GappyLightcurve::new(times, y, Some(dy), None, None, None).unwrap()
    }

    #[test]
    fn test_basic_properties() {
        let lc = simple_lc();
        assert_eq!(lc.n(), 6);
        assert_eq!(lc.duration(), 110.0);
        assert!((lc.mean() - 3.5).abs() < 1e-12);
        assert_eq!(lc.exposures(), &Array1::<f64>::zeros(6));
    }

    #[test]
    fn test_length_mismatch() {
        let result = GappyLightcurve::new(
            array![0.0, 1.0],
            array![1.0],
            None,
            None,
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_exposure_validation() {
        // 10 s exposures over 1 s spacings cannot work
        let result = GappyLightcurve::with_uniform_exposure(
            array![0.0, 1.0, 2.0],
            array![1.0, 1.0, 1.0],
            None,
            10.0,
        );
        assert!(matches!(result, Err(Error::ExposureTime(_))));

        // generous spacing is fine
        let result = GappyLightcurve::with_uniform_exposure(
            array![0.0, 100.0, 200.0],
            array![1.0, 1.0, 1.0],
            None,
            10.0,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_truncate() {
        let lc = simple_lc();
        let cut = lc.truncate(10.0, 40.0).unwrap();
        assert_eq!(cut.n(), 3);
        assert_eq!(cut.times(), &array![10.0, 20.0, 35.0]);
        assert_eq!(cut.y(), &array![2.0, 3.0, 4.0]);

        assert!(lc.truncate(50.0, 40.0).is_err());
        assert!(lc.truncate(-20.0, -10.0).is_err());
    }

    #[test]
    fn test_split_on_gaps() {
        let lc = simple_lc();
        // only the 35 -> 100 spacing exceeds 30 s
        let segments = lc.split(30.0).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].n(), 4);
        assert_eq!(segments[1].n(), 2);

        // no gap larger than the full duration: single segment
        let segments = lc.split(1000.0).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].n(), 6);
    }

    #[test]
    fn test_rand_remove() {
        let lc = simple_lc();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let reduced = lc.rand_remove(2, &mut rng).unwrap();
        assert_eq!(reduced.n(), 4);
        // surviving points keep their original ordering
        for i in 1..reduced.n() {
            assert!(reduced.times()[i] > reduced.times()[i - 1]);
        }

        assert!(lc.rand_remove(7, &mut rng).is_err());
    }

    #[test]
    fn test_to_csv_roundtrip_lines() {
        let lc = simple_lc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lc.dat");
        lc.to_csv(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        // header plus one line per datapoint
        assert_eq!(contents.lines().count(), lc.n() + 1);
    }

    #[test]
    fn test_serde_roundtrip() {
        let lc = simple_lc();
        let serialized = serde_json::to_string(&lc).unwrap();
        let deserialized: GappyLightcurve = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.times(), lc.times());
        assert_eq!(deserialized.y(), lc.y());
    }
}
