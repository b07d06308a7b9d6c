//! Repeated length measurements at one waypoint.

use cablebot_shared::AxisId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchRejection {
    pub axis: AxisId,
    pub deviation: f64,
}

/// Accepts a batch when every axis spreads by at most `max_deviation`; returns the
/// per-axis mean.
pub fn evaluate_batch(samples: &[[f64; 4]], max_deviation: f64) -> Result<[f64; 4], BatchRejection> {
    let mut means = [0.0; 4];
    let mut worst: Option<BatchRejection> = None;
    for axis in AxisId::ALL {
        let i = axis.index();
        let min = samples.iter().map(|s| s[i]).fold(f64::INFINITY, f64::min);
        let max = samples.iter().map(|s| s[i]).fold(f64::NEG_INFINITY, f64::max);
        let deviation = max - min;
        if deviation > max_deviation && worst.is_none_or(|w| deviation > w.deviation) {
            worst = Some(BatchRejection { axis, deviation });
        }
        means[i] = samples.iter().map(|s| s[i]).sum::<f64>() / samples.len().max(1) as f64;
    }
    match worst {
        Some(rejection) => Err(rejection),
        None => Ok(means),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatus {
    Collecting,
    Accepted([f64; 4]),
    Rejected(BatchRejection),
}

/// Drops the settling samples, keeps the next `kept`, then judges them.
#[derive(Debug, Clone)]
pub struct MeasurementBatch {
    discard: usize,
    kept: usize,
    max_deviation: f64,
    seen: usize,
    samples: Vec<[f64; 4]>,
}

impl MeasurementBatch {
    pub fn new(discard: usize, kept: usize, max_deviation: f64) -> Self {
        Self {
            discard,
            kept: kept.max(1),
            max_deviation,
            seen: 0,
            samples: Vec::with_capacity(kept),
        }
    }

    /// Index of the next measurement within the batch, counting discarded ones.
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn samples(&self) -> &[[f64; 4]] {
        &self.samples
    }

    pub fn push(&mut self, sample: [f64; 4]) -> BatchStatus {
        self.seen += 1;
        if self.seen <= self.discard {
            return BatchStatus::Collecting;
        }
        self.samples.push(sample);
        if self.samples.len() < self.kept {
            return BatchStatus::Collecting;
        }
        match evaluate_batch(&self.samples, self.max_deviation) {
            Ok(mean) => BatchStatus::Accepted(mean),
            Err(rejection) => BatchStatus::Rejected(rejection),
        }
    }

    pub fn restart(&mut self) {
        self.seen = 0;
        self.samples.clear();
    }
}
