//! Operations with serial, multi-core and accelerator implementations.

use std::thread;

use anyhow::{anyhow, Result};

use crate::backend::MemFlags;
use crate::control::Control;

/// An operation with one implementation per backend path.
///
/// [`Control::execute`] resolves the run mode per call and invokes the
/// matching method.
pub trait AcceleratedOp<Input, Output> {
    /// Device implementation. Scratch and staging buffers come from the
    /// control's allocation cache.
    fn run_accelerator(&self, input: &Input, control: &Control) -> Result<Output>;

    /// Host implementation spread across all cores.
    fn run_multicore(&self, input: &Input) -> Result<Output>;

    /// Single-threaded reference implementation.
    fn run_serial(&self, input: &Input) -> Result<Output>;
}

/// Samples summarised by [`StatsOp`].
#[derive(Debug)]
pub struct StatsInput {
    pub data: Vec<f32>,
}

/// Summary of a sample. All fields are zero for an empty sample.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct StatsOutput {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Divides by the sample count, not count - 1.
    pub variance: f32,
}

/// Min, max, mean and population variance of a sample.
pub struct StatsOp;

#[derive(Debug, Clone, Copy)]
struct Partial {
    min: f32,
    max: f32,
    sum: f64,
    sum_sq: f64,
    n: usize,
}

impl Partial {
    const EMPTY: Partial = Partial {
        min: f32::MAX,
        max: f32::MIN,
        sum: 0.0,
        sum_sq: 0.0,
        n: 0,
    };

    fn of(data: &[f32]) -> Self {
        data.iter().fold(Self::EMPTY, |mut acc, &val| {
            acc.min = acc.min.min(val);
            acc.max = acc.max.max(val);
            acc.sum += f64::from(val);
            acc.sum_sq += f64::from(val) * f64::from(val);
            acc.n += 1;
            acc
        })
    }

    fn merge(self, other: Partial) -> Self {
        Partial {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
            sum_sq: self.sum_sq + other.sum_sq,
            n: self.n + other.n,
        }
    }

    fn finish(self) -> StatsOutput {
        if self.n == 0 {
            return StatsOutput {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                variance: 0.0,
            };
        }
        let n = self.n as f64;
        let mean = self.sum / n;
        // E[x^2] - (E[x])^2, clamped against rounding below zero
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        StatsOutput {
            min: self.min,
            max: self.max,
            mean: mean as f32,
            variance: variance as f32,
        }
    }
}

impl AcceleratedOp<StatsInput, StatsOutput> for StatsOp {
    fn run_accelerator(&self, input: &StatsInput, control: &Control) -> Result<StatsOutput> {
        if input.data.is_empty() {
            return self.run_serial(input);
        }

        let bytes: Vec<u8> = input.data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let staging = control.acquire_buffer(bytes.len(), MemFlags::READ_ONLY, None)?;
        staging.write(0, &bytes)?;

        let mut device_view = vec![0u8; bytes.len()];
        staging.read(0, &mut device_view)?;
        let samples: Vec<f32> = device_view
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // One partial per work-group, reduced afterwards.
        let groups = control.work_group_count().max(1) as usize;
        let chunk = samples.len().div_ceil(groups).max(1);
        let total = samples
            .chunks(chunk)
            .map(Partial::of)
            .fold(Partial::EMPTY, Partial::merge);

        Ok(total.finish())
    }

    fn run_multicore(&self, input: &StatsInput) -> Result<StatsOutput> {
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        let chunk = input.data.len().div_ceil(workers).max(1);

        let total = thread::scope(|s| {
            let handles: Vec<_> = input
                .data
                .chunks(chunk)
                .map(|part| s.spawn(move || Partial::of(part)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow!("stats worker panicked")))
                .try_fold(Partial::EMPTY, |acc, part| part.map(|p| acc.merge(p)))
        })?;

        Ok(total.finish())
    }

    fn run_serial(&self, input: &StatsInput) -> Result<StatsOutput> {
        Ok(Partial::of(&input.data).finish())
    }
}
