//! Alignment of software timestamps to a hardware TTL pulse train.
//!
//! Each software sample is mapped onto one TTL pulse. The first sample takes
//! the first pulse; every later sample takes the nearest pulse that occurs
//! strictly after the previously assigned pulse time. A repair pass then
//! reassigns samples that break ordering or share a pulse to the nearest
//! unused pulse.

use ndarray::Array1;
use tracing::{debug, warn};

use crate::error::{OpenEphysError, Result};
use crate::types::TrackingData;

/// Tuning of the nearest-pulse search and the repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Nearest pulses inspected before falling back to a full search
    pub candidates: usize,
    /// Upper bound on repair iterations
    pub max_repair_passes: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            candidates: 5,
            max_repair_passes: 10,
        }
    }
}

/// Pulse assigned to each software sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlAssignment {
    /// Assigned pulse time per software sample (s)
    pub times: Array1<f64>,
    /// Assigned pulse index per software sample
    pub indices: Vec<usize>,
}

/// Outcome of the repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairReport {
    pub passes: usize,
    pub reassigned: usize,
    /// Violations left when the pass budget or the unused pulses ran out
    pub remaining: usize,
}

/// Corrected assignment together with the pulses nobody claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub assignment: TtlAssignment,
    /// `missed[k]` is true when pulse `k` has no software sample
    pub missed: Vec<bool>,
    pub report: RepairReport,
}

/// Up to `k` pulse indices ordered by distance to `value`, lowest index first on ties.
///
/// `pulses` must be sorted ascending.
pub fn nearest_candidates(pulses: &[f64], value: f64, k: usize) -> Vec<usize> {
    let mut right = pulses.partition_point(|&p| p < value);
    let mut left = right;
    let mut picked = Vec::with_capacity(k.min(pulses.len()));

    while picked.len() < k && (left > 0 || right < pulses.len()) {
        let take_left = match (left.checked_sub(1), pulses.get(right)) {
            (Some(l), Some(&r)) => (value - pulses[l]).abs() <= (r - value).abs(),
            (Some(_), None) => true,
            _ => false,
        };
        if take_left {
            left -= 1;
            picked.push(left);
        } else {
            picked.push(right);
            right += 1;
        }
    }
    picked
}

/// Nearest pulse to `value` strictly later than `lower_bound`.
///
/// Inspects the `candidates` closest pulses first, then falls back to the
/// nearest pulse among all that lie after the bound.
pub fn find_nearest_after(
    pulses: &[f64],
    value: f64,
    lower_bound: f64,
    candidates: usize,
) -> Option<usize> {
    if let Some(idx) = nearest_candidates(pulses, value, candidates)
        .into_iter()
        .find(|&i| pulses[i] > lower_bound)
    {
        return Some(idx);
    }

    let start = pulses.partition_point(|&p| p <= lower_bound);
    nearest_candidates(&pulses[start..], value, 1)
        .first()
        .map(|&i| start + i)
}

/// Nearest pulse to `value` whose `used` flag is unset, lowest index on ties.
pub fn find_nearest_unused(pulses: &[f64], value: f64, used: &[bool]) -> Option<usize> {
    pulses
        .iter()
        .enumerate()
        .filter(|&(i, _)| !used[i])
        .min_by(|(_, a), (_, b)| (value - **a).abs().total_cmp(&(value - **b).abs()))
        .map(|(i, _)| i)
}

/// Assigns each software timestamp to a TTL pulse.
///
/// Fails with [`OpenEphysError::InvalidArgument`] when there are software
/// timestamps but no pulses.
pub fn assign_ttl(software: &[f64], pulses: &[f64], options: &SyncOptions) -> Result<TtlAssignment> {
    if software.is_empty() {
        return Ok(TtlAssignment {
            times: Array1::zeros(0),
            indices: Vec::new(),
        });
    }
    if pulses.is_empty() {
        return Err(OpenEphysError::InvalidArgument(
            "cannot assign software timestamps to an empty pulse train".to_string(),
        ));
    }

    let mut indices = Vec::with_capacity(software.len());
    indices.push(0);
    let mut fallbacks = 0usize;

    for &s in &software[1..] {
        let previous = pulses[indices[indices.len() - 1]];
        let idx = match find_nearest_after(pulses, s, previous, options.candidates) {
            Some(idx) => idx,
            None => {
                // Left for the repair pass
                fallbacks += 1;
                nearest_candidates(pulses, s, 1).first().copied().unwrap_or(0)
            }
        };
        indices.push(idx);
    }

    if fallbacks > 0 {
        debug!(fallbacks, "software timestamps ran past the last pulse");
    }

    Ok(TtlAssignment {
        times: indices.iter().map(|&i| pulses[i]).collect(),
        indices,
    })
}

/// Positions whose pulse breaks ordering or was already claimed earlier.
fn violations(indices: &[usize], num_pulses: usize) -> Vec<usize> {
    let mut seen = vec![false; num_pulses];
    let mut found = Vec::new();
    for (pos, &idx) in indices.iter().enumerate() {
        let out_of_order = pos > 0 && idx <= indices[pos - 1];
        if out_of_order || seen[idx] {
            found.push(pos);
        } else {
            seen[idx] = true;
        }
    }
    found
}

/// Reassigns violating samples to the nearest unused pulse.
pub fn repair(
    software: &[f64],
    pulses: &[f64],
    assignment: &mut TtlAssignment,
    options: &SyncOptions,
) -> RepairReport {
    let mut report = RepairReport::default();

    for _ in 0..options.max_repair_passes {
        let wrong = violations(&assignment.indices, pulses.len());
        if wrong.is_empty() {
            break;
        }
        report.passes += 1;

        let mut used = vec![false; pulses.len()];
        for (pos, &idx) in assignment.indices.iter().enumerate() {
            if wrong.binary_search(&pos).is_err() {
                used[idx] = true;
            }
        }

        let mut exhausted = false;
        let mut changed = false;
        for &pos in &wrong {
            let Some(idx) = find_nearest_unused(pulses, software[pos], &used) else {
                exhausted = true;
                break;
            };
            used[idx] = true;
            if assignment.indices[pos] != idx {
                assignment.indices[pos] = idx;
                assignment.times[pos] = pulses[idx];
                report.reassigned += 1;
                changed = true;
            }
        }
        if exhausted || !changed {
            break;
        }
    }

    report.remaining = violations(&assignment.indices, pulses.len()).len();
    if report.reassigned > 0 || report.remaining > 0 {
        warn!(
            reassigned = report.reassigned,
            remaining = report.remaining,
            total = software.len(),
            "repaired TTL assignment"
        );
    }
    report
}

/// Runs [`assign_ttl`] and [`repair`], then marks unclaimed pulses.
pub fn align(software: &[f64], pulses: &[f64], options: &SyncOptions) -> Result<Alignment> {
    let mut assignment = assign_ttl(software, pulses, options)?;
    let report = repair(software, pulses, &mut assignment, options);

    let mut missed = vec![true; pulses.len()];
    for &idx in &assignment.indices {
        missed[idx] = false;
    }

    Ok(Alignment {
        assignment,
        missed,
        report,
    })
}

/// Resamples a tracking stream onto the TTL time base.
///
/// The result has one sample per pulse. Pulses no tracking sample was
/// assigned to carry NaN positions and channel -1.
pub fn align_tracking(
    tracking: &TrackingData,
    pulses: &Array1<f64>,
    options: &SyncOptions,
) -> Result<TrackingData> {
    let software = tracking.times.to_vec();
    let pulse_times = pulses.to_vec();
    let alignment = align(&software, &pulse_times, options)?;

    let n = pulse_times.len();
    let mut out = TrackingData {
        times: pulses.clone(),
        x: Array1::from_elem(n, f64::NAN),
        y: Array1::from_elem(n, f64::NAN),
        width: Array1::from_elem(n, f64::NAN),
        height: Array1::from_elem(n, f64::NAN),
        channels: Array1::from_elem(n, -1),
    };
    for (i, &idx) in alignment.assignment.indices.iter().enumerate() {
        out.x[idx] = tracking.x[i];
        out.y[idx] = tracking.y[i];
        out.width[idx] = tracking.width[i];
        out.height[idx] = tracking.height[i];
        out.channels[idx] = tracking.channels[i];
    }

    let missed = alignment.missed.iter().filter(|&&m| m).count();
    debug!(samples = software.len(), pulses = n, missed, "aligned tracking to TTL");
    Ok(out)
}
