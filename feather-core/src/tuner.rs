//! Work-group size autotuner.
//!
//! The tuner decides the local work size of every GPU launch. Its mode is fixed
//! when the owning net is created:
//!
//! - `Disabled` launches with the derived default geometry.
//! - `Tuning` times every candidate of a (layer, kernel) pair once, keeps the
//!   fastest and records it.
//! - `Tuned` reads the geometry from a persisted table; a missing key is fatal.
//! - `TunerInProcess` times one new candidate per launch and keeps the best so
//!   far, spreading the search over many forward passes.
//!
//! Table keys have the form `{layer}_{kernel}_{gws|lws}`.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use feather_utils::TuningMode;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::TuningError;

/// Which half of a launch geometry a table key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Gws,
    Lws,
}

impl GeometryKind {
    fn suffix(self) -> &'static str {
        match self {
            GeometryKind::Gws => "gws",
            GeometryKind::Lws => "lws",
        }
    }
}

/// Table key for one geometry of one (layer, kernel) pair.
pub fn tuning_key(layer: &str, kernel: &str, kind: GeometryKind) -> String {
    format!("{layer}_{kernel}_{}", kind.suffix())
}

/// Global and local work size of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub gws: [u32; 3],
    pub lws: [u32; 3],
}

/// Recorded dimensions plus the time that earned them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningEntry {
    pub dims: [u32; 3],
    pub elapsed_ms: f64,
}

/// Persisted key to geometry table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TuningTable {
    entries: BTreeMap<String, TuningEntry>,
}

impl TuningTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: TuningEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&TuningEntry> {
        self.entries.get(key)
    }

    /// Dimensions recorded under `key`, or a lookup miss.
    pub fn lookup(&self, key: &str) -> Result<[u32; 3], TuningError> {
        self.entries
            .get(key)
            .map(|entry| entry.dims)
            .ok_or_else(|| TuningError::LookupMiss {
                key: key.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TuningEntry)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, TuningError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| TuningError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| TuningError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), TuningError> {
        let path = path.as_ref();
        let payload = serde_json::to_string_pretty(self).map_err(|source| TuningError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, payload).map_err(|source| TuningError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Candidate local work sizes for a problem of extent `gws`.
///
/// Every axis is a power of two bounded by its limit, by the work-group budget
/// and by the next power of two of its extent. Only sizes whose product divides
/// `max_work_group_size` are kept. `first` leads the list when it qualifies.
pub fn generate_candidates(
    gws: [u32; 3],
    max_work_group_size: u32,
    axis_limits: [u32; 3],
    first: [u32; 3],
) -> Vec<[u32; 3]> {
    let max = max_work_group_size.max(1);
    let bounds: Vec<u32> = (0..3)
        .map(|axis| {
            gws[axis]
                .max(1)
                .next_power_of_two()
                .min(axis_limits[axis].max(1))
                .min(max)
        })
        .collect();
    let divides = |lws: &[u32; 3]| {
        let product = lws.iter().try_fold(1u32, |acc, v| acc.checked_mul(*v));
        matches!(product, Some(p) if p <= max && max % p == 0)
    };

    let mut candidates = Vec::new();
    if divides(&first) && first.iter().zip(&bounds).all(|(v, b)| v <= b) {
        candidates.push(first);
    }
    let powers = |bound: u32| (0..32).map(|shift| 1u32 << shift).take_while(move |v| *v <= bound);
    for x in powers(bounds[0]) {
        for y in powers(bounds[1]) {
            for z in powers(bounds[2]) {
                let lws = [x, y, z];
                if divides(&lws) && lws != first {
                    candidates.push(lws);
                }
            }
        }
    }
    candidates
}

/// Evaluate every candidate and return the index of the fastest with its time.
///
/// Ties go to the earliest candidate. Every measured time is returned so
/// callers can audit the choice.
pub fn select_best<C, E, F>(candidates: &[C], mut measure: F) -> Result<(usize, f64, Vec<f64>), E>
where
    F: FnMut(&C) -> Result<f64, E>,
{
    let mut times = Vec::with_capacity(candidates.len());
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let elapsed = measure(candidate)?;
        times.push(elapsed);
        if best.is_none_or(|(_, fastest)| elapsed < fastest) {
            best = Some((index, elapsed));
        }
    }
    let (index, elapsed) = best.unwrap_or((0, f64::INFINITY));
    Ok((index, elapsed, times))
}

/// Device limits candidate generation works within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupLimits {
    pub max_work_group_size: u32,
    pub axis_limits: [u32; 3],
}

impl WorkGroupLimits {
    pub fn default_lws(&self, gws: [u32; 3]) -> [u32; 3] {
        crate::gpu::fine_tune_group_size(gws, self.max_work_group_size, self.axis_limits)
    }
}

#[derive(Debug)]
struct IncrementalSearch {
    gws: [u32; 3],
    candidates: Vec<[u32; 3]>,
    next: usize,
    best: Option<([u32; 3], f64)>,
}

/// Launch-geometry state for one net.
#[derive(Debug)]
pub struct Tuner {
    mode: TuningMode,
    table: TuningTable,
    warmup_runs: u32,
    /// Global size each kernel was last searched at.
    searched: HashMap<String, [u32; 3]>,
    in_process: HashMap<String, IncrementalSearch>,
    evaluations: usize,
}

impl Tuner {
    pub fn new(mode: TuningMode, table: TuningTable, warmup_runs: u32) -> Self {
        Self {
            mode,
            table,
            warmup_runs,
            searched: HashMap::new(),
            in_process: HashMap::new(),
            evaluations: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(TuningMode::Disabled, TuningTable::new(), 0)
    }

    pub fn mode(&self) -> TuningMode {
        self.mode
    }

    pub fn table(&self) -> &TuningTable {
        &self.table
    }

    /// Number of candidate timings taken so far, warm-ups excluded.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Decide the geometry of the next launch of `kernel` in `layer`.
    ///
    /// `measure` runs one synchronized, timed launch at the given local size
    /// and returns the elapsed milliseconds. It is only called in the modes
    /// that search.
    pub fn select<E, F>(
        &mut self,
        layer: &str,
        kernel: &str,
        gws: [u32; 3],
        limits: WorkGroupLimits,
        mut measure: F,
    ) -> Result<Geometry, E>
    where
        E: From<TuningError>,
        F: FnMut([u32; 3]) -> Result<f64, E>,
    {
        let default = Geometry {
            gws,
            lws: limits.default_lws(gws),
        };
        let lws_key = tuning_key(layer, kernel, GeometryKind::Lws);
        let gws_key = tuning_key(layer, kernel, GeometryKind::Gws);

        match self.mode {
            TuningMode::Disabled => Ok(default),
            TuningMode::Tuned => {
                let recorded_gws = self.table.lookup(&gws_key)?;
                if recorded_gws != gws {
                    return Err(TuningError::StaleEntry {
                        key: gws_key,
                        expected: gws,
                        found: recorded_gws,
                    }
                    .into());
                }
                let lws = self.table.lookup(&lws_key)?;
                Ok(Geometry { gws, lws })
            }
            TuningMode::Tuning => {
                if self.searched.get(&lws_key) == Some(&gws) {
                    return Ok(Geometry {
                        gws,
                        lws: self.table.lookup(&lws_key)?,
                    });
                }
                for _ in 0..self.warmup_runs {
                    measure(default.lws)?;
                }
                let candidates = generate_candidates(
                    gws,
                    limits.max_work_group_size,
                    limits.axis_limits,
                    default.lws,
                );
                if candidates.is_empty() {
                    return Err(TuningError::NoCandidates {
                        kernel: kernel.to_string(),
                    }
                    .into());
                }
                let (index, elapsed, _) = select_best(&candidates, |lws| measure(*lws))?;
                self.evaluations += candidates.len();
                let lws = candidates[index];
                info!(
                    target: "feather::tuner",
                    "{layer}/{kernel}: picked lws {lws:?} ({elapsed:.3} ms) from {} candidates",
                    candidates.len()
                );
                self.record(&gws_key, &lws_key, gws, lws, elapsed);
                self.searched.insert(lws_key, gws);
                Ok(Geometry { gws, lws })
            }
            TuningMode::TunerInProcess => {
                let fresh = self
                    .in_process
                    .get(&lws_key)
                    .is_none_or(|search| search.gws != gws);
                if fresh {
                    for _ in 0..self.warmup_runs {
                        measure(default.lws)?;
                    }
                    let candidates = generate_candidates(
                        gws,
                        limits.max_work_group_size,
                        limits.axis_limits,
                        default.lws,
                    );
                    self.in_process.insert(
                        lws_key.clone(),
                        IncrementalSearch {
                            gws,
                            candidates,
                            next: 0,
                            best: None,
                        },
                    );
                }
                let search = self.in_process.get_mut(&lws_key).ok_or_else(|| {
                    TuningError::NoCandidates {
                        kernel: kernel.to_string(),
                    }
                })?;

                let Some(lws) = search.candidates.get(search.next).copied() else {
                    return Ok(Geometry {
                        gws,
                        lws: search.best.map_or(default.lws, |(lws, _)| lws),
                    });
                };
                let elapsed = measure(lws)?;
                search.next += 1;
                let improved = search.best.is_none_or(|(_, fastest)| elapsed < fastest);
                if improved {
                    search.best = Some((lws, elapsed));
                }
                let (best_lws, best_ms) = search.best.unwrap_or((lws, elapsed));
                let remaining = search.candidates.len() - search.next;
                self.evaluations += 1;
                if improved {
                    self.record(&gws_key, &lws_key, gws, best_lws, best_ms);
                }
                debug!(
                    target: "feather::tuner",
                    "{layer}/{kernel}: lws {lws:?} took {elapsed:.3} ms, best {best_lws:?}, {remaining} left"
                );
                Ok(Geometry { gws, lws: best_lws })
            }
        }
    }

    fn record(&mut self, gws_key: &str, lws_key: &str, gws: [u32; 3], lws: [u32; 3], elapsed_ms: f64) {
        self.table.insert(
            gws_key,
            TuningEntry {
                dims: gws,
                elapsed_ms,
            },
        );
        self.table.insert(
            lws_key,
            TuningEntry {
                dims: lws,
                elapsed_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::NamedTempFile;

    const LIMITS: WorkGroupLimits = WorkGroupLimits {
        max_work_group_size: 64,
        axis_limits: [64, 64, 16],
    };

    fn cost(lws: [u32; 3]) -> f64 {
        // Fastest at [8, 4, 1].
        let target = [8i64, 4, 1];
        lws.iter()
            .zip(target)
            .map(|(v, t)| (*v as i64 - t).abs() as f64)
            .sum::<f64>()
            + 1.0
    }

    #[test]
    fn candidates_divide_the_budget_and_start_with_default() {
        let gws = [16, 16, 3];
        let first = LIMITS.default_lws(gws);
        let candidates = generate_candidates(gws, 64, LIMITS.axis_limits, first);
        assert_eq!(candidates[0], first);
        let unique: HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
        for lws in &candidates {
            let product: u32 = lws.iter().product();
            assert_eq!(64 % product, 0);
            assert!(lws[0] <= 16 && lws[1] <= 16 && lws[2] <= 4);
        }
    }

    #[test]
    fn select_best_picks_minimum_and_breaks_ties_by_order() {
        let candidates = [[1, 1, 1], [2, 1, 1], [4, 1, 1], [8, 1, 1]];
        let times = [3.0, 1.0, 1.0, 2.0];
        let (index, elapsed, measured) = select_best(&candidates, |lws| {
            let at = candidates.iter().position(|c| c == lws).expect("known");
            Ok::<_, TuningError>(times[at])
        })
        .expect("measure");
        assert_eq!(index, 1);
        assert_eq!(elapsed, 1.0);
        assert!(measured.iter().all(|t| elapsed <= *t));
    }

    #[test]
    fn tuning_mode_keeps_the_fastest_and_searches_once() {
        let mut tuner = Tuner::new(TuningMode::Tuning, TuningTable::new(), 2);
        let mut calls = Vec::new();
        let geometry = tuner
            .select::<TuningError, _>("L1", "conv", [16, 16, 1], LIMITS, |lws| {
                calls.push(lws);
                Ok(cost(lws))
            })
            .expect("tuning");
        assert_eq!(geometry.lws, [8, 4, 1]);

        let candidates = generate_candidates([16, 16, 1], 64, LIMITS.axis_limits, LIMITS.default_lws([16, 16, 1]));
        assert_eq!(calls.len(), candidates.len() + 2);
        let best = cost(geometry.lws);
        assert!(candidates.iter().all(|lws| best <= cost(*lws)));

        let table = tuner.table();
        assert_eq!(table.lookup("L1_conv_lws").expect("lws"), [8, 4, 1]);
        assert_eq!(table.lookup("L1_conv_gws").expect("gws"), [16, 16, 1]);

        let again = tuner
            .select::<TuningError, _>("L1", "conv", [16, 16, 1], LIMITS, |_| {
                panic!("second launch must reuse the recorded result")
            })
            .expect("cached");
        assert_eq!(again, geometry);
    }

    #[test]
    fn tuning_mode_searches_again_when_the_global_size_changes() {
        let mut tuner = Tuner::new(TuningMode::Tuning, TuningTable::new(), 0);
        tuner
            .select::<TuningError, _>("L1", "conv", [2, 2, 1], LIMITS, |lws| Ok(cost(lws)))
            .expect("small");
        let first = tuner.evaluations();

        let mut measured = 0;
        let geometry = tuner
            .select::<TuningError, _>("L1", "conv", [64, 64, 1], LIMITS, |lws| {
                measured += 1;
                Ok(cost(lws))
            })
            .expect("large");
        assert!(measured > 0);
        assert_eq!(tuner.evaluations(), first + measured);
        assert_eq!(geometry.lws, [8, 4, 1]);
        assert_eq!(tuner.table().lookup("L1_conv_gws").expect("gws"), [64, 64, 1]);

        let mut replay = Tuner::new(TuningMode::Tuned, tuner.table().clone(), 0);
        let replayed = replay
            .select::<TuningError, _>("L1", "conv", [64, 64, 1], LIMITS, |_| {
                panic!("tuned mode never measures")
            })
            .expect("table matches the reshaped graph");
        assert_eq!(replayed, geometry);
    }

    #[test]
    fn tuned_mode_reads_the_table_and_fails_on_miss() {
        let mut table = TuningTable::new();
        table.insert("L1_conv_gws", TuningEntry { dims: [8, 8, 1], elapsed_ms: 0.5 });
        table.insert("L1_conv_lws", TuningEntry { dims: [4, 2, 1], elapsed_ms: 0.5 });
        assert_eq!(table.lookup("L1_conv_gws").expect("present"), [8, 8, 1]);

        let mut tuner = Tuner::new(TuningMode::Tuned, table, 1);
        let never = |_: [u32; 3]| -> Result<f64, TuningError> { panic!("tuned mode never measures") };
        let geometry = tuner
            .select("L1", "conv", [8, 8, 1], LIMITS, never)
            .expect("hit");
        assert_eq!(geometry, Geometry { gws: [8, 8, 1], lws: [4, 2, 1] });

        let miss = tuner.select("L2", "conv", [8, 8, 1], LIMITS, never);
        assert!(matches!(miss, Err(TuningError::LookupMiss { key }) if key == "L2_conv_gws"));

        let stale = tuner.select("L1", "conv", [16, 8, 1], LIMITS, never);
        assert!(matches!(stale, Err(TuningError::StaleEntry { .. })));
    }

    #[test]
    fn in_process_mode_measures_one_candidate_per_call() {
        let mut tuner = Tuner::new(TuningMode::TunerInProcess, TuningTable::new(), 1);
        let gws = [16, 16, 1];
        let total = generate_candidates(gws, 64, LIMITS.axis_limits, LIMITS.default_lws(gws)).len();

        let mut measured = 0usize;
        let mut last = None;
        for call in 0..total + 3 {
            let mut this_call = 0usize;
            let geometry = tuner
                .select::<TuningError, _>("L1", "conv", gws, LIMITS, |lws| {
                    this_call += 1;
                    Ok(cost(lws))
                })
                .expect("incremental");
            let expected = match call {
                0 => 2,
                c if c < total => 1,
                _ => 0,
            };
            assert_eq!(this_call, expected, "call {call}");
            measured += this_call;
            last = Some(geometry);
        }
        assert_eq!(measured, total + 1);
        assert_eq!(tuner.evaluations(), total);
        assert_eq!(last.map(|g| g.lws), Some([8, 4, 1]));
        assert_eq!(tuner.table().lookup("L1_conv_lws").expect("recorded"), [8, 4, 1]);
    }

    #[test]
    fn disabled_mode_uses_the_default_geometry() {
        let mut tuner = Tuner::disabled();
        let geometry = tuner
            .select::<TuningError, _>("L1", "conv", [100, 3, 1], LIMITS, |_| {
                panic!("disabled mode never measures")
            })
            .expect("default");
        assert_eq!(geometry.lws, LIMITS.default_lws([100, 3, 1]));
        assert!(tuner.table().is_empty());
    }

    #[test]
    fn table_survives_save_and_load() {
        let file = NamedTempFile::new().expect("tempfile");
        let mut table = TuningTable::new();
        table.insert("conv1_convolution_lws", TuningEntry { dims: [4, 8, 2], elapsed_ms: 1.25 });
        table.save_to_path(file.path()).expect("save");
        let loaded = TuningTable::load_from_path(file.path()).expect("load");
        assert_eq!(loaded, table);

        std::fs::write(file.path(), "{ not json").expect("write");
        assert!(matches!(
            TuningTable::load_from_path(file.path()),
            Err(TuningError::Parse { .. })
        ));
    }
}
