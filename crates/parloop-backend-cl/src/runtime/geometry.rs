//! Work group sizing.
//!
//! Launches use a local size whose dimensions divide the global size, so
//! the emitted kernel needs no tail handling. The solver maximizes the
//! group volume under the device limits; when a device rejects a launch
//! anyway, the cache lowers a per (kernel, device) ceiling and later
//! attempts stay under it.

use std::collections::HashMap;
use std::sync::Mutex;

use parloop::exec::DeviceHandle;

/// Largest admissible local size for `global`. Every dimension is a
/// divisor of its global extent, capped by the device work-item limit and
/// the remembered ceiling; the volume is capped by the work group limit.
/// Among maximal volumes the most cube-like shape wins.
pub fn solve_local(
    global: &[usize],
    device: &DeviceHandle,
    ceiling: Option<[usize; 3]>,
) -> Vec<usize> {
    let group_limit = device.limits.max_work_group_size.max(1);
    let candidates: Vec<Vec<usize>> = global
        .iter()
        .enumerate()
        .map(|(d, &extent)| {
            let mut cap = device
                .limits
                .max_work_item_sizes
                .get(d)
                .copied()
                .unwrap_or(1)
                .max(1);
            if let Some(ceiling) = ceiling {
                cap = cap.min(ceiling.get(d).copied().unwrap_or(usize::MAX).max(1));
            }
            divisors_upto(extent.max(1), cap)
        })
        .collect();

    let mut best: Option<(usize, usize, Vec<usize>)> = None;
    let mut chosen = Vec::with_capacity(candidates.len());
    pick(&candidates, group_limit, &mut chosen, &mut best);
    match best {
        Some((_, _, local)) => local,
        // Size one per dimension always fits.
        None => vec![1; global.len()],
    }
}

fn divisors_upto(n: usize, cap: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            if i <= cap {
                out.push(i);
            }
            let pair = n / i;
            if pair != i && pair <= cap {
                out.push(pair);
            }
        }
        i += 1;
    }
    out.sort_unstable_by(|a, b| b.cmp(a));
    out
}

fn pick(
    candidates: &[Vec<usize>],
    group_limit: usize,
    chosen: &mut Vec<usize>,
    best: &mut Option<(usize, usize, Vec<usize>)>,
) {
    let depth = chosen.len();
    if depth == candidates.len() {
        let volume: usize = chosen.iter().product();
        let perimeter: usize = chosen.iter().sum();
        let better = match best {
            None => true,
            Some((v, p, _)) => volume > *v || (volume == *v && perimeter < *p),
        };
        if better {
            *best = Some((volume, perimeter, chosen.clone()));
        }
        return;
    }
    let used: usize = chosen.iter().product();
    for &size in &candidates[depth] {
        if used.saturating_mul(size) > group_limit {
            continue;
        }
        chosen.push(size);
        pick(candidates, group_limit, chosen, best);
        chosen.pop();
    }
}

/// Per (kernel entry, device) local-size ceilings, lowered after rejected
/// launches.
#[derive(Default)]
pub struct GeometryCache {
    ceilings: Mutex<HashMap<(String, String), [usize; 3]>>,
}

impl GeometryCache {
    pub fn new() -> GeometryCache {
        GeometryCache::default()
    }

    /// Local size for this kernel on this device, under any learned
    /// ceiling.
    pub fn local_for(&self, entry: &str, device: &DeviceHandle, global: &[usize]) -> Vec<usize> {
        let ceiling = self
            .ceilings
            .lock()
            .expect("geometry cache lock poisoned")
            .get(&(entry.to_string(), device.identity()))
            .copied();
        solve_local(global, device, ceiling)
    }

    /// Lower the ceiling below a rejected local size. `false` when the
    /// size was already minimal, meaning the device cannot launch this
    /// kernel at all.
    pub fn shrink(&self, entry: &str, device: &DeviceHandle, rejected: &[usize]) -> bool {
        if rejected.iter().all(|&l| l <= 1) {
            return false;
        }
        let mut ceilings = self.ceilings.lock().expect("geometry cache lock poisoned");
        let slot = ceilings
            .entry((entry.to_string(), device.identity()))
            .or_insert([usize::MAX; 3]);
        for (d, &l) in rejected.iter().take(3).enumerate() {
            slot[d] = slot[d].min(l.saturating_sub(1).max(1));
        }
        true
    }
}
