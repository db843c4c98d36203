//! GPU-like resource lines with percentage budgets.
//!
//! Reservations are RAII handles: dropping a [`Reservation`] returns its
//! share to the line, whichever task happens to hold it at that point.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a job asks for when it is admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Line the job must run on; `None` lets the manager pick.
    #[serde(default)]
    pub line_hint: Option<usize>,
    /// Share of the line's budget, in percent. Zero needs no line at all.
    #[serde(default)]
    pub percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Line {
    budget: u32,
    used: u32,
    /// Changes whenever the slot is removed and re-added.
    generation: u64,
}

impl Line {
    fn fits(&self, percent: u32) -> bool {
        self.used.saturating_add(percent) <= self.budget
    }
}

/// Snapshot of one line for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineUsage {
    pub budget: u32,
    pub used: u32,
}

#[derive(Debug, Default)]
struct Lines {
    lines: Vec<Line>,
    next_generation: u64,
}

impl Lines {
    fn fresh(&mut self, budget: u32) -> Line {
        let generation = self.next_generation;
        self.next_generation += 1;
        Line {
            budget,
            used: 0,
            generation,
        }
    }
}

/// Thread-safe accounting of resource lines.
#[derive(Debug)]
pub struct ResourceManager {
    inner: Mutex<Lines>,
}

/// A granted share of one line, released on drop.
#[derive(Debug)]
pub struct Reservation {
    manager: Arc<ResourceManager>,
    line: Option<usize>,
    generation: u64,
    percent: u32,
}

impl Reservation {
    /// Line the share was taken from (`None` for zero-percent requests).
    pub fn line(&self) -> Option<usize> {
        self.line
    }

    pub fn percent(&self) -> u32 {
        self.percent
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(line) = self.line {
            self.manager.release(line, self.generation, self.percent);
        }
    }
}

impl ResourceManager {
    /// Create a manager with one line per budget entry.
    pub fn new(budgets: &[u32]) -> Arc<Self> {
        let mut inner = Lines::default();
        let lines = budgets.iter().map(|&budget| inner.fresh(budget)).collect();
        inner.lines = lines;
        Arc::new(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Replace the line budgets, keeping current usage of surviving lines.
    ///
    /// Lowering a budget below current usage never revokes a reservation;
    /// it only blocks new ones until usage drops. A line that is removed and
    /// later added back starts empty, and reservations taken before the
    /// removal no longer count against it.
    pub fn set_budgets(&self, budgets: &[u32]) {
        let mut inner = self.inner.lock();
        let old = std::mem::take(&mut inner.lines);
        let lines: Vec<Line> = budgets
            .iter()
            .enumerate()
            .map(|(i, &budget)| match old.get(i) {
                Some(l) => Line { budget, ..*l },
                None => inner.fresh(budget),
            })
            .collect();
        inner.lines = lines;
    }

    /// Try to take `request.percent` of a line. Refusal is back-pressure,
    /// not an error.
    pub fn try_reserve(self: &Arc<Self>, request: ResourceRequest) -> Option<Reservation> {
        if request.percent == 0 {
            return Some(Reservation {
                manager: Arc::clone(self),
                line: None,
                generation: 0,
                percent: 0,
            });
        }

        let mut inner = self.inner.lock();
        let lines = &mut inner.lines;
        let chosen = match request.line_hint {
            Some(i) => lines.get(i).filter(|l| l.fits(request.percent)).map(|_| i),
            // Least loaded line that still fits
            None => lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.fits(request.percent))
                .min_by_key(|(_, l)| l.used)
                .map(|(i, _)| i),
        }?;

        lines[chosen].used += request.percent;
        Some(Reservation {
            manager: Arc::clone(self),
            line: Some(chosen),
            generation: lines[chosen].generation,
            percent: request.percent,
        })
    }

    /// Whether the request could be granted on an otherwise idle system.
    pub fn can_ever_satisfy(&self, request: ResourceRequest) -> bool {
        if request.percent == 0 {
            return true;
        }
        let inner = self.inner.lock();
        let lines = &inner.lines;
        match request.line_hint {
            Some(i) => lines.get(i).map_or(false, |l| request.percent <= l.budget),
            None => lines.iter().any(|l| request.percent <= l.budget),
        }
    }

    pub fn usage(&self) -> Vec<LineUsage> {
        self.inner
            .lock()
            .lines
            .iter()
            .map(|l| LineUsage {
                budget: l.budget,
                used: l.used,
            })
            .collect()
    }

    fn release(&self, line: usize, generation: u64, percent: u32) {
        let mut inner = self.inner.lock();
        // The line may have been removed, or removed and re-added, since
        if let Some(l) = inner
            .lines
            .get_mut(line)
            .filter(|l| l.generation == generation)
        {
            l.used = l.used.saturating_sub(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn req(line_hint: Option<usize>, percent: u32) -> ResourceRequest {
        ResourceRequest { line_hint, percent }
    }

    #[test]
    fn test_second_sixty_percent_waits_for_release() {
        let rm = ResourceManager::new(&[100]);
        let first = rm.try_reserve(req(None, 60)).expect("first fits");
        assert!(rm.try_reserve(req(None, 60)).is_none());

        drop(first);
        let second = rm.try_reserve(req(None, 60));
        assert!(second.is_some());
        assert_eq!(rm.usage()[0].used, 60);
    }

    #[test]
    fn test_zero_percent_always_granted() {
        let rm = ResourceManager::new(&[]);
        let r = rm.try_reserve(req(None, 0)).expect("zero is free");
        assert_eq!(r.line(), None);
    }

    #[test]
    fn test_hint_selects_line() {
        let rm = ResourceManager::new(&[100, 100]);
        let r = rm.try_reserve(req(Some(1), 50)).unwrap();
        assert_eq!(r.line(), Some(1));
        assert!(rm.try_reserve(req(Some(2), 10)).is_none());
    }

    #[test]
    fn test_least_loaded_line_chosen() {
        let rm = ResourceManager::new(&[100, 100]);
        let a = rm.try_reserve(req(None, 30)).unwrap();
        let b = rm.try_reserve(req(None, 30)).unwrap();
        assert_ne!(a.line(), b.line());
    }

    #[test]
    fn test_can_ever_satisfy() {
        let rm = ResourceManager::new(&[100, 50]);
        assert!(rm.can_ever_satisfy(req(None, 100)));
        assert!(!rm.can_ever_satisfy(req(None, 101)));
        assert!(!rm.can_ever_satisfy(req(Some(1), 60)));
        assert!(!rm.can_ever_satisfy(req(Some(5), 1)));
        assert!(rm.can_ever_satisfy(req(Some(5), 0)));
    }

    #[test]
    fn test_shrinking_budget_keeps_reservation() {
        let rm = ResourceManager::new(&[100]);
        let r = rm.try_reserve(req(None, 80)).unwrap();
        rm.set_budgets(&[50]);
        assert_eq!(rm.usage()[0], LineUsage { budget: 50, used: 80 });
        assert!(rm.try_reserve(req(None, 10)).is_none());
        drop(r);
        assert!(rm.try_reserve(req(None, 10)).is_some());
    }

    #[test]
    fn test_release_after_line_removed() {
        let rm = ResourceManager::new(&[100, 100]);
        let r = rm.try_reserve(req(Some(1), 40)).unwrap();
        rm.set_budgets(&[100]);
        drop(r);
        assert_eq!(rm.usage().len(), 1);
    }

    #[test]
    fn test_stale_release_after_line_readded() {
        let rm = ResourceManager::new(&[100, 100]);
        let a = rm.try_reserve(req(Some(1), 40)).unwrap();
        rm.set_budgets(&[100]);
        rm.set_budgets(&[100, 100]);
        assert_eq!(rm.usage()[1], LineUsage { budget: 100, used: 0 });

        let b = rm.try_reserve(req(Some(1), 60)).unwrap();
        drop(a);
        assert_eq!(rm.usage()[1].used, 60);
        assert!(rm.try_reserve(req(Some(1), 80)).is_none());

        drop(b);
        assert_eq!(rm.usage()[1].used, 0);
    }

    #[test]
    fn test_surviving_line_keeps_reservations_across_resize() {
        let rm = ResourceManager::new(&[100]);
        let a = rm.try_reserve(req(Some(0), 40)).unwrap();
        rm.set_budgets(&[100, 100]);
        rm.set_budgets(&[80]);
        assert_eq!(rm.usage()[0], LineUsage { budget: 80, used: 40 });
        drop(a);
        assert_eq!(rm.usage()[0].used, 0);
    }

    #[test]
    fn test_concurrent_reserve_release() {
        let rm = ResourceManager::new(&[100]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rm = Arc::clone(&rm);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(r) = rm.try_reserve(req(None, 30)) {
                            assert!(rm.usage()[0].used <= 100);
                            drop(r);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rm.usage()[0].used, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Usage never exceeds any budget and returns to zero once all
        // reservations are dropped.
        #[test]
        fn prop_accounting_balances(
            budgets in proptest::collection::vec(1u32..200, 1..4),
            requests in proptest::collection::vec((proptest::option::of(0usize..4), 0u32..120), 1..30),
        ) {
            let rm = ResourceManager::new(&budgets);
            let mut held = Vec::new();
            for (hint, percent) in requests {
                if let Some(r) = rm.try_reserve(req(hint, percent)) {
                    held.push(r);
                }
                for usage in rm.usage() {
                    prop_assert!(usage.used <= usage.budget);
                }
            }
            drop(held);
            for usage in rm.usage() {
                prop_assert_eq!(usage.used, 0);
            }
        }
    }
}
