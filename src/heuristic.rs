//! Scoring of resolutions.
//!
//! The scoring function is injected wherever a score is needed so that
//! deployments can swap the formula without touching the cache machinery.
//! Scores are non-negative, larger is better, and a function must stay pure:
//! the wall clock is an argument, not an ambient read.

use crate::config::HeuristicChoice;
use crate::db::associator::Resolution;

pub type Heuristic = fn(&Resolution, f64) -> f64;

const ONE_DAY: f64 = 86_400.0;

impl Resolution {
    /// Number of labels in the final fqdn.
    pub fn number_of_labels(&self) -> usize {
        match self.chain.terminal() {
            Some(terminal) => terminal
                .trim_end_matches('.')
                .split('.')
                .filter(|l| !l.is_empty())
                .count(),
            None => 0,
        }
    }

    /// Number of cnames in the resolution chain.
    pub fn depth_of_chain(&self) -> usize {
        self.chain.depth()
    }

    pub fn first_seen_delta(&self, now: f64) -> f64 {
        now - self.first_seen
    }

    pub fn last_seen_delta(&self, now: f64) -> f64 {
        now - self.last_seen
    }

    /// Queries per second over the resolution's lifetime.
    pub fn query_rate(&self, now: f64) -> f64 {
        self.query_count as f64 / (now - self.first_seen)
    }
}

pub fn for_choice(choice: HeuristicChoice) -> Heuristic {
    match choice {
        HeuristicChoice::Standard => standard,
        HeuristicChoice::Attenuating => attenuating,
    }
}

/// Prefers deeper chains terminating in shorter FQDNs; all other things
/// being roughly equal, the larger query count wins.
///
///     <depth of chain> / <number of labels> + ln(<query count>)
pub fn standard(resolution: &Resolution, _now: f64) -> f64 {
    let n_labels = resolution.number_of_labels();
    if n_labels == 0 {
        return 0.0;
    }
    resolution.depth_of_chain() as f64 / n_labels as f64 + (resolution.query_count as f64).ln()
}

/// The standard goals, attenuated when there is no activity:
///
///     (<depth> / <labels> + ln(<count>))
///         / (1 + (sqrt(<trend>^2 + <last seen delta>^2) / 172800)^2)
pub fn attenuating(resolution: &Resolution, now: f64) -> f64 {
    let n_labels = resolution.number_of_labels();
    if n_labels == 0 {
        return 0.0;
    }

    let boost = (resolution.query_count as f64).ln();
    let attenuation = 1.0
        + (resolution
            .query_trend
            .hypot(resolution.last_seen_delta(now))
            / (2.0 * ONE_DAY))
            .powi(2);

    (resolution.depth_of_chain() as f64 / n_labels as f64 + boost) / attenuation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::associator::Chain;

    const TIME_NOW: f64 = 23456789.54321;

    fn resolution(labels: &[&str]) -> Resolution {
        Resolution::new(Chain::live(labels.iter().map(|l| l.to_string())), TIME_NOW)
    }

    #[test]
    fn standard_formula() {
        let mut r = resolution(&["foo.example.com.", "www.example.com."]);
        r.query_count = 8;

        let expected = 2.0 / 3.0 + 8.0_f64.ln();
        assert!((standard(&r, TIME_NOW) - expected).abs() < 1e-12);
    }

    #[test]
    fn attenuating_matches_standard_when_fresh() {
        let r = resolution(&["foo.example.com.", "www.example.com."]);

        assert!((attenuating(&r, TIME_NOW) - standard(&r, TIME_NOW)).abs() < 1e-9);
    }

    #[test]
    fn attenuating_decays_with_idle_time() {
        let r = resolution(&["foo.example.com.", "www.example.com."]);

        let fresh = attenuating(&r, TIME_NOW);
        let stale = attenuating(&r, TIME_NOW + 4.0 * ONE_DAY);
        assert!(stale < fresh / 2.0);
    }

    #[test]
    fn empty_terminal_scores_zero() {
        let r = Resolution::new(Chain::live([".".to_string()]), TIME_NOW);

        assert_eq!(standard(&r, TIME_NOW), 0.0);
        assert_eq!(attenuating(&r, TIME_NOW), 0.0);
    }

    #[test]
    fn heuristic_is_pure() {
        let r = resolution(&["a.example.com.", "b.example.com."]);

        assert_eq!(attenuating(&r, TIME_NOW), attenuating(&r, TIME_NOW));
        assert_eq!(standard(&r, TIME_NOW), standard(&r, TIME_NOW));
    }

    #[test]
    fn reloaded_interior_does_not_change_the_score() {
        let live = resolution(&["foo.example.com.", "www.example.com."]);
        let reloaded = Resolution::new(Chain::reloaded(2, "www.example.com."), TIME_NOW);

        assert_eq!(standard(&live, TIME_NOW), standard(&reloaded, TIME_NOW));
    }
}
