//! Latency / depth / rate collectors for the busy paths.
//!
//! A [`Timer`] is started when a unit of work is queued and stopped when it
//! completes, so the reported elapsed times include queue latency and the
//! depth gauge approximates queue depth.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall clock in seconds, the unit every timestamp in the agent uses.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

const WINDOW: f64 = 60.0;

pub struct StatisticsFactory {
    collectors: RefCell<Vec<Rc<Collector>>>,
}

impl StatisticsFactory {
    pub fn new() -> Self {
        StatisticsFactory {
            collectors: RefCell::new(Vec::new()),
        }
    }

    pub fn collector(&self, name: &str) -> Rc<Collector> {
        let collector = Rc::new(Collector {
            name: name.to_string(),
            inner: RefCell::new(Inner::default()),
        });
        self.collectors.borrow_mut().push(collector.clone());
        collector
    }

    pub fn report(&self) -> Vec<String> {
        let mut collectors = self.collectors.borrow().clone();
        collectors.sort_by(|a, b| a.name.cmp(&b.name));
        collectors.iter().map(|c| c.report()).collect()
    }
}

pub struct Collector {
    name: String,
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    samples: VecDeque<Sample>,
    depth: usize,
}

struct Sample {
    stamp: f64,
    elapsed: f64,
    depth: usize,
}

impl Collector {
    pub fn start_timer(self: Rc<Self>) -> Timer {
        self.inner.borrow_mut().depth += 1;
        Timer {
            collector: self,
            start: Instant::now(),
            stopped: false,
        }
    }

    fn record(&self, elapsed: f64) {
        let now = unix_now();
        let mut inner = self.inner.borrow_mut();
        inner.depth -= 1;
        let depth = inner.depth;
        inner.samples.push_back(Sample {
            stamp: now,
            elapsed,
            depth,
        });
        while inner
            .samples
            .front()
            .map(|s| now - s.stamp > WINDOW)
            .unwrap_or(false)
        {
            inner.samples.pop_front();
        }
    }

    /// One line per collector: the elapsed, depth and rate series each
    /// report min, max and the 1/10/60 second windows.
    fn report(&self) -> String {
        let now = unix_now();
        let inner = self.inner.borrow();
        let over = |window: f64| -> (f64, f64, usize) {
            let mut elapsed = 0.0;
            let mut depth = 0.0;
            let mut n = 0;
            for s in inner.samples.iter().filter(|s| now - s.stamp <= window) {
                elapsed += s.elapsed;
                depth += s.depth as f64;
                n += 1;
            }
            (elapsed, depth, n)
        };
        let (e1, d1, n1) = over(1.0);
        let (e10, d10, n10) = over(10.0);
        let (e60, d60, n60) = over(WINDOW);
        let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };

        let emin = inner
            .samples
            .iter()
            .map(|s| s.elapsed)
            .fold(f64::INFINITY, f64::min);
        let emax = inner.samples.iter().map(|s| s.elapsed).fold(0.0, f64::max);
        let dmin = inner.samples.iter().map(|s| s.depth).min().unwrap_or(0);
        let dmax = inner.samples.iter().map(|s| s.depth).max().unwrap_or(0);

        // Events per whole second across the window, empty seconds included.
        let mut buckets = [0usize; 60];
        for s in inner.samples.iter() {
            let age = now - s.stamp;
            if age >= 0.0 && age < WINDOW {
                buckets[(age as usize).min(buckets.len() - 1)] += 1;
            }
        }
        let nmin = buckets.iter().min().copied().unwrap_or(0);
        let nmax = buckets.iter().max().copied().unwrap_or(0);

        format!(
            "{}: emin={:.4} emax={:.4} e1={:.4} e10={:.4} e60={:.4} dmin={} dmax={} d1={:.4} d10={:.4} d60={:.4} nmin={} nmax={} n1={:.4} n10={:.4} n60={:.4}",
            self.name,
            if emin.is_finite() { emin } else { 0.0 },
            emax,
            mean(e1, n1),
            mean(e10, n10),
            mean(e60, n60),
            dmin,
            dmax,
            mean(d1, n1),
            mean(d10, n10),
            mean(d60, n60),
            nmin,
            nmax,
            n1 as f64,
            n10 as f64 / 10.0,
            n60 as f64 / WINDOW,
        )
    }
}

/// Stopping records a sample; dropping an unstopped timer only releases the
/// depth gauge.
pub struct Timer {
    collector: Rc<Collector>,
    start: Instant,
    stopped: bool,
}

impl Timer {
    pub fn stop(mut self) {
        self.stopped = true;
        self.collector.record(self.start.elapsed().as_secs_f64());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.stopped {
            self.collector.inner.borrow_mut().depth -= 1;
        }
    }
}

/// Periodic report loop, in the same shape as the serverside metrics dump.
pub async fn report_loop(factory: Rc<StatisticsFactory>, period: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(period));
    interval.tick().await;
    loop {
        interval.tick().await;
        for line in factory.report() {
            log::info!(target: "stats", "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_and_depth_balances() {
        let factory = StatisticsFactory::new();
        let collector = factory.collector("solve");

        let outer = collector.clone().start_timer();
        let inner = collector.clone().start_timer();
        assert_eq!(collector.inner.borrow().depth, 2);

        inner.stop();
        assert_eq!(collector.inner.borrow().depth, 1);
        assert_eq!(collector.inner.borrow().samples.len(), 1);

        // Dropping without stop releases the gauge without a sample.
        drop(outer);
        assert_eq!(collector.inner.borrow().depth, 0);
        assert_eq!(collector.inner.borrow().samples.len(), 1);
    }

    #[test]
    fn report_sorts_by_name() {
        let factory = StatisticsFactory::new();
        factory.collector("solve");
        factory.collector("cache eviction");

        let report = factory.report();
        assert!(report[0].starts_with("cache eviction:"));
        assert!(report[1].starts_with("solve:"));
    }

    #[test]
    fn report_carries_all_three_series() {
        let factory = StatisticsFactory::new();
        let collector = factory.collector("solve");
        collector.clone().start_timer().stop();

        let line = factory.report().remove(0);
        for field in [
            "emin=", "emax=", "e1=", "e10=", "e60=", "dmin=", "dmax=", "d1=", "d10=", "d60=",
            "nmin=", "nmax=", "n1=", "n10=", "n60=",
        ] {
            assert!(line.contains(field), "{} missing from {}", field, line);
        }
        assert!(line.contains("nmax=1"), "{}", line);
    }
}
