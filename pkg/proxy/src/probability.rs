use pkg_constants::iptables::PROBABILITY_PRECISION;

/// Cache of `1/n` strings for `-m statistic --mode random --probability`.
///
/// Picking among N endpoints is done with N rules: rule `i` (0-based) matches
/// with probability `1/(N-i)` and the last one matches unconditionally, which
/// gives every endpoint a `1/N` share without any shared counter.
#[derive(Debug, Default)]
pub struct ProbabilityTable {
    /// `cache[n - 1]` holds the string for `1/n`.
    cache: Vec<String>,
}

impl ProbabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The probability string for `1/n`. `n == 0` is treated as 1.
    pub fn probability(&mut self, n: usize) -> &str {
        let n = n.max(1);
        if self.cache.len() < n {
            self.precompute(n);
        }
        &self.cache[n - 1]
    }

    fn precompute(&mut self, max: usize) {
        for n in self.cache.len() + 1..=max {
            self.cache.push(format_probability(n));
        }
    }
}

/// `1/n` with a fixed number of decimal digits.
pub fn format_probability(n: usize) -> String {
    format!("{:.*}", PROBABILITY_PRECISION, 1.0 / n as f64)
}
