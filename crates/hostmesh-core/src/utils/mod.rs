//! Utility functions

use chrono::Utc;

/// Wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Display name used when none is configured
pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Clock skew summary across sampled peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkewSummary {
    pub min_ms: i64,
    pub max_ms: i64,
}

impl SkewSummary {
    /// Summarize signed skew samples; `None` when there are none
    pub fn from_samples(samples: &[i64]) -> Option<Self> {
        let min_ms = *samples.iter().min()?;
        let max_ms = *samples.iter().max()?;
        Some(Self { min_ms, max_ms })
    }

    /// Largest spread between any two clocks, including the local one
    pub fn spread_ms(&self) -> i64 {
        self.max_ms.max(0) - self.min_ms.min(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_default_display_name_not_empty() {
        assert!(!default_display_name().is_empty());
    }

    #[test]
    fn test_skew_summary() {
        assert!(SkewSummary::from_samples(&[]).is_none());

        let summary = SkewSummary::from_samples(&[-40, 10, 75]).unwrap();
        assert_eq!(summary.min_ms, -40);
        assert_eq!(summary.max_ms, 75);
        assert_eq!(summary.spread_ms(), 115);

        let summary = SkewSummary::from_samples(&[5, 20]).unwrap();
        assert_eq!(summary.spread_ms(), 20);
    }
}
