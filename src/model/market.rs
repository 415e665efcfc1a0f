use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

/// Market reference data. Written by ingestion, read-only here.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub tags: Vec<String>,
    /// Exchange token id per outcome index
    pub outcome_tokens: Vec<String>,
    pub resolves_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Market {
    pub fn token_for(&self, outcome: u32) -> Option<&str> {
        self.outcome_tokens.get(outcome as usize).map(String::as_str)
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags
            .iter()
            .any(|t| tags.iter().any(|x| x.eq_ignore_ascii_case(t)))
    }

    /// Whether the market resolves within `window` of `now`.
    pub fn resolves_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.resolves_at {
            Some(at) => at <= now + window,
            None => false,
        }
    }
}

/// A single price sample for one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub market_id: String,
    pub outcome: u32,
    pub ts: DateTime<Utc>,
    pub price: Decimal,
    pub volume_usd: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> Market {
        Market {
            market_id: "m1".to_string(),
            question: "Will it rain tomorrow?".to_string(),
            tags: vec!["Weather".to_string()],
            outcome_tokens: vec!["tok-no".to_string(), "tok-yes".to_string()],
            resolves_at: None,
            active: true,
        }
    }

    #[test]
    fn test_tag_match_is_case_insensitive() {
        let m = market();
        assert!(m.has_any_tag(&["weather".to_string()]));
        assert!(!m.has_any_tag(&["sports".to_string()]));
    }

    #[test]
    fn test_resolution_window() {
        let now = Utc::now();
        let mut m = market();
        assert!(!m.resolves_within(now, Duration::hours(6)));
        m.resolves_at = Some(now + Duration::hours(2));
        assert!(m.resolves_within(now, Duration::hours(6)));
        assert_eq!(m.token_for(1), Some("tok-yes"));
        assert_eq!(m.token_for(2), None);
    }
}
