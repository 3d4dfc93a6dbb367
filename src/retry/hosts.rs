use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::time::Instant;

/// Ordered candidate hosts for connection attempts.
///
/// The fallback list is shuffled once when the cursor is built and stays in
/// that order for the lifetime of the client. Each reconnect cycle starts at
/// the preferred host (the last one that produced a connection, while it is
/// younger than `preferred_ttl`) or the primary, then walks the remaining hosts
/// in order and wraps around.
#[derive(Debug, Clone)]
pub struct HostCursor {
    primary: String,
    fallbacks: Vec<String>,
    cycle: Vec<String>,
    position: usize,
    preferred: Option<(String, Instant)>,
    preferred_ttl: Duration,
}

impl HostCursor {
    /// Builds a cursor with the fallback hosts shuffled.
    pub fn new(primary: impl Into<String>, mut fallbacks: Vec<String>, preferred_ttl: Duration) -> Self {
        fallbacks.shuffle(&mut rand::thread_rng());
        Self::with_order(primary, fallbacks, preferred_ttl)
    }

    /// Builds a cursor that keeps the fallback hosts in the given order.
    pub fn with_order(
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        preferred_ttl: Duration,
    ) -> Self {
        let primary = primary.into();
        let fallbacks: Vec<String> = fallbacks
            .into_iter()
            .filter(|host| *host != primary)
            .collect();
        let mut cursor = Self {
            cycle: Vec::new(),
            position: 0,
            primary,
            fallbacks,
            preferred: None,
            preferred_ttl,
        };
        cursor.cycle = cursor.build_cycle(None);
        cursor
    }

    fn build_cycle(&self, first: Option<&str>) -> Vec<String> {
        let first = first.unwrap_or(&self.primary).to_string();
        let mut cycle = vec![first.clone()];
        cycle.extend(
            std::iter::once(&self.primary)
                .chain(self.fallbacks.iter())
                .filter(|host| **host != first)
                .cloned(),
        );
        cycle
    }

    /// Starts a new cycle and returns its first host.
    pub fn begin_cycle(&mut self, now: Instant) -> &str {
        let preferred = self.preferred(now).map(str::to_string);
        self.cycle = self.build_cycle(preferred.as_deref());
        self.position = 0;
        &self.cycle[0]
    }

    pub fn current(&self) -> &str {
        &self.cycle[self.position]
    }

    /// Moves to the next host, wrapping to the start of the cycle after the last one.
    pub fn advance(&mut self) -> &str {
        self.position = (self.position + 1) % self.cycle.len();
        &self.cycle[self.position]
    }

    /// Whether the current host is the last one of the cycle.
    pub fn is_exhausted(&self) -> bool {
        self.position + 1 >= self.cycle.len()
    }

    /// Number of hosts in a cycle (primary plus fallbacks).
    pub fn len(&self) -> usize {
        self.cycle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycle.is_empty()
    }

    pub fn record_success(&mut self, host: &str, now: Instant) {
        if host == self.primary {
            self.preferred = None;
        } else {
            self.preferred = Some((host.to_string(), now));
        }
    }

    pub fn preferred(&self, now: Instant) -> Option<&str> {
        self.preferred
            .as_ref()
            .filter(|(_, since)| now.saturating_duration_since(*since) < self.preferred_ttl)
            .map(|(host, _)| host.as_str())
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Fallback hosts in their (shuffled) order.
    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        ["a", "b", "c"].iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_first_cycle_starts_at_primary() {
        let mut cursor = HostCursor::with_order("main", hosts(), Duration::from_secs(600));
        assert_eq!(cursor.begin_cycle(Instant::now()), "main");
        assert_eq!(cursor.advance(), "a");
        assert_eq!(cursor.advance(), "b");
        assert_eq!(cursor.advance(), "c");
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(), "main");
    }

    #[test]
    fn test_preferred_host_goes_first() {
        let now = Instant::now();
        let mut cursor = HostCursor::with_order("main", hosts(), Duration::from_secs(600));
        cursor.begin_cycle(now);
        cursor.advance();
        cursor.advance();
        cursor.record_success("b", now);

        assert_eq!(cursor.begin_cycle(now), "b");
        assert_eq!(cursor.advance(), "main");
        assert_eq!(cursor.advance(), "a");
        assert_eq!(cursor.advance(), "c");
        assert_eq!(cursor.len(), 4);
    }

    #[test]
    fn test_preferred_host_expires() {
        let now = Instant::now();
        let mut cursor = HostCursor::with_order("main", hosts(), Duration::from_secs(600));
        cursor.record_success("c", now);

        let later = now + Duration::from_secs(601);
        assert_eq!(cursor.preferred(later), None);
        assert_eq!(cursor.begin_cycle(later), "main");
    }

    #[test]
    fn test_primary_success_clears_preference() {
        let now = Instant::now();
        let mut cursor = HostCursor::with_order("main", hosts(), Duration::from_secs(600));
        cursor.record_success("a", now);
        cursor.record_success("main", now);
        assert_eq!(cursor.begin_cycle(now), "main");
    }

    #[test]
    fn test_shuffle_keeps_every_host_once() {
        let cursor = HostCursor::new("main", hosts(), Duration::from_secs(600));
        let mut fallbacks = cursor.fallbacks().to_vec();
        fallbacks.sort();
        assert_eq!(fallbacks, hosts());
    }

    #[test]
    fn test_without_fallbacks_cycle_is_primary_only() {
        let mut cursor = HostCursor::with_order("custom", Vec::new(), Duration::from_secs(600));
        assert_eq!(cursor.begin_cycle(Instant::now()), "custom");
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(), "custom");
    }
}
