//! Correlation ticket generation.

use crate::error::{ClientError, Result};
use std::fmt;
use tracing::trace;

/// How many draws [`TicketGenerator::generate`] makes before giving up.
pub const MAX_TICKET_ATTEMPTS: usize = 64;

/// A source of candidate tickets.
///
/// Candidates do not need to be unique; the generator retries on collision.
pub trait TicketSource: Send + Sync {
    /// Draw the next candidate.
    fn next_ticket(&self) -> String;
}

/// Random base-36 tickets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTickets;

impl TicketSource for RandomTickets {
    fn next_ticket(&self) -> String {
        to_base36(rand::random::<u64>())
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Produces tickets that are unique among currently pending requests.
pub struct TicketGenerator {
    source: Box<dyn TicketSource>,
}

impl TicketGenerator {
    /// Create a generator backed by [`RandomTickets`].
    pub fn new() -> Self {
        Self::with_source(RandomTickets)
    }

    /// Create a generator backed by a custom source.
    pub fn with_source(source: impl TicketSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Draw tickets until one is not `taken`.
    pub fn generate(&self, taken: impl Fn(&str) -> bool) -> Result<String> {
        for attempt in 0..MAX_TICKET_ATTEMPTS {
            let ticket = self.source.next_ticket();
            if !taken(&ticket) {
                return Ok(ticket);
            }
            trace!(attempt, ticket = %ticket, "Ticket collision, retrying");
        }
        Err(ClientError::TicketsExhausted(MAX_TICKET_ATTEMPTS))
    }
}

impl Default for TicketGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TicketGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketGenerator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};

    /// Replays a fixed script of tickets, then counts upward.
    struct Scripted {
        script: Mutex<VecDeque<String>>,
        counter: Mutex<u64>,
    }

    impl Scripted {
        fn new(script: &[&str]) -> Self {
            Self {
                script: Mutex::new(script.iter().map(|s| s.to_string()).collect()),
                counter: Mutex::new(0),
            }
        }
    }

    impl TicketSource for Scripted {
        fn next_ticket(&self) -> String {
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            let mut counter = self.counter.lock();
            *counter += 1;
            format!("n{}", *counter)
        }
    }

    struct Constant;

    impl TicketSource for Constant {
        fn next_ticket(&self) -> String {
            "same".to_string()
        }
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn test_random_tickets_are_base36() {
        let ticket = RandomTickets.next_ticket();
        assert!(!ticket.is_empty());
        assert!(ticket
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_retries_on_collision() {
        let generator = TicketGenerator::with_source(Scripted::new(&["a", "a", "b"]));
        let pending: HashSet<String> = ["a".to_string()].into_iter().collect();

        let ticket = generator.generate(|t| pending.contains(t)).unwrap();
        assert_eq!(ticket, "b");
    }

    #[test]
    fn test_gives_up_after_bounded_attempts() {
        let generator = TicketGenerator::with_source(Constant);
        let err = generator.generate(|t| t == "same").unwrap_err();
        assert!(matches!(err, ClientError::TicketsExhausted(MAX_TICKET_ATTEMPTS)));
    }

    proptest! {
        /// Tickets stay pairwise distinct even when the source keeps
        /// replaying tickets that are already pending.
        #[test]
        fn prop_tickets_unique_under_collisions(
            script in prop::collection::vec("[a-c]", 0..40),
            n in 1usize..60,
        ) {
            let script: Vec<&str> = script.iter().map(String::as_str).collect();
            let generator = TicketGenerator::with_source(Scripted::new(&script));
            let mut pending = HashSet::new();

            for _ in 0..n {
                let ticket = generator.generate(|t| pending.contains(t)).unwrap();
                prop_assert!(pending.insert(ticket));
            }
            prop_assert_eq!(pending.len(), n);
        }
    }
}
