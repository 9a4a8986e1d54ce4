//! Ticket-id generation.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of a generated ticket string.
pub const TICKET_LENGTH: usize = 52;

/// Generate a fresh bearer ticket id: 52 random alphanumeric characters.
pub fn generate_ticket() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TICKET_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ticket_has_expected_length() {
        assert_eq!(generate_ticket().len(), TICKET_LENGTH);
    }

    #[test]
    fn ticket_is_alphanumeric() {
        assert!(generate_ticket().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tickets_do_not_repeat() {
        let a = generate_ticket();
        let b = generate_ticket();
        assert_ne!(a, b);
    }
}
