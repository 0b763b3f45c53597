use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};

const SUFFIX_LEN: usize = 7;

/// Build a record id of the form `{prefix}-{unix_millis}-{suffix}`.
///
/// The suffix is seven random lowercase alphanumerics, so ids minted in the same
/// millisecond still differ.
pub fn generate_record_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_lowercase())
        .take(SUFFIX_LEN)
        .collect();
    format!("{}-{}-{}", prefix, Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_carry_prefix_and_suffix() {
        let id = generate_record_id("response");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "response");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn burst_of_ids_is_unique() {
        let ids: HashSet<String> = (0..1_000).map(|_| generate_record_id("offline")).collect();
        assert_eq!(ids.len(), 1_000);
    }
}
