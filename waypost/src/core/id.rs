//! Human-readable run identifiers.
//!
//! IDs look like `brave-otter-x7Kq02Lm`: an adjective, an animal, and an
//! eight-character alphanumeric suffix that keeps collisions negligible.

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;

const SUFFIX_LENGTH: usize = 8;

const ADJECTIVES: &[&str] = &[
    "able", "amber", "ample", "bold", "brave", "brisk", "calm", "clever", "cosmic", "crisp",
    "daring", "eager", "fair", "fancy", "fleet", "fond", "gentle", "glad", "golden", "grand",
    "happy", "hardy", "humble", "ideal", "jolly", "keen", "kind", "lively", "loyal", "lucky",
    "merry", "mighty", "modest", "noble", "polite", "proud", "quick", "quiet", "rapid", "ready",
    "regal", "robust", "sharp", "shiny", "smooth", "solid", "steady", "sunny", "swift", "tidy",
    "upbeat", "valid", "vivid", "warm", "wise", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "cougar", "coyote", "dingo", "dolphin", "eagle",
    "falcon", "ferret", "finch", "gazelle", "gecko", "heron", "husky", "ibex", "iguana",
    "jackal", "jaguar", "kestrel", "koala", "lemur", "lynx", "magpie", "marten", "mink", "moose",
    "narwhal", "newt", "ocelot", "osprey", "otter", "panda", "puffin", "quail", "raven", "robin",
    "salmon", "seal", "stork", "tapir", "tiger", "toucan", "turtle", "urchin", "viper", "walrus",
    "weasel", "wombat", "yak", "zebra",
];

/// Generates a new readable identifier for workflow and activity runs.
pub fn generate_readable_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("run");
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LENGTH)
        .map(char::from)
        .collect();

    format!("{adjective}-{animal}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_readable_id_shape() {
        let id = generate_readable_id();
        let parts: Vec<&str> = id.split('-').collect();

        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert_eq!(parts[2].len(), SUFFIX_LENGTH);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_readable_ids_are_distinct() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_readable_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
