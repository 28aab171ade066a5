//! Randomized display and room names for users who don't bring their own.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "cosmic", "crimson", "daring", "eager",
    "gentle", "golden", "keen", "lively", "lucid", "mellow", "nimble", "polar", "quiet",
    "rapid", "silent", "sly", "solar", "swift", "vivid", "wandering", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "bat", "bison", "crane", "dingo", "falcon", "ferret", "fox", "gecko",
    "heron", "ibis", "lemur", "lynx", "marten", "mole", "moose", "otter", "owl",
    "panda", "puffin", "raven", "seal", "stoat", "tapir", "viper", "wombat",
];

fn pick(list: &[&'static str]) -> &'static str {
    // both lists are non-empty constants
    list.choose(&mut rand::thread_rng()).copied().unwrap_or("unnamed")
}

/// A display name like `Clever Otter`.
pub fn random_user_name() -> String {
    format!("{} {}", capitalize(pick(ADJECTIVES)), capitalize(pick(ANIMALS)))
}

/// A room name like `silent-lynx-42`.
pub fn random_room_name() -> String {
    let n: u8 = rand::thread_rng().gen_range(0..100);
    format!("{}-{}-{}", pick(ADJECTIVES), pick(ANIMALS), n)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_are_two_capitalized_words() {
        let name = random_user_name();
        let words: Vec<&str> = name.split(' ').collect();
        assert_eq!(words.len(), 2);
        for word in words {
            assert!(word.chars().next().unwrap().is_uppercase());
        }
    }

    #[test]
    fn room_names_are_url_friendly() {
        let name = random_room_name();
        assert_eq!(name.split('-').count(), 3);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
