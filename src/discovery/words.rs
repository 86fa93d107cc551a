//! Session-string dictionary.
//!
//! The dictionary is the cross product of two curated stem lists: every
//! entry is a pronounceable compound like `amberfox`. 128 × 84 = 10 752
//! words gives log2(10752) ≈ 13.4 bits per word, so a three-word session
//! string carries just over 40 bits of entropy.

use rand::Rng;

pub const FIRST: [&str; 128] = [
    "amber", "ash", "autumn", "azure", "birch", "bitter", "black", "blue",
    "bold", "brass", "brave", "bright", "bronze", "brown", "calm", "cedar",
    "chill", "cinder", "clear", "cloud", "coal", "cobalt", "cold", "copper",
    "coral", "crimson", "dark", "dawn", "deep", "dew", "dim", "dusk",
    "dusty", "early", "east", "ember", "fall", "fern", "fire", "fleet",
    "fog", "frost", "gold", "gray", "green", "grim", "hazel", "hidden",
    "high", "hill", "hollow", "honey", "ice", "iron", "ivory", "jade",
    "keen", "lake", "late", "lazy", "light", "lilac", "lime", "lone",
    "long", "loud", "low", "lunar", "maple", "mellow", "mild", "mint",
    "misty", "moon", "moss", "mute", "night", "noble", "north", "oak",
    "ocean", "old", "olive", "opal", "pale", "pearl", "pine", "plain",
    "polar", "proud", "purple", "quick", "quiet", "rain", "rapid", "raven",
    "red", "ridge", "river", "rose", "rough", "round", "ruby", "rust",
    "sage", "salt", "sand", "scarlet", "sharp", "silent", "silver", "sky",
    "slate", "slow", "small", "smoky", "snow", "soft", "solar", "spring",
    "steel", "still", "stone", "storm", "summer", "swift", "tall", "thorn",
];

pub const SECOND: [&str; 84] = [
    "badger", "bear", "beetle", "bird", "bloom", "brook", "crane",
    "creek", "crow", "deer", "dove", "dream", "drift", "eagle",
    "echo", "elk", "falcon", "feather", "field", "finch", "flame",
    "flower", "forest", "fox", "frog", "gale", "glade", "glen",
    "grove", "hare", "hawk", "heron", "horse", "lark", "leaf",
    "lion", "lynx", "marsh", "meadow", "mist", "moth", "newt",
    "otter", "owl", "panda", "path", "peak", "pebble", "pond",
    "rabbit", "reed", "robin", "rock", "salmon", "seal", "shade",
    "shadow", "shore", "snake", "sparrow", "spider", "spruce", "star",
    "stream", "swan", "thrush", "tiger", "trail", "trout", "valley",
    "water", "wave", "wolf", "wren", "yarrow", "zephyr", "aspen",
    "briar", "clover", "heath", "laurel", "rowan", "sorrel", "willow",
];

/// Number of distinct words the generator can draw from.
pub fn dictionary_size() -> usize {
    FIRST.len() * SECOND.len()
}

/// The word at a flat dictionary index.
pub fn word_at(index: usize) -> String {
    let first = FIRST[index / SECOND.len()];
    let second = SECOND[index % SECOND.len()];
    format!("{first}{second}")
}

/// Samples one word uniformly.
pub fn random_word<R: Rng>(rng: &mut R) -> String {
    word_at(rng.gen_range(0..dictionary_size()))
}

/// Samples a three-word hyphenated session string.
pub fn random_session_string<R: Rng>(rng: &mut R) -> String {
    format!(
        "{}-{}-{}",
        random_word(rng),
        random_word(rng),
        random_word(rng)
    )
}

/// Loose shape check used to tell session strings apart from host names.
pub fn looks_like_session_string(text: &str) -> bool {
    let words: Vec<&str> = text.split('-').collect();
    words.len() == 3
        && words
            .iter()
            .all(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn dictionary_clears_forty_bits_over_three_words() {
        let bits_per_word = (dictionary_size() as f64).log2();
        assert!(bits_per_word * 3.0 >= 40.0);
    }

    #[test]
    fn words_are_lowercase_ascii() {
        for index in [0, 1, SECOND.len(), dictionary_size() - 1] {
            let word = word_at(index);
            assert!(word.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn session_strings_have_three_hyphenated_words() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let text = random_session_string(&mut rng);
            assert!(looks_like_session_string(&text), "bad string {text}");
        }
    }

    #[test]
    fn host_names_are_not_session_strings() {
        assert!(!looks_like_session_string("example.com"));
        assert!(!looks_like_session_string("amberfox-trail"));
        assert!(!looks_like_session_string("Amber-Fox-Trail"));
        assert!(!looks_like_session_string("a-b-c-d"));
        assert!(looks_like_session_string("amberfox-mosswren-duskowl"));
    }
}
